//! 업스트림 페치 경로.
//!
//! 동기 호출자와 백그라운드 워커가 같은 경로를 사용합니다:
//! 레지스트리 확인 → rate limiter → 어댑터 → 실패 분류 → 캐시 기록.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use feed_core::{CacheKey, CoordinatorConfig, DataType, FetchParams, FetchRequest};

use crate::adapter::SourceAdapter;
use crate::error::{FailureClass, SourceError};
use crate::lock::LockManager;
use crate::rate_limiter::RateLimiter;
use crate::registry::InvalidResourceRegistry;
use crate::scheduler::{EnqueueOutcome, FetchQueue};
use crate::stats::CoordinatorStats;
use crate::store::{CacheStore, TtlPolicy};

/// 한 번의 페치 결과.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FetchOutcome {
    /// 성공, 캐시 기록 완료
    Fetched(Value),
    /// provider가 rate limit 신호를 보냄 (냉각 진입)
    RateLimited,
    /// 호출자 예산 안에 rate limiter 허가를 받지 못함
    Throttled,
    /// 영구 무효 리소스
    Invalid,
    /// 재시도 소진
    Failed(FailureClass),
    /// 다른 호출자가 이미 페치 중 (워커 전용)
    Skipped,
    /// 종료 신호
    Cancelled,
}

/// 대기 정책.
///
/// 워커는 종료 신호가 올 때까지 기다리고, 동기 호출자는 마감 시각까지만 기다립니다.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Gate<'a> {
    Background(&'a CancellationToken),
    Deadline(Instant),
}

impl Gate<'_> {
    async fn admit(&self, limiter: &RateLimiter, sync_wait: Duration) -> bool {
        match self {
            Gate::Background(cancel) => limiter.acquire(cancel).await,
            Gate::Deadline(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                limiter.acquire_within(remaining.min(sync_wait)).await
            }
        }
    }

    /// 대기. 취소되었거나 마감을 넘기게 되면 `false`.
    async fn pause(&self, wait: Duration) -> bool {
        match self {
            Gate::Background(cancel) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => true,
                    _ = cancel.cancelled() => false,
                }
            }
            Gate::Deadline(deadline) => {
                if Instant::now().checked_add(wait).map_or(true, |t| t > *deadline) {
                    return false;
                }
                tokio::time::sleep(wait).await;
                true
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Gate::Background(cancel) if cancel.is_cancelled())
    }
}

/// 공유 페치 경로.
pub(crate) struct FetchPipeline {
    pub(crate) config: CoordinatorConfig,
    pub(crate) store: CacheStore,
    pub(crate) limiter: RateLimiter,
    pub(crate) locks: LockManager,
    pub(crate) registry: Arc<InvalidResourceRegistry>,
    pub(crate) adapters: HashMap<DataType, Arc<dyn SourceAdapter>>,
    pub(crate) queue: Arc<FetchQueue>,
    pub(crate) stats: Arc<CoordinatorStats>,
}

impl FetchPipeline {
    pub(crate) fn ttl(&self, data_type: DataType) -> TtlPolicy {
        let (fresh, stale) = self.config.ttl_for(data_type);
        TtlPolicy::new(fresh, stale)
    }

    fn adapter(&self, data_type: DataType) -> Option<&Arc<dyn SourceAdapter>> {
        let adapter = self.adapters.get(&data_type);
        if adapter.is_none() {
            warn!(data_type = %data_type, "No source adapter registered");
        }
        adapter
    }

    /// 큐에 요청 추가. 레지스트리에 있으면 무시합니다.
    pub(crate) async fn enqueue(&self, request: FetchRequest) -> bool {
        if self.registry.contains(&request.resource_id).await {
            debug!(resource = %request.resource_id, "Skipping enqueue for invalid resource");
            return false;
        }

        match self.queue.push(request).await {
            EnqueueOutcome::Queued | EnqueueOutcome::Raised => {
                self.stats.record_enqueued();
                true
            }
            EnqueueOutcome::Duplicate => false,
        }
    }

    /// 단일 키 페치. 일시적 실패는 선형 백오프로 재시도합니다.
    ///
    /// 호출자는 해당 키의 잠금을 [`LockManager::hold`]로 유지하고 있어야 합니다.
    pub(crate) async fn fetch_one(
        &self,
        key: &CacheKey,
        params: &FetchParams,
        gate: Gate<'_>,
    ) -> FetchOutcome {
        let data_type = key.data_type();
        let resource_id = key.resource_id();
        let Some(adapter) = self.adapter(data_type) else {
            return FetchOutcome::Failed(FailureClass::Unknown);
        };

        let mut attempt: u32 = 0;
        loop {
            if self.registry.contains(resource_id).await {
                return FetchOutcome::Invalid;
            }
            if !gate.admit(&self.limiter, self.config.sync_limiter_wait()).await {
                return if gate.is_cancelled() {
                    FetchOutcome::Cancelled
                } else {
                    FetchOutcome::Throttled
                };
            }

            self.stats.record_upstream_call();
            let result = adapter.fetch(resource_id, params).await;

            let err = match result {
                Ok(value) => {
                    record_call(data_type, "success");
                    self.stats.record_upstream_success();
                    self.write_through(key, &value).await;
                    return FetchOutcome::Fetched(value);
                }
                Err(err) => err,
            };

            let class = err.classify();
            record_call(data_type, class.as_str());
            self.stats.record_failure(class);

            match class {
                FailureClass::RateLimited => {
                    self.limiter
                        .report_rate_limited(adapter.as_ref(), err.retry_after())
                        .await;
                    return FetchOutcome::RateLimited;
                }
                FailureClass::PermanentlyInvalid => {
                    self.mark_invalid(resource_id, data_type, &err).await;
                    return FetchOutcome::Invalid;
                }
                class => {
                    if !class.retry_in_place() || attempt >= self.config.max_retries {
                        warn!(
                            resource = %resource_id,
                            data_type = %data_type,
                            class = %class,
                            error = %err,
                            attempts = attempt + 1,
                            "Upstream fetch failed, giving up"
                        );
                        return FetchOutcome::Failed(class);
                    }
                    attempt += 1;
                    let backoff = self.config.retry_backoff() * attempt;
                    debug!(
                        resource = %resource_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying upstream fetch"
                    );
                    if !gate.pause(backoff).await {
                        return if gate.is_cancelled() {
                            FetchOutcome::Cancelled
                        } else {
                            FetchOutcome::Failed(class)
                        };
                    }
                }
            }
        }
    }

    /// 다중 리소스 페치.
    ///
    /// 어댑터가 배치를 지원하면 `batch_chunk_size` 단위로 한 번의 rate-limited
    /// 호출을 보내고 청크 사이에 `inter_chunk_pause`만큼 쉽니다. rate limit 신호를
    /// 받으면 이미 성공한 항목은 즉시 기록하고, 남은 항목만 지수 백오프로
    /// 재시도합니다. 호출자는 대상 키들의 잠금을 보유하고 있어야 합니다.
    pub(crate) async fn fetch_many(
        &self,
        data_type: DataType,
        resource_ids: &[String],
        params: &FetchParams,
        gate: Gate<'_>,
    ) -> HashMap<String, Value> {
        let mut fetched = HashMap::new();
        let Some(adapter) = self.adapter(data_type) else {
            return fetched;
        };

        if !adapter.supports_batch() {
            for id in resource_ids {
                let key = CacheKey::new(data_type, id, params);
                match self.fetch_one(&key, params, gate).await {
                    FetchOutcome::Fetched(value) => {
                        fetched.insert(id.clone(), value);
                    }
                    FetchOutcome::RateLimited
                    | FetchOutcome::Throttled
                    | FetchOutcome::Cancelled => break,
                    _ => {}
                }
            }
            return fetched;
        }

        'chunks: for (index, chunk) in resource_ids
            .chunks(self.config.batch_chunk_size.max(1))
            .enumerate()
        {
            if index > 0 && !gate.pause(self.config.inter_chunk_pause()).await {
                break;
            }

            let mut outstanding = Vec::with_capacity(chunk.len());
            for id in chunk {
                if !self.registry.contains(id).await {
                    outstanding.push(id.clone());
                }
            }

            let mut attempt: u32 = 0;
            while !outstanding.is_empty() {
                if !gate.admit(&self.limiter, self.config.sync_limiter_wait()).await {
                    break 'chunks;
                }

                self.stats.record_upstream_call();
                let response = adapter.fetch_batch(&outstanding, params).await;
                let (next, throttled) = match response {
                    Ok(mut results) => {
                        record_call(data_type, "success");
                        let mut next = Vec::new();
                        let mut throttled: Option<Option<Duration>> = None;

                        for id in outstanding.drain(..) {
                            match results.remove(&id) {
                                Some(Ok(value)) => {
                                    self.stats.record_upstream_success();
                                    let key = CacheKey::new(data_type, &id, params);
                                    self.write_through(&key, &value).await;
                                    fetched.insert(id, value);
                                }
                                Some(Err(err)) => match err.classify() {
                                    FailureClass::RateLimited => {
                                        throttled = Some(err.retry_after());
                                        next.push(id);
                                    }
                                    FailureClass::PermanentlyInvalid => {
                                        self.stats.record_failure(FailureClass::PermanentlyInvalid);
                                        self.mark_invalid(&id, data_type, &err).await;
                                    }
                                    class => {
                                        self.stats.record_failure(class);
                                        next.push(id);
                                    }
                                },
                                None => next.push(id),
                            }
                        }
                        (next, throttled)
                    }
                    Err(err) => {
                        let class = err.classify();
                        record_call(data_type, class.as_str());
                        if class != FailureClass::RateLimited {
                            self.stats.record_failure(class);
                        }
                        warn!(
                            data_type = %data_type,
                            count = outstanding.len(),
                            class = %class,
                            error = %err,
                            "Batch upstream call failed"
                        );
                        let throttled =
                            (class == FailureClass::RateLimited).then(|| err.retry_after());
                        (std::mem::take(&mut outstanding), throttled)
                    }
                };

                outstanding = next;
                if outstanding.is_empty() {
                    break;
                }

                let rate_limited = throttled.is_some();
                if let Some(retry_after) = throttled {
                    self.stats.record_failure(FailureClass::RateLimited);
                    self.limiter
                        .report_rate_limited(adapter.as_ref(), retry_after)
                        .await;
                }

                if attempt >= self.config.max_retries {
                    warn!(
                        data_type = %data_type,
                        dropped = outstanding.len(),
                        "Batch retries exhausted"
                    );
                    break;
                }
                attempt += 1;

                let backoff = if rate_limited {
                    self.config
                        .cooldown()
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                } else {
                    self.config.retry_backoff() * attempt
                };
                debug!(
                    data_type = %data_type,
                    outstanding = outstanding.len(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying batch chunk"
                );
                if !gate.pause(backoff).await {
                    break 'chunks;
                }
            }
        }

        fetched
    }

    /// 워커의 요청 처리.
    pub(crate) async fn process(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let key = request.cache_key();

        if self.registry.contains(&request.resource_id).await {
            return FetchOutcome::Invalid;
        }
        if self.store.get_fresh(&key).await.is_some() {
            debug!(key = %key, "Already fresh, skipping");
            self.clear_placeholder(&key).await;
            return FetchOutcome::Skipped;
        }

        let Some(guard) = self
            .locks
            .try_acquire(&key.lock_key(), self.config.lock_ttl())
            .await
        else {
            debug!(key = %key, "Another holder is fetching, skipping");
            return FetchOutcome::Skipped;
        };

        let outcome = self
            .locks
            .hold(
                &[&guard],
                self.config.lock_ttl(),
                self.fetch_one(&key, &request.params, Gate::Background(cancel)),
            )
            .await;
        self.locks.release(guard).await;
        self.clear_placeholder(&key).await;
        outcome
    }

    pub(crate) async fn write_through(&self, key: &CacheKey, value: &Value) {
        if let Err(e) = self.store.set(key, value, self.ttl(key.data_type())).await {
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    async fn clear_placeholder(&self, key: &CacheKey) {
        if let Err(e) = self.store.backend().del(&key.pending_key()).await {
            debug!(key = %key, error = %e, "Placeholder cleanup failed");
        }
    }

    async fn mark_invalid(&self, resource_id: &str, data_type: DataType, err: &SourceError) {
        match self.registry.add(resource_id).await {
            Ok(_) => info!(
                resource = %resource_id,
                data_type = %data_type,
                reason = %err,
                "무효 리소스 등록"
            ),
            Err(e) => warn!(resource = %resource_id, error = %e, "Failed to persist invalid resource"),
        }
        if let Err(e) = self.store.delete_resource(data_type, resource_id).await {
            debug!(resource = %resource_id, error = %e, "Cache cleanup for invalid resource failed");
        }
    }
}

fn record_call(data_type: DataType, outcome: &'static str) {
    metrics::counter!(
        "feed_cache_upstream_calls_total",
        "data_type" => data_type.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}
