//! 캐시 코디네이터 (파사드).
//!
//! 애플리케이션 코드가 업스트림 데이터를 얻는 유일한 진입점입니다.
//!
//! # 조회 순서
//!
//! 1. 무효 리소스 레지스트리 → `NotFound`
//! 2. fresh 티어 → `Fresh`
//! 3. stale 티어 → 잠금이 없으면 High 우선순위 갱신 등록 후 `Stale`
//! 4. miss
//!    - 비동기: placeholder를 새로 쓴 경우에만 Normal 우선순위 등록, `Loading`
//!    - 동기: 잠금 승자는 직접 페치, 패자는 fresh 티어를 폴링
//!
//! 어떤 경로도 에러를 반환하지 않습니다. 모든 결과는 [`CacheLookup`]입니다.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use feed_core::{
    normalize_resource_id, AppConfig, CacheKey, CoordinatorConfig, DataType, FetchParams,
    FetchRequest, Priority,
};

use crate::adapter::{HttpSourceAdapter, SourceAdapter};
use crate::error::{CacheError, Result};
use crate::lock::{LockGuard, LockManager};
use crate::pipeline::{FetchOutcome, FetchPipeline, Gate};
use crate::rate_limiter::{RateLimitState, RateLimiter};
use crate::registry::InvalidResourceRegistry;
use crate::scheduler::{FetchQueue, FetchScheduler};
use crate::stats::{CoordinatorStats, StatsSnapshot};
use crate::store::{connect_backend, CacheStore, KvBackend, MemoryBackend};

/// 조회 결과 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupState {
    /// fresh 티어 값
    Fresh,
    /// stale 티어 값 (백그라운드 갱신 중일 수 있음)
    Stale,
    /// 백그라운드 페치 등록됨, 값 없음
    Loading,
    /// 영구 무효 리소스
    NotFound,
    /// 예산 안에 값을 얻지 못함
    Empty,
}

impl LookupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupState::Fresh => "fresh",
            LookupState::Stale => "stale",
            LookupState::Loading => "loading",
            LookupState::NotFound => "not_found",
            LookupState::Empty => "empty",
        }
    }
}

impl std::fmt::Display for LookupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 조회 결과.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheLookup {
    pub value: Option<Value>,
    pub state: LookupState,
}

impl CacheLookup {
    fn with_value(value: Value, state: LookupState) -> Self {
        Self {
            value: Some(value),
            state,
        }
    }

    fn without_value(state: LookupState) -> Self {
        Self { value: None, state }
    }

    pub fn is_stale(&self) -> bool {
        self.state == LookupState::Stale
    }

    pub fn is_found(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }
}

/// 헬스 체크 결과.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// 저장소 이름
    pub backend: &'static str,
    /// 저장소 응답 여부
    pub backend_ok: bool,
    pub rate_limit: RateLimitState,
    pub queued: usize,
    pub in_flight: usize,
    pub invalid_resources: usize,
    pub workers_running: bool,
}

/// 코디네이터 빌더.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    backend: Option<Arc<dyn KvBackend>>,
    registry: Option<Arc<InvalidResourceRegistry>>,
    adapters: HashMap<DataType, Arc<dyn SourceAdapter>>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            backend: None,
            registry: None,
            adapters: HashMap::new(),
        }
    }

    /// 공유 저장소. 지정하지 않으면 프로세스 내 저장소를 사용합니다.
    pub fn backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 무효 리소스 레지스트리. 지정하지 않으면 메모리 전용.
    pub fn registry(mut self, registry: Arc<InvalidResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 어댑터 등록. 같은 데이터 유형은 마지막 등록이 유효합니다.
    pub fn adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.data_type(), adapter);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        if self.adapters.is_empty() {
            return Err(CacheError::Config(
                "at least one source adapter is required".to_string(),
            ));
        }

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let mut store = CacheStore::new(Arc::clone(&backend));
        if let Some(local_ttl) = self.config.local_ttl() {
            store = store.with_local_tier(local_ttl);
        }

        let queue = Arc::new(FetchQueue::new());
        let stats = Arc::new(CoordinatorStats::new());
        let pipeline = Arc::new(FetchPipeline {
            limiter: RateLimiter::new(Arc::clone(&backend), &self.config),
            locks: LockManager::new(Arc::clone(&backend)),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(InvalidResourceRegistry::in_memory())),
            adapters: self.adapters,
            queue: Arc::clone(&queue),
            stats,
            store,
            config: self.config,
        });

        Ok(Coordinator {
            pipeline,
            scheduler: FetchScheduler::new(queue),
        })
    }
}

/// 캐시 코디네이터.
pub struct Coordinator {
    pipeline: Arc<FetchPipeline>,
    scheduler: FetchScheduler,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    /// 애플리케이션 설정으로 생성합니다.
    ///
    /// 저장소 연결, 레지스트리 로드, provider마다 HTTP 어댑터 등록을 수행합니다.
    /// 알 수 없는 데이터 유형 이름의 provider는 경고 후 무시합니다.
    pub async fn from_app_config(config: &AppConfig) -> Result<Self> {
        let backend = connect_backend(&config.redis).await;
        let registry = InvalidResourceRegistry::from_path(config.registry.path.as_deref()).await?;

        let mut builder = CoordinatorBuilder::new(config.coordinator.clone())
            .backend(backend)
            .registry(Arc::new(registry));

        for (name, provider) in &config.providers {
            let Ok(data_type) = name.parse::<DataType>() else {
                warn!(provider = %name, "Unknown data type in provider table, ignoring");
                continue;
            };
            let adapter = HttpSourceAdapter::new(data_type, provider.clone())
                .map_err(|e| CacheError::Config(format!("provider {name}: {e}")))?;
            builder = builder.adapter(Arc::new(adapter));
        }

        builder.build()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.pipeline.config
    }

    /// 백그라운드 워커 시작.
    pub async fn start(&self) {
        self.scheduler
            .start(Arc::clone(&self.pipeline), self.pipeline.config.worker_count)
            .await;
    }

    /// 워커 종료 (대기 중인 요청은 버려집니다).
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pipeline.stats.snapshot().log_summary("shutdown");
    }

    /// 조회. 동기 경로는 `max_poll_wait` 안에 끝납니다.
    pub async fn get(
        &self,
        resource_id: &str,
        data_type: DataType,
        params: &FetchParams,
        allow_sync: bool,
    ) -> CacheLookup {
        let deadline = Instant::now() + self.pipeline.config.max_poll_wait();
        self.get_until(resource_id, data_type, params, allow_sync, deadline)
            .await
    }

    /// 마감 시각이 있는 조회.
    #[instrument(skip_all, fields(resource = %resource_id, data_type = %data_type, allow_sync = allow_sync))]
    pub async fn get_until(
        &self,
        resource_id: &str,
        data_type: DataType,
        params: &FetchParams,
        allow_sync: bool,
        deadline: Instant,
    ) -> CacheLookup {
        let lookup = self
            .lookup(resource_id, data_type, params, allow_sync, deadline)
            .await;
        metrics::counter!("feed_cache_lookups_total", "state" => lookup.state.as_str())
            .increment(1);
        lookup
    }

    async fn lookup(
        &self,
        resource_id: &str,
        data_type: DataType,
        params: &FetchParams,
        allow_sync: bool,
        deadline: Instant,
    ) -> CacheLookup {
        let p = &self.pipeline;
        let key = CacheKey::new(data_type, resource_id, params);

        if p.registry.contains(key.resource_id()).await {
            p.stats.record_not_found();
            return CacheLookup::without_value(LookupState::NotFound);
        }

        if let Some(value) = p.store.get_fresh(&key).await {
            p.stats.record_fresh_hit();
            return CacheLookup::with_value(value, LookupState::Fresh);
        }

        if let Some(value) = p.store.get_stale(&key).await {
            p.stats.record_stale_hit();
            if !p.locks.is_locked(&key.lock_key()).await {
                let request = FetchRequest::new(key.resource_id(), data_type, Priority::High)
                    .with_params(params.clone());
                p.enqueue(request).await;
            }
            return CacheLookup::with_value(value, LookupState::Stale);
        }

        p.stats.record_miss();

        if !allow_sync {
            return self.enqueue_miss(&key, params).await;
        }

        match p.locks.try_acquire(&key.lock_key(), p.config.lock_ttl()).await {
            Some(guard) => {
                // 잠금을 얻는 사이 다른 호출자가 채웠을 수 있음
                if let Some(value) = p.store.get_fresh(&key).await {
                    p.locks.release(guard).await;
                    return CacheLookup::with_value(value, LookupState::Fresh);
                }

                let outcome = p
                    .locks
                    .hold(
                        &[&guard],
                        p.config.lock_ttl(),
                        p.fetch_one(&key, params, Gate::Deadline(deadline)),
                    )
                    .await;
                p.locks.release(guard).await;
                self.resolve_sync(&key, params, outcome).await
            }
            None => self.wait_for_holder(&key, deadline).await,
        }
    }

    /// 비동기 miss: placeholder를 새로 쓴 호출자만 페치를 등록합니다.
    async fn enqueue_miss(&self, key: &CacheKey, params: &FetchParams) -> CacheLookup {
        let p = &self.pipeline;
        let fresh_placeholder = match p
            .store
            .backend()
            .set_nx_ex(&key.pending_key(), "1", p.config.placeholder_ttl())
            .await
        {
            Ok(set) => set,
            Err(e) => {
                warn!(key = %key, error = %e, "Placeholder write failed, enqueueing anyway");
                true
            }
        };

        if fresh_placeholder {
            let request = FetchRequest::new(key.resource_id(), key.data_type(), Priority::Normal)
                .with_params(params.clone());
            if !p.enqueue(request).await {
                // 다른 파라미터 변형이 대기 중이면 이 키의 placeholder는 아무도 지우지 않음
                if let Err(e) = p.store.backend().del(&key.pending_key()).await {
                    debug!(key = %key, error = %e, "Placeholder cleanup failed");
                }
            }
        }
        CacheLookup::without_value(LookupState::Loading)
    }

    async fn resolve_sync(
        &self,
        key: &CacheKey,
        params: &FetchParams,
        outcome: FetchOutcome,
    ) -> CacheLookup {
        let p = &self.pipeline;
        match outcome {
            FetchOutcome::Fetched(value) => CacheLookup::with_value(value, LookupState::Fresh),
            FetchOutcome::Invalid => {
                p.stats.record_not_found();
                CacheLookup::without_value(LookupState::NotFound)
            }
            FetchOutcome::RateLimited | FetchOutcome::Throttled => {
                let request = FetchRequest::new(key.resource_id(), key.data_type(), Priority::Normal)
                    .with_params(params.clone());
                p.enqueue(request).await;
                self.best_effort(key).await
            }
            _ => self.best_effort(key).await,
        }
    }

    /// 잠금 패자: fresh 티어를 폴링합니다.
    ///
    /// 잠금이 사라졌는데 값이 없으면 (승자 실패) 즉시 멈춥니다.
    async fn wait_for_holder(&self, key: &CacheKey, deadline: Instant) -> CacheLookup {
        let p = &self.pipeline;
        let poll_deadline = deadline.min(Instant::now() + p.config.max_poll_wait());
        let lock_key = key.lock_key();

        loop {
            let now = Instant::now();
            if now >= poll_deadline {
                debug!(key = %key, "Poll budget exhausted");
                break;
            }
            tokio::time::sleep(p.config.poll_interval().min(poll_deadline - now)).await;

            if let Some(value) = p.store.get_fresh(key).await {
                return CacheLookup::with_value(value, LookupState::Fresh);
            }
            if !p.locks.is_locked(&lock_key).await {
                if let Some(value) = p.store.get_fresh(key).await {
                    return CacheLookup::with_value(value, LookupState::Fresh);
                }
                debug!(key = %key, "Lock released without a value");
                break;
            }
        }

        self.best_effort(key).await
    }

    /// stale이 있으면 stale, 없으면 빈 결과.
    async fn best_effort(&self, key: &CacheKey) -> CacheLookup {
        match self.pipeline.store.get_stale(key).await {
            Some(value) => CacheLookup::with_value(value, LookupState::Stale),
            None => CacheLookup::without_value(LookupState::Empty),
        }
    }

    /// 백그라운드 페치 등록 (fire-and-forget).
    ///
    /// 레지스트리에 있거나 이미 대기/처리 중이면 `false`.
    pub async fn prefetch(&self, resource_id: &str, data_type: DataType, priority: Priority) -> bool {
        self.prefetch_with(resource_id, data_type, &FetchParams::new(), priority)
            .await
    }

    /// 파라미터가 있는 백그라운드 페치 등록.
    pub async fn prefetch_with(
        &self,
        resource_id: &str,
        data_type: DataType,
        params: &FetchParams,
        priority: Priority,
    ) -> bool {
        let request = FetchRequest::new(resource_id, data_type, priority).with_params(params.clone());
        self.pipeline.enqueue(request).await
    }

    /// 다중 조회. 부분 결과를 허용합니다.
    ///
    /// 마감은 `max_poll_wait`에 청크 사이 휴지 시간을 더한 값입니다.
    pub async fn batch_get(
        &self,
        resource_ids: &[String],
        data_type: DataType,
        params: &FetchParams,
    ) -> HashMap<String, Value> {
        let config = &self.pipeline.config;
        let chunks = resource_ids.len().div_ceil(config.batch_chunk_size.max(1)).max(1);
        let budget = config.max_poll_wait() + config.inter_chunk_pause() * (chunks as u32 - 1);
        self.batch_get_until(resource_ids, data_type, params, Instant::now() + budget)
            .await
    }

    /// 마감 시각이 있는 다중 조회.
    ///
    /// 결과 키는 정규화된 리소스 ID입니다.
    #[instrument(skip_all, fields(data_type = %data_type, count = resource_ids.len()))]
    pub async fn batch_get_until(
        &self,
        resource_ids: &[String],
        data_type: DataType,
        params: &FetchParams,
        deadline: Instant,
    ) -> HashMap<String, Value> {
        let p = &self.pipeline;
        let mut results = HashMap::with_capacity(resource_ids.len());
        let mut misses: Vec<CacheKey> = Vec::new();

        let mut seen = std::collections::HashSet::new();
        for raw in resource_ids {
            let id = normalize_resource_id(raw);
            if id.is_empty() || !seen.insert(id.clone()) {
                continue;
            }
            if p.registry.contains(&id).await {
                p.stats.record_not_found();
                continue;
            }

            let key = CacheKey::new(data_type, &id, params);
            if let Some(value) = p.store.get_fresh(&key).await {
                p.stats.record_fresh_hit();
                results.insert(id, value);
            } else if let Some(value) = p.store.get_stale(&key).await {
                p.stats.record_stale_hit();
                if !p.locks.is_locked(&key.lock_key()).await {
                    let request = FetchRequest::new(&id, data_type, Priority::High)
                        .with_params(params.clone());
                    p.enqueue(request).await;
                }
                results.insert(id, value);
            } else {
                p.stats.record_miss();
                misses.push(key);
            }
        }

        if misses.is_empty() {
            return results;
        }

        // 잠금 일괄 획득: 승자는 직접 페치, 패자는 마지막에 폴링
        let mut guards = Vec::new();
        let mut held_elsewhere = Vec::new();
        for key in misses {
            match p.locks.try_acquire(&key.lock_key(), p.config.lock_ttl()).await {
                Some(guard) => guards.push((key, guard)),
                None => held_elsewhere.push(key),
            }
        }

        if !guards.is_empty() {
            let ids: Vec<String> = guards
                .iter()
                .map(|(key, _)| key.resource_id().to_string())
                .collect();
            let held: Vec<&LockGuard> = guards.iter().map(|(_, guard)| guard).collect();
            let fetched = p
                .locks
                .hold(
                    &held,
                    p.config.lock_ttl(),
                    p.fetch_many(data_type, &ids, params, Gate::Deadline(deadline)),
                )
                .await;

            for (key, guard) in guards {
                p.locks.release(guard).await;
                if !fetched.contains_key(key.resource_id()) {
                    // 이번에 못 가져온 항목은 백그라운드로 넘깁니다 (무효 리소스는 enqueue가 거름)
                    let request = FetchRequest::new(key.resource_id(), data_type, Priority::Normal)
                        .with_params(params.clone());
                    p.enqueue(request).await;
                }
            }
            results.extend(fetched);
        }

        if !held_elsewhere.is_empty() {
            self.poll_many(&mut results, held_elsewhere, deadline).await;
        }

        info!(
            requested = resource_ids.len(),
            returned = results.len(),
            "배치 조회 완료"
        );
        results
    }

    /// 다른 프로세스가 잡고 있는 키들을 남은 예산 동안 폴링합니다.
    async fn poll_many(
        &self,
        results: &mut HashMap<String, Value>,
        mut pending: Vec<CacheKey>,
        deadline: Instant,
    ) {
        let p = &self.pipeline;
        while !pending.is_empty() && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(p.config.poll_interval().min(remaining)).await;

            let mut still_waiting = Vec::new();
            for key in pending {
                if let Some(value) = p.store.get_fresh(&key).await {
                    results.insert(key.resource_id().to_string(), value);
                } else if p.locks.is_locked(&key.lock_key()).await {
                    still_waiting.push(key);
                } else if let Some(value) = p.store.get_stale(&key).await {
                    results.insert(key.resource_id().to_string(), value);
                }
            }
            pending = still_waiting;
        }

        for key in pending {
            if let Some(value) = p.store.get_stale(&key).await {
                results.insert(key.resource_id().to_string(), value);
            }
        }
    }

    /// 리소스의 모든 파라미터 변형을 두 티어에서 삭제합니다.
    pub async fn invalidate_key(&self, resource_id: &str, data_type: DataType) -> Result<usize> {
        let deleted = self
            .pipeline
            .store
            .delete_resource(data_type, resource_id)
            .await?;
        info!(
            resource = %normalize_resource_id(resource_id),
            data_type = %data_type,
            deleted,
            "Cache invalidated"
        );
        Ok(deleted)
    }

    /// 무효 리소스 레지스트리.
    pub fn registry(&self) -> &Arc<InvalidResourceRegistry> {
        &self.pipeline.registry
    }

    /// rate limiter 상태.
    pub async fn rate_limit_state(&self) -> RateLimitState {
        self.pipeline.limiter.state().await
    }

    /// 통계 스냅샷.
    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats.snapshot()
    }

    /// 대기 중인 백그라운드 요청 수.
    pub async fn queued(&self) -> usize {
        self.scheduler.queue().len().await
    }

    /// 대기 및 처리 중인 요청이 모두 끝날 때까지 기다립니다.
    ///
    /// 시간 안에 비워지면 `true`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let queue = self.scheduler.queue();
        loop {
            if queue.is_empty().await && queue.in_flight().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// 저장소/limiter/큐 상태 점검.
    pub async fn health_check(&self) -> HealthReport {
        let p = &self.pipeline;
        let backend = p.store.backend();
        let backend_ok = match backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "Backend health check failed");
                false
            }
        };

        HealthReport {
            backend: backend.name(),
            backend_ok,
            rate_limit: p.limiter.state().await,
            queued: self.scheduler.queue().len().await,
            in_flight: self.scheduler.queue().in_flight().await,
            invalid_resources: p.registry.len().await,
            workers_running: !self.scheduler.is_shutdown(),
        }
    }
}
