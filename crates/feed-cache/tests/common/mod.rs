//! 통합 테스트 공용 도구.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use feed_cache::{
    BatchResult, Coordinator, KvBackend, MemoryBackend, SourceAdapter, SourceError, SourceResult,
};
use feed_core::{CoordinatorConfig, DataType, FetchParams};

/// 빠른 타이밍의 테스트 설정.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        calls_per_window: 100,
        window_ms: 1_000,
        rate_limit_buffer: 0,
        min_call_interval_ms: 0,
        cooldown_ms: 200,
        poll_interval_ms: 20,
        max_poll_wait_ms: 2_000,
        inter_chunk_pause_ms: 20,
        retry_backoff_ms: 10,
        idle_wait_ms: 20,
        worker_count: 2,
        ..CoordinatorConfig::default()
    }
}

pub fn coordinator(config: CoordinatorConfig, adapter: &Arc<MockAdapter>) -> Coordinator {
    coordinator_on(config, adapter, Arc::new(MemoryBackend::new()))
}

/// 저장소를 공유하는 코디네이터 (여러 프로세스 흉내).
pub fn coordinator_on(
    config: CoordinatorConfig,
    adapter: &Arc<MockAdapter>,
    backend: Arc<dyn KvBackend>,
) -> Coordinator {
    Coordinator::builder(config)
        .backend(backend)
        .adapter(Arc::clone(adapter) as Arc<dyn SourceAdapter>)
        .build()
        .unwrap()
}

pub fn quote(id: &str) -> Value {
    json!({ "symbol": id, "price": 101.5 })
}

/// 호출을 기록하는 스크립트형 어댑터.
pub struct MockAdapter {
    data_type: DataType,
    batch: bool,
    delay: Duration,
    not_found: HashSet<String>,
    throttled_once: Mutex<HashSet<String>>,
    rate_limit_next: AtomicUsize,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
    resets: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    seen: Mutex<Vec<String>>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl MockAdapter {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            batch: false,
            delay: Duration::ZERO,
            not_found: HashSet::new(),
            throttled_once: Mutex::new(HashSet::new()),
            rate_limit_next: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_batch(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_not_found(mut self, ids: &[&str]) -> Self {
        self.not_found.extend(ids.iter().map(|id| id.to_string()));
        self
    }

    /// 배치 응답 안에서 해당 항목만 처음 한 번 rate limit 응답.
    pub fn with_item_rate_limit(self, ids: &[&str]) -> Self {
        self.throttled_once
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
        self
    }

    /// 다음 `n`번의 호출은 rate limit 응답.
    pub fn rate_limit_next(self, n: usize) -> Self {
        self.rate_limit_next.store(n, Ordering::SeqCst);
        self
    }

    /// 다음 `n`번의 호출은 네트워크 오류.
    pub fn fail_next(self, n: usize) -> Self {
        self.fail_next.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    /// 단일 호출 순서대로 받은 리소스 ID.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn answer(&self, resource_id: &str) -> SourceResult<Value> {
        if self.not_found.contains(resource_id) {
            Err(SourceError::NotFound(resource_id.to_string()))
        } else {
            Ok(quote(resource_id))
        }
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    async fn fetch(&self, resource_id: &str, _params: &FetchParams) -> SourceResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.seen.lock().unwrap().push(resource_id.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if Self::take(&self.rate_limit_next) {
            return Err(SourceError::RateLimited { retry_after: None });
        }
        if Self::take(&self.fail_next) {
            return Err(SourceError::Network("connection reset by peer".to_string()));
        }
        self.answer(resource_id)
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn fetch_batch(
        &self,
        resource_ids: &[String],
        _params: &FetchParams,
    ) -> SourceResult<BatchResult> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.batches.lock().unwrap().push(resource_ids.to_vec());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if Self::take(&self.rate_limit_next) {
            return Err(SourceError::RateLimited { retry_after: None });
        }

        let mut throttled = self.throttled_once.lock().unwrap();
        Ok(resource_ids
            .iter()
            .map(|id| {
                let answer = if throttled.remove(id) {
                    Err(SourceError::RateLimited { retry_after: None })
                } else {
                    self.answer(id)
                };
                (id.clone(), answer)
            })
            .collect())
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
