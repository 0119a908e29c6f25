//! Redis → 프로세스 내 저장소 자동 전환.
//!
//! 연결 계열 에러가 나면 degraded 상태로 전환하고 모든 작업을 메모리
//! 저장소로 보냅니다. `recheck` 간격이 지나면 다시 Redis를 시도합니다.
//! degraded 동안의 잠금과 rate limit은 프로세스 내에서만 유효합니다.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{KvBackend, MemoryBackend, RedisBackend, WindowAdmission};
use crate::error::{CacheError, Result};

/// `degraded_at`이 이 값이면 정상 상태.
const HEALTHY: u64 = 0;

/// primary 연결 에러 시 fallback으로 전환하고, 그 외 에러는 그대로 반환합니다.
macro_rules! route {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {{
        if $self.primary_available() {
            match $self.primary.$method($($arg),*).await {
                Ok(value) => {
                    $self.mark_healthy();
                    return Ok(value);
                }
                Err(e) if e.is_connection() => $self.mark_degraded(&e),
                Err(e) => return Err(e),
            }
        }
        $self.fallback.$method($($arg),*).await
    }};
}

/// 장애 전환 저장소.
pub struct FailoverBackend {
    primary: RedisBackend,
    fallback: MemoryBackend,
    recheck: Duration,
    started: Instant,
    /// degraded 진입 시각 (started 기준 ms + 1), 정상이면 0
    degraded_at: AtomicU64,
}

impl FailoverBackend {
    pub fn new(primary: RedisBackend, fallback: MemoryBackend, recheck: Duration) -> Self {
        Self {
            primary,
            fallback,
            recheck,
            started: Instant::now(),
            degraded_at: AtomicU64::new(HEALTHY),
        }
    }

    /// 현재 degraded 상태인지 확인.
    pub fn is_degraded(&self) -> bool {
        self.degraded_at.load(Ordering::Acquire) != HEALTHY
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn primary_available(&self) -> bool {
        match self.degraded_at.load(Ordering::Acquire) {
            HEALTHY => true,
            since => self.elapsed_ms() + 1 >= since + self.recheck.as_millis() as u64,
        }
    }

    fn mark_degraded(&self, err: &CacheError) {
        let now = self.elapsed_ms() + 1;
        let previous = self.degraded_at.swap(now, Ordering::AcqRel);
        if previous == HEALTHY {
            warn!(
                error = %err,
                recheck_ms = self.recheck.as_millis() as u64,
                "Redis unavailable, falling back to in-process store"
            );
            metrics::counter!("feed_store_failovers_total").increment(1);
        }
    }

    fn mark_healthy(&self) {
        if self.degraded_at.swap(HEALTHY, Ordering::AcqRel) != HEALTHY {
            info!("Redis 연결 복구, 공유 저장소로 복귀");
        }
    }
}

#[async_trait]
impl KvBackend for FailoverBackend {
    fn name(&self) -> &'static str {
        if self.is_degraded() {
            "memory (redis degraded)"
        } else {
            "redis"
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        route!(self.get(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        route!(self.set_ex(key, value, ttl))
    }

    async fn set_many_ex(&self, entries: &[(String, String, Duration)]) -> Result<()> {
        route!(self.set_many_ex(entries))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        route!(self.set_nx_ex(key, value, ttl))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        route!(self.del(key))
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        route!(self.del_if_eq(key, expected))
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        route!(self.expire_if_eq(key, expected, ttl))
    }

    async fn del_prefix(&self, prefix: &str, except_suffixes: &[&str]) -> Result<usize> {
        route!(self.del_prefix(prefix, except_suffixes))
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        route!(self.pttl(key))
    }

    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u32,
    ) -> Result<WindowAdmission> {
        route!(self.window_admit(key, now_ms, window, limit))
    }

    async fn window_peek(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> Result<WindowAdmission> {
        route!(self.window_peek(key, now_ms, window))
    }

    async fn ping(&self) -> Result<()> {
        // 헬스 체크는 항상 Redis 상태를 반영합니다.
        match self.primary.ping().await {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            }
            Err(e) => {
                if e.is_connection() {
                    self.mark_degraded(&e);
                }
                Err(e)
            }
        }
    }
}
