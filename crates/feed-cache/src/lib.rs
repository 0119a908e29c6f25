//! 업스트림 시장 데이터 캐시 코디네이터.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Coordinator: fresh/stale 2단계 캐시 조회 파사드
//! - 공유 rate limiter (슬라이딩 윈도우 + 최소 호출 간격 + 냉각)
//! - 키 단위 분산 잠금으로 중복 업스트림 호출 방지
//! - 우선순위 백그라운드 페치 큐와 워커 풀
//! - 영구 무효 리소스 레지스트리
//! - Redis 저장소와 프로세스 내 대체 저장소

pub mod adapter;
pub mod coordinator;
pub mod error;
pub mod lock;
mod pipeline;
pub mod rate_limiter;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use adapter::{BatchResult, HttpSourceAdapter, SourceAdapter, SourceResult};
pub use coordinator::{CacheLookup, Coordinator, CoordinatorBuilder, HealthReport, LookupState};
pub use error::*;
pub use lock::{LockGuard, LockManager};
pub use rate_limiter::{LimiterPhase, RateLimitState, RateLimiter};
pub use registry::InvalidResourceRegistry;
pub use scheduler::{EnqueueOutcome, FetchQueue, FetchScheduler};
pub use stats::{CoordinatorStats, StatsSnapshot};
pub use store::{
    connect_backend, CacheStore, FailoverBackend, KvBackend, MemoryBackend, RedisBackend,
    TtlPolicy, WindowAdmission,
};
