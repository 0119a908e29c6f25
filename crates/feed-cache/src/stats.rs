//! 코디네이터 통계.
//!
//! 프로세스 로컬 카운터입니다. 같은 이벤트가 `metrics` 파사드로도 기록되므로
//! 외부 수집기는 그쪽을 사용하고, 이 값은 CLI 요약/헬스 체크용입니다.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FailureClass;

/// 원자적 카운터 모음.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    not_found: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_success: AtomicU64,
    transient_failures: AtomicU64,
    rate_limited: AtomicU64,
    invalid: AtomicU64,
    unknown_failures: AtomicU64,
    enqueued: AtomicU64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fresh_hit(&self) {
        self.fresh_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_call(&self) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_success(&self) {
        self.upstream_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, class: FailureClass) {
        let counter = match class {
            FailureClass::Transient => &self.transient_failures,
            FailureClass::RateLimited => &self.rate_limited,
            FailureClass::PermanentlyInvalid => &self.invalid,
            FailureClass::Unknown => &self.unknown_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값 스냅샷.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_success: self.upstream_success.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            unknown_failures: self.unknown_failures.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
        }
    }
}

/// 통계 스냅샷.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub not_found: u64,
    pub upstream_calls: u64,
    pub upstream_success: u64,
    pub transient_failures: u64,
    pub rate_limited: u64,
    pub invalid: u64,
    pub unknown_failures: u64,
    pub enqueued: u64,
}

impl StatsSnapshot {
    /// 캐시 적중률 (stale 포함).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.fresh_hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            fresh_hits = self.fresh_hits,
            stale_hits = self.stale_hits,
            misses = self.misses,
            upstream_calls = self.upstream_calls,
            upstream_success = self.upstream_success,
            rate_limited = self.rate_limited,
            invalid = self.invalid,
            hit_rate = format!("{:.1}%", self.hit_rate() * 100.0),
            "코디네이터 통계"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CoordinatorStats::new();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);

        stats.record_fresh_hit();
        stats.record_stale_hit();
        stats.record_miss();
        stats.record_miss();

        let snapshot = stats.snapshot();
        assert!((snapshot.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failures_are_counted_per_class() {
        let stats = CoordinatorStats::new();
        stats.record_failure(FailureClass::Transient);
        stats.record_failure(FailureClass::Transient);
        stats.record_failure(FailureClass::RateLimited);
        stats.record_failure(FailureClass::PermanentlyInvalid);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transient_failures, 2);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.invalid, 1);
        assert_eq!(snapshot.unknown_failures, 0);
    }
}
