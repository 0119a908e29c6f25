//! 수집 통계 구조체.

use serde::Serialize;
use std::time::Duration;

/// 수집 작업 통계
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    /// 총 요청 리소스 수
    pub total: usize,
    /// 값을 얻은 리소스 수
    pub success: usize,
    /// 백그라운드 큐에 등록된 수
    pub queued: usize,
    /// 이미 대기 중이거나 무효 리소스라 건너뛴 수
    pub skipped: usize,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl CollectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 성공률 계산 (%)
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.success as f64 / self.total as f64) * 100.0
        }
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            total = self.total,
            success = self.success,
            queued = self.queued,
            skipped = self.skipped,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "수집 완료"
        );
    }
}
