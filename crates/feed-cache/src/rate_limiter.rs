//! 공유 업스트림 rate limiter.
//!
//! 모든 프로세스가 같은 저장소 키로 한도를 공유합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Open ──[윈도우 내 호출 = 한도 - 여유분]──> Throttled
//!   ↑                                           │
//!   └────────────[윈도우가 밀려 자리 생김]──────┘
//!
//! (any) ──[provider rate limit 신호]──> Cooldown ──[냉각 종료]──> Open
//! ```
//!
//! 냉각 중에는 윈도우 상태와 무관하게 어떤 호출도 허용되지 않습니다.

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use feed_core::CoordinatorConfig;

use crate::adapter::SourceAdapter;
use crate::store::KvBackend;

/// 한 번에 잠드는 최대 시간 (취소/냉각 해제를 놓치지 않도록).
const MAX_NAP: Duration = Duration::from_secs(1);

/// 저장소 오류 시 재시도 대기.
const BACKEND_ERROR_WAIT: Duration = Duration::from_millis(250);

/// 대기 지터 상한 (밀리초). 여러 워커가 같은 순간에 깨어나지 않도록 합니다.
const JITTER_MS: u64 = 20;

/// Rate limiter 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterPhase {
    /// 호출 가능
    Open,
    /// 윈도우 예산 소진 - 자리가 날 때까지 대기
    Throttled,
    /// provider 신호로 냉각 중
    Cooldown,
}

impl std::fmt::Display for LimiterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimiterPhase::Open => write!(f, "open"),
            LimiterPhase::Throttled => write!(f, "throttled"),
            LimiterPhase::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// Rate limiter 상태 스냅샷.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    /// 현재 윈도우의 가장 오래된 호출 시각
    pub window_start: Option<DateTime<Utc>>,
    /// 윈도우 내 호출 수
    pub window_count: u32,
    /// 냉각 종료 시각
    pub cooldown_until: Option<DateTime<Utc>>,
    pub phase: LimiterPhase,
}

/// 한 번의 입장 시도 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Granted,
    Wait(Duration),
}

/// 공유 rate limiter.
pub struct RateLimiter {
    backend: Arc<dyn KvBackend>,
    group: String,
    budget: u32,
    window: Duration,
    min_interval: Duration,
    cooldown: Duration,
}

impl RateLimiter {
    /// 코디네이터 설정으로 생성합니다.
    ///
    /// 실제 허용량은 `calls_per_window - rate_limit_buffer`입니다.
    pub fn new(backend: Arc<dyn KvBackend>, config: &CoordinatorConfig) -> Self {
        Self {
            backend,
            group: config.rate_limit_group.clone(),
            budget: config.effective_budget(),
            window: config.window(),
            min_interval: config.min_call_interval(),
            cooldown: config.cooldown(),
        }
    }

    /// 윈도우당 허용 호출 수.
    pub fn budget(&self) -> u32 {
        self.budget
    }

    fn window_key(&self) -> String {
        format!("ratelimit:{}:window", self.group)
    }

    fn cooldown_key(&self) -> String {
        format!("ratelimit:{}:cooldown", self.group)
    }

    fn spacing_key(&self) -> String {
        format!("ratelimit:{}:spacing", self.group)
    }

    /// 호출 허가를 받을 때까지 대기합니다.
    ///
    /// 취소되면 `false`를 반환합니다.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_acquire().await {
                Admission::Granted => return true,
                Admission::Wait(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap(wait)) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// `budget` 안에 허가를 받으면 `true`.
    ///
    /// 남은 시간 안에 자리가 날 수 없으면 즉시 `false`를 반환합니다.
    pub async fn acquire_within(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            match self.try_acquire().await {
                Admission::Granted => return true,
                Admission::Wait(wait) => {
                    if Instant::now().checked_add(wait).map_or(true, |t| t > deadline) {
                        debug!(
                            wait_ms = wait.as_millis() as u64,
                            "Rate limiter wait exceeds caller budget"
                        );
                        return false;
                    }
                    tokio::time::sleep(nap(wait)).await;
                }
            }
        }
    }

    /// provider가 rate limit을 알려왔을 때 냉각에 진입하고 어댑터 세션을 초기화합니다.
    pub async fn report_rate_limited(
        &self,
        adapter: &dyn SourceAdapter,
        retry_after: Option<Duration>,
    ) {
        self.enter_cooldown(retry_after).await;
        adapter.reset().await;
    }

    /// 냉각 진입.
    ///
    /// 냉각 시간은 설정값과 provider의 `Retry-After` 중 긴 쪽입니다.
    pub(crate) async fn enter_cooldown(&self, retry_after: Option<Duration>) {
        let cooldown = retry_after.map_or(self.cooldown, |r| r.max(self.cooldown));
        let until = now_ms() + cooldown.as_millis() as i64;

        if let Err(e) = self
            .backend
            .set_ex(&self.cooldown_key(), &until.to_string(), cooldown)
            .await
        {
            warn!(error = %e, "Failed to persist rate limiter cooldown");
        }

        metrics::counter!("feed_rate_limiter_cooldowns_total", "group" => self.group.clone())
            .increment(1);
        warn!(
            group = %self.group,
            cooldown_ms = cooldown.as_millis() as u64,
            "Rate limiter tripped: -> Cooldown"
        );
    }

    /// 현재 상태 스냅샷.
    pub async fn state(&self) -> RateLimitState {
        let now = now_ms();

        let cooldown_until = match self.backend.pttl(&self.cooldown_key()).await {
            Ok(Some(remaining)) => to_datetime(now + remaining.as_millis() as i64),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read rate limiter cooldown");
                None
            }
        };

        let (window_start, window_count) =
            match self.backend.window_peek(&self.window_key(), now, self.window).await {
                Ok(w) => (w.oldest_ms.and_then(to_datetime), w.count),
                Err(e) => {
                    warn!(error = %e, "Failed to read rate limiter window");
                    (None, 0)
                }
            };

        let phase = if cooldown_until.is_some() {
            LimiterPhase::Cooldown
        } else if window_count >= self.budget {
            LimiterPhase::Throttled
        } else {
            LimiterPhase::Open
        };

        RateLimitState {
            window_start,
            window_count,
            cooldown_until,
            phase,
        }
    }

    /// 냉각 → 최소 간격 → 윈도우 순서로 확인합니다.
    async fn try_acquire(&self) -> Admission {
        match self.backend.pttl(&self.cooldown_key()).await {
            Ok(Some(remaining)) => return Admission::Wait(remaining),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Rate limiter cooldown check failed");
                return Admission::Wait(BACKEND_ERROR_WAIT);
            }
        }

        if !self.min_interval.is_zero() {
            match self
                .backend
                .set_nx_ex(&self.spacing_key(), "1", self.min_interval)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    let remaining = self
                        .backend
                        .pttl(&self.spacing_key())
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or(self.min_interval);
                    return Admission::Wait(remaining.min(self.min_interval));
                }
                Err(e) => {
                    warn!(error = %e, "Rate limiter spacing check failed");
                    return Admission::Wait(BACKEND_ERROR_WAIT);
                }
            }
        }

        let now = now_ms();
        match self
            .backend
            .window_admit(&self.window_key(), now, self.window, self.budget)
            .await
        {
            Ok(admission) if admission.admitted => {
                debug!(group = %self.group, count = admission.count, "Upstream call admitted");
                Admission::Granted
            }
            Ok(admission) => Admission::Wait(admission.retry_after(now, self.window)),
            Err(e) => {
                warn!(error = %e, "Rate limiter window check failed");
                Admission::Wait(BACKEND_ERROR_WAIT)
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn nap(wait: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);
    wait.min(MAX_NAP) + Duration::from_millis(jitter)
}
