//! Single-flight 분산 잠금.
//!
//! 키마다 하나의 소유자만 업스트림 호출을 수행하도록 보장합니다.
//! 잠금은 TTL로 자동 만료되므로 소유자가 죽어도 영구히 남지 않습니다.
//! 살아 있는 소유자는 [`LockManager::hold`]로 작업이 끝날 때까지 TTL을 연장합니다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::KvBackend;

/// 획득한 잠금.
///
/// 해제는 [`LockManager::release`]로 명시적으로 수행합니다. 해제하지 않아도
/// TTL이 지나면 만료됩니다.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "잠금은 작업 후 release 해야 합니다"]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 소유자 토큰.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// 분산 잠금 관리자.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn KvBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// 잠금 획득 시도. 이미 다른 소유자가 있으면 `None`.
    ///
    /// 저장소 오류도 `None`으로 처리하여 호출자가 대기 경로로 가도록 합니다.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        let token = Uuid::new_v4().to_string();
        match self.backend.set_nx_ex(key, &token, ttl).await {
            Ok(true) => {
                debug!(key, "Lock acquired");
                Some(LockGuard {
                    key: key.to_string(),
                    token,
                })
            }
            Ok(false) => None,
            Err(e) => {
                warn!(key, error = %e, "Lock acquisition failed");
                None
            }
        }
    }

    /// 잠금 해제. 소유자가 바뀌었으면 (만료 후 재획득) 아무것도 하지 않습니다.
    pub async fn release(&self, guard: LockGuard) -> bool {
        match self.backend.del_if_eq(&guard.key, &guard.token).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(key = %guard.key, "Lock already expired or taken over");
                false
            }
            Err(e) => {
                warn!(key = %guard.key, error = %e, "Lock release failed, waiting for TTL");
                false
            }
        }
    }

    /// 소유자가 그대로일 때만 TTL 연장.
    pub async fn extend(&self, guard: &LockGuard, ttl: Duration) -> bool {
        match self.backend.expire_if_eq(&guard.key, &guard.token, ttl).await {
            Ok(extended) => extended,
            Err(e) => {
                warn!(key = %guard.key, error = %e, "Lock extension failed");
                false
            }
        }
    }

    /// `work`가 끝날 때까지 `ttl / 3` 간격으로 잠금을 연장합니다.
    ///
    /// rate limiter 대기나 느린 업스트림 응답이 TTL보다 길어도 다른 호출자가
    /// 같은 키를 가져가지 못합니다.
    pub async fn hold<F: Future>(&self, guards: &[&LockGuard], ttl: Duration, work: F) -> F::Output {
        let period = (ttl / 3).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    for guard in guards {
                        if !self.extend(guard, ttl).await {
                            warn!(key = %guard.key, "Lock lost while holding it");
                        }
                    }
                }
            }
        }
    }

    /// 잠금이 걸려 있는지 확인.
    pub async fn is_locked(&self, key: &str) -> bool {
        matches!(self.backend.get(key).await, Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_only_one_holder_at_a_time() {
        let locks = manager();
        let first = locks.try_acquire("k:lock", Duration::from_secs(5)).await;
        assert!(first.is_some());
        assert!(locks
            .try_acquire("k:lock", Duration::from_secs(5))
            .await
            .is_none());
        assert!(locks.is_locked("k:lock").await);

        assert!(locks.release(first.unwrap()).await);
        assert!(!locks.is_locked("k:lock").await);
        assert!(locks
            .try_acquire("k:lock", Duration::from_secs(5))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_holder_cannot_release_new_owner() {
        let locks = manager();
        let stale = locks
            .try_acquire("k:lock", Duration::from_millis(30))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = locks
            .try_acquire("k:lock", Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(stale.token(), current.token());

        assert!(!locks.release(stale).await);
        assert!(locks.is_locked("k:lock").await);
        assert!(locks.release(current).await);
    }

    #[tokio::test]
    async fn test_hold_keeps_lock_past_its_ttl() {
        let locks = manager();
        let ttl = Duration::from_millis(60);
        let guard = locks.try_acquire("slow:lock", ttl).await.unwrap();

        let contender = locks.clone();
        let taken_meanwhile = locks
            .hold(&[&guard], ttl, async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                contender.try_acquire("slow:lock", ttl).await.is_some()
            })
            .await;

        assert!(!taken_meanwhile);
        assert!(locks.release(guard).await);
    }

    #[tokio::test]
    async fn test_extend_fails_after_takeover() {
        let locks = manager();
        let stale = locks
            .try_acquire("k:lock", Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = locks
            .try_acquire("k:lock", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!locks.extend(&stale, Duration::from_secs(5)).await);
        assert!(locks.extend(&current, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let locks = manager();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .try_acquire("race:lock", Duration::from_secs(5))
                    .await
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
