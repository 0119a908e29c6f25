//! 캐시 저장소.
//!
//! - [`KvBackend`]: 공유 key-value 저장소 추상화 (Redis / 프로세스 내 메모리)
//! - [`CacheStore`]: fresh/stale 두 티어와 선택적 L1 로컬 캐시
//! - [`connect_backend`]: 설정에 따라 생성 시점에 백엔드 선택
//!
//! 저장소 에러는 호출자에게 전파하지 않습니다. 읽기 실패는 miss로,
//! 쓰기 실패는 경고 로그로 처리합니다.

mod failover;
mod memory;
mod redis;

pub use failover::FailoverBackend;
pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;

use async_trait::async_trait;
use feed_core::{CacheKey, DataType, RedisConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;

/// 슬라이딩 윈도우 입장 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    /// 이번 호출이 기록되었는지 여부
    pub admitted: bool,
    /// 윈도우 내 기록 수 (이번 호출 포함)
    pub count: u32,
    /// 윈도우 내 가장 오래된 기록 (epoch 밀리초)
    pub oldest_ms: Option<i64>,
}

impl WindowAdmission {
    /// 다음 슬롯이 열릴 때까지 남은 시간.
    pub fn retry_after(&self, now_ms: i64, window: Duration) -> Duration {
        match self.oldest_ms {
            Some(oldest) => {
                let opens_at = oldest + window.as_millis() as i64;
                Duration::from_millis((opens_at - now_ms).max(1) as u64)
            }
            None => Duration::from_millis(1),
        }
    }
}

/// 공유 key-value 저장소.
///
/// 모든 프로세스가 같은 인스턴스를 바라보면 잠금/rate limit/캐시가
/// 프로세스 간에 공유됩니다.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// 백엔드 이름 (로깅/헬스 체크용).
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// TTL과 함께 저장 (덮어쓰기).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 여러 키를 한 번에 저장. 다른 클라이언트에게는 원자적으로 보입니다.
    async fn set_many_ex(&self, entries: &[(String, String, Duration)]) -> Result<()>;

    /// 키가 없을 때만 저장. 저장했으면 `true`.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// 현재 값이 `expected`일 때만 삭제 (compare-and-delete).
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// 현재 값이 `expected`일 때만 TTL을 다시 설정 (잠금 연장).
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// 접두사로 시작하는 키 삭제. 삭제한 키 수 반환.
    ///
    /// `except_suffixes` 중 하나로 끝나는 키는 남겨 둡니다.
    async fn del_prefix(&self, prefix: &str, except_suffixes: &[&str]) -> Result<usize>;

    /// 남은 TTL. 키가 없으면 `None`.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>>;

    /// 슬라이딩 윈도우 입장 시도.
    ///
    /// `(now - window, now]` 구간의 기록 수가 `limit` 미만이면 `now`를 기록하고
    /// 입장시킵니다. 확인과 기록은 하나의 원자적 단계입니다.
    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u32,
    ) -> Result<WindowAdmission>;

    /// 기록 없이 윈도우 상태만 조회.
    async fn window_peek(&self, key: &str, now_ms: i64, window: Duration)
        -> Result<WindowAdmission>;

    async fn ping(&self) -> Result<()>;
}

/// 설정에 따라 공유 저장소를 선택합니다.
///
/// Redis가 비활성화되었거나 연결할 수 없으면 프로세스 내 저장소를 사용합니다.
/// 연결에 성공하면 런타임 장애 시 자동 전환되는 [`FailoverBackend`]를 반환합니다.
pub async fn connect_backend(config: &RedisConfig) -> Arc<dyn KvBackend> {
    if !config.enabled {
        info!("Redis disabled, using in-process store");
        return Arc::new(MemoryBackend::new());
    }

    match RedisBackend::connect(config).await {
        Ok(redis) => Arc::new(FailoverBackend::new(
            redis,
            MemoryBackend::new(),
            config.recheck_interval(),
        )),
        Err(e) => {
            warn!(error = %e, "Redis 연결 실패, 프로세스 내 저장소로 대체");
            Arc::new(MemoryBackend::new())
        }
    }
}

/// fresh/stale TTL 쌍.
///
/// stale TTL은 항상 fresh TTL 이상으로 정규화됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    fresh: Duration,
    stale: Duration,
}

impl TtlPolicy {
    pub fn new(fresh: Duration, stale: Duration) -> Self {
        Self {
            fresh,
            stale: stale.max(fresh),
        }
    }

    pub fn fresh(&self) -> Duration {
        self.fresh
    }

    pub fn stale(&self) -> Duration {
        self.stale
    }
}

/// 프로세스 내 L1 캐시.
struct LocalTier {
    cache: MemoryBackend,
    ttl: Duration,
}

/// 2티어 캐시 저장소.
///
/// 쓰기는 항상 fresh와 stale 티어를 함께 갱신하므로, stale로 읽히는 값은
/// 반드시 한 번은 fresh로 읽힐 수 있었던 값입니다.
pub struct CacheStore {
    backend: Arc<dyn KvBackend>,
    local: Option<LocalTier>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            local: None,
        }
    }

    /// L1 로컬 캐시 활성화.
    ///
    /// L1 항목은 fresh TTL보다 짧게 유지되며 공유 저장소가 기준입니다.
    pub fn with_local_tier(mut self, ttl: Duration) -> Self {
        self.local = Some(LocalTier {
            cache: MemoryBackend::new(),
            ttl,
        });
        self
    }

    /// 공유 저장소.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// fresh 티어 조회.
    pub async fn get_fresh(&self, key: &CacheKey) -> Option<Value> {
        let fresh_key = key.fresh_key();

        if let Some(local) = &self.local {
            if let Ok(Some(raw)) = local.cache.get(&fresh_key).await {
                if let Some(value) = decode(&fresh_key, &raw) {
                    return Some(value);
                }
            }
        }

        let raw = self.read(&fresh_key).await?;
        let value = decode(&fresh_key, &raw)?;

        if let Some(local) = &self.local {
            let _ = local.cache.set_ex(&fresh_key, &raw, local.ttl).await;
        }

        Some(value)
    }

    /// stale 티어 조회.
    pub async fn get_stale(&self, key: &CacheKey) -> Option<Value> {
        let stale_key = key.stale_key();
        let raw = self.read(&stale_key).await?;
        decode(&stale_key, &raw)
    }

    /// 두 티어에 값을 저장합니다.
    pub async fn set(&self, key: &CacheKey, value: &Value, ttl: TtlPolicy) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let fresh_key = key.fresh_key();

        let entries = [
            (fresh_key.clone(), raw.clone(), ttl.fresh()),
            (key.stale_key(), raw.clone(), ttl.stale()),
        ];
        self.backend.set_many_ex(&entries).await?;

        if let Some(local) = &self.local {
            let local_ttl = local
                .ttl
                .min(ttl.fresh().saturating_sub(Duration::from_millis(1)));
            if !local_ttl.is_zero() {
                let _ = local.cache.set_ex(&fresh_key, &raw, local_ttl).await;
            }
        }

        debug!(key = %key, fresh_ms = ttl.fresh().as_millis() as u64, "데이터 캐시 완료");
        Ok(())
    }

    /// 키의 두 티어와 부가 키(잠금 제외)를 삭제합니다.
    pub async fn delete(&self, key: &CacheKey) -> Result<()> {
        let fresh_key = key.fresh_key();
        self.backend.del(&fresh_key).await?;
        self.backend.del(&key.stale_key()).await?;
        self.backend.del(&key.pending_key()).await?;

        if let Some(local) = &self.local {
            let _ = local.cache.del(&fresh_key).await;
        }
        Ok(())
    }

    /// 리소스의 모든 파라미터 변형에서 fresh/stale 티어를 삭제합니다.
    ///
    /// 진행 중인 페치의 잠금과 placeholder는 남겨 둡니다.
    pub async fn delete_resource(&self, data_type: DataType, resource_id: &str) -> Result<usize> {
        let prefix = CacheKey::resource_prefix(data_type, resource_id);
        let deleted = self
            .backend
            .del_prefix(&prefix, CacheKey::COORDINATION_SUFFIXES)
            .await?;

        if let Some(local) = &self.local {
            let _ = local
                .cache
                .del_prefix(&prefix, CacheKey::COORDINATION_SUFFIXES)
                .await;
        }
        Ok(deleted)
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }
}

fn decode(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "Cached payload is not valid JSON, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_core::FetchParams;
    use proptest::prelude::*;
    use serde_json::json;

    fn quote_key(id: &str) -> CacheKey {
        CacheKey::new(DataType::Quote, id, &FetchParams::new())
    }

    fn store() -> CacheStore {
        CacheStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_set_populates_both_tiers() {
        let store = store();
        let key = quote_key("AAPL");
        let value = json!({"price": 187.5});

        store
            .set(&key, &value, TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(3600)))
            .await
            .unwrap();

        assert_eq!(store.get_fresh(&key).await, Some(value.clone()));
        assert_eq!(store.get_stale(&key).await, Some(value));
    }

    #[tokio::test]
    async fn test_fresh_expires_before_stale() {
        let store = store();
        let key = quote_key("MSFT");
        store
            .set(
                &key,
                &json!(1),
                TtlPolicy::new(Duration::from_millis(50), Duration::from_secs(60)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get_fresh(&key).await, None);
        assert_eq!(store.get_stale(&key).await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_delete_resource_removes_every_param_variant() {
        let store = store();
        let ttl = TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(60));
        let daily = CacheKey::new(
            DataType::History,
            "AAPL",
            &FetchParams::new().with("period", "1d"),
        );
        let yearly = CacheKey::new(
            DataType::History,
            "AAPL",
            &FetchParams::new().with("period", "1y"),
        );
        let other = CacheKey::new(DataType::History, "AAPLX", &FetchParams::new());

        for key in [&daily, &yearly, &other] {
            store.set(key, &json!("bars"), ttl).await.unwrap();
        }

        let deleted = store
            .delete_resource(DataType::History, "aapl")
            .await
            .unwrap();
        assert_eq!(deleted, 4);
        assert_eq!(store.get_stale(&daily).await, None);
        assert_eq!(store.get_stale(&yearly).await, None);
        assert!(store.get_fresh(&other).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_resource_keeps_lock_and_placeholder() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(backend.clone());
        let ttl = TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(60));
        let key = quote_key("AAPL");

        store.set(&key, &json!(1), ttl).await.unwrap();
        backend
            .set_ex(&key.lock_key(), "owner", Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set_ex(&key.pending_key(), "1", Duration::from_secs(60))
            .await
            .unwrap();

        let deleted = store.delete_resource(DataType::Quote, "AAPL").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.get_stale(&key).await, None);
        assert_eq!(
            backend.get(&key.lock_key()).await.unwrap().as_deref(),
            Some("owner")
        );
        assert!(backend.get(&key.pending_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_tier_is_cleared_on_delete() {
        let store = store().with_local_tier(Duration::from_secs(5));
        let key = quote_key("TSLA");
        let ttl = TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(60));

        store.set(&key, &json!(250), ttl).await.unwrap();
        assert_eq!(store.get_fresh(&key).await, Some(json!(250)));

        store.delete(&key).await.unwrap();
        assert_eq!(store.get_fresh(&key).await, None);
    }

    #[tokio::test]
    async fn test_corrupt_payload_reads_as_miss() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(backend.clone());
        let key = quote_key("BAD");

        backend
            .set_ex(&key.fresh_key(), "{not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get_fresh(&key).await, None);
    }

    proptest! {
        #[test]
        fn prop_stale_ttl_never_shorter_than_fresh(fresh in 0u64..1_000_000, stale in 0u64..1_000_000) {
            let policy = TtlPolicy::new(Duration::from_millis(fresh), Duration::from_millis(stale));
            prop_assert!(policy.stale() >= policy.fresh());
            prop_assert_eq!(policy.fresh(), Duration::from_millis(fresh));
        }
    }
}
