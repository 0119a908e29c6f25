//! 백그라운드 페치 요청.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::data_type::{DataType, Priority};
use super::key::{normalize_resource_id, CacheKey, FetchParams};

/// 스케줄러 큐에 들어가는 페치 요청.
///
/// `(resource_id, data_type)` 쌍으로 중복 제거됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub resource_id: String,
    pub data_type: DataType,
    pub priority: Priority,
    #[serde(default)]
    pub params: FetchParams,
    pub enqueued_at: DateTime<Utc>,
}

impl FetchRequest {
    /// 새 요청 생성.
    pub fn new(resource_id: &str, data_type: DataType, priority: Priority) -> Self {
        Self {
            resource_id: normalize_resource_id(resource_id),
            data_type,
            priority,
            params: FetchParams::default(),
            enqueued_at: Utc::now(),
        }
    }

    /// 파라미터 설정.
    pub fn with_params(mut self, params: FetchParams) -> Self {
        self.params = params;
        self
    }

    /// 중복 제거 키.
    pub fn dedup_key(&self) -> (String, DataType) {
        (self.resource_id.clone(), self.data_type)
    }

    /// 대상 캐시 키.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.data_type, &self.resource_id, &self.params)
    }
}
