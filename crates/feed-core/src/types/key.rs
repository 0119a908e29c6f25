//! 캐시 키 네임스페이스.
//!
//! 모든 공유 저장소 키는 다음 규칙을 따릅니다:
//!
//! ```text
//! {dataType}:{resourceId}:{paramsHash}          fresh 티어
//! {dataType}:{resourceId}:{paramsHash}:stale    stale 티어
//! {dataType}:{resourceId}:{paramsHash}:lock     single-flight 잠금
//! {dataType}:{resourceId}:{paramsHash}:pending  비동기 로딩 placeholder
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use super::data_type::DataType;

/// 파라미터가 없을 때 사용하는 해시 자리 표시자.
const DEFAULT_PARAMS_HASH: &str = "default";

/// 파라미터 해시 길이 (hex 문자 수).
const PARAMS_HASH_LEN: usize = 12;

/// 리소스 식별자 정규화 (공백 제거 + 대문자).
pub fn normalize_resource_id(resource_id: &str) -> String {
    resource_id.trim().to_uppercase()
}

/// 업스트림 요청 파라미터 (예: `period=1y`).
///
/// 키 순서와 무관하게 같은 해시를 얻도록 정렬된 맵을 사용합니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchParams(BTreeMap<String, String>);

impl FetchParams {
    /// 빈 파라미터.
    pub fn new() -> Self {
        Self::default()
    }

    /// 파라미터 추가.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// 값 조회.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// (키, 값) 반복자.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 캐시 키용 파라미터 해시.
    ///
    /// SHA-256의 앞 12자리 hex. 파라미터가 없으면 `default`.
    pub fn hash(&self) -> String {
        if self.0.is_empty() {
            return DEFAULT_PARAMS_HASH.to_string();
        }

        let mut hasher = Sha256::new();
        for (key, value) in &self.0 {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"&");
        }
        let digest = hex::encode(hasher.finalize());
        digest[..PARAMS_HASH_LEN].to_string()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FetchParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

const LOCK_SUFFIX: &str = ":lock";
const PENDING_SUFFIX: &str = ":pending";

/// 논리적 캐시 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    data_type: DataType,
    resource_id: String,
    params_hash: String,
}

impl CacheKey {
    /// 잠금/placeholder 등 조정용 키의 접미사. 캐시 무효화 대상이 아닙니다.
    pub const COORDINATION_SUFFIXES: &'static [&'static str] = &[LOCK_SUFFIX, PENDING_SUFFIX];

    /// 새 캐시 키 생성. 리소스 식별자는 정규화됩니다.
    pub fn new(data_type: DataType, resource_id: &str, params: &FetchParams) -> Self {
        Self {
            data_type,
            resource_id: normalize_resource_id(resource_id),
            params_hash: params.hash(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// fresh 티어 키.
    pub fn fresh_key(&self) -> String {
        self.to_string()
    }

    /// stale 티어 키.
    pub fn stale_key(&self) -> String {
        format!("{}:stale", self)
    }

    /// single-flight 잠금 키.
    pub fn lock_key(&self) -> String {
        format!("{}{}", self, LOCK_SUFFIX)
    }

    /// 비동기 로딩 placeholder 키.
    pub fn pending_key(&self) -> String {
        format!("{}{}", self, PENDING_SUFFIX)
    }

    /// 리소스의 모든 파라미터 변형을 포괄하는 접두사.
    pub fn resource_prefix(data_type: DataType, resource_id: &str) -> String {
        format!("{}:{}:", data_type, normalize_resource_id(resource_id))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.data_type, self.resource_id, self.params_hash)
    }
}
