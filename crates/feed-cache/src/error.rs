//! 캐시 코디네이터 에러 타입.
//!
//! 두 계층으로 나뉩니다:
//!
//! - [`CacheError`]: 공유 저장소/레지스트리 등 내부 인프라 에러.
//!   호출자에게 전파되지 않고 로그 후 degrade 됩니다.
//! - [`SourceError`]: 업스트림 어댑터 결과. [`FailureClass`]로 정확히 하나의
//!   처리 경로(재시도, 냉각, 레지스트리 등록, 폐기)에 매핑됩니다.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 인프라 에러.
#[derive(Debug, Error)]
pub enum CacheError {
    /// 저장소 연결 불가 (장애 전환 대상)
    #[error("Connection error: {0}")]
    Connection(String),

    /// 저장소 명령 실패
    #[error("Backend error: {0}")]
    Backend(String),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 레지스트리 파일 입출력 오류
    #[error("Registry I/O error: {0}")]
    Io(String),

    /// 설정 오류
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// 연결 계열 에러인지 확인 (in-process 저장소로 전환할지 판단).
    pub fn is_connection(&self) -> bool {
        matches!(self, CacheError::Connection(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            CacheError::Connection(err.to_string())
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<feed_core::CoreError> for CacheError {
    fn from(err: feed_core::CoreError) -> Self {
        CacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// 업스트림 실패 분류.
///
/// 모든 어댑터 실패는 정확히 하나의 분류에 속합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 네트워크/5xx - 제자리에서 재시도
    Transient,
    /// provider 스로틀링 신호 - 냉각 진입 후 재큐
    RateLimited,
    /// 존재하지 않는 리소스 - 레지스트리 등록 후 폐기
    PermanentlyInvalid,
    /// 분류 불가 - 재시도 소진 후 폐기
    Unknown,
}

impl FailureClass {
    /// 같은 요청 안에서 재시도할 대상인지 확인.
    pub fn retry_in_place(&self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::PermanentlyInvalid => "permanently_invalid",
            FailureClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 어댑터 실패.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    Network(String),

    /// 요청 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 업스트림 5xx
    #[error("Upstream server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 요청 한도 초과
    #[error("Rate limit exceeded")]
    RateLimited {
        /// provider가 알려준 재시도 대기 시간
        retry_after: Option<Duration>,
    },

    /// 리소스가 존재하지 않음 (상장 폐지 등)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// 응답 파싱 실패
    #[error("Parse error: {0}")]
    Parse(String),

    /// 예상치 못한 응답
    #[error("Unexpected response {status}: {message}")]
    Unexpected { status: u16, message: String },

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SourceError {
    /// 실패 분류.
    pub fn classify(&self) -> FailureClass {
        match self {
            SourceError::Network(_) | SourceError::Timeout(_) | SourceError::Server { .. } => {
                FailureClass::Transient
            }
            SourceError::RateLimited { .. } => FailureClass::RateLimited,
            SourceError::NotFound(_) => FailureClass::PermanentlyInvalid,
            SourceError::Parse(_) | SourceError::Unexpected { .. } | SourceError::Unknown(_) => {
                FailureClass::Unknown
            }
        }
    }

    /// provider가 알려준 재시도 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            SourceError::Network(err.to_string())
        } else if err.is_decode() {
            SourceError::Parse(err.to_string())
        } else {
            SourceError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Parse(err.to_string())
    }
}
