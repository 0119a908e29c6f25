//! 에러 타입 정의.

use thiserror::Error;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(#[from] feed_core::CoreError),

    /// 코디네이터 인프라 에러
    #[error("Cache error: {0}")]
    Cache(#[from] feed_cache::CacheError),

    /// 잘못된 CLI 입력
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 출력 직렬화 에러
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
