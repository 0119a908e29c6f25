//! 코어 에러 타입.

use thiserror::Error;

/// 설정 및 도메인 파싱 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 로드/검증 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 로깅 초기화 에러
    #[error("로깅 에러: {0}")]
    Logging(String),

    /// 알 수 없는 데이터 유형
    #[error("알 수 없는 데이터 유형: {0}")]
    InvalidDataType(String),

    /// 알 수 없는 우선순위
    #[error("알 수 없는 우선순위: {0}")]
    InvalidPriority(String),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

/// 코어 작업을 위한 Result 타입.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
