//! # Feed Core
//!
//! 시장 데이터 피드 백엔드의 공통 도메인 타입을 제공합니다.
//!
//! 이 크레이트는 캐시 코디네이터와 수집기가 함께 사용하는 기본 요소를 담고 있습니다:
//! - 데이터 유형, 우선순위, 페치 요청 타입
//! - 캐시 키 네임스페이스 규칙
//! - 설정 관리 (`config` 크레이트 기반)
//! - 로깅 인프라 (`tracing-subscriber` 기반)

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use types::*;
