//! 시장 데이터 캐시 수집기.
//!
//! 캐시 코디네이터를 감싸는 CLI와 데몬을 제공합니다:
//! - 단건/다건 조회 및 프리페치
//! - 캐시 무효화와 무효 리소스 레지스트리 관리
//! - 관심 종목 주기 프리페치 (데몬 모드)

pub mod error;
pub mod stats;
pub mod watchlist;

pub use error::{CollectorError, Result};
pub use stats::CollectionStats;
