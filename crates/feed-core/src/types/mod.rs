//! 코어 도메인 타입.
//!
//! - `data_type`: 업스트림 리소스 유형과 페치 우선순위
//! - `key`: 캐시 키 네임스페이스와 파라미터 해시
//! - `request`: 백그라운드 페치 요청

pub mod data_type;
pub mod key;
pub mod request;

pub use data_type::{DataType, Priority};
pub use key::{normalize_resource_id, CacheKey, FetchParams};
pub use request::FetchRequest;
