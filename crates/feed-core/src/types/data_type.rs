//! 업스트림 데이터 유형과 페치 우선순위.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// 업스트림 리소스 유형.
///
/// 리소스 유형마다 하나의 `SourceAdapter`가 등록됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 실시간 시세
    Quote,
    /// 재무 지표
    Fundamentals,
    /// 과거 가격 시계열
    History,
    /// 뉴스 헤드라인
    News,
    /// 소셜 신호
    Social,
}

impl DataType {
    /// 캐시 키에 사용되는 문자열.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Quote => "quote",
            DataType::Fundamentals => "fundamentals",
            DataType::History => "history",
            DataType::News => "news",
            DataType::Social => "social",
        }
    }

    /// 모든 데이터 유형 반환.
    pub fn all() -> [DataType; 5] {
        [
            DataType::Quote,
            DataType::Fundamentals,
            DataType::History,
            DataType::News,
            DataType::Social,
        ]
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quote" | "quotes" => Ok(DataType::Quote),
            "fundamentals" | "fundamental" => Ok(DataType::Fundamentals),
            "history" | "historical" => Ok(DataType::History),
            "news" => Ok(DataType::News),
            "social" => Ok(DataType::Social),
            _ => Err(CoreError::InvalidDataType(s.to_string())),
        }
    }
}

/// 백그라운드 페치 우선순위.
///
/// 선언 순서가 곧 정렬 순서입니다 (`Low < Normal < High < Critical`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// 투기적 프리페치
    Low,
    /// 캐시 미스 후 비동기 로딩
    #[default]
    Normal,
    /// stale 항목 갱신
    High,
    /// 사용자 대기 중인 요청
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(CoreError::InvalidPriority(s.to_string())),
        }
    }
}
