//! 관심 종목 프리페치와 CLI 입력 파싱.

use std::collections::HashSet;
use std::time::Instant;

use feed_cache::Coordinator;
use feed_core::{normalize_resource_id, DataType, FetchParams, Priority, WatchlistConfig};

use crate::stats::CollectionStats;

/// 쉼표로 구분된 심볼 목록을 정규화합니다. 빈 항목과 중복은 제거됩니다.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(normalize_resource_id)
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// `key=value` 형식의 파라미터 파싱 (clap value parser).
pub fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// 모든 (심볼, 데이터 유형) 조합을 백그라운드 큐에 등록합니다.
pub async fn prefetch_all(
    coordinator: &Coordinator,
    symbols: &[String],
    data_types: &[DataType],
    priority: Priority,
) -> CollectionStats {
    let started = Instant::now();
    let mut stats = CollectionStats::new();

    for data_type in data_types {
        for symbol in symbols {
            stats.total += 1;
            if coordinator.prefetch(symbol, *data_type, priority).await {
                stats.queued += 1;
            } else {
                stats.skipped += 1;
            }
        }
    }

    stats.elapsed = started.elapsed();
    stats
}

/// 관심 종목 주기 프리페치 (가장 낮은 우선순위).
pub async fn refresh_watchlist(
    coordinator: &Coordinator,
    watchlist: &WatchlistConfig,
) -> CollectionStats {
    let symbols: Vec<String> = watchlist
        .symbols
        .iter()
        .map(|s| normalize_resource_id(s))
        .collect();
    prefetch_all(coordinator, &symbols, &watchlist.data_types, Priority::Low).await
}

/// 다건 조회로 캐시를 채우고 결과 통계를 반환합니다.
pub async fn warm(
    coordinator: &Coordinator,
    symbols: &[String],
    data_type: DataType,
    params: &FetchParams,
) -> (CollectionStats, std::collections::HashMap<String, serde_json::Value>) {
    let started = Instant::now();
    let results = coordinator.batch_get(symbols, data_type, params).await;

    let stats = CollectionStats {
        total: symbols.len(),
        success: results.len(),
        queued: coordinator.queued().await,
        skipped: 0,
        elapsed: started.elapsed(),
    };
    (stats, results)
}
