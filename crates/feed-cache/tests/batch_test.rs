//! 다중 조회 통합 테스트

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{coordinator, quote, test_config, MockAdapter};
use feed_cache::LookupState;
use feed_core::{CoordinatorConfig, DataType, FetchParams};

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|id| id.to_string()).collect()
}

fn chunked_config() -> CoordinatorConfig {
    CoordinatorConfig {
        batch_chunk_size: 3,
        ..test_config()
    }
}

#[tokio::test]
async fn test_batch_is_split_into_chunks() {
    let adapter = Arc::new(MockAdapter::new(DataType::Quote).with_batch());
    let coordinator = coordinator(chunked_config(), &adapter);

    let requested = ids(&["A", "B", "C", "D", "E", "F", "G"]);
    let results = coordinator
        .batch_get(&requested, DataType::Quote, &FetchParams::new())
        .await;

    assert_eq!(results.len(), 7);
    assert_eq!(results["D"], quote("D"));
    assert_eq!(adapter.batch_calls(), 3);
    assert_eq!(
        adapter.batches(),
        vec![ids(&["A", "B", "C"]), ids(&["D", "E", "F"]), ids(&["G"])]
    );
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn test_cached_entries_are_not_refetched() {
    let adapter = Arc::new(MockAdapter::new(DataType::Quote).with_batch());
    let coordinator = coordinator(chunked_config(), &adapter);
    let params = FetchParams::new();

    coordinator.get("AAPL", DataType::Quote, &params, true).await;
    coordinator.get("MSFT", DataType::Quote, &params, true).await;

    let results = coordinator
        .batch_get(&ids(&["aapl", "MSFT", "GOOG", "AMZN", "goog"]), DataType::Quote, &params)
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(adapter.batches(), vec![ids(&["GOOG", "AMZN"])]);
}

#[tokio::test]
async fn test_partial_success_registers_missing_resources() {
    let adapter = Arc::new(
        MockAdapter::new(DataType::Fundamentals)
            .with_batch()
            .with_not_found(&["ENRN"]),
    );
    let coordinator = coordinator(chunked_config(), &adapter);

    let results = coordinator
        .batch_get(&ids(&["IBM", "ENRN", "ORCL"]), DataType::Fundamentals, &FetchParams::new())
        .await;

    assert_eq!(results.len(), 2);
    assert!(!results.contains_key("ENRN"));
    assert!(coordinator.registry().contains("ENRN").await);
    assert_eq!(adapter.batch_calls(), 1);
    assert_eq!(coordinator.queued().await, 0);
}

#[tokio::test]
async fn test_rate_limited_chunk_retries_after_cooldown() {
    let config = CoordinatorConfig {
        cooldown_ms: 100,
        ..chunked_config()
    };
    let adapter = Arc::new(MockAdapter::new(DataType::Quote).with_batch().rate_limit_next(1));
    let coordinator = coordinator(config, &adapter);

    let results = coordinator
        .batch_get(&ids(&["A", "B", "C", "D"]), DataType::Quote, &FetchParams::new())
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(adapter.resets(), 1);
    assert_eq!(
        adapter.batches(),
        vec![ids(&["A", "B", "C"]), ids(&["A", "B", "C"]), ids(&["D"])]
    );

    let times = adapter.call_times();
    assert!(times[1] - times[0] >= Duration::from_millis(90));
    assert_eq!(coordinator.stats().rate_limited, 1);
}

#[tokio::test]
async fn test_item_rate_limit_keeps_successful_items() {
    let config = CoordinatorConfig {
        cooldown_ms: 150,
        ..chunked_config()
    };
    let adapter = Arc::new(
        MockAdapter::new(DataType::Quote)
            .with_batch()
            .with_item_rate_limit(&["C"]),
    );
    let coordinator = coordinator(config, &adapter);
    let params = FetchParams::new();

    let batch_ids = ids(&["A", "B", "C"]);
    let (results, early) = tokio::join!(
        coordinator.batch_get(&batch_ids, DataType::Quote, &params),
        async {
            // C 재시도 전 냉각 중
            tokio::time::sleep(Duration::from_millis(60)).await;
            let a = coordinator.get("A", DataType::Quote, &params, false).await;
            let b = coordinator.get("B", DataType::Quote, &params, false).await;
            (a.state, b.state)
        },
    );

    assert_eq!(early, (LookupState::Fresh, LookupState::Fresh));
    assert_eq!(results.len(), 3);
    assert_eq!(results["C"], quote("C"));
    assert_eq!(
        adapter.batches(),
        vec![ids(&["A", "B", "C"]), ids(&["C"])]
    );
    assert_eq!(adapter.resets(), 1);
    assert_eq!(coordinator.stats().rate_limited, 1);
}

#[tokio::test]
async fn test_batch_respects_deadline_and_hands_rest_to_workers() {
    let config = CoordinatorConfig {
        cooldown_ms: 5_000,
        ..chunked_config()
    };
    let adapter = Arc::new(MockAdapter::new(DataType::Quote).with_batch().rate_limit_next(1));
    let coordinator = coordinator(config, &adapter);

    let started = std::time::Instant::now();
    let results = coordinator
        .batch_get_until(
            &ids(&["A", "B"]),
            DataType::Quote,
            &FetchParams::new(),
            started + Duration::from_millis(300),
        )
        .await;

    assert!(results.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(adapter.batch_calls(), 1);
    assert_eq!(coordinator.queued().await, 2);
}

#[tokio::test]
async fn test_adapter_without_batch_support_is_called_per_resource() {
    let adapter = Arc::new(MockAdapter::new(DataType::News));
    let coordinator = coordinator(chunked_config(), &adapter);

    let results = coordinator
        .batch_get(&ids(&["X", "Y", "Z"]), DataType::News, &FetchParams::new())
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(adapter.calls(), 3);
    assert_eq!(adapter.batch_calls(), 0);
}

#[tokio::test]
async fn test_stale_entries_fill_in_during_batch() {
    let config = CoordinatorConfig {
        fresh_ttl_ms: 50,
        stale_ttl_ms: 10_000,
        ..chunked_config()
    };
    let adapter = Arc::new(MockAdapter::new(DataType::Quote).with_batch());
    let coordinator = coordinator(config, &adapter);
    let params = FetchParams::new();

    coordinator.batch_get(&ids(&["A", "B"]), DataType::Quote, &params).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = coordinator.batch_get(&ids(&["A", "B"]), DataType::Quote, &params).await;
    assert_eq!(results.len(), 2);
    assert_eq!(adapter.batch_calls(), 1);
    assert_eq!(coordinator.queued().await, 2);
}
