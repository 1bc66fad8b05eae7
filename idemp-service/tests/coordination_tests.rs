//! End-to-end duplicate coordination through the tiered cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use idemp_core::{ConsistencyMode, IdempotencyConfig, IdempotencyRecord};
use idemp_service::{CoordinationService, SyncReceiver};
use idemp_storage::{InMemorySharedTier, LocalTier, Reservation, SharedTier};
use idemp_test_utils::assertions::{
    assert_finalized_with, assert_invalid_argument, assert_unavailable,
};
use idemp_test_utils::fixtures::{test_config, tiered_cache, LocalRecords};
use idemp_test_utils::generators::{arb_idempotency_key, arb_reserved_record};
use idemp_test_utils::MockSharedTier;
use proptest::prelude::*;
use serde_json::json;

type Service<S> = CoordinationService<LocalRecords, S>;

fn node<S: SharedTier>(
    shared: Arc<S>,
    mode: ConsistencyMode,
    config: IdempotencyConfig,
) -> (Arc<Service<S>>, SyncReceiver) {
    let (service, rx) = CoordinationService::new(tiered_cache(shared, mode), config);
    (Arc::new(service), rx)
}

#[tokio::test]
async fn test_reserve_wait_finalize_replay() {
    let (service, _rx) = node(
        Arc::new(InMemorySharedTier::new()),
        ConsistencyMode::Strict,
        test_config(),
    );
    let window = Duration::from_millis(1000);

    let reserved = service.reserve("A", window).await.unwrap();
    assert!(service.check_for_duplicate("A").await.unwrap());

    let pending = service
        .get_response("A", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert!(pending.is_processing);
    assert!(pending.payload.is_none());

    service
        .finalize("A", json!("ok"), Some(200), window)
        .await
        .unwrap();

    let started = Instant::now();
    let done = service
        .get_response("A", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_finalized_with(&done, &json!("ok"), Some(200));
    assert_eq!(done.reservation_id, reserved.reservation_id);
    assert_eq!(done.expiry, reserved.expiry);
}

#[tokio::test]
async fn test_repeated_finalize_keeps_identity() {
    let (service, _rx) = node(
        Arc::new(InMemorySharedTier::new()),
        ConsistencyMode::Strict,
        test_config(),
    );
    let window = Duration::from_secs(30);
    let first = service.reserve("idem", window).await.unwrap();

    for n in 0..5 {
        let updated = service
            .finalize("idem", json!({ "attempt": n }), Some(200 + n), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(updated.key, first.key);
        assert_eq!(updated.expiry, first.expiry);
        assert_eq!(updated.created_at, first.created_at);
        assert_eq!(updated.status_code, Some(200 + n));
    }
}

#[tokio::test]
async fn test_wait_ends_at_expiry() {
    let (service, _rx) = node(
        Arc::new(InMemorySharedTier::new()),
        ConsistencyMode::Strict,
        test_config(),
    );
    service.reserve("slow", Duration::from_millis(100)).await.unwrap();

    let started = Instant::now();
    let snapshot = service
        .get_response("slow", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    // Past expiry the record reads as absent in both tiers.
    assert!(snapshot.map_or(true, |r| r.is_expired(chrono::Utc::now())));
}

#[tokio::test]
async fn test_remote_finalize_is_seen_by_waiter() {
    let shared = Arc::new(InMemorySharedTier::new());
    let config = test_config();
    let (origin, _rx_a) = node(Arc::clone(&shared), ConsistencyMode::Strict, config.clone());
    let (replica, _rx_b) = node(Arc::clone(&shared), ConsistencyMode::Strict, config);

    origin.reserve("pay", Duration::from_secs(30)).await.unwrap();
    assert!(replica.check_for_duplicate("pay").await.unwrap());

    let waiter = {
        let replica = Arc::clone(&replica);
        tokio::spawn(async move { replica.get_response("pay", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    origin
        .finalize("pay", json!({"id": 7}), Some(201), Duration::from_secs(30))
        .await
        .unwrap();

    let seen = waiter.await.unwrap().unwrap().unwrap();
    assert_finalized_with(&seen, &json!({"id": 7}), Some(201));
}

#[tokio::test]
async fn test_check_then_write_race_creates_two_reservations() {
    let shared = Arc::new(MockSharedTier::new());
    let (service, _rx) = node(Arc::clone(&shared), ConsistencyMode::Strict, test_config());
    shared.gate_gets(2);

    // Both lookups are held until each has missed, then both write.
    let window = Duration::from_secs(30);
    let (a, b) = tokio::join!(service.reserve("race", window), service.reserve("race", window));
    shared.clear_gate();

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_processing && b.is_processing);
    assert_ne!(a.reservation_id, b.reservation_id);
    assert_eq!(service.metrics().reservations, 2);
}

#[tokio::test]
async fn test_reserve_if_absent_has_single_winner_across_nodes() {
    let shared = Arc::new(InMemorySharedTier::new());
    let config = test_config().with_atomic_reservation(true);
    let nodes: Vec<_> = (0..4)
        .map(|_| node(Arc::clone(&shared), ConsistencyMode::Strict, config.clone()).0)
        .collect();

    let tasks: Vec<_> = nodes
        .iter()
        .map(|service| {
            let service = Arc::clone(service);
            tokio::spawn(async move {
                service
                    .reserve_if_absent("once", Duration::from_secs(30))
                    .await
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for task in tasks {
        match task.await.unwrap().unwrap() {
            Reservation::Acquired(record) => winners.push(record),
            Reservation::Existing(record) => losers.push(record),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 3);
    for loser in &losers {
        assert_eq!(loser.reservation_id, winners[0].reservation_id);
    }
}

#[tokio::test]
async fn test_lenient_unhealthy_never_calls_shared() {
    let shared = Arc::new(MockSharedTier::new());
    let (service, _rx) = node(
        Arc::clone(&shared),
        ConsistencyMode::Lenient,
        test_config().with_strict_mode(false),
    );
    service.cache().health().set(false);

    assert!(!service.check_for_duplicate("k").await.unwrap());
    service.reserve("k", Duration::from_secs(10)).await.unwrap();
    assert!(service.check_for_duplicate("k").await.unwrap());
    let done = service
        .finalize("k", json!(1), None, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(done.is_finalized());
    assert!(service.cache().get("other").await.unwrap().is_none());
    service.cache().remove("k").await.unwrap();

    assert_eq!(shared.calls().data_calls(), 0);
    assert!(service.cache().metrics().shared_skipped > 0);
}

#[tokio::test]
async fn test_strict_unhealthy_fails_closed() {
    let shared = Arc::new(MockSharedTier::new());
    let (service, _rx) = node(Arc::clone(&shared), ConsistencyMode::Strict, test_config());
    service.cache().health().set(false);

    assert_unavailable(&service.check_for_duplicate("k").await);
    assert_unavailable(&service.reserve("k", Duration::from_secs(10)).await);
    assert_unavailable(&service.reserve_if_absent("k", Duration::from_secs(10)).await);
    assert_unavailable(&service.cache().get("k").await);
    assert_unavailable(&service.cache().remove("k").await);

    assert_eq!(shared.calls().data_calls(), 0);
    // The atomic path rolls back its local insert.
    assert!(!service.cache().local().contains("k"));
}

#[tokio::test]
async fn test_shared_errors_follow_consistency_mode() {
    let shared = Arc::new(MockSharedTier::new());
    shared.set_failing(true);

    let (strict, _rx_s) = node(Arc::clone(&shared), ConsistencyMode::Strict, test_config());
    assert_unavailable(&strict.check_for_duplicate("k").await);

    let (lenient, _rx_l) = node(
        Arc::clone(&shared),
        ConsistencyMode::Lenient,
        test_config().with_strict_mode(false),
    );
    assert!(!lenient.check_for_duplicate("k").await.unwrap());
    let record = lenient.reserve("k", Duration::from_secs(10)).await.unwrap();
    assert_eq!(lenient.cache().local().get("k"), Some(record));
    assert!(lenient.cache().metrics().shared_errors >= 2);
    // Errors never flip the health flag on the request path.
    assert!(lenient.cache().health().is_healthy());
}

#[tokio::test]
async fn test_sync_events_reach_receiver() {
    let (service, mut rx) = node(
        Arc::new(InMemorySharedTier::new()),
        ConsistencyMode::Strict,
        test_config(),
    );
    service.reserve("a", Duration::from_secs(10)).await.unwrap();
    service.check_for_duplicate("a").await.unwrap();
    service
        .finalize("a", json!(null), None, Duration::from_secs(10))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(key) = rx.try_recv() {
        seen.push(key);
    }
    assert_eq!(seen, vec!["a".to_string(), "a".to_string()]);
}

#[tokio::test]
async fn test_record_serializes_through_shared_tier() {
    let shared = Arc::new(InMemorySharedTier::new());
    let (service, _rx) = node(Arc::clone(&shared), ConsistencyMode::Strict, test_config());
    let stored = service
        .finalize("wire", json!({"nested": [1, 2, 3]}), Some(204), Duration::from_secs(10))
        .await
        .unwrap();

    let remote: IdempotencyRecord = shared.get("wire").await.unwrap().unwrap();
    assert_eq!(remote, stored);
}

#[tokio::test]
async fn test_invalid_arguments_are_rejected_before_any_io() {
    let shared = Arc::new(MockSharedTier::new());
    let (service, _rx) = node(Arc::clone(&shared), ConsistencyMode::Strict, test_config());

    assert_invalid_argument(&service.check_for_duplicate("").await);
    assert_invalid_argument(&service.reserve("", Duration::from_secs(1)).await);
    assert_invalid_argument(
        &service
            .reserve("k", Duration::from_secs(100_000_000_000_000))
            .await,
    );
    assert_eq!(shared.calls().save, 0);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a record reserved anywhere in the cluster is a duplicate on a fresh node.
    #[test]
    fn prop_remote_reservation_is_duplicate(record in arb_reserved_record()) {
        prop_assume!(record
            .remaining(chrono::Utc::now())
            .is_some_and(|left| left > Duration::from_secs(10)));
        runtime().block_on(async {
            let shared = Arc::new(InMemorySharedTier::new());
            shared.save(&record.key, &record, record.expiry).await.unwrap();
            let (service, _rx) = node(shared, ConsistencyMode::Strict, test_config());

            assert!(service.check_for_duplicate(&record.key).await.unwrap());
            let seen = service
                .get_response(&record.key, Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(seen.reservation_id, record.reservation_id);
        });
    }

    /// Property: any valid key can be reserved once atomically.
    #[test]
    fn prop_valid_keys_reserve_once(key in arb_idempotency_key()) {
        runtime().block_on(async {
            let (service, _rx) = node(
                Arc::new(InMemorySharedTier::new()),
                ConsistencyMode::Strict,
                test_config(),
            );
            let window = Duration::from_secs(30);
            let first = service.reserve_if_absent(key.as_str(), window).await.unwrap();
            let second = service.reserve_if_absent(key.as_str(), window).await.unwrap();
            assert!(first.is_acquired());
            assert!(!second.is_acquired());
        });
    }
}
