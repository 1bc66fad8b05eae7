//! idemp Test Utilities
//!
//! Shared test infrastructure for the idemp workspace:
//! - Proptest generators for keys, windows and records
//! - A scriptable shared tier that can fail, stall or rendezvous on demand
//! - Fixtures for common cache and service setups
//! - Assertions for idemp error kinds

pub use idemp_core::{
    ConsistencyMode, IdempotencyConfig, IdempotencyError, IdempotencyKey, IdempotencyRecord,
    IdempotencyResult, SharedHealth, Timestamp,
};
pub use idemp_storage::{InMemoryLocalTier, InMemorySharedTier, SharedTier, TieredCache};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Barrier;

// ============================================================================
// MOCK SHARED TIER
// ============================================================================

/// Call counters kept by [`MockSharedTier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedCalls {
    pub contains: u64,
    pub get: u64,
    pub save: u64,
    pub save_if_absent: u64,
    pub remove: u64,
    pub health: u64,
}

impl SharedCalls {
    /// Calls on the data path, health probes excluded.
    pub fn data_calls(&self) -> u64 {
        self.contains + self.get + self.save + self.save_if_absent + self.remove
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    contains: AtomicU64,
    get: AtomicU64,
    save: AtomicU64,
    save_if_absent: AtomicU64,
    remove: AtomicU64,
    health: AtomicU64,
}

/// Shared tier over [`InMemorySharedTier`] with switchable faults.
///
/// - `set_failing(true)` makes every data call return a backend error.
/// - `set_reports_healthy(false)` makes `is_healthy` answer `Ok(false)`.
/// - `set_probe_delay` stalls `is_healthy`, for probe timeouts.
/// - `gate_gets(n)` makes `get` wait until `n` callers are inside it, so
///   concurrent check-then-write sequences interleave deterministically.
#[derive(Debug)]
pub struct MockSharedTier {
    inner: InMemorySharedTier,
    failing: AtomicBool,
    reports_healthy: AtomicBool,
    probe_delay: Mutex<Duration>,
    get_gate: Mutex<Option<Arc<Barrier>>>,
    calls: CallCounters,
}

impl Default for MockSharedTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSharedTier {
    pub fn new() -> Self {
        Self {
            inner: InMemorySharedTier::new(),
            failing: AtomicBool::new(false),
            reports_healthy: AtomicBool::new(true),
            probe_delay: Mutex::new(Duration::ZERO),
            get_gate: Mutex::new(None),
            calls: CallCounters::default(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_reports_healthy(&self, healthy: bool) {
        self.reports_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// Hold every `get` until `parties` callers have arrived.
    pub fn gate_gets(&self, parties: usize) {
        *self.get_gate.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(Arc::new(Barrier::new(parties)));
    }

    pub fn clear_gate(&self) {
        *self.get_gate.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn calls(&self) -> SharedCalls {
        SharedCalls {
            contains: self.calls.contains.load(Ordering::SeqCst),
            get: self.calls.get.load(Ordering::SeqCst),
            save: self.calls.save.load(Ordering::SeqCst),
            save_if_absent: self.calls.save_if_absent.load(Ordering::SeqCst),
            remove: self.calls.remove.load(Ordering::SeqCst),
            health: self.calls.health.load(Ordering::SeqCst),
        }
    }

    /// The backing store, for seeding and inspection without counting calls.
    pub fn inner(&self) -> &InMemorySharedTier {
        &self.inner
    }

    fn check(&self, op: &str) -> IdempotencyResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdempotencyError::backend(
                "mock",
                format!("{} failed: injected fault", op),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedTier for MockSharedTier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn contains(&self, key: &str) -> IdempotencyResult<bool> {
        self.calls.contains.fetch_add(1, Ordering::SeqCst);
        self.check("contains")?;
        self.inner.contains(key).await
    }

    async fn get<T>(&self, key: &str) -> IdempotencyResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .get_gate
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn save<T>(&self, key: &str, value: &T, expiry: Timestamp) -> IdempotencyResult<()>
    where
        T: Serialize + Sync,
    {
        self.calls.save.fetch_add(1, Ordering::SeqCst);
        self.check("save")?;
        self.inner.save(key, value, expiry).await
    }

    async fn save_if_absent<T>(
        &self,
        key: &str,
        value: &T,
        expiry: Timestamp,
    ) -> IdempotencyResult<bool>
    where
        T: Serialize + Sync,
    {
        self.calls.save_if_absent.fetch_add(1, Ordering::SeqCst);
        self.check("save_if_absent")?;
        self.inner.save_if_absent(key, value, expiry).await
    }

    async fn remove(&self, key: &str) -> IdempotencyResult<()> {
        self.calls.remove.fetch_add(1, Ordering::SeqCst);
        self.check("remove")?;
        self.inner.remove(key).await
    }

    async fn is_healthy(&self) -> IdempotencyResult<bool> {
        self.calls.health.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check("is_healthy")?;
        Ok(self.reports_healthy.load(Ordering::SeqCst))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for idemp types.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    /// Generate a non-empty key string.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z0-9:_-]{1,48}"
    }

    /// Generate a validated key.
    pub fn arb_idempotency_key() -> impl Strategy<Value = IdempotencyKey> {
        arb_key().prop_filter_map("key rejected", |k| IdempotencyKey::new(k).ok())
    }

    /// Generate a window between 1ms and one day.
    pub fn arb_window() -> impl Strategy<Value = Duration> {
        (1u64..86_400_000).prop_map(Duration::from_millis)
    }

    /// Generate an optional HTTP-like status code.
    pub fn arb_status_code() -> impl Strategy<Value = Option<u16>> {
        prop::option::of(100u16..600)
    }

    /// Generate a small JSON payload.
    pub fn arb_payload() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,32}".prop_map(serde_json::Value::from),
            ("[a-z]{1,8}", any::<i32>())
                .prop_map(|(field, n)| serde_json::json!({ field: n })),
        ]
    }

    /// Generate an in-progress record.
    pub fn arb_reserved_record() -> impl Strategy<Value = IdempotencyRecord> {
        (arb_key(), arb_window()).prop_filter_map("record rejected", |(key, window)| {
            IdempotencyRecord::reserve(key, window).ok()
        })
    }

    /// Generate a finalized record.
    pub fn arb_finalized_record() -> impl Strategy<Value = IdempotencyRecord> {
        (arb_key(), arb_window(), arb_payload(), arb_status_code()).prop_filter_map(
            "record rejected",
            |(key, window, payload, status)| {
                IdempotencyRecord::new(key, window, Some(payload), status, false, Utc::now()).ok()
            },
        )
    }

    /// Generate a config that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = IdempotencyConfig> {
        (
            any::<bool>(),
            arb_window(),
            0u64..120_000,
            1u64..1_000,
            any::<bool>(),
            1usize..100_000,
            1usize..100_000,
        )
            .prop_map(
                |(strict, window, timeout_ms, poll_ms, atomic, capacity, queue)| {
                    IdempotencyConfig::default()
                        .with_strict_mode(strict)
                        .with_window(window)
                        .with_timeout(Duration::from_millis(timeout_ms))
                        .with_poll_interval(Duration::from_millis(poll_ms))
                        .with_atomic_reservation(atomic)
                        .with_local_capacity(capacity)
                        .with_sync_queue_capacity(queue)
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configs, records and caches.

    use super::*;
    use chrono::Utc;

    /// Local tier type used by the fixtures.
    pub type LocalRecords = InMemoryLocalTier<IdempotencyRecord>;

    /// Config with short intervals for fast tests.
    pub fn test_config() -> IdempotencyConfig {
        IdempotencyConfig::default()
            .with_window(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(10))
            .with_local_capacity(1_000)
            .with_sync_queue_capacity(1_000)
    }

    /// An in-progress record for `key`.
    pub fn reserved_record(key: &str, window: Duration) -> IdempotencyRecord {
        IdempotencyRecord::reserve(key, window).unwrap_or_else(|e| panic!("fixture: {e}"))
    }

    /// A finalized record for `key`.
    pub fn finalized_record(
        key: &str,
        window: Duration,
        payload: serde_json::Value,
        status_code: Option<u16>,
    ) -> IdempotencyRecord {
        IdempotencyRecord::new(key, window, Some(payload), status_code, false, Utc::now())
            .unwrap_or_else(|e| panic!("fixture: {e}"))
    }

    /// A tiered cache over a fresh local tier and the given shared tier.
    pub fn tiered_cache<S: SharedTier>(
        shared: Arc<S>,
        mode: ConsistencyMode,
    ) -> Arc<TieredCache<LocalRecords, S>> {
        Arc::new(TieredCache::new(
            Arc::new(InMemoryLocalTier::new(1_000)),
            shared,
            Arc::new(SharedHealth::default()),
            mode,
        ))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for idemp error kinds.

    use super::*;

    /// Assert that the result failed with `CacheUnavailable`.
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &IdempotencyResult<T>) {
        match result {
            Err(e) if e.is_cache_unavailable() => {}
            other => panic!("Expected CacheUnavailable, got {:?}", other),
        }
    }

    /// Assert that the result failed with an invalid argument.
    pub fn assert_invalid_argument<T: std::fmt::Debug>(result: &IdempotencyResult<T>) {
        match result {
            Err(e) if e.is_invalid_argument() => {}
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
    }

    /// Assert that `record` carries the given outcome and is finalized.
    pub fn assert_finalized_with(
        record: &IdempotencyRecord,
        payload: &serde_json::Value,
        status_code: Option<u16>,
    ) {
        assert!(!record.is_processing, "Record {} still processing", record.key);
        assert_eq!(record.payload.as_ref(), Some(payload));
        assert_eq!(record.status_code, status_code);
    }
}

// ============================================================================
// TESTS
// ============================================================================
