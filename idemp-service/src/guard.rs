//! Request guard packaging the caller contract.
//!
//! [`IdempotencyGuard::execute`] runs an operation at most once per key
//! within its window:
//!
//! 1. A duplicate waits for the original and replays its outcome, or
//!    resolves as [`Outcome::Conflict`] if no outcome arrives in time.
//! 2. A first sighting reserves the key, runs the operation and finalizes
//!    the record with the result.
//!
//! # Example
//!
//! ```ignore
//! let key = KeyBuilder::new()
//!     .component("account", Some(1), &account_id)
//!     .component("reference", Some(0), &reference)
//!     .build()?;
//!
//! match guard.execute(&key, &guard.default_options(), || async {
//!     (json!({"transfer": "accepted"}), Some(202))
//! }).await? {
//!     Outcome::Executed(record) | Outcome::Replayed(record) => respond(record),
//!     Outcome::Conflict(_) => respond_conflict(),
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use idemp_core::{IdempotencyConfig, IdempotencyKey, IdempotencyRecord, IdempotencyResult};
use idemp_storage::{LocalTier, Reservation, SharedTier};

use crate::coordination::CoordinationService;

/// Per-operation guard settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardOptions {
    /// Validity window of the record
    pub window: Duration,
    /// How long a duplicate waits for the original
    pub timeout: Duration,
    /// Propagate finalize failures instead of logging them
    pub strict_mode: bool,
}

impl GuardOptions {
    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self {
            window: config.window,
            timeout: config.timeout,
            strict_mode: config.strict_mode,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self::from_config(&IdempotencyConfig::default())
    }
}

/// How a guarded call was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The operation ran here; the finalized record is returned.
    Executed(IdempotencyRecord),
    /// A previous run's outcome was replayed.
    Replayed(IdempotencyRecord),
    /// Another run is still in flight (or vanished) and no outcome is
    /// available. Callers should answer with a conflict / retry-later.
    Conflict(Option<IdempotencyRecord>),
}

impl Outcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// The record behind this outcome, if any.
    pub fn record(&self) -> Option<&IdempotencyRecord> {
        match self {
            Self::Executed(r) | Self::Replayed(r) => Some(r),
            Self::Conflict(r) => r.as_ref(),
        }
    }
}

/// Runs operations under the duplicate coordination protocol.
pub struct IdempotencyGuard<L, S> {
    service: Arc<CoordinationService<L, S>>,
    defaults: GuardOptions,
}

impl<L, S> IdempotencyGuard<L, S>
where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    pub fn new(service: Arc<CoordinationService<L, S>>) -> Self {
        let defaults = GuardOptions::from_config(service.config());
        Self { service, defaults }
    }

    pub fn service(&self) -> &Arc<CoordinationService<L, S>> {
        &self.service
    }

    /// Options derived from the service configuration.
    pub fn default_options(&self) -> GuardOptions {
        self.defaults
    }

    /// Run `operation` unless `key` was already seen within its window.
    ///
    /// The operation yields the payload and optional status code to record.
    pub async fn execute<F, Fut>(
        &self,
        key: &IdempotencyKey,
        options: &GuardOptions,
        operation: F,
    ) -> IdempotencyResult<Outcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (serde_json::Value, Option<u16>)>,
    {
        let key = key.as_str();

        let phase = Instant::now();
        let duplicate = match self.service.check_for_duplicate(key).await {
            Ok(duplicate) => duplicate,
            Err(e) if options.strict_mode => return Err(e),
            Err(e) => {
                tracing::warn!(key, error = %e, "Duplicate check failed, treating as first sighting");
                false
            }
        };
        log_phase(key, "check", phase);
        if duplicate {
            return self.resolve_duplicate(key, options).await;
        }

        let phase = Instant::now();
        let reserved = if self.service.config().atomic_reservation {
            match self.service.reserve_if_absent(key, options.window).await {
                Ok(Reservation::Acquired(record)) => Ok(record),
                Ok(Reservation::Existing(_)) => {
                    log_phase(key, "reserve", phase);
                    return self.resolve_duplicate(key, options).await;
                }
                Err(e) => Err(e),
            }
        } else {
            self.service.reserve(key, options.window).await
        };
        let reservation = match reserved {
            Ok(record) => record,
            Err(e) if options.strict_mode => return Err(e),
            Err(e) => {
                tracing::warn!(key, error = %e, "Reservation failed, running unrecorded");
                IdempotencyRecord::reserve(key, options.window)?
            }
        };
        log_phase(key, "reserve", phase);

        let phase = Instant::now();
        let (payload, status_code) = operation().await;
        log_phase(key, "execute", phase);

        let phase = Instant::now();
        let finalized = self
            .service
            .finalize(key, payload.clone(), status_code, options.window)
            .await;
        log_phase(key, "finalize", phase);

        match finalized {
            Ok(record) => Ok(Outcome::Executed(record)),
            Err(e) if options.strict_mode => Err(e),
            Err(e) => {
                tracing::warn!(
                    key,
                    error = %e,
                    "Failed to record outcome, returning it unrecorded"
                );
                Ok(Outcome::Executed(reservation.finalize(payload, status_code)?))
            }
        }
    }

    async fn resolve_duplicate(
        &self,
        key: &str,
        options: &GuardOptions,
    ) -> IdempotencyResult<Outcome> {
        let phase = Instant::now();
        let snapshot = match self.service.get_response(key, options.timeout).await {
            Ok(snapshot) => snapshot,
            Err(e) if options.strict_mode => return Err(e),
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read duplicate outcome");
                None
            }
        };
        log_phase(key, "wait", phase);

        match snapshot {
            Some(record) if record.payload.is_some() => {
                tracing::debug!(key, "Replaying recorded outcome");
                Ok(Outcome::Replayed(record))
            }
            other => {
                tracing::debug!(key, "Duplicate still in flight, reporting conflict");
                Ok(Outcome::Conflict(other))
            }
        }
    }
}

fn log_phase(key: &str, phase: &'static str, started: Instant) {
    tracing::debug!(
        key,
        phase,
        elapsed_us = started.elapsed().as_micros() as u64,
        "Idempotency phase finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use idemp_core::{ConsistencyMode, SharedHealth};
    use idemp_storage::{InMemoryLocalTier, InMemorySharedTier, TieredCache};
    use idemp_test_utils::MockSharedTier;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Guard = IdempotencyGuard<InMemoryLocalTier<IdempotencyRecord>, InMemorySharedTier>;

    fn guard(config: IdempotencyConfig) -> Guard {
        let cache = Arc::new(TieredCache::new(
            Arc::new(InMemoryLocalTier::new(64)),
            Arc::new(InMemorySharedTier::new()),
            Arc::new(SharedHealth::default()),
            ConsistencyMode::Strict,
        ));
        let (service, _rx) = CoordinationService::new(cache, config);
        IdempotencyGuard::new(Arc::new(service))
    }

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    #[test]
    fn test_options_from_config() {
        let config = IdempotencyConfig::default()
            .with_window(Duration::from_secs(9))
            .with_strict_mode(false);
        let options = GuardOptions::from_config(&config);
        assert_eq!(options.window, Duration::from_secs(9));
        assert_eq!(options.timeout, config.timeout);
        assert!(!options.strict_mode);
    }

    #[tokio::test]
    async fn test_execute_then_replay() {
        let guard = guard(IdempotencyConfig::default());
        let options = guard.default_options();
        let runs = AtomicU32::new(0);

        let first = guard
            .execute(&key("pay-1"), &options, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                (json!({"paid": 10}), Some(201))
            })
            .await
            .unwrap();
        let second = guard
            .execute(&key("pay-1"), &options, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                (json!({"paid": 99}), Some(500))
            })
            .await
            .unwrap();

        assert!(first.is_executed());
        assert!(second.is_replayed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let replayed = second.record().unwrap();
        assert_eq!(replayed.payload, Some(json!({"paid": 10})));
        assert_eq!(replayed.status_code, Some(201));
    }

    #[tokio::test]
    async fn test_in_flight_duplicate_is_conflict() {
        let guard = guard(IdempotencyConfig::default());
        guard.service().reserve("pay-2", Duration::from_secs(60)).await.unwrap();

        let options = guard.default_options().with_timeout(Duration::from_millis(30));
        let outcome = guard
            .execute(&key("pay-2"), &options, || async { (json!(null), None) })
            .await
            .unwrap();

        assert!(outcome.is_conflict());
        assert!(outcome.record().unwrap().is_processing);
    }

    fn guard_over_mock(
        shared: Arc<MockSharedTier>,
    ) -> IdempotencyGuard<InMemoryLocalTier<IdempotencyRecord>, MockSharedTier> {
        let cache = Arc::new(TieredCache::new(
            Arc::new(InMemoryLocalTier::new(64)),
            shared,
            Arc::new(SharedHealth::default()),
            ConsistencyMode::Strict,
        ));
        let (service, _rx) = CoordinationService::new(cache, IdempotencyConfig::default());
        IdempotencyGuard::new(Arc::new(service))
    }

    #[tokio::test]
    async fn test_finalize_failure_follows_strict_option() {
        let shared = Arc::new(MockSharedTier::new());
        let guard = guard_over_mock(Arc::clone(&shared));

        let lenient = guard.default_options().with_strict_mode(false);
        let outcome = guard
            .execute(&key("fin-1"), &lenient, || async {
                shared.set_failing(true);
                (json!({"charged": 5}), Some(201))
            })
            .await
            .unwrap();
        let Outcome::Executed(record) = outcome else {
            panic!("expected executed, got {:?}", outcome);
        };
        assert_eq!(record.payload, Some(json!({"charged": 5})));
        assert_eq!(record.status_code, Some(201));
        assert!(record.is_finalized());

        shared.set_failing(false);
        let strict = guard.default_options().with_strict_mode(true);
        let result = guard
            .execute(&key("fin-2"), &strict, || async {
                shared.set_failing(true);
                (json!({"charged": 6}), Some(201))
            })
            .await;
        assert!(result.unwrap_err().is_cache_unavailable());
    }

    #[tokio::test]
    async fn test_lenient_options_run_through_unavailable_shared_tier() {
        let shared = Arc::new(MockSharedTier::new());
        let guard = guard_over_mock(Arc::clone(&shared));
        guard.service().cache().health().set(false);
        let runs = AtomicU32::new(0);

        let lenient = guard.default_options().with_strict_mode(false);
        let outcome = guard
            .execute(&key("down-1"), &lenient, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                (json!("ok"), Some(200))
            })
            .await
            .unwrap();
        assert!(outcome.is_executed());
        assert_eq!(outcome.record().unwrap().payload, Some(json!("ok")));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let strict = guard.default_options().with_strict_mode(true);
        let result = guard
            .execute(&key("down-2"), &strict, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                (json!("ok"), Some(200))
            })
            .await;
        assert!(result.unwrap_err().is_cache_unavailable());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(shared.calls().data_calls(), 0);
    }

    #[tokio::test]
    async fn test_atomic_reservation_path() {
        let guard = guard(IdempotencyConfig::default().with_atomic_reservation(true));
        let options = guard.default_options();

        let outcome = guard
            .execute(&key("pay-3"), &options, || async { (json!("ok"), Some(200)) })
            .await
            .unwrap();
        assert!(outcome.is_executed());
        assert_eq!(guard.service().metrics().reservations, 1);
    }
}
