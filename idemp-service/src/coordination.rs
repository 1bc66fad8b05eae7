//! Duplicate coordination protocol.
//!
//! [`CoordinationService`] implements check-duplicate, reserve, finalize and
//! wait-for-completion on top of a [`TieredCache`]. Every duplicate sighting
//! and every first write emits a "key touched" event on a bounded channel
//! drained by the reconciliation job.
//!
//! # Per-key lifecycle
//!
//! ```text
//! ABSENT ── upsert(processing) ──→ RESERVED ── upsert(outcome) ──→ FINALIZED
//!    ↑                                                                 │
//!    └──────────────────────────── expiry ─────────────────────────────┘
//! ```
//!
//! `upsert` checks for an existing record and then writes, without a lock in
//! between. Two concurrent first sightings of a key can both reserve. Callers
//! that need at most one owner use [`CoordinationService::reserve_if_absent`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use idemp_core::{IdempotencyConfig, IdempotencyError, IdempotencyRecord, IdempotencyResult};
use idemp_storage::{LocalTier, Reservation, SharedTier, TieredCache};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Receiving half of the key-touched channel.
pub type SyncReceiver = mpsc::Receiver<String>;

// ============================================================================
// METRICS
// ============================================================================

/// Request-path counters.
#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    /// Duplicate sightings
    pub duplicates_detected: AtomicU64,
    /// Records created for a first sighting
    pub reservations: AtomicU64,
    /// Records replaced with a final outcome
    pub finalizations: AtomicU64,
    /// Waits that ended because the caller's timeout elapsed
    pub wait_timeouts: AtomicU64,
    /// Key-touched events handed to the reconciliation job
    pub sync_events_sent: AtomicU64,
    /// Key-touched events dropped because the channel was full or closed
    pub sync_events_dropped: AtomicU64,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CoordinationSnapshot {
        CoordinationSnapshot {
            duplicates_detected: self.duplicates_detected.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
            finalizations: self.finalizations.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            sync_events_sent: self.sync_events_sent.load(Ordering::Relaxed),
            sync_events_dropped: self.sync_events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of coordination metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinationSnapshot {
    pub duplicates_detected: u64,
    pub reservations: u64,
    pub finalizations: u64,
    pub wait_timeouts: u64,
    pub sync_events_sent: u64,
    pub sync_events_dropped: u64,
}

// ============================================================================
// COMPLETION SIGNALS
// ============================================================================

/// Per-key wake-ups for local waiters.
///
/// A finalization in this process wakes waiters immediately. Finalizations
/// made elsewhere are picked up on the next poll.
#[derive(Debug, Default)]
struct CompletionSignals {
    signals: DashMap<String, Arc<Notify>>,
}

impl CompletionSignals {
    fn subscribe(&self, key: &str) -> Arc<Notify> {
        self.signals
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify(&self, key: &str) {
        if let Some(signal) = self.signals.get(key) {
            signal.notify_waiters();
        }
    }

    /// Drop the signal once no waiter holds it.
    fn release(&self, key: &str, signal: Arc<Notify>) {
        drop(signal);
        self.signals
            .remove_if(key, |_, signal| Arc::strong_count(signal) == 1);
    }

    fn len(&self) -> usize {
        self.signals.len()
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Duplicate coordination over a tiered record cache.
pub struct CoordinationService<L, S> {
    cache: Arc<TieredCache<L, S>>,
    config: IdempotencyConfig,
    sync_tx: mpsc::Sender<String>,
    signals: CompletionSignals,
    metrics: CoordinationMetrics,
}

impl<L, S> CoordinationService<L, S>
where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    /// Create the service and the receiving half of its sync channel.
    ///
    /// The receiver is meant for [`crate::ReconciliationJob::new`].
    pub fn new(cache: Arc<TieredCache<L, S>>, config: IdempotencyConfig) -> (Self, SyncReceiver) {
        let (sync_tx, sync_rx) = mpsc::channel(config.sync_queue_capacity.max(1));
        let service = Self {
            cache,
            config,
            sync_tx,
            signals: CompletionSignals::default(),
            metrics: CoordinationMetrics::new(),
        };
        (service, sync_rx)
    }

    pub fn cache(&self) -> &Arc<TieredCache<L, S>> {
        &self.cache
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn metrics(&self) -> CoordinationSnapshot {
        self.metrics.snapshot()
    }

    /// Check whether `key` was already seen within its window.
    ///
    /// A positive answer emits a key-touched event.
    pub async fn check_for_duplicate(&self, key: &str) -> IdempotencyResult<bool> {
        require_key(key)?;
        let found = self.cache.contains(key).await?;
        if found {
            self.metrics
                .duplicates_detected
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "Duplicate idempotency key detected");
            self.emit_sync(key);
        }
        Ok(found)
    }

    /// Create or replace the record for `key`.
    ///
    /// With no live record, a new one expiring at `now + window` is saved and
    /// a key-touched event is emitted. Otherwise the existing record is
    /// replaced with the new outcome fields; its expiry is kept and `window`
    /// is ignored. A non-processing write wakes local waiters.
    pub async fn upsert(
        &self,
        key: &str,
        payload: Option<serde_json::Value>,
        status_code: Option<u16>,
        is_processing: bool,
        window: Duration,
    ) -> IdempotencyResult<IdempotencyRecord> {
        require_key(key)?;

        let stored = match self.cache.get(key).await? {
            None => {
                let record = IdempotencyRecord::new(
                    key,
                    window,
                    payload,
                    status_code,
                    is_processing,
                    Utc::now(),
                )?;
                let stored = self.cache.save(record).await?;
                self.metrics.reservations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    key,
                    reservation_id = %stored.reservation_id,
                    is_processing,
                    "Created idempotency record"
                );
                self.emit_sync(key);
                stored
            }
            Some(current) => {
                let replacement = current.replace_outcome(payload, status_code, is_processing)?;
                self.cache.save(replacement).await?
            }
        };

        if stored.is_finalized() {
            self.metrics.finalizations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, status_code = ?stored.status_code, "Finalized idempotency record");
            self.signals.notify(key);
        }
        Ok(stored)
    }

    /// Reserve `key` as in progress.
    pub async fn reserve(&self, key: &str, window: Duration) -> IdempotencyResult<IdempotencyRecord> {
        self.upsert(key, None, None, true, window).await
    }

    /// Record the final outcome for `key`.
    pub async fn finalize(
        &self,
        key: &str,
        payload: serde_json::Value,
        status_code: Option<u16>,
        window: Duration,
    ) -> IdempotencyResult<IdempotencyRecord> {
        self.upsert(key, Some(payload), status_code, false, window)
            .await
    }

    /// Reserve `key` only if no live record exists, atomically.
    pub async fn reserve_if_absent(
        &self,
        key: &str,
        window: Duration,
    ) -> IdempotencyResult<Reservation> {
        require_key(key)?;
        let record = IdempotencyRecord::reserve(key, window)?;
        let reservation = self.cache.reserve_if_absent(record).await?;

        if reservation.is_acquired() {
            self.metrics.reservations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                key,
                reservation_id = %reservation.record().reservation_id,
                "Acquired idempotency reservation"
            );
        } else {
            self.metrics
                .duplicates_detected
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "Reservation already held");
        }
        self.emit_sync(key);
        Ok(reservation)
    }

    /// Wait up to `timeout` for the record of `key` to carry an outcome.
    ///
    /// The wait ends as soon as the record is absent, finalized, carries a
    /// payload, or has expired, or once `timeout` has elapsed. The latest
    /// snapshot is returned; a record still in progress means no outcome is
    /// available yet.
    pub async fn get_response(
        &self,
        key: &str,
        timeout: Duration,
    ) -> IdempotencyResult<Option<IdempotencyRecord>> {
        require_key(key)?;
        let started = Instant::now();
        let signal = self.signals.subscribe(key);
        let result = self.wait_for_outcome(key, timeout, started, &signal).await;
        self.signals.release(key, signal);
        result
    }

    async fn wait_for_outcome(
        &self,
        key: &str,
        timeout: Duration,
        started: Instant,
        signal: &Notify,
    ) -> IdempotencyResult<Option<IdempotencyRecord>> {
        loop {
            // Registered before the read so a finalize in between is not missed.
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(record) = self.cache.get(key).await? else {
                return Ok(None);
            };

            let now = Utc::now();
            if !record.is_awaiting_outcome(now) {
                return Ok(Some(record));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                self.metrics.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    key,
                    waited_ms = elapsed.as_millis() as u64,
                    "Gave up waiting for in-flight duplicate"
                );
                return Ok(Some(record));
            }

            let until_expiry = record.remaining(now).unwrap_or(Duration::ZERO);
            let wait = self
                .config
                .poll_interval
                .min(timeout - elapsed)
                .min(until_expiry);

            tracing::trace!(
                key,
                wait_ms = wait.as_millis() as u64,
                "Waiting for duplicate outcome"
            );
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn emit_sync(&self, key: &str) {
        match self.sync_tx.try_send(key.to_string()) {
            Ok(()) => {
                self.metrics.sync_events_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.metrics
                    .sync_events_dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, "Sync queue full, dropping key-touched event");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics
                    .sync_events_dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key, "Sync queue closed, dropping key-touched event");
            }
        }
    }

    #[cfg(test)]
    fn pending_signals(&self) -> usize {
        self.signals.len()
    }
}

fn require_key(key: &str) -> IdempotencyResult<()> {
    if key.is_empty() {
        return Err(IdempotencyError::invalid_argument(
            "key",
            "idempotency key must not be empty",
        ));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
