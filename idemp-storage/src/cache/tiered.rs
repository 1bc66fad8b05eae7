//! Health-aware two-tier record cache.
//!
//! Reads go to the local tier first. On a local miss the shared tier is
//! consulted according to its health and the configured [`ConsistencyMode`]:
//!
//! | shared health | Strict              | Lenient               |
//! |---------------|---------------------|-----------------------|
//! | healthy       | query shared        | query shared          |
//! | unhealthy     | `CacheUnavailable`  | local answer, no call |
//!
//! Writes always land in the local tier first, then follow the same table.
//! Backend errors raised by the shared tier on the request path become
//! `CacheUnavailable` in strict mode; in lenient mode they are logged,
//! counted and the local answer stands. The health flag itself is never
//! written from here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use idemp_core::{
    ConsistencyMode, IdempotencyError, IdempotencyRecord, IdempotencyResult, SharedHealth,
};

use super::traits::{InsertOutcome, LocalTier, SharedTier};

/// Result of an atomic reservation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller's record was stored; the caller owns the operation.
    Acquired(IdempotencyRecord),
    /// A live record already existed; the caller is a duplicate.
    Existing(IdempotencyRecord),
}

impl Reservation {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn record(&self) -> &IdempotencyRecord {
        match self {
            Self::Acquired(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> IdempotencyRecord {
        match self {
            Self::Acquired(r) | Self::Existing(r) => r,
        }
    }
}

/// Counters for shared-tier policy decisions.
#[derive(Debug, Default)]
pub struct TieredCacheMetrics {
    /// Lookups answered by the local tier
    pub local_hits: AtomicU64,
    /// Shared-tier calls skipped because it was unhealthy (lenient)
    pub shared_skipped: AtomicU64,
    /// Calls rejected because the shared tier was unhealthy (strict)
    pub unavailable_rejections: AtomicU64,
    /// Shared-tier backend errors seen on the request path
    pub shared_errors: AtomicU64,
}

/// Point-in-time copy of [`TieredCacheMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TieredCacheMetricsSnapshot {
    pub local_hits: u64,
    pub shared_skipped: u64,
    pub unavailable_rejections: u64,
    pub shared_errors: u64,
}

impl TieredCacheMetrics {
    pub fn snapshot(&self) -> TieredCacheMetricsSnapshot {
        TieredCacheMetricsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_skipped: self.shared_skipped.load(Ordering::Relaxed),
            unavailable_rejections: self.unavailable_rejections.load(Ordering::Relaxed),
            shared_errors: self.shared_errors.load(Ordering::Relaxed),
        }
    }
}

/// Whether a call may proceed to the shared tier.
enum SharedAccess {
    Use,
    Skip,
}

/// Two-tier record cache over a local tier `L` and a shared tier `S`.
pub struct TieredCache<L, S> {
    local: Arc<L>,
    shared: Arc<S>,
    health: Arc<SharedHealth>,
    mode: ConsistencyMode,
    metrics: TieredCacheMetrics,
}

impl<L, S> TieredCache<L, S>
where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    pub fn new(
        local: Arc<L>,
        shared: Arc<S>,
        health: Arc<SharedHealth>,
        mode: ConsistencyMode,
    ) -> Self {
        Self {
            local,
            shared,
            health,
            mode,
            metrics: TieredCacheMetrics::default(),
        }
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn shared(&self) -> &Arc<S> {
        &self.shared
    }

    pub fn health(&self) -> &Arc<SharedHealth> {
        &self.health
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    pub fn metrics(&self) -> TieredCacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Check whether a live record exists in either tier.
    pub async fn contains(&self, key: &str) -> IdempotencyResult<bool> {
        if self.local.contains(key) {
            self.metrics.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        match self.shared_access("contains", key)? {
            SharedAccess::Skip => Ok(false),
            SharedAccess::Use => match self.shared.contains(key).await {
                Ok(found) => Ok(found),
                Err(e) => self.on_shared_error("contains", key, e, false),
            },
        }
    }

    /// Get a live record, local tier first.
    pub async fn get(&self, key: &str) -> IdempotencyResult<Option<IdempotencyRecord>> {
        if let Some(record) = self.local.get(key) {
            self.metrics.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(record));
        }

        match self.shared_access("get", key)? {
            SharedAccess::Skip => Ok(None),
            SharedAccess::Use => match self.shared.get::<IdempotencyRecord>(key).await {
                Ok(found) => Ok(found),
                Err(e) => self.on_shared_error("get", key, e, None),
            },
        }
    }

    /// Write a record locally, then through to the shared tier.
    ///
    /// Returns the record as stored in the local tier. In strict mode the
    /// local write is kept even when the shared write is refused.
    pub async fn save(&self, record: IdempotencyRecord) -> IdempotencyResult<IdempotencyRecord> {
        let stored = self
            .local
            .save(&record.key, record.clone(), record.expiry)?;

        match self.shared_access("save", &record.key)? {
            SharedAccess::Skip => Ok(stored),
            SharedAccess::Use => {
                match self.shared.save(&record.key, &record, record.expiry).await {
                    Ok(()) => Ok(stored),
                    Err(e) => self.on_shared_error("save", &record.key, e, stored),
                }
            }
        }
    }

    /// Remove a record from both tiers.
    pub async fn remove(&self, key: &str) -> IdempotencyResult<()> {
        self.local.remove(key)?;

        match self.shared_access("remove", key)? {
            SharedAccess::Skip => Ok(()),
            SharedAccess::Use => match self.shared.remove(key).await {
                Ok(()) => Ok(()),
                Err(e) => self.on_shared_error("remove", key, e, ()),
            },
        }
    }

    /// Store `record` only if no live record exists for its key.
    ///
    /// The local insert is atomic per key. When the shared tier is in use,
    /// its `save_if_absent` decides across processes; if another process got
    /// there first, its record is adopted locally and returned as
    /// [`Reservation::Existing`].
    pub async fn reserve_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> IdempotencyResult<Reservation> {
        let key = record.key.clone();
        let ours = match self
            .local
            .insert_if_absent(&key, record.clone(), record.expiry)?
        {
            InsertOutcome::Existing(existing) => return Ok(Reservation::Existing(existing)),
            InsertOutcome::Inserted(ours) => ours,
        };

        let access = match self.shared_access("reserve_if_absent", &key) {
            Ok(access) => access,
            Err(e) => {
                self.local.remove(&key)?;
                return Err(e);
            }
        };
        if let SharedAccess::Skip = access {
            return Ok(Reservation::Acquired(ours));
        }

        match self.shared.save_if_absent(&key, &record, record.expiry).await {
            Ok(true) => Ok(Reservation::Acquired(ours)),
            Ok(false) => self.adopt_shared(record, ours).await,
            Err(e) => {
                if self.mode.is_strict() {
                    self.local.remove(&key)?;
                }
                self.on_shared_error("reserve_if_absent", &key, e, Reservation::Acquired(ours))
            }
        }
    }

    /// The shared tier already held a record for this key.
    async fn adopt_shared(
        &self,
        record: IdempotencyRecord,
        ours: IdempotencyRecord,
    ) -> IdempotencyResult<Reservation> {
        let key = record.key.clone();
        match self.shared.get::<IdempotencyRecord>(&key).await {
            Ok(Some(theirs)) => {
                tracing::debug!(
                    key = %key,
                    reservation_id = %theirs.reservation_id,
                    "Reservation lost to another process"
                );
                let adopted = self.local.save(&key, theirs.clone(), theirs.expiry)?;
                Ok(Reservation::Existing(adopted))
            }
            // Expired between the two calls.
            Ok(None) => match self.shared.save(&key, &record, record.expiry).await {
                Ok(()) => Ok(Reservation::Acquired(ours)),
                Err(e) => {
                    if self.mode.is_strict() {
                        self.local.remove(&key)?;
                    }
                    self.on_shared_error("reserve_if_absent", &key, e, Reservation::Acquired(ours))
                }
            },
            Err(e) => {
                if self.mode.is_strict() {
                    self.local.remove(&key)?;
                }
                self.on_shared_error("reserve_if_absent", &key, e, Reservation::Acquired(ours))
            }
        }
    }

    fn shared_access(&self, op: &'static str, key: &str) -> IdempotencyResult<SharedAccess> {
        if self.health.is_healthy() {
            return Ok(SharedAccess::Use);
        }

        match self.mode {
            ConsistencyMode::Strict => {
                self.metrics
                    .unavailable_rejections
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    op,
                    key,
                    backend = self.shared.name(),
                    "Shared tier unhealthy, failing closed"
                );
                Err(IdempotencyError::unavailable(format!(
                    "shared tier '{}' is unhealthy",
                    self.shared.name()
                )))
            }
            ConsistencyMode::Lenient => {
                self.metrics.shared_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(op, key, "Shared tier unhealthy, using local tier only");
                Ok(SharedAccess::Skip)
            }
        }
    }

    fn on_shared_error<T>(
        &self,
        op: &'static str,
        key: &str,
        error: IdempotencyError,
        fallback: T,
    ) -> IdempotencyResult<T> {
        self.metrics.shared_errors.fetch_add(1, Ordering::Relaxed);

        match self.mode {
            ConsistencyMode::Strict => {
                tracing::warn!(
                    op,
                    key,
                    backend = self.shared.name(),
                    error = %error,
                    "Shared tier call failed"
                );
                Err(IdempotencyError::unavailable(error.to_string()))
            }
            ConsistencyMode::Lenient => {
                tracing::warn!(
                    op,
                    key,
                    backend = self.shared.name(),
                    error = %error,
                    "Shared tier call failed, falling back to local tier"
                );
                Ok(fallback)
            }
        }
    }
}
