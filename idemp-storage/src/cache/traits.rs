//! Tier traits for the local and shared record stores.
//!
//! The local tier is synchronous and infallible apart from argument
//! validation. The shared tier is reached over the network, so every call is
//! async and may fail; "not found" is always a normal `Ok` result.

use async_trait::async_trait;
use idemp_core::{IdempotencyResult, Timestamp};
use serde::{de::DeserializeOwned, Serialize};

/// Result of an insert-if-absent on a tier.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<V> {
    /// The value was stored.
    Inserted(V),
    /// A live value already existed and was left untouched.
    Existing(V),
}

impl<V> InsertOutcome<V> {
    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    pub fn into_value(self) -> V {
        match self {
            Self::Inserted(v) | Self::Existing(v) => v,
        }
    }
}

/// Process-local, TTL-aware store.
///
/// Lookups past a value's expiry behave as if the value were absent.
/// Implementations must tolerate concurrent access from request tasks and
/// the reconciliation job.
pub trait LocalTier<V>: Send + Sync {
    /// Check whether a live value exists.
    fn contains(&self, key: &str) -> bool;

    /// Get a live value.
    fn get(&self, key: &str) -> Option<V>;

    /// Store or replace a value until `expiry`. Returns the stored value.
    fn save(&self, key: &str, value: V, expiry: Timestamp) -> IdempotencyResult<V>;

    /// Store a value only if no live value exists, atomically per key.
    fn insert_if_absent(
        &self,
        key: &str,
        value: V,
        expiry: Timestamp,
    ) -> IdempotencyResult<InsertOutcome<V>>;

    /// Remove a value. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> IdempotencyResult<()>;

    /// Drop every expired value. Returns how many were dropped.
    fn purge_expired(&self) -> usize;

    /// Get tier statistics.
    fn stats(&self) -> CacheStats;
}

/// Cluster-wide store contract for pluggable backends (e.g., Redis, LMDB,
/// a database table).
///
/// # Failure semantics
///
/// Transport and backend failures are reported as errors and must never be
/// folded into "absent". Expired values must be reported as absent.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Check whether a live value exists.
    async fn contains(&self, key: &str) -> IdempotencyResult<bool>;

    /// Get a live value.
    async fn get<T>(&self, key: &str) -> IdempotencyResult<Option<T>>
    where
        T: DeserializeOwned + Send;

    /// Store or replace a value until `expiry`.
    async fn save<T>(&self, key: &str, value: &T, expiry: Timestamp) -> IdempotencyResult<()>
    where
        T: Serialize + Sync;

    /// Store a value only if no live value exists. Returns true if stored.
    ///
    /// The default implementation is a non-atomic contains-then-save;
    /// backends with a native compare-and-insert should override it.
    async fn save_if_absent<T>(
        &self,
        key: &str,
        value: &T,
        expiry: Timestamp,
    ) -> IdempotencyResult<bool>
    where
        T: Serialize + Sync,
    {
        if self.contains(key).await? {
            return Ok(false);
        }
        self.save(key, value, expiry).await?;
        Ok(true)
    }

    /// Remove a value. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> IdempotencyResult<()>;

    /// Report whether the backend is reachable and serving.
    async fn is_healthy(&self) -> IdempotencyResult<bool>;
}

/// Statistics about tier usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found a live value.
    pub hits: u64,
    /// Number of lookups that found nothing (or only an expired value).
    pub misses: u64,
    /// Number of entries currently held.
    pub entry_count: u64,
    /// Number of entries dropped due to expiry or capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
