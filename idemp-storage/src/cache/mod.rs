//! Record tiers and the health-aware tiered cache.
//!
//! Two stores hold every idempotency record:
//!
//! - a process-local [`LocalTier`] answering most lookups without I/O, and
//! - a cluster-wide [`SharedTier`] reached over the network, whose health is
//!   tracked out of band by the reconciliation job.
//!
//! [`TieredCache`] composes them. Its behavior while the shared tier is down
//! is picked by [`idemp_core::ConsistencyMode`]: strict callers fail closed,
//! lenient callers keep serving from the local tier.
//!
//! # Example
//!
//! ```ignore
//! let cache = TieredCache::new(
//!     Arc::new(InMemoryLocalTier::new(10_000)),
//!     Arc::new(LmdbSharedTier::open("/var/lib/idemp", 64)?),
//!     Arc::new(SharedHealth::default()),
//!     ConsistencyMode::Strict,
//! );
//!
//! let record = cache.save(IdempotencyRecord::reserve("order-42", window)?).await?;
//! assert!(cache.contains("order-42").await?);
//! ```

pub mod lmdb_backend;
pub mod local;
pub mod memory;
pub mod tiered;
pub mod traits;

pub use lmdb_backend::{LmdbSharedTier, LmdbTierError};
pub use local::InMemoryLocalTier;
pub use memory::{InMemorySharedTier, NoopSharedTier};
pub use tiered::{Reservation, TieredCache, TieredCacheMetrics, TieredCacheMetricsSnapshot};
pub use traits::{CacheStats, InsertOutcome, LocalTier, SharedTier};
