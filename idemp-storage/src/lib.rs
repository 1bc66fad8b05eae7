//! idemp Storage - Record Tiers
//!
//! Local and shared record stores, their bundled backends, and the tiered
//! cache that applies the shared-tier health policy.

pub mod cache;

pub use cache::{
    CacheStats, InMemoryLocalTier, InMemorySharedTier, InsertOutcome, LmdbSharedTier,
    LmdbTierError, LocalTier, NoopSharedTier, Reservation, SharedTier, TieredCache,
    TieredCacheMetrics, TieredCacheMetricsSnapshot,
};
