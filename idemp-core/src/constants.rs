//! Constants for idempotency coordination
//!
//! Centralizing defaults makes them easy to find, modify, and test.

// ============================================================================
// KEYS
// ============================================================================

/// Maximum length of an idempotency key, in characters
pub const MAX_KEY_LENGTH: usize = 256;

// ============================================================================
// REQUEST PATH
// ============================================================================

/// Default validity window of a record, measured from first sighting (5 minutes)
pub const DEFAULT_WINDOW_MS: u64 = 300_000;

/// Default bound on how long a duplicate waits for the original (1 minute)
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Default re-check interval while a duplicate waits
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Strict mode fails closed when the shared tier is unhealthy
pub const DEFAULT_STRICT_MODE: bool = true;

// ============================================================================
// LOCAL TIER
// ============================================================================

/// Default maximum number of records held in the local tier
pub const DEFAULT_LOCAL_CAPACITY: usize = 10_000;

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Default capacity of the key-touched sync queue
pub const DEFAULT_SYNC_QUEUE_CAPACITY: usize = 10_000;

/// Default period of the sync loop
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;

/// Default period of the shared-tier health probe
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;

/// Default bound on a single health probe
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
