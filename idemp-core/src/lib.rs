//! idemp Core - Record, Key and Policy Types
//!
//! Pure data structures shared by the storage tiers and the coordination
//! service. All other crates depend on this.

use chrono::{DateTime, Utc};

pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod key;
pub mod record;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use config::{env_flag, env_parse, ConsistencyMode, IdempotencyConfig};
pub use error::{CacheError, ConfigError, IdempotencyError, IdempotencyResult, ValidationError};
pub use health::{HealthCheck, HealthStatus, SharedHealth};
pub use key::{fingerprint, IdempotencyKey, KeyBuilder, KeyComponent};
pub use record::{IdempotencyRecord, RecordedOutcome};
