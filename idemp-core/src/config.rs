//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_LOCAL_CAPACITY, DEFAULT_POLL_INTERVAL_MS, DEFAULT_STRICT_MODE,
    DEFAULT_SYNC_QUEUE_CAPACITY, DEFAULT_TIMEOUT_MS, DEFAULT_WINDOW_MS,
};
use crate::error::{ConfigError, IdempotencyResult};

/// How the tiered cache behaves while the shared tier is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConsistencyMode {
    /// Any shared-tier access while unhealthy fails with `CacheUnavailable`.
    #[default]
    Strict,
    /// The shared tier is skipped and the local tier is authoritative until
    /// health recovers.
    Lenient,
}

impl ConsistencyMode {
    pub fn from_strict(strict_mode: bool) -> Self {
        if strict_mode {
            Self::Strict
        } else {
            Self::Lenient
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Request-path configuration for idempotency coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Fail closed when the shared tier is unhealthy (default: true)
    pub strict_mode: bool,

    /// Validity window of a record, from first sighting (default: 5 minutes)
    pub window: Duration,

    /// Bound on how long a duplicate waits for the original (default: 1 minute)
    pub timeout: Duration,

    /// Re-check interval while waiting (default: 100ms)
    pub poll_interval: Duration,

    /// Reserve with an atomic insert-if-absent instead of check-then-write
    /// (default: false)
    pub atomic_reservation: bool,

    /// Maximum records held in the local tier (default: 10,000)
    pub local_capacity: usize,

    /// Capacity of the key-touched sync queue (default: 10,000)
    pub sync_queue_capacity: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            strict_mode: DEFAULT_STRICT_MODE,
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            atomic_reservation: false,
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            sync_queue_capacity: DEFAULT_SYNC_QUEUE_CAPACITY,
        }
    }
}

impl IdempotencyConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create IdempotencyConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `IDEMP_STRICT_MODE`: Fail closed on shared-tier outage (default: true)
    /// - `IDEMP_WINDOW_MS`: Validity window (default: 300000)
    /// - `IDEMP_TIMEOUT_MS`: Duplicate wait bound (default: 60000)
    /// - `IDEMP_POLL_INTERVAL_MS`: Wait re-check interval (default: 100)
    /// - `IDEMP_ATOMIC_RESERVATION`: Use atomic reservations (default: false)
    /// - `IDEMP_LOCAL_CAPACITY`: Local tier capacity (default: 10000)
    /// - `IDEMP_SYNC_QUEUE_CAPACITY`: Sync queue capacity (default: 10000)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let strict_mode = env_flag("IDEMP_STRICT_MODE").unwrap_or(DEFAULT_STRICT_MODE);

        let window = Duration::from_millis(env_parse("IDEMP_WINDOW_MS").unwrap_or(DEFAULT_WINDOW_MS));

        let timeout =
            Duration::from_millis(env_parse("IDEMP_TIMEOUT_MS").unwrap_or(DEFAULT_TIMEOUT_MS));

        let poll_interval = Duration::from_millis(
            env_parse("IDEMP_POLL_INTERVAL_MS").unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );

        let atomic_reservation = env_flag("IDEMP_ATOMIC_RESERVATION").unwrap_or(false);

        let local_capacity = env_parse("IDEMP_LOCAL_CAPACITY").unwrap_or(DEFAULT_LOCAL_CAPACITY);

        let sync_queue_capacity =
            env_parse("IDEMP_SYNC_QUEUE_CAPACITY").unwrap_or(DEFAULT_SYNC_QUEUE_CAPACITY);

        Self {
            strict_mode,
            window,
            timeout,
            poll_interval,
            atomic_reservation,
            local_capacity,
            sync_queue_capacity,
        }
    }

    /// The consistency policy implied by `strict_mode`.
    pub fn consistency(&self) -> ConsistencyMode {
        ConsistencyMode::from_strict(self.strict_mode)
    }

    /// Set strict mode.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Set the validity window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the duplicate wait bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the wait re-check interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable atomic reservations.
    pub fn with_atomic_reservation(mut self, enabled: bool) -> Self {
        self.atomic_reservation = enabled;
        self
    }

    /// Set the local tier capacity.
    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity;
        self
    }

    /// Set the sync queue capacity.
    pub fn with_sync_queue_capacity(mut self, capacity: usize) -> Self {
        self.sync_queue_capacity = capacity;
        self
    }

    /// Reject values the coordination engine cannot work with.
    pub fn validate(&self) -> IdempotencyResult<()> {
        if self.window.is_zero() {
            return Err(invalid("window", &self.window, "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid(
                "poll_interval",
                &self.poll_interval,
                "must be greater than zero",
            ));
        }
        if crate::record::expiry_after(chrono::Utc::now(), self.window).is_none() {
            return Err(invalid("window", &self.window, "is out of range"));
        }
        if self.local_capacity == 0 {
            return Err(invalid("local_capacity", &0, "must be at least 1"));
        }
        if self.sync_queue_capacity == 0 {
            return Err(invalid("sync_queue_capacity", &0, "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &dyn std::fmt::Debug, reason: &str) -> crate::IdempotencyError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: format!("{:?}", value),
        reason: reason.to_string(),
    }
    .into()
}

/// Parse an environment variable, ignoring unset or malformed values.
pub fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Read a boolean environment variable (`true`/`1`/`false`/`0`).
pub fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        })
}
