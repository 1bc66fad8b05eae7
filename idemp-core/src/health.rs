//! Shared-tier health state
//!
//! [`SharedHealth`] is the single flag the tiered cache consults before
//! touching the shared tier. It is owned explicitly and injected, so the
//! cache can be tested without process-wide state. Only the reconciliation
//! job's health probe (or a test) writes it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is not operational
    Unhealthy,
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    /// Component name
    pub component: String,
    /// Failure detail, if any
    pub message: Option<String>,
    /// Probe duration in milliseconds
    pub response_time_ms: Option<i64>,
    pub checked_at: Timestamp,
}

impl HealthCheck {
    /// Create a healthy check result.
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            response_time_ms: None,
            checked_at: chrono::Utc::now(),
        }
    }

    /// Create an unhealthy check result.
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            component: component.into(),
            message: Some(message.into()),
            response_time_ms: None,
            checked_at: chrono::Utc::now(),
        }
    }

    /// Set the response time.
    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Injected holder of the shared tier's health flag.
///
/// Starts healthy; the first probe corrects it within one probe interval.
#[derive(Debug)]
pub struct SharedHealth {
    healthy: AtomicBool,
    transitions: AtomicU64,
}

impl Default for SharedHealth {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SharedHealth {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Store a probe result. Returns the previous value.
    pub fn set(&self, healthy: bool) -> bool {
        let previous = self.healthy.swap(healthy, Ordering::AcqRel);
        if previous != healthy {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    /// Number of healthy/unhealthy flips observed.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> HealthStatus {
        if self.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_health_starts_healthy() {
        let health = SharedHealth::default();
        assert!(health.is_healthy());
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert_eq!(health.transitions(), 0);
    }

    #[test]
    fn test_set_counts_transitions_only() {
        let health = SharedHealth::default();
        assert!(health.set(true));
        assert_eq!(health.transitions(), 0);

        assert!(health.set(false));
        assert!(!health.is_healthy());
        assert!(!health.set(false));
        assert!(!health.set(true));
        assert_eq!(health.transitions(), 2);
    }

    #[test]
    fn test_health_check_builders() {
        let ok = HealthCheck::healthy("shared").with_response_time(3);
        assert!(ok.is_healthy());
        assert_eq!(ok.response_time_ms, Some(3));

        let bad = HealthCheck::unhealthy("shared", "timed out");
        assert!(!bad.is_healthy());
        assert_eq!(bad.message.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_health_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
    }
}
