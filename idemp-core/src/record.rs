//! Idempotency record value type.
//!
//! A record is never mutated in place. Finalizing a reservation produces a new
//! record that keeps the identity fields (`key`, `expiry`, `created_at`,
//! `reservation_id`) and replaces the outcome fields.
//!
//! # State Transition Diagram
//!
//! ```text
//! (absent) ─── reserve() ──→ Reserved ─── finalize() ──→ Finalized
//!    ↑                                                      │
//!    └──────────────────── expiry elapses ──────────────────┘
//! ```

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::Timestamp;

/// The recorded outcome of an operation, replayed to duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedOutcome {
    pub payload: serde_json::Value,
    pub status_code: Option<u16>,
}

/// Value stored per idempotency key in every tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Identifies the reservation that created this record.
    pub reservation_id: Uuid,
    pub key: String,
    /// Absolute time after which the record is void in every tier.
    pub expiry: Timestamp,
    /// Outcome body; absent while processing.
    pub payload: Option<serde_json::Value>,
    pub status_code: Option<u16>,
    pub is_processing: bool,
    pub created_at: Timestamp,
}

impl IdempotencyRecord {
    /// Create a record for the first sighting of `key`.
    ///
    /// The expiry is measured from `now`, and is never extended afterwards.
    pub fn new(
        key: impl Into<String>,
        window: Duration,
        payload: Option<serde_json::Value>,
        status_code: Option<u16>,
        is_processing: bool,
        now: Timestamp,
    ) -> IdempotencyResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(IdempotencyError::invalid_argument(
                "key",
                "idempotency key must not be empty",
            ));
        }
        check_outcome(is_processing, payload.as_ref())?;
        let expiry = expiry_after(now, window).ok_or_else(|| {
            IdempotencyError::invalid_argument("window", "window is out of range")
        })?;

        Ok(Self {
            reservation_id: Uuid::now_v7(),
            key,
            expiry,
            payload,
            status_code,
            is_processing,
            created_at: now,
        })
    }

    /// Create an in-progress reservation.
    pub fn reserve(key: impl Into<String>, window: Duration) -> IdempotencyResult<Self> {
        Self::new(key, window, None, None, true, Utc::now())
    }

    /// Build the replacement record carrying a new outcome.
    ///
    /// Identity fields and the expiry are preserved.
    pub fn replace_outcome(
        &self,
        payload: Option<serde_json::Value>,
        status_code: Option<u16>,
        is_processing: bool,
    ) -> IdempotencyResult<Self> {
        check_outcome(is_processing, payload.as_ref())?;
        Ok(Self {
            payload,
            status_code,
            is_processing,
            ..self.clone()
        })
    }

    /// Build the finalized replacement record.
    pub fn finalize(
        &self,
        payload: serde_json::Value,
        status_code: Option<u16>,
    ) -> IdempotencyResult<Self> {
        self.replace_outcome(Some(payload), status_code, false)
    }

    /// Check if the record has expired as of `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }

    /// Remaining lifetime, or `None` once expired.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expiry - now).to_std().ok()
        }
    }

    /// True once an outcome has been recorded.
    pub fn is_finalized(&self) -> bool {
        !self.is_processing
    }

    /// True while a duplicate should keep waiting for this record.
    pub fn is_awaiting_outcome(&self, now: Timestamp) -> bool {
        self.is_processing && self.payload.is_none() && !self.is_expired(now)
    }

    /// The replayable outcome, if one was recorded.
    pub fn outcome(&self) -> Option<RecordedOutcome> {
        self.payload.as_ref().map(|payload| RecordedOutcome {
            payload: payload.clone(),
            status_code: self.status_code,
        })
    }
}

/// `now + window`, or `None` if it leaves the representable time range.
pub(crate) fn expiry_after(now: Timestamp, window: Duration) -> Option<Timestamp> {
    let window = chrono::Duration::from_std(window).ok()?;
    now.checked_add_signed(window)
}

fn check_outcome(is_processing: bool, payload: Option<&serde_json::Value>) -> IdempotencyResult<()> {
    if is_processing && payload.is_some() {
        return Err(IdempotencyError::invalid_argument(
            "payload",
            "an in-progress record cannot carry a payload",
        ));
    }
    Ok(())
}
