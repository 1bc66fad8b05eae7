//! Error types for idempotency operations

use thiserror::Error;

/// Cache tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The shared tier is unhealthy and the operation requires it.
    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all idempotency errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl IdempotencyError {
    /// Shorthand for [`CacheError::Unavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        CacheError::Unavailable {
            reason: reason.into(),
        }
        .into()
    }

    /// Shorthand for [`ValidationError::InvalidArgument`].
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
        .into()
    }

    /// Shorthand for [`CacheError::Backend`].
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::Backend {
            backend: backend.into(),
            reason: reason.into(),
        }
        .into()
    }

    /// Returns true if the shared tier was unavailable for this operation.
    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, Self::Cache(CacheError::Unavailable { .. }))
    }

    /// Returns true if the caller supplied an invalid argument.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::Validation(ValidationError::InvalidArgument { .. }))
    }
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization {
            reason: e.to_string(),
        }
        .into()
    }
}

/// Result type alias for idempotency operations.
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

// =============================================================================
// TESTS
// =============================================================================
