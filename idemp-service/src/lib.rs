//! idemp Service - Duplicate Coordination
//!
//! The request-path protocol (check, reserve, finalize, wait), the
//! background reconciliation job that keeps the tiers converged and tracks
//! shared-tier health, and a guard that packages the caller contract.
//!
//! # Wiring
//!
//! ```ignore
//! use idemp_service::{IdempotencyEngine, ReconciliationConfig};
//! use idemp_storage::LmdbSharedTier;
//!
//! let shared = Arc::new(LmdbSharedTier::open("/var/lib/idemp", 64)?);
//! let engine = IdempotencyEngine::from_env(shared)?;
//! let reconciliation = engine.start().expect("started once");
//!
//! let outcome = engine
//!     .guard()
//!     .execute(&key, &engine.guard().default_options(), || async { (body, Some(200)) })
//!     .await?;
//!
//! reconciliation.shutdown().await;
//! ```

pub mod coordination;
pub mod engine;
pub mod guard;
pub mod reconcile;
pub mod telemetry;

pub use coordination::{CoordinationMetrics, CoordinationService, CoordinationSnapshot, SyncReceiver};
pub use engine::{IdempotencyEngine, LocalRecords};
pub use guard::{GuardOptions, IdempotencyGuard, Outcome};
pub use reconcile::{
    HealthProbe, ReconciliationConfig, ReconciliationHandle, ReconciliationJob,
    ReconciliationMetrics, ReconciliationSnapshot, SyncPassReport, SyncWorker,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};

pub use idemp_storage::Reservation;
