//! Reconciliation Background Tasks
//!
//! Two periodic activities keep the tiers converged:
//!
//! - **Sync loop**: drains key-touched events from the coordination service
//!   into a de-duplicated pending set. For each key whose local copy is not
//!   yet finalized, the shared copy is fetched; a finalized shared copy is
//!   written into the local tier, an in-progress one is retried on the next
//!   pass until it expires.
//! - **Health probe**: asks the shared tier whether it is healthy, bounded by
//!   a probe timeout, and stores the answer in the injected
//!   [`SharedHealth`](idemp_core::SharedHealth) flag read by the tiered
//!   cache. Errors and timeouts count as unhealthy.
//!
//! A failed iteration is logged and counted; neither loop ever stops on error.
//!
//! # Configuration
//!
//! ```rust
//! use idemp_service::ReconciliationConfig;
//! use std::time::Duration;
//!
//! let config = ReconciliationConfig {
//!     sync_interval: Duration::from_secs(5),    // Drain the sync queue every 5s
//!     health_interval: Duration::from_secs(5),  // Probe the shared tier every 5s
//!     probe_timeout: Duration::from_secs(2),    // A slower probe counts as unhealthy
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use idemp_core::constants::{
    DEFAULT_HEALTH_INTERVAL_SECS, DEFAULT_PROBE_TIMEOUT_MS, DEFAULT_SYNC_INTERVAL_SECS,
};
use idemp_core::{env_parse, ConfigError, HealthCheck, IdempotencyRecord, IdempotencyResult};
use idemp_storage::{LocalTier, SharedTier, TieredCache};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::coordination::SyncReceiver;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the reconciliation tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConfig {
    /// How often to run a sync pass (default: 5 seconds)
    pub sync_interval: Duration,

    /// How often to probe shared-tier health (default: 5 seconds)
    pub health_interval: Duration,

    /// Bound on a single health probe (default: 2 seconds)
    pub probe_timeout: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

impl ReconciliationConfig {
    /// Create ReconciliationConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `IDEMP_SYNC_INTERVAL_SECS`: Sync pass period (default: 5)
    /// - `IDEMP_HEALTH_INTERVAL_SECS`: Health probe period (default: 5)
    /// - `IDEMP_PROBE_TIMEOUT_MS`: Health probe bound (default: 2000)
    pub fn from_env() -> Self {
        let sync_interval = Duration::from_secs(
            env_parse("IDEMP_SYNC_INTERVAL_SECS").unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
        );

        let health_interval = Duration::from_secs(
            env_parse("IDEMP_HEALTH_INTERVAL_SECS").unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
        );

        let probe_timeout = Duration::from_millis(
            env_parse("IDEMP_PROBE_TIMEOUT_MS").unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
        );

        Self {
            sync_interval,
            health_interval,
            probe_timeout,
        }
    }

    /// Create a configuration for development/testing with short periods.
    pub fn development() -> Self {
        Self {
            sync_interval: Duration::from_millis(50),
            health_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
        }
    }

    /// Reject zero periods, which `tokio::time::interval` cannot run.
    pub fn validate(&self) -> IdempotencyResult<()> {
        for (field, value) in [
            ("sync_interval", self.sync_interval),
            ("health_interval", self.health_interval),
            ("probe_timeout", self.probe_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: format!("{:?}", value),
                    reason: "must be greater than zero".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for reconciliation activity.
#[derive(Debug, Default)]
pub struct ReconciliationMetrics {
    /// Completed sync passes
    pub sync_passes: AtomicU64,
    /// Finalized shared records written into the local tier
    pub records_synced: AtomicU64,
    /// Keys put back for a later pass
    pub keys_requeued: AtomicU64,
    /// Keys dropped from the pending set
    pub keys_dropped: AtomicU64,
    /// Shared-tier errors during sync passes
    pub sync_errors: AtomicU64,
    /// Completed health probes
    pub health_probes: AtomicU64,
    /// Probes that failed or timed out
    pub probe_failures: AtomicU64,
}

impl ReconciliationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> ReconciliationSnapshot {
        ReconciliationSnapshot {
            sync_passes: self.sync_passes.load(Ordering::Relaxed),
            records_synced: self.records_synced.load(Ordering::Relaxed),
            keys_requeued: self.keys_requeued.load(Ordering::Relaxed),
            keys_dropped: self.keys_dropped.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
            health_probes: self.health_probes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciliation metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationSnapshot {
    pub sync_passes: u64,
    pub records_synced: u64,
    pub keys_requeued: u64,
    pub keys_dropped: u64,
    pub sync_errors: u64,
    pub health_probes: u64,
    pub probe_failures: u64,
}

// ============================================================================
// SYNC WORKER
// ============================================================================

/// What a sync pass decided for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyDisposition {
    Synced,
    Done,
    Requeue,
    Drop,
}

/// Outcome counts of a single sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPassReport {
    pub processed: usize,
    pub synced: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Pending keys, each held at most once.
#[derive(Debug, Default)]
struct PendingKeys {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl PendingKeys {
    fn push(&mut self, key: String) {
        if self.members.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    fn pop(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.members.remove(&key);
        Some(key)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Owns the sync channel receiver and the pending set.
pub struct SyncWorker<L, S> {
    cache: Arc<TieredCache<L, S>>,
    receiver: SyncReceiver,
    pending: PendingKeys,
    metrics: Arc<ReconciliationMetrics>,
}

impl<L, S> SyncWorker<L, S>
where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    pub fn new(
        cache: Arc<TieredCache<L, S>>,
        receiver: SyncReceiver,
        metrics: Arc<ReconciliationMetrics>,
    ) -> Self {
        Self {
            cache,
            receiver,
            pending: PendingKeys::default(),
            metrics,
        }
    }

    /// Number of keys waiting for a later pass.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drain queued events and reconcile every pending key once.
    pub async fn run_pass(&mut self) -> SyncPassReport {
        while let Ok(key) = self.receiver.try_recv() {
            self.pending.push(key);
        }

        let mut report = SyncPassReport::default();
        let mut retry = Vec::new();

        while let Some(key) = self.pending.pop() {
            report.processed += 1;
            match self.sync_key(&key).await {
                KeyDisposition::Synced => report.synced += 1,
                KeyDisposition::Done => {}
                KeyDisposition::Requeue => {
                    report.requeued += 1;
                    retry.push(key);
                }
                KeyDisposition::Drop => report.dropped += 1,
            }
        }

        for key in retry {
            self.pending.push(key);
        }

        self.metrics.sync_passes.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .records_synced
            .fetch_add(report.synced as u64, Ordering::Relaxed);
        self.metrics
            .keys_requeued
            .fetch_add(report.requeued as u64, Ordering::Relaxed);
        self.metrics
            .keys_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        if report.synced > 0 {
            tracing::info!(
                synced = report.synced,
                requeued = report.requeued,
                dropped = report.dropped,
                "Sync pass completed"
            );
        } else {
            tracing::trace!(
                processed = report.processed,
                "Sync pass completed with nothing to sync"
            );
        }
        report
    }

    async fn sync_key(&self, key: &str) -> KeyDisposition {
        let local = self.cache.local().get(key);
        if local.as_ref().is_some_and(IdempotencyRecord::is_finalized) {
            return KeyDisposition::Done;
        }
        // An in-progress local copy is only returned while it is live.
        let retry_or_drop = if local.is_some() {
            KeyDisposition::Requeue
        } else {
            KeyDisposition::Drop
        };

        if !self.cache.health().is_healthy() {
            tracing::trace!(key, "Shared tier unhealthy, deferring sync");
            return retry_or_drop;
        }

        match self.cache.shared().get::<IdempotencyRecord>(key).await {
            Ok(Some(shared)) if shared.is_finalized() => {
                match self.cache.local().save(key, shared.clone(), shared.expiry) {
                    Ok(_) => {
                        tracing::debug!(key, "Pulled finalized record into local tier");
                        KeyDisposition::Synced
                    }
                    Err(e) => {
                        tracing::error!(key, error = %e, "Failed to store synced record");
                        self.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
                        retry_or_drop
                    }
                }
            }
            Ok(Some(shared)) => {
                if shared.is_expired(Utc::now()) {
                    KeyDisposition::Drop
                } else {
                    KeyDisposition::Requeue
                }
            }
            Ok(None) => retry_or_drop,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to fetch shared record during sync");
                self.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
                retry_or_drop
            }
        }
    }
}

// ============================================================================
// HEALTH PROBE
// ============================================================================

/// Probes the shared tier and publishes the result.
pub struct HealthProbe<L, S> {
    cache: Arc<TieredCache<L, S>>,
    probe_timeout: Duration,
    last_check: Arc<RwLock<Option<HealthCheck>>>,
    metrics: Arc<ReconciliationMetrics>,
}

impl<L, S> HealthProbe<L, S>
where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    pub fn new(
        cache: Arc<TieredCache<L, S>>,
        probe_timeout: Duration,
        metrics: Arc<ReconciliationMetrics>,
    ) -> Self {
        Self {
            cache,
            probe_timeout,
            last_check: Arc::new(RwLock::new(None)),
            metrics,
        }
    }

    /// The most recent probe result, if any probe ran.
    pub fn last_check(&self) -> Option<HealthCheck> {
        self.last_check.read().ok().and_then(|guard| guard.clone())
    }

    /// Run one probe and store its result in the shared health flag.
    pub async fn probe(&self) -> HealthCheck {
        let shared = self.cache.shared();
        let component = shared.name().to_string();
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.probe_timeout, shared.is_healthy()).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let check = match outcome {
            Ok(Ok(true)) => HealthCheck::healthy(&component),
            Ok(Ok(false)) => HealthCheck::unhealthy(&component, "backend reported unhealthy"),
            Ok(Err(e)) => HealthCheck::unhealthy(&component, e.to_string()),
            Err(_) => HealthCheck::unhealthy(
                &component,
                format!("probe timed out after {}ms", self.probe_timeout.as_millis()),
            ),
        }
        .with_response_time(elapsed_ms);

        self.metrics.health_probes.fetch_add(1, Ordering::Relaxed);
        if !check.is_healthy() {
            self.metrics.probe_failures.fetch_add(1, Ordering::Relaxed);
        }

        let healthy = check.is_healthy();
        let was_healthy = self.cache.health().set(healthy);
        match (was_healthy, healthy) {
            (true, false) => tracing::warn!(
                backend = %component,
                reason = check.message.as_deref().unwrap_or("unknown"),
                "Shared tier marked unhealthy"
            ),
            (false, true) => tracing::info!(
                backend = %component,
                response_time_ms = elapsed_ms,
                "Shared tier recovered"
            ),
            _ => tracing::trace!(backend = %component, healthy, "Shared tier probe completed"),
        }

        if let Ok(mut guard) = self.last_check.write() {
            *guard = Some(check.clone());
        }
        check
    }
}

// ============================================================================
// BACKGROUND JOB
// ============================================================================

/// The reconciliation job: one sync task and one health probe task.
///
/// # Example
///
/// ```ignore
/// let (service, sync_rx) = CoordinationService::new(cache.clone(), config);
/// let job = ReconciliationJob::new(cache, sync_rx, ReconciliationConfig::default());
///
/// let handle = job.start().expect("first start");
/// assert!(job.start().is_none());
///
/// // On shutdown
/// let metrics = handle.shutdown().await;
/// ```
pub struct ReconciliationJob<L, S> {
    cache: Arc<TieredCache<L, S>>,
    config: ReconciliationConfig,
    receiver: Mutex<Option<SyncReceiver>>,
    started: AtomicBool,
    metrics: Arc<ReconciliationMetrics>,
    probe: Arc<HealthProbe<L, S>>,
}

impl<L, S> ReconciliationJob<L, S>
where
    L: LocalTier<IdempotencyRecord> + 'static,
    S: SharedTier + 'static,
{
    pub fn new(
        cache: Arc<TieredCache<L, S>>,
        receiver: SyncReceiver,
        config: ReconciliationConfig,
    ) -> Self {
        let metrics = Arc::new(ReconciliationMetrics::new());
        let probe = Arc::new(HealthProbe::new(
            Arc::clone(&cache),
            config.probe_timeout,
            Arc::clone(&metrics),
        ));
        Self {
            cache,
            config,
            receiver: Mutex::new(Some(receiver)),
            started: AtomicBool::new(false),
            metrics,
            probe,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> ReconciliationSnapshot {
        self.metrics.snapshot()
    }

    /// The most recent health probe result.
    pub fn last_health_check(&self) -> Option<HealthCheck> {
        self.probe.last_check()
    }

    /// Spawn both tasks. Only the first call starts anything; later calls
    /// return `None`.
    pub fn start(&self) -> Option<ReconciliationHandle> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Reconciliation job already started");
            return None;
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = SyncWorker::new(
            Arc::clone(&self.cache),
            receiver,
            Arc::clone(&self.metrics),
        );
        let sync_task = tokio::spawn(sync_loop(
            worker,
            self.config.sync_interval,
            shutdown_rx.clone(),
        ));
        let health_task = tokio::spawn(health_loop(
            Arc::clone(&self.probe),
            self.config.health_interval,
            shutdown_rx,
        ));

        tracing::info!(
            sync_interval_ms = self.config.sync_interval.as_millis() as u64,
            health_interval_ms = self.config.health_interval.as_millis() as u64,
            probe_timeout_ms = self.config.probe_timeout.as_millis() as u64,
            "Reconciliation job started"
        );

        Some(ReconciliationHandle {
            shutdown_tx,
            sync_task,
            health_task,
            metrics: Arc::clone(&self.metrics),
        })
    }
}

/// Handle to the running reconciliation tasks.
///
/// Dropping the handle also stops the tasks, without waiting for them.
pub struct ReconciliationHandle {
    shutdown_tx: watch::Sender<bool>,
    sync_task: JoinHandle<()>,
    health_task: JoinHandle<()>,
    metrics: Arc<ReconciliationMetrics>,
}

impl ReconciliationHandle {
    pub fn metrics(&self) -> ReconciliationSnapshot {
        self.metrics.snapshot()
    }

    /// Signal both tasks to stop and wait for them to finish.
    pub async fn shutdown(self) -> ReconciliationSnapshot {
        let _ = self.shutdown_tx.send(true);

        for (name, task) in [("sync", self.sync_task), ("health", self.health_task)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Reconciliation task ended abnormally");
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            sync_passes = snapshot.sync_passes,
            records_synced = snapshot.records_synced,
            sync_errors = snapshot.sync_errors,
            health_probes = snapshot.health_probes,
            probe_failures = snapshot.probe_failures,
            "Reconciliation job stopped"
        );
        snapshot
    }
}

async fn sync_loop<L, S>(
    mut worker: SyncWorker<L, S>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!(pending = worker.pending(), "Sync loop shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                worker.run_pass().await;
            }
        }
    }
}

async fn health_loop<L, S>(
    probe: Arc<HealthProbe<L, S>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    L: LocalTier<IdempotencyRecord>,
    S: SharedTier,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("Health probe loop shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                probe.probe().await;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
