//! One-call wiring of the coordination stack.

use std::sync::Arc;

use idemp_core::{IdempotencyConfig, IdempotencyRecord, IdempotencyResult, SharedHealth};
use idemp_storage::{InMemoryLocalTier, SharedTier, TieredCache};

use crate::coordination::CoordinationService;
use crate::guard::IdempotencyGuard;
use crate::reconcile::{ReconciliationConfig, ReconciliationHandle, ReconciliationJob};

/// The local tier used by [`IdempotencyEngine`].
pub type LocalRecords = InMemoryLocalTier<IdempotencyRecord>;

/// Tiered cache, coordination service, guard and reconciliation job over a
/// caller-supplied shared tier, all sharing one health flag.
pub struct IdempotencyEngine<S> {
    service: Arc<CoordinationService<LocalRecords, S>>,
    guard: IdempotencyGuard<LocalRecords, S>,
    reconciliation: ReconciliationJob<LocalRecords, S>,
}

impl<S> IdempotencyEngine<S>
where
    S: SharedTier + 'static,
{
    pub fn new(
        config: IdempotencyConfig,
        reconciliation: ReconciliationConfig,
        shared: Arc<S>,
    ) -> IdempotencyResult<Self> {
        config.validate()?;
        reconciliation.validate()?;

        let cache = Arc::new(TieredCache::new(
            Arc::new(InMemoryLocalTier::new(config.local_capacity)),
            shared,
            Arc::new(SharedHealth::default()),
            config.consistency(),
        ));

        let (service, sync_rx) = CoordinationService::new(Arc::clone(&cache), config);
        let service = Arc::new(service);
        let guard = IdempotencyGuard::new(Arc::clone(&service));
        let reconciliation = ReconciliationJob::new(cache, sync_rx, reconciliation);

        tracing::debug!(
            strict_mode = service.config().strict_mode,
            atomic_reservation = service.config().atomic_reservation,
            "Idempotency engine assembled"
        );

        Ok(Self {
            service,
            guard,
            reconciliation,
        })
    }

    /// Build from `IDEMP_*` environment variables.
    pub fn from_env(shared: Arc<S>) -> IdempotencyResult<Self> {
        Self::new(
            IdempotencyConfig::from_env(),
            ReconciliationConfig::from_env(),
            shared,
        )
    }

    pub fn service(&self) -> &Arc<CoordinationService<LocalRecords, S>> {
        &self.service
    }

    pub fn guard(&self) -> &IdempotencyGuard<LocalRecords, S> {
        &self.guard
    }

    pub fn cache(&self) -> &Arc<TieredCache<LocalRecords, S>> {
        self.service.cache()
    }

    pub fn reconciliation(&self) -> &ReconciliationJob<LocalRecords, S> {
        &self.reconciliation
    }

    /// Start the reconciliation job. Later calls return `None`.
    pub fn start(&self) -> Option<ReconciliationHandle> {
        self.reconciliation.start()
    }
}
