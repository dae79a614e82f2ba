//! Service wiring: job store, queue manager and the in-process worker pool.

use std::sync::Arc;

use paperlab_ai::CapabilityResolver;
use paperlab_infra::PipelineConfig;
use paperlab_infra::jobs::{
    InMemoryJobStore, JobQueueManager, JobStore, OperatorAlert, OutcomeNotifier, SubjectReader, WorkerDeps,
    WorkerPool,
};

/// Everything the handlers need.
pub struct AppServices {
    pub manager: JobQueueManager,
    /// Absent when workers run in another process against the same store.
    pub pool: Option<Arc<WorkerPool>>,
}

impl AppServices {
    pub fn new(manager: JobQueueManager, pool: Option<Arc<WorkerPool>>) -> Self {
        Self { manager, pool }
    }

    /// In-memory store with an in-process worker pool (dev/test).
    ///
    /// Must be called from within a tokio runtime.
    pub fn in_memory(
        config: PipelineConfig,
        resolver: Arc<dyn CapabilityResolver>,
        subjects: Arc<dyn SubjectReader>,
        notifier: Arc<dyn OutcomeNotifier>,
        alert: Option<Arc<dyn OperatorAlert>>,
    ) -> Self {
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
        let manager =
            JobQueueManager::new(store.clone(), resolver.clone()).with_max_attempts(config.retry.max_attempts);

        let mut deps = WorkerDeps::new(store, resolver, subjects, notifier);
        if let Some(alert) = alert {
            deps = deps.with_alert(alert);
        }
        let pool = Arc::new(WorkerPool::spawn(config, deps));

        Self::new(manager, Some(pool))
    }

    /// Store reachable and, if workers run in-process, the pool still open.
    pub async fn is_healthy(&self) -> bool {
        if !self.manager.is_healthy().await {
            return false;
        }
        match &self.pool {
            Some(pool) => pool.is_healthy().await,
            None => true,
        }
    }
}
