//! Job storage implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use paperlab_core::OwnerId;

use super::types::{Job, JobId, JobStatus};

/// Job record store: the single source of truth for job status.
///
/// Implementations must make `claim_next` and `cancel` atomic with respect to
/// each other and to `update`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Write back a worker's copy of a job.
    ///
    /// Fails with `AlreadyTerminal` when the stored record is terminal and with
    /// `LeaseLost` when the job was claimed again since `job` was read
    /// (the claim tokens differ).
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the next ready job for `worker`: pending, retry-scheduled past its
    /// resume time, or processing with an expired lease.
    /// Returns None if no jobs are available.
    async fn claim_next(&self, worker: &str, lease: Duration) -> Result<Option<Job>, JobStoreError>;

    /// Move a non-terminal job to `cancelled`. Returns false if it was already terminal.
    async fn cancel(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// List jobs, oldest first.
    async fn list(
        &self,
        owner: Option<&OwnerId>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self, owner: Option<&OwnerId>) -> Result<JobStats, JobStoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job already terminal: {0}")]
    AlreadyTerminal(JobId),
    #[error("job lease lost: {0}")]
    LeaseLost(JobId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every operation fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobStoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    fn poisoned<T>(_: T) -> JobStoreError {
        JobStoreError::Storage("job map lock poisoned".to_string())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(Self::poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        let jobs = self.jobs.read().map_err(Self::poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(Self::poisoned)?;
        let stored = jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;

        if stored.status.is_terminal() {
            return Err(JobStoreError::AlreadyTerminal(job.id));
        }
        if stored.claim_token != job.claim_token {
            return Err(JobStoreError::LeaseLost(job.id));
        }

        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_next(&self, worker: &str, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(Self::poisoned)?;
        let now = Utc::now();

        // Oldest claimable job first.
        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.claim(worker, lease)
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(Self::poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if job.status.is_terminal() {
            return Ok(false);
        }
        job.cancel().map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(true)
    }

    async fn list(
        &self,
        owner: Option<&OwnerId>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.check_available()?;
        let jobs = self.jobs.read().map_err(Self::poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| owner.is_none_or(|o| &j.owner_id == o) && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, owner: Option<&OwnerId>) -> Result<JobStats, JobStoreError> {
        self.check_available()?;
        let jobs = self.jobs.read().map_err(Self::poisoned)?;

        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| owner.is_none_or(|o| &j.owner_id == o)) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::RetryScheduled => stats.retry_scheduled += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        Ok(stats)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        self.check_available()
    }
}
