//! Job queue manager: the boundary the rest of the system calls.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use paperlab_ai::CapabilityResolver;
use paperlab_core::{OwnerId, ProviderId, SubjectId};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus, RetryPolicy};

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} is {status}")]
    InvalidState { id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for QueueError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::Store(other),
        }
    }
}

/// Enqueue, inspect, cancel and manually retry analysis jobs.
#[derive(Clone)]
pub struct JobQueueManager {
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn CapabilityResolver>,
    max_attempts: u32,
}

impl JobQueueManager {
    pub fn new(store: Arc<dyn JobStore>, resolver: Arc<dyn CapabilityResolver>) -> Self {
        Self {
            store,
            resolver,
            max_attempts: RetryPolicy::default().max_attempts,
        }
    }

    /// Automatic retries stamped onto newly enqueued jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Persist a new `pending` job.
    ///
    /// Capabilities keep their request order; repeated ids are collapsed.
    pub async fn enqueue(
        &self,
        subject_id: SubjectId,
        owner_id: OwnerId,
        capabilities: Vec<ProviderId>,
    ) -> Result<JobId, QueueError> {
        if capabilities.is_empty() {
            return Err(QueueError::Validation("capabilities must not be empty".to_string()));
        }

        let mut requested: Vec<ProviderId> = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            if !self.resolver.is_known(&capability) {
                return Err(QueueError::Validation(format!("unknown capability: {capability}")));
            }
            if !requested.contains(&capability) {
                requested.push(capability);
            }
        }

        let job = Job::new(subject_id, owner_id, requested, self.max_attempts);
        let job_id = self.store.insert(job).await?;
        info!(job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    /// Snapshot of a job record.
    pub async fn get_status(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.store.get(job_id).await?.ok_or(QueueError::NotFound(job_id))
    }

    /// Cancel a non-terminal job. Returns false if it was already terminal.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let cancelled = self.store.cancel(job_id).await?;
        if cancelled {
            info!(job_id = %job_id, "job cancelled");
        } else {
            debug!(job_id = %job_id, "cancel ignored, job already terminal");
        }
        Ok(cancelled)
    }

    /// Start a fresh attempt of a failed job; the new job's `retried_from`
    /// points back at `job_id`.
    pub async fn retry(&self, job_id: JobId) -> Result<JobId, QueueError> {
        let job = self.get_status(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }

        let new_id = self.store.insert(job.manual_retry()).await?;
        info!(job_id = %new_id, retried_from = %job_id, "job manually retried");
        Ok(new_id)
    }

    pub async fn list(
        &self,
        owner: Option<&OwnerId>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(owner, status, limit).await?)
    }

    pub async fn stats(&self, owner: Option<&OwnerId>) -> Result<JobStats, QueueError> {
        Ok(self.store.stats(owner).await?)
    }

    /// Whether the job store is reachable.
    pub async fn is_healthy(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}
