//! External collaborators the worker talks to: the paper store, the outcome
//! notifier and the operator alert channel.
//!
//! Only the call contracts live here, plus in-memory implementations for
//! tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::error;

use paperlab_ai::Paper;
use paperlab_core::{OwnerId, SubjectId};

use super::classifier::ClassifiedError;
use super::types::{Job, JobId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject not found: {0}")]
    NotFound(SubjectId),
    #[error("paper store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the papers being analyzed.
#[async_trait]
pub trait SubjectReader: Send + Sync + 'static {
    async fn get_subject(&self, subject_id: &SubjectId) -> Result<Paper, SubjectError>;
}

/// In-memory paper store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySubjectStore {
    papers: RwLock<HashMap<SubjectId, Paper>>,
}

impl InMemorySubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, paper: Paper) {
        if let Ok(mut papers) = self.papers.write() {
            papers.insert(paper.id.clone(), paper);
        }
    }
}

#[async_trait]
impl SubjectReader for InMemorySubjectStore {
    async fn get_subject(&self, subject_id: &SubjectId) -> Result<Paper, SubjectError> {
        let papers = self
            .papers
            .read()
            .map_err(|_| SubjectError::Unavailable("paper map lock poisoned".to_string()))?;
        papers
            .get(subject_id)
            .cloned()
            .ok_or_else(|| SubjectError::NotFound(subject_id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Terminal outcome delivered to a job's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub job_id: JobId,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers terminal outcomes to owners.
///
/// Fire-and-forget from the worker's point of view: errors are logged, never
/// fed back into the job.
#[async_trait]
pub trait OutcomeNotifier: Send + Sync + 'static {
    async fn notify(&self, owner: &OwnerId, outcome: Outcome) -> Result<(), NotifyError>;
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    inner: Mutex<Vec<(OwnerId, Outcome)>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(OwnerId, Outcome)> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<Outcome> {
        self.all()
            .into_iter()
            .filter(|(_, o)| o.job_id == job_id)
            .map(|(_, o)| o)
            .collect()
    }
}

#[async_trait]
impl OutcomeNotifier for InMemoryNotifier {
    async fn notify(&self, owner: &OwnerId, outcome: Outcome) -> Result<(), NotifyError> {
        self.inner
            .lock()
            .map_err(|_| NotifyError("notification log lock poisoned".to_string()))?
            .push((owner.clone(), outcome));
        Ok(())
    }
}

/// Out-of-band operator escalation for critical failures.
pub trait OperatorAlert: Send + Sync + 'static {
    fn alert(&self, job: &Job, error: &ClassifiedError);
}

/// Escalates through the log pipeline at `error` level.
#[derive(Debug, Default, Copy, Clone)]
pub struct TracingOperatorAlert;

impl OperatorAlert for TracingOperatorAlert {
    fn alert(&self, job: &Job, error: &ClassifiedError) {
        error!(
            job_id = %job.id,
            owner = %job.owner_id,
            code = error.code.as_deref().unwrap_or("unknown"),
            message = %error.message,
            "critical job failure; operator attention required"
        );
    }
}

/// Records alerts for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOperatorAlert {
    inner: Mutex<Vec<(JobId, ClassifiedError)>>,
}

impl InMemoryOperatorAlert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(JobId, ClassifiedError)> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl OperatorAlert for InMemoryOperatorAlert {
    fn alert(&self, job: &Job, error: &ClassifiedError) {
        if let Ok(mut alerts) = self.inner.lock() {
            alerts.push((job.id, error.clone()));
        }
    }
}
