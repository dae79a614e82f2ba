//! Pipeline error taxonomy.

use thiserror::Error;

use paperlab_ai::{AnalyzeError, ProviderError, ProviderFailure};
use paperlab_core::ProviderId;

use super::collaborators::SubjectError;
use super::store::JobStoreError;
use super::types::InvalidTransition;

/// Anything that can go wrong while a worker drives a job.
///
/// Every variant is routed through [`classify`](super::classifier::classify);
/// `Cancelled` and `LeaseLost` are control flow and never reach the owner.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Bad job data; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown job or subject; never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// One provider timed out, hit the network or got rate limited.
    #[error("provider {provider} failed: {source}")]
    TransientProvider {
        provider: ProviderId,
        #[source]
        source: ProviderError,
    },

    /// Every requested provider failed in one analyzer pass.
    #[error("all providers failed: {}", summarize(.failures))]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    /// Missing or invalid credentials/configuration; the owner has to act.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Store or queue transport unavailable; escalated to operators.
    #[error("infrastructure unavailable: {0}")]
    Infrastructure(String),

    /// Workers kept losing the job mid-attempt until its retry budget ran out.
    #[error("job abandoned mid-attempt {attempts} times, giving up")]
    AttemptsExhausted { attempts: u32 },

    /// The job record was in a state the worker cannot act on.
    #[error("invalid job state: {0}")]
    InvalidState(String),

    /// The stored job went terminal under us (cancelled or finished elsewhere).
    #[error("job cancelled")]
    Cancelled,

    /// Another worker reclaimed the job after our lease expired.
    #[error("job lease lost")]
    LeaseLost,

    /// Opaque failure, classified by its message.
    #[error("{0}")]
    Other(String),
}

fn summarize(failures: &[ProviderFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl From<JobStoreError> for PipelineError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::AlreadyTerminal(_) => PipelineError::Cancelled,
            JobStoreError::LeaseLost(_) => PipelineError::LeaseLost,
            JobStoreError::NotFound(id) => PipelineError::NotFound(format!("job {id}")),
            JobStoreError::AlreadyExists(id) => PipelineError::InvalidState(format!("job {id} already exists")),
            JobStoreError::Unavailable(msg) | JobStoreError::Storage(msg) => PipelineError::Infrastructure(msg),
        }
    }
}

impl From<AnalyzeError> for PipelineError {
    fn from(value: AnalyzeError) -> Self {
        match value {
            AnalyzeError::NoCapabilities => PipelineError::Configuration("no capabilities available".to_string()),
            AnalyzeError::AllProvidersFailed { failures } => PipelineError::AllProvidersFailed { failures },
            AnalyzeError::Cancelled => PipelineError::Cancelled,
        }
    }
}

impl From<SubjectError> for PipelineError {
    fn from(value: SubjectError) -> Self {
        match value {
            SubjectError::NotFound(id) => PipelineError::NotFound(format!("subject {id}")),
            SubjectError::Unavailable(msg) => PipelineError::Infrastructure(format!("paper store: {msg}")),
        }
    }
}

impl From<InvalidTransition> for PipelineError {
    fn from(value: InvalidTransition) -> Self {
        PipelineError::InvalidState(value.to_string())
    }
}
