//! Background analysis jobs with retry, backoff and cooperative cancellation.
//!
//! ## Design
//!
//! - Jobs are owner-scoped and reference the paper they analyze
//! - Retry policy with capped exponential backoff and jitter
//! - Claims carry a lease; an expired lease makes a stalled job claimable again
//! - The store refuses writes to terminal records, so a terminal outcome is
//!   persisted (and notified) at most once
//!
//! ## Components
//!
//! - `Job`: job record and its state machine
//! - `JobStore`: persistence for jobs (in-memory or durable)
//! - `JobQueueManager`: enqueue, status, cancel, manual retry
//! - `WorkerPool`: claims jobs and drives them to a terminal state
//! - `classify`: maps failures to retryable/critical decisions

pub mod classifier;
pub mod collaborators;
pub mod error;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use classifier::{ClassifiedError, classify, classify_provider};
pub use collaborators::{
    InMemoryNotifier, InMemoryOperatorAlert, InMemorySubjectStore, NotifyError, OperatorAlert, Outcome, OutcomeKind,
    OutcomeNotifier, SubjectError, SubjectReader, TracingOperatorAlert,
};
pub use error::PipelineError;
pub use queue::{JobQueueManager, QueueError};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    AttemptOutcome, InvalidTransition, Job, JobAttemptRecord, JobId, JobStatus, PROGRESS_BASELINE, RetryPolicy,
};
pub use worker::{WorkerDeps, WorkerPool, WorkerPoolStats};
