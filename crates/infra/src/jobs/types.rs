//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use paperlab_ai::AnalysisResult;
use paperlab_core::{DomainError, OwnerId, ProviderId, SubjectId};

use super::classifier::ClassifiedError;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Job lifecycle status.
///
/// Transitions only move forward, except `RetryScheduled -> Processing`
/// (and `Processing -> Processing` when an expired lease is reclaimed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Owned by exactly one worker
    Processing,
    /// Failed transiently, eligible again at `scheduled_at`
    RetryScheduled,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Processing)
                | (Processing, RetryScheduled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (RetryScheduled, Processing)
                | (RetryScheduled, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::RetryScheduled => "retry-scheduled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "retry-scheduled" => Ok(JobStatus::RetryScheduled),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Retry policy configuration.
///
/// Delay for attempt `n` (0-indexed): `min(base * 2^n + jitter, max_delay)` with
/// jitter drawn uniformly from `[0, jitter * base * 2^n]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Automatic whole-job retries before the job fails (0 = no retries)
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter as a fraction of the exponential term (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// `base * 2^attempt`, saturating at `Duration::MAX`.
    pub fn exponential_term(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay for `attempt` with a random jitter draw.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(attempt, unit)
    }

    /// Delay for `attempt` where `unit` in \[0, 1\] picks the point in the jitter range.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let exp = self.exponential_term(attempt);
        let fraction = (self.jitter * unit.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        let jitter = exp.mul_f64(fraction);
        exp.saturating_add(jitter).min(self.max_delay)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Progress baseline every processing attempt starts from.
pub const PROGRESS_BASELINE: u8 = 0;

/// A background analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Paper being analyzed (owned by the paper store)
    pub subject_id: SubjectId,
    /// Requester; receives the outcome notification
    pub owner_id: OwnerId,
    /// Provider capabilities to invoke, in request order, without duplicates
    pub capabilities: Vec<ProviderId>,
    pub status: JobStatus,
    /// Whole-job automatic retries so far
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// 0-100, non-decreasing within one attempt
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a `retry-scheduled` job may be claimed again
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Present only when `completed`
    pub result: Option<Vec<AnalysisResult>>,
    /// Present only when `failed`
    pub error: Option<ClassifiedError>,
    /// Worker holding (or last holding) the claim
    pub locked_by: Option<String>,
    /// Fencing token, fresh on every claim; the store only accepts writes carrying the current one
    pub claim_token: Option<Uuid>,
    pub lease_until: Option<DateTime<Utc>>,
    /// Set on jobs created by a manual retry
    pub retried_from: Option<JobId>,
    /// Execution history, one record per processing attempt
    pub history: Vec<JobAttemptRecord>,
}

/// How a processing attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Completed,
    RetryScheduled,
    Failed,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub worker: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(
        subject_id: SubjectId,
        owner_id: OwnerId,
        capabilities: Vec<ProviderId>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            subject_id,
            owner_id,
            capabilities,
            status: JobStatus::Pending,
            attempts_made: 0,
            max_attempts,
            progress_percent: PROGRESS_BASELINE,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            scheduled_at: None,
            result: None,
            error: None,
            locked_by: None,
            claim_token: None,
            lease_until: None,
            retried_from: None,
            history: Vec::new(),
        }
    }

    /// A fresh job for a user-initiated retry of `self`.
    pub fn manual_retry(&self) -> Self {
        let mut job = Job::new(
            self.subject_id.clone(),
            self.owner_id.clone(),
            self.capabilities.clone(),
            self.max_attempts,
        );
        job.retried_from = Some(self.id);
        job
    }

    /// Whether a claim may pick this job up at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::RetryScheduled => self.scheduled_at.is_none_or(|at| now >= at),
            JobStatus::Processing => self.lease_until.is_some_and(|until| now >= until),
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// True once reclaims after expired leases have used up more than the retry budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made > self.max_attempts
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Hand the job to `worker` for one processing attempt.
    ///
    /// Reclaiming a `processing` job whose lease expired counts as a spent attempt.
    pub fn claim(&mut self, worker: &str, lease: Duration) -> Result<(), InvalidTransition> {
        let reclaimed = self.status == JobStatus::Processing;
        self.transition(JobStatus::Processing)?;
        if reclaimed {
            self.attempts_made += 1;
        }
        let now = self.updated_at;
        self.started_at.get_or_insert(now);
        self.scheduled_at = None;
        self.progress_percent = PROGRESS_BASELINE;
        self.locked_by = Some(worker.to_string());
        self.claim_token = Some(Uuid::now_v7());
        self.lease_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        Ok(())
    }

    /// Raise progress to `percent` (never lowers it) and renew the lease.
    pub fn checkpoint(&mut self, percent: u8, lease: Duration) {
        let now = Utc::now();
        self.progress_percent = self.progress_percent.max(percent.min(100));
        self.updated_at = now;
        self.lease_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
    }

    pub fn complete(
        &mut self,
        results: Vec<AnalysisResult>,
        started_at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed)?;
        self.progress_percent = 100;
        self.result = Some(results);
        self.finish(started_at, AttemptOutcome::Completed, None);
        self.completed_at.get_or_insert(self.updated_at);
        Ok(())
    }

    /// Release the job for another attempt after `delay`.
    pub fn schedule_retry(
        &mut self,
        error: &ClassifiedError,
        delay: Duration,
        started_at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::RetryScheduled)?;
        self.attempts_made += 1;
        self.progress_percent = PROGRESS_BASELINE;
        self.scheduled_at = Some(self.updated_at + chrono::Duration::from_std(delay).unwrap_or_default());
        self.finish(started_at, AttemptOutcome::RetryScheduled, Some(error.message.clone()));
        Ok(())
    }

    pub fn fail(&mut self, error: ClassifiedError, started_at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.finish(started_at, AttemptOutcome::Failed, Some(error.message.clone()));
        self.error = Some(error);
        self.completed_at.get_or_insert(self.updated_at);
        Ok(())
    }

    /// Mark job as cancelled.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Cancelled)?;
        self.lease_until = None;
        self.scheduled_at = None;
        self.completed_at.get_or_insert(self.updated_at);
        Ok(())
    }

    fn finish(&mut self, started_at: DateTime<Utc>, outcome: AttemptOutcome, error: Option<String>) {
        let now = self.updated_at;
        self.lease_until = None;
        self.history.push(JobAttemptRecord {
            attempt: self.history.len() as u32 + 1,
            worker: self.locked_by.clone(),
            started_at,
            finished_at: now,
            outcome,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "paper-1".into(),
            "owner-1".into(),
            vec!["providerA".into()],
            3,
        )
    }

    fn transient() -> ClassifiedError {
        ClassifiedError {
            message: "timeout".into(),
            retryable: true,
            critical: false,
            code: Some("transient_provider".into()),
        }
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_with_jitter(0, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_with_jitter(1, 0.0), Duration::from_secs(4));
        assert_eq!(policy.delay_with_jitter(2, 0.0), Duration::from_secs(8));
        assert_eq!(policy.delay_with_jitter(3, 0.0), Duration::from_secs(16));
        assert_eq!(policy.delay_with_jitter(4, 0.0), Duration::from_secs(30));
    }

    #[test]
    fn jitter_is_at_most_ten_percent_of_the_exponential_term() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_with_jitter(0, 1.0), Duration::from_millis(2200));
        assert_eq!(policy.delay_with_jitter(2, 0.5), Duration::from_millis(8400));
        // Capped once the jittered term passes max_delay.
        assert_eq!(policy.delay_with_jitter(3, 1.0), Duration::from_millis(17600));
        assert_eq!(policy.delay_with_jitter(10, 1.0), Duration::from_secs(30));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::RetryScheduled).unwrap(),
            "\"retry-scheduled\""
        );
        assert_eq!("retry-scheduled".parse::<JobStatus>().unwrap(), JobStatus::RetryScheduled);
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::RetryScheduled,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts_made, 0);

        job.claim("w-1", Duration::from_secs(60)).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        let started = job.started_at.unwrap();

        job.checkpoint(40, Duration::from_secs(60));
        job.checkpoint(30, Duration::from_secs(60));
        assert_eq!(job.progress_percent, 40);

        job.complete(vec![], started).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert!(job.result.is_some());
        assert!(job.completed_at.is_some());
        assert_eq!(job.history.len(), 1);
        assert_eq!(job.history[0].outcome, AttemptOutcome::Completed);

        assert!(job.cancel().is_err());
    }

    #[test]
    fn retry_resets_progress_and_keeps_started_at() {
        let mut job = job();
        job.claim("w-1", Duration::from_secs(60)).unwrap();
        let first_start = job.started_at;
        job.checkpoint(40, Duration::from_secs(60));

        job.schedule_retry(&transient(), Duration::from_secs(2), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::RetryScheduled);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.progress_percent, PROGRESS_BASELINE);
        assert!(job.error.is_none());
        assert!(!job.is_claimable(Utc::now()));
        assert!(job.is_claimable(Utc::now() + chrono::Duration::seconds(3)));

        job.claim("w-2", Duration::from_secs(60)).unwrap();
        assert_eq!(job.started_at, first_start);
        assert_eq!(job.locked_by.as_deref(), Some("w-2"));
    }

    #[test]
    fn failure_records_classified_error() {
        let mut job = job();
        job.claim("w-1", Duration::from_secs(60)).unwrap();
        job.fail(transient(), Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_ref().map(|e| e.message.as_str()), Some("timeout"));
        assert!(job.result.is_none());
    }

    #[test]
    fn expired_lease_makes_processing_job_claimable() {
        let mut job = job();
        job.claim("w-1", Duration::ZERO).unwrap();
        assert!(job.is_claimable(Utc::now() + chrono::Duration::milliseconds(1)));

        job.checkpoint(10, Duration::from_secs(60));
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn every_claim_gets_a_fresh_token() {
        let mut job = job();
        assert!(job.claim_token.is_none());

        job.claim("w-1", Duration::ZERO).unwrap();
        let first = job.claim_token;
        job.claim("w-1", Duration::from_secs(60)).unwrap();

        assert!(first.is_some());
        assert_ne!(job.claim_token, first);
        assert_eq!(job.locked_by.as_deref(), Some("w-1"));
    }

    #[test]
    fn reclaiming_an_expired_lease_spends_an_attempt() {
        let mut job = Job::new("paper-1".into(), "owner-1".into(), vec!["providerA".into()], 1);
        job.claim("w-1", Duration::ZERO).unwrap();
        assert_eq!(job.attempts_made, 0);

        job.claim("w-2", Duration::ZERO).unwrap();
        assert_eq!(job.attempts_made, 1);
        assert!(!job.attempts_exhausted());

        job.claim("w-3", Duration::ZERO).unwrap();
        assert_eq!(job.attempts_made, 2);
        assert!(job.attempts_exhausted());
    }

    #[test]
    fn claim_after_scheduled_retry_does_not_double_count() {
        let mut job = job();
        job.claim("w-1", Duration::from_secs(60)).unwrap();
        job.schedule_retry(&transient(), Duration::ZERO, Utc::now()).unwrap();
        job.claim("w-2", Duration::from_secs(60)).unwrap();
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn manual_retry_starts_fresh() {
        let mut job = job();
        job.claim("w-1", Duration::from_secs(60)).unwrap();
        job.attempts_made = 3;
        job.fail(transient(), Utc::now()).unwrap();

        let retry = job.manual_retry();
        assert_ne!(retry.id, job.id);
        assert_eq!(retry.status, JobStatus::Pending);
        assert_eq!(retry.attempts_made, 0);
        assert_eq!(retry.retried_from, Some(job.id));
        assert_eq!(retry.capabilities, job.capabilities);
    }
}
