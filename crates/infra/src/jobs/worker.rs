//! Worker pool: claims jobs and drives them through the per-job state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use paperlab_ai::{
    AnalysisObserver, AnalysisProvider, AnalysisReport, CapabilityResolver, MultiProviderAnalyzer, ObserverSignal,
};
use paperlab_core::ProviderId;

use crate::config::PipelineConfig;

use super::classifier::{ClassifiedError, classify};
use super::collaborators::{
    OperatorAlert, Outcome, OutcomeKind, OutcomeNotifier, SubjectReader, TracingOperatorAlert,
};
use super::error::PipelineError;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId};

/// Progress milestones persisted while a job is processed.
mod milestone {
    pub const CLAIMED: u8 = 10;
    pub const VALIDATED: u8 = 20;
    pub const RESOLVED: u8 = 30;
    pub const ANALYZING: u8 = 40;
    /// Span of progress shared out across settling providers.
    pub const ANALYSIS_SPAN: u8 = 50;
    pub const PERSISTING: u8 = 95;
}

/// Collaborators a worker pool needs.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub resolver: Arc<dyn CapabilityResolver>,
    pub subjects: Arc<dyn SubjectReader>,
    pub notifier: Arc<dyn OutcomeNotifier>,
    pub alert: Arc<dyn OperatorAlert>,
}

impl WorkerDeps {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn CapabilityResolver>,
        subjects: Arc<dyn SubjectReader>,
        notifier: Arc<dyn OutcomeNotifier>,
    ) -> Self {
        Self {
            store,
            resolver,
            subjects,
            notifier,
            alert: Arc::new(TracingOperatorAlert),
        }
    }

    pub fn with_alert(mut self, alert: Arc<dyn OperatorAlert>) -> Self {
        self.alert = alert;
        self
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerPoolStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    running: AtomicUsize,
}

impl StatsCounters {
    fn record(&self, outcome: JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Completed => &self.completed,
            JobOutcome::Failed => &self.failed,
            JobOutcome::Retried => &self.retried,
            JobOutcome::Cancelled => &self.cancelled,
            JobOutcome::Abandoned => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_completed: self.completed.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_cancelled: self.cancelled.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// How one processing attempt ended, from the worker's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    Retried,
    /// Cancel observed, or the record was already terminal.
    Cancelled,
    /// Claim lost or the terminal write failed; the lease will expire and
    /// another worker picks the job up.
    Abandoned,
}

struct WorkerContext {
    config: PipelineConfig,
    deps: WorkerDeps,
    analyzer: MultiProviderAnalyzer,
    shutdown: Notify,
    closed: AtomicBool,
    stats: StatsCounters,
}

/// Fixed-size pool of `C` workers sharing one job store.
///
/// Explicitly constructed with [`WorkerPool::spawn`] and torn down with
/// [`WorkerPool::close`], which drains in-flight jobs.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.concurrency` workers on the current tokio runtime.
    pub fn spawn(config: PipelineConfig, deps: WorkerDeps) -> Self {
        let ctx = Arc::new(WorkerContext {
            analyzer: MultiProviderAnalyzer::new(config.analyzer.clone()),
            config,
            deps,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        });

        if !ctx.config.lease_covers_analysis() {
            warn!(
                pool = %ctx.config.name,
                lease_ms = ctx.config.lease_duration.as_millis() as u64,
                pass_ms = ctx.config.analyzer.max_pass_duration().as_millis() as u64,
                "lease shorter than a worst-case analysis pass, jobs may be reclaimed while running"
            );
        }

        let concurrency = ctx.config.concurrency.max(1);
        let workers = (0..concurrency)
            .map(|index| {
                let worker_id = format!("{}-{}", ctx.config.name, index);
                tokio::spawn(worker_loop(ctx.clone(), worker_id))
            })
            .collect();

        info!(pool = %ctx.config.name, concurrency, "worker pool started");
        Self {
            ctx,
            workers: Mutex::new(workers),
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        self.ctx.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.closed.load(Ordering::Acquire)
    }

    /// True iff the job store is reachable and the pool has not been closed.
    pub async fn is_healthy(&self) -> bool {
        !self.is_closed() && self.ctx.deps.store.ping().await.is_ok()
    }

    /// Stop claiming, let in-flight jobs finish, and join every worker.
    pub async fn close(&self) {
        self.ctx.closed.store(true, Ordering::Release);
        self.ctx.shutdown.notify_waiters();

        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(pool = %self.ctx.config.name, error = %e, "worker task ended abnormally");
            }
        }
        info!(pool = %self.ctx.config.name, "worker pool closed");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.ctx.closed.store(true, Ordering::Release);
        self.ctx.shutdown.notify_waiters();
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: String) {
    debug!(worker = %worker_id, "worker started");

    while !ctx.closed.load(Ordering::Acquire) {
        match ctx.deps.store.claim_next(&worker_id, ctx.config.lease_duration).await {
            Ok(Some(job)) => {
                debug!(worker = %worker_id, job_id = %job.id, attempt = job.attempts_made, "claimed job");
                ctx.stats.running.fetch_add(1, Ordering::Relaxed);
                let outcome = supervise_job(&ctx, &worker_id, job).await;
                ctx.stats.running.fetch_sub(1, Ordering::Relaxed);
                ctx.stats.record(outcome);
            }
            Ok(None) => ctx.idle().await,
            Err(e) => {
                error!(worker = %worker_id, error = %e, "failed to claim job");
                ctx.idle().await;
            }
        }
    }

    debug!(worker = %worker_id, "worker stopped");
}

/// Run one job in its own task so a panic cannot take the worker down with it.
async fn supervise_job(ctx: &Arc<WorkerContext>, worker_id: &str, job: Job) -> JobOutcome {
    let job_id = job.id;
    let claim = job.claim_token;
    let started = Utc::now();
    let handle = tokio::spawn(process_job(ctx.clone(), job, started));

    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(worker = %worker_id, job_id = %job_id, error = %e, "job task panicked");
            ctx.recover_panicked(job_id, claim, started, e.to_string()).await
        }
    }
}

async fn process_job(ctx: Arc<WorkerContext>, mut job: Job, started: DateTime<Utc>) -> JobOutcome {
    match ctx.run_attempt(&mut job).await {
        Ok(report) => ctx.finish_success(job, report, started).await,
        Err(error) => ctx.finish_failure(job, error, started).await,
    }
}

impl WorkerContext {
    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.notified() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Persist progress and renew the lease.
    ///
    /// A record cancelled under us surfaces as `PipelineError::Cancelled`.
    async fn checkpoint(&self, job: &mut Job, percent: u8) -> Result<(), PipelineError> {
        job.checkpoint(percent, self.config.lease_duration);
        self.deps.store.update(job).await?;
        debug!(job_id = %job.id, progress = job.progress_percent, "checkpoint");
        Ok(())
    }

    async fn run_attempt(&self, job: &mut Job) -> Result<AnalysisReport, PipelineError> {
        self.checkpoint(job, milestone::CLAIMED).await?;

        if job.attempts_exhausted() {
            return Err(PipelineError::AttemptsExhausted {
                attempts: job.attempts_made,
            });
        }

        if job.capabilities.is_empty() {
            return Err(PipelineError::Validation("job has no capabilities".to_string()));
        }
        let paper = self.deps.subjects.get_subject(&job.subject_id).await?;
        self.checkpoint(job, milestone::VALIDATED).await?;

        let providers = self.resolve_providers(job).await;
        if providers.is_empty() {
            return Err(PipelineError::Configuration("no capabilities available".to_string()));
        }
        self.checkpoint(job, milestone::RESOLVED).await?;
        self.checkpoint(job, milestone::ANALYZING).await?;

        let observer = CheckpointObserver {
            ctx: self,
            job: tokio::sync::Mutex::new(job.clone()),
            stopped: Mutex::new(None),
        };
        let analyzed = self.analyzer.analyze(Arc::new(paper), providers, &observer).await;

        let CheckpointObserver { job: observed, stopped, .. } = observer;
        *job = observed.into_inner();
        if let Some(reason) = stopped.into_inner().ok().flatten() {
            return Err(reason);
        }
        let report = analyzed?;

        self.checkpoint(job, milestone::PERSISTING).await?;
        Ok(report)
    }

    /// Capabilities that resolve for the owner, in request order.
    async fn resolve_providers(&self, job: &Job) -> Vec<Arc<dyn AnalysisProvider>> {
        let mut providers = Vec::with_capacity(job.capabilities.len());
        for capability in &job.capabilities {
            match self.deps.resolver.resolve(&job.owner_id, capability).await {
                Some(provider) => providers.push(provider),
                None => debug!(
                    job_id = %job.id,
                    provider = %capability,
                    "capability unavailable for owner, skipping"
                ),
            }
        }
        providers
    }

    async fn finish_success(&self, mut job: Job, report: AnalysisReport, started: DateTime<Utc>) -> JobOutcome {
        let failed: Vec<&ProviderId> = report.failures.iter().map(|f| &f.provider_id).collect();
        let payload = json!({
            "job_id": job.id,
            "subject_id": job.subject_id,
            "providers": report.provider_ids(),
            "failed_providers": failed,
            "result_count": report.results.len(),
        });

        if report.is_partial() {
            info!(
                job_id = %job.id,
                succeeded = report.results.len(),
                failed = report.failures.len(),
                "partial analysis"
            );
        }

        if let Err(e) = job.complete(report.results, started) {
            return self.finish_failure(job, e.into(), started).await;
        }
        if let Err(outcome) = self.persist_terminal(&job).await {
            return outcome;
        }

        info!(job_id = %job.id, "job completed");
        self.notify(&job, OutcomeKind::Success, payload).await;
        JobOutcome::Completed
    }

    async fn finish_failure(&self, mut job: Job, error: PipelineError, started: DateTime<Utc>) -> JobOutcome {
        match error {
            PipelineError::Cancelled => {
                info!(job_id = %job.id, "cancellation observed, stopping");
                return JobOutcome::Cancelled;
            }
            PipelineError::LeaseLost => {
                warn!(job_id = %job.id, "lease lost, another worker owns the job");
                return JobOutcome::Abandoned;
            }
            _ => {}
        }

        let classified = classify(&error);

        if classified.retryable && job.can_retry() {
            let delay = self.config.retry.delay_for_attempt(job.attempts_made);
            if let Err(e) = job.schedule_retry(&classified, delay, started) {
                error!(job_id = %job.id, error = %e, "cannot schedule retry");
                return JobOutcome::Abandoned;
            }
            return match self.persist_terminal(&job).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        attempts_made = job.attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %classified.message,
                        "job retry scheduled"
                    );
                    JobOutcome::Retried
                }
                Err(outcome) => outcome,
            };
        }

        if let Err(e) = job.fail(classified.clone(), started) {
            error!(job_id = %job.id, error = %e, "cannot mark job failed");
            return JobOutcome::Abandoned;
        }

        if classified.critical {
            self.deps.alert.alert(&job, &classified);
        }
        if let Err(outcome) = self.persist_terminal(&job).await {
            return outcome;
        }

        warn!(
            job_id = %job.id,
            attempts_made = job.attempts_made,
            retryable = classified.retryable,
            error = %classified.message,
            "job failed"
        );
        let payload = failure_payload(&job, &classified);
        self.notify(&job, OutcomeKind::Failure, payload).await;
        JobOutcome::Failed
    }

    /// Write a state transition that releases the claim.
    ///
    /// Returns the outcome to report when the write did not land; the caller
    /// must not notify in that case.
    async fn persist_terminal(&self, job: &Job) -> Result<(), JobOutcome> {
        match self.deps.store.update(job).await {
            Ok(()) => Ok(()),
            Err(JobStoreError::AlreadyTerminal(_)) => {
                info!(job_id = %job.id, "job already terminal, discarding attempt");
                Err(JobOutcome::Cancelled)
            }
            Err(JobStoreError::LeaseLost(_)) => {
                warn!(job_id = %job.id, "lease lost before final write, discarding attempt");
                Err(JobOutcome::Abandoned)
            }
            Err(e) => {
                error!(job_id = %job.id, status = %job.status, error = %e, "failed to persist job state");
                Err(JobOutcome::Abandoned)
            }
        }
    }

    async fn notify(&self, job: &Job, kind: OutcomeKind, payload: serde_json::Value) {
        let outcome = Outcome {
            kind,
            job_id: job.id,
            payload,
        };
        if let Err(e) = self.deps.notifier.notify(&job.owner_id, outcome).await {
            warn!(job_id = %job.id, owner = %job.owner_id, error = %e, "outcome notification failed");
        }
    }

    /// Route a panicked attempt through the normal failure path, provided the
    /// record is still held by the same claim.
    async fn recover_panicked(
        &self,
        job_id: JobId,
        claim: Option<Uuid>,
        started: DateTime<Utc>,
        panic: String,
    ) -> JobOutcome {
        let job = match self.deps.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return JobOutcome::Abandoned,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "cannot load job after panic");
                return JobOutcome::Abandoned;
            }
        };
        if job.status.is_terminal() || job.claim_token != claim {
            return JobOutcome::Abandoned;
        }
        self.finish_failure(job, PipelineError::Other(format!("job task panicked: {panic}")), started)
            .await
    }
}

fn failure_payload(job: &Job, error: &ClassifiedError) -> serde_json::Value {
    json!({
        "job_id": job.id,
        "subject_id": job.subject_id,
        "message": error.message,
        "code": error.code,
        "retryable": error.retryable,
        "attempts_made": job.attempts_made,
    })
}

/// Turns analyzer sub-progress into persisted checkpoints; stops the pass once
/// a checkpoint is rejected.
struct CheckpointObserver<'a> {
    ctx: &'a WorkerContext,
    job: tokio::sync::Mutex<Job>,
    stopped: Mutex<Option<PipelineError>>,
}

#[async_trait]
impl<'a> AnalysisObserver for CheckpointObserver<'a> {
    async fn provider_settled(&self, provider: &ProviderId, settled: usize, total: usize) -> ObserverSignal {
        let share = (usize::from(milestone::ANALYSIS_SPAN) * settled / total.max(1)) as u8;
        let mut job = self.job.lock().await;

        match self.ctx.checkpoint(&mut job, milestone::ANALYZING + share).await {
            Ok(()) => ObserverSignal::Continue,
            Err(e) => {
                debug!(job_id = %job.id, provider = %provider, error = %e, "stopping analysis pass");
                if let Ok(mut slot) = self.stopped.lock() {
                    slot.get_or_insert(e);
                }
                ObserverSignal::Stop
            }
        }
    }
}
