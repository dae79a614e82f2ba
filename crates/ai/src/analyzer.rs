//! Multi-provider fan-out.
//!
//! One task per capability, joined as a set. Provider failures stay inside the
//! analyzer; the caller only learns whether anything succeeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use paperlab_core::ProviderId;

use crate::provider::{AnalysisProvider, Paper};
use crate::result::{AnalysisResult, ProviderError, ProviderFailure};

/// Analyzer tuning.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Independent timeout for every provider call.
    pub provider_timeout: Duration,
    /// Calls per provider within one pass (1 = no in-pass retry).
    pub provider_attempts: u32,
    /// Delay between in-pass retries of a transient provider failure.
    pub provider_retry_delay: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(120),
            provider_attempts: 2,
            provider_retry_delay: Duration::from_millis(250),
        }
    }
}

impl AnalyzerConfig {
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_provider_attempts(mut self, attempts: u32) -> Self {
        self.provider_attempts = attempts.max(1);
        self
    }

    pub fn with_provider_retry_delay(mut self, delay: Duration) -> Self {
        self.provider_retry_delay = delay;
        self
    }

    /// Longest wait between in-pass attempts; a provider's `retry_after` hint is capped here.
    pub fn max_retry_wait(&self) -> Duration {
        self.provider_timeout.max(self.provider_retry_delay)
    }

    /// Worst case for one provider in a pass: every call times out and every
    /// wait in between is as long as allowed.
    pub fn max_pass_duration(&self) -> Duration {
        let attempts = self.provider_attempts.max(1);
        self.provider_timeout
            .saturating_mul(attempts)
            .saturating_add(self.max_retry_wait().saturating_mul(attempts - 1))
    }
}

/// What the observer wants after a provider settles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObserverSignal {
    Continue,
    /// Stop the pass: no further provider calls; in-flight ones finish and are discarded.
    Stop,
}

/// Receives sub-progress from a running pass.
#[async_trait]
pub trait AnalysisObserver: Send + Sync {
    async fn provider_settled(&self, provider: &ProviderId, settled: usize, total: usize) -> ObserverSignal;
}

/// Observer that never stops the pass.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopObserver;

#[async_trait]
impl AnalysisObserver for NoopObserver {
    async fn provider_settled(&self, _provider: &ProviderId, _settled: usize, _total: usize) -> ObserverSignal {
        ObserverSignal::Continue
    }
}

/// Outcome of a pass in which at least one provider succeeded.
///
/// `results.len()` may be smaller than the number of requested providers.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub results: Vec<AnalysisResult>,
    pub failures: Vec<ProviderFailure>,
}

impl AnalysisReport {
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.results.iter().map(|r| r.provider_id.clone()).collect()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Error)]
pub enum AnalyzeError {
    #[error("no capabilities available")]
    NoCapabilities,

    #[error("all providers failed: {}", summarize(.failures))]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    #[error("analysis cancelled")]
    Cancelled,
}

fn summarize(failures: &[ProviderFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Fans one paper out to N provider capabilities concurrently.
#[derive(Debug, Clone, Default)]
pub struct MultiProviderAnalyzer {
    config: AnalyzerConfig,
}

impl MultiProviderAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Run one pass over `providers`.
    ///
    /// Every task is joined before returning, including after a `Stop` signal.
    pub async fn analyze(
        &self,
        paper: Arc<Paper>,
        providers: Vec<Arc<dyn AnalysisProvider>>,
        observer: &dyn AnalysisObserver,
    ) -> Result<AnalysisReport, AnalyzeError> {
        if providers.is_empty() {
            return Err(AnalyzeError::NoCapabilities);
        }

        let total = providers.len();
        let stop = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut task_providers = HashMap::with_capacity(total);

        for provider in providers {
            let provider_id = provider.id().clone();
            let handle = tasks.spawn(run_provider(provider, paper.clone(), self.config.clone(), stop.clone()));
            task_providers.insert(handle.id(), provider_id);
        }

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut settled = 0usize;
        let mut cancelled = false;

        while let Some(joined) = tasks.join_next_with_id().await {
            // A panicking provider surfaces as a join error and counts as a failed call.
            let (task_id, outcome) = match joined {
                Ok((task_id, outcome)) => (task_id, outcome),
                Err(e) => (e.id(), Err((ProviderError::Other(format!("provider task failed: {e}")), 1))),
            };
            let Some(provider_id) = task_providers.remove(&task_id) else {
                warn!(task = %task_id, "analyzer task settled for an unknown provider");
                continue;
            };
            settled += 1;

            match outcome {
                Ok(result) => {
                    debug!(provider = %provider_id, confidence = result.confidence, "provider succeeded");
                    results.push(result);
                }
                Err((error, attempts)) => {
                    warn!(provider = %provider_id, attempts, error = %error, "provider failed");
                    failures.push(ProviderFailure {
                        provider_id: provider_id.clone(),
                        error,
                        attempts,
                    });
                }
            }

            if cancelled {
                continue;
            }
            if observer.provider_settled(&provider_id, settled, total).await == ObserverSignal::Stop {
                debug!(settled, total, "analysis pass stopped by observer");
                cancelled = true;
                stop.store(true, Ordering::Release);
            }
        }

        if cancelled {
            return Err(AnalyzeError::Cancelled);
        }
        if results.is_empty() {
            return Err(AnalyzeError::AllProvidersFailed { failures });
        }

        Ok(AnalysisReport { results, failures })
    }
}

async fn run_provider(
    provider: Arc<dyn AnalysisProvider>,
    paper: Arc<Paper>,
    config: AnalyzerConfig,
    stop: Arc<AtomicBool>,
) -> Result<AnalysisResult, (ProviderError, u32)> {
    let max_attempts = config.provider_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(config.provider_timeout, provider.analyze(&paper)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::Timeout(config.provider_timeout)),
        };

        match outcome {
            Ok(output) => {
                return Ok(AnalysisResult::from_output(
                    provider.id().clone(),
                    output,
                    started.elapsed(),
                ));
            }
            Err(error) if error.is_transient() && attempt < max_attempts && !stop.load(Ordering::Acquire) => {
                debug!(provider = %provider.id(), attempt, error = %error, "retrying transient provider failure");
                let delay = match &error {
                    ProviderError::RateLimited { retry_after: Some(after) } => {
                        (*after).clamp(config.provider_retry_delay, config.max_retry_wait())
                    }
                    _ => config.provider_retry_delay,
                };
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err((error, attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use serde_json::json;

    use super::*;
    use crate::provider::ProviderOutput;

    struct Scripted {
        id: ProviderId,
        delay: Duration,
        calls: AtomicU32,
        fail_first: u32,
        error: Option<ProviderError>,
    }

    impl Scripted {
        fn ok(id: &str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ProviderId::from(id),
                delay: Duration::from_millis(delay_ms),
                calls: AtomicU32::new(0),
                fail_first: 0,
                error: None,
            })
        }

        fn failing(id: &str, error: ProviderError, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                id: ProviderId::from(id),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
                fail_first,
                error: Some(error),
            })
        }
    }

    #[async_trait]
    impl AnalysisProvider for Scripted {
        fn id(&self) -> &ProviderId {
            &self.id
        }

        async fn analyze(&self, _paper: &Paper) -> Result<ProviderOutput, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            match &self.error {
                Some(e) if call <= self.fail_first => Err(e.clone()),
                _ => Ok(ProviderOutput::new(json!({ "call": call }), 0.8)),
            }
        }
    }

    fn paper() -> Arc<Paper> {
        Arc::new(Paper::new("paper-1".into(), "Attention Is All You Need"))
    }

    fn fast_config() -> AnalyzerConfig {
        AnalyzerConfig::default()
            .with_provider_timeout(Duration::from_millis(200))
            .with_provider_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn empty_capability_set_is_rejected() {
        let analyzer = MultiProviderAnalyzer::new(fast_config());
        let err = analyzer.analyze(paper(), vec![], &NoopObserver).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::NoCapabilities));
    }

    #[tokio::test]
    async fn partial_success_keeps_successful_results() {
        let analyzer = MultiProviderAnalyzer::new(fast_config().with_provider_attempts(1));
        let providers: Vec<Arc<dyn AnalysisProvider>> = vec![
            Scripted::ok("a", 5),
            Scripted::failing("b", ProviderError::Unauthorized("bad key".into()), u32::MAX),
            Scripted::failing("c", ProviderError::Network("reset".into()), u32::MAX),
        ];

        let report = analyzer.analyze(paper(), providers, &NoopObserver).await.unwrap();
        assert_eq!(report.provider_ids(), vec![ProviderId::from("a")]);
        assert_eq!(report.failures.len(), 2);
        assert!(report.is_partial());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_a_pass() {
        let analyzer = MultiProviderAnalyzer::new(fast_config().with_provider_attempts(2));
        let flaky = Scripted::failing("flaky", ProviderError::Network("reset".into()), 1);

        let report = analyzer
            .analyze(paper(), vec![flaky.clone() as Arc<dyn AnalysisProvider>], &NoopObserver)
            .await
            .unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let analyzer = MultiProviderAnalyzer::new(fast_config().with_provider_attempts(3));
        let broken = Scripted::failing("broken", ProviderError::Configuration("no model".into()), u32::MAX);

        let err = analyzer
            .analyze(paper(), vec![broken.clone() as Arc<dyn AnalysisProvider>], &NoopObserver)
            .await
            .unwrap_err();
        match err {
            AnalyzeError::AllProvidersFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out_without_failing_others() {
        let analyzer = MultiProviderAnalyzer::new(
            fast_config()
                .with_provider_timeout(Duration::from_millis(20))
                .with_provider_attempts(1),
        );
        let providers: Vec<Arc<dyn AnalysisProvider>> = vec![Scripted::ok("fast", 1), Scripted::ok("slow", 500)];

        let report = analyzer.analyze(paper(), providers, &NoopObserver).await.unwrap();
        assert_eq!(report.provider_ids(), vec![ProviderId::from("fast")]);
        assert!(matches!(report.failures[0].error, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn rate_limit_hint_is_capped_by_the_retry_wait() {
        let config = fast_config()
            .with_provider_timeout(Duration::from_millis(50))
            .with_provider_attempts(2);
        assert_eq!(config.max_retry_wait(), Duration::from_millis(50));
        let analyzer = MultiProviderAnalyzer::new(config);
        let limited = Scripted::failing(
            "limited",
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
            1,
        );

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            analyzer.analyze(paper(), vec![limited.clone() as Arc<dyn AnalysisProvider>], &NoopObserver),
        )
        .await
        .expect("retry_after hint was not capped")
        .unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(limited.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn worst_case_pass_covers_every_call_and_wait() {
        let config = AnalyzerConfig::default()
            .with_provider_timeout(Duration::from_millis(150))
            .with_provider_attempts(3)
            .with_provider_retry_delay(Duration::from_millis(10));
        // Three timed-out calls plus two capped waits.
        assert_eq!(config.max_pass_duration(), Duration::from_millis(750));

        let single = config.with_provider_attempts(1);
        assert_eq!(single.max_pass_duration(), Duration::from_millis(150));
    }

    struct Exploding(ProviderId);

    #[async_trait]
    impl AnalysisProvider for Exploding {
        fn id(&self) -> &ProviderId {
            &self.0
        }

        async fn analyze(&self, _paper: &Paper) -> Result<ProviderOutput, ProviderError> {
            panic!("provider exploded")
        }
    }

    struct Counting(std::sync::Mutex<Vec<(usize, usize)>>);

    #[async_trait]
    impl AnalysisObserver for Counting {
        async fn provider_settled(&self, _provider: &ProviderId, settled: usize, total: usize) -> ObserverSignal {
            self.0.lock().unwrap().push((settled, total));
            ObserverSignal::Continue
        }
    }

    #[tokio::test]
    async fn panicking_provider_is_reported_as_a_failure() {
        let analyzer = MultiProviderAnalyzer::new(fast_config());
        let providers: Vec<Arc<dyn AnalysisProvider>> =
            vec![Arc::new(Exploding(ProviderId::from("boom"))), Scripted::ok("ok", 5)];
        let observer = Counting(std::sync::Mutex::new(Vec::new()));

        let report = analyzer.analyze(paper(), providers, &observer).await.unwrap();
        assert_eq!(report.provider_ids(), vec![ProviderId::from("ok")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].provider_id, ProviderId::from("boom"));
        assert!(matches!(report.failures[0].error, ProviderError::Other(_)));

        let seen = observer.0.lock().unwrap().clone();
        assert_eq!(seen.last(), Some(&(2, 2)));
    }

    struct StopAfterFirst;

    #[async_trait]
    impl AnalysisObserver for StopAfterFirst {
        async fn provider_settled(&self, _provider: &ProviderId, _settled: usize, _total: usize) -> ObserverSignal {
            ObserverSignal::Stop
        }
    }

    #[tokio::test]
    async fn stop_signal_discards_results_and_joins_in_flight_calls() {
        let analyzer = MultiProviderAnalyzer::new(fast_config());
        let slow = Scripted::ok("slow", 30);
        let providers: Vec<Arc<dyn AnalysisProvider>> = vec![Scripted::ok("fast", 1), slow.clone()];

        let err = analyzer.analyze(paper(), providers, &StopAfterFirst).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Cancelled));
        // The in-flight call was allowed to run to completion before returning.
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }
}
