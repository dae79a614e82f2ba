//! Configuration loading and representation.

use std::time::Duration;

use tracing::warn;

use paperlab_ai::AnalyzerConfig;

use crate::jobs::RetryPolicy;

/// Pipeline configuration: worker pool, retry policy and analyzer tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name for logging; worker ids are `{name}-{index}`
    pub name: String,
    /// Concurrent workers (`C`)
    pub concurrency: usize,
    /// Whole-job retry policy; `max_attempts` is stamped onto new jobs
    pub retry: RetryPolicy,
    pub analyzer: AnalyzerConfig,
    /// How long an idle worker waits before polling for work again
    pub poll_interval: Duration,
    /// How long a claim stays valid without a checkpoint; must outlast
    /// `analyzer.max_pass_duration()`
    pub lease_duration: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "analysis-worker".to_string(),
            concurrency: 4,
            retry: RetryPolicy::default(),
            analyzer: AnalyzerConfig::default(),
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(600),
        }
    }
}

impl PipelineConfig {
    /// Load from `PAPERLAB_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, file, test map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read_u64 = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(key, value = %raw, error = %e, "ignoring unparsable config value");
                    None
                }
            }
        };
        let millis = |key: &str, default: Duration| read_u64(key).map(Duration::from_millis).unwrap_or(default);

        let analyzer = AnalyzerConfig {
            provider_timeout: millis("PAPERLAB_PROVIDER_TIMEOUT_MS", defaults.analyzer.provider_timeout),
            provider_attempts: read_u64("PAPERLAB_PROVIDER_ATTEMPTS")
                .map(|v| v.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.analyzer.provider_attempts),
            provider_retry_delay: millis(
                "PAPERLAB_PROVIDER_RETRY_DELAY_MS",
                defaults.analyzer.provider_retry_delay,
            ),
        };

        let retry = RetryPolicy {
            max_attempts: read_u64("PAPERLAB_MAX_ATTEMPTS")
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: millis("PAPERLAB_BACKOFF_BASE_MS", defaults.retry.base_delay),
            max_delay: millis("PAPERLAB_BACKOFF_CAP_MS", defaults.retry.max_delay),
            jitter: defaults.retry.jitter,
        };

        let config = Self {
            name: lookup("PAPERLAB_WORKER_NAME").unwrap_or(defaults.name),
            concurrency: read_u64("PAPERLAB_CONCURRENCY")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.concurrency),
            retry,
            analyzer,
            poll_interval: millis("PAPERLAB_POLL_INTERVAL_MS", defaults.poll_interval),
            lease_duration: millis("PAPERLAB_LEASE_MS", defaults.lease_duration),
        };

        if !config.lease_covers_analysis() {
            warn!(
                lease_ms = config.lease_duration.as_millis() as u64,
                pass_ms = config.analyzer.max_pass_duration().as_millis() as u64,
                "PAPERLAB_LEASE_MS does not cover a worst-case analysis pass"
            );
        }
        config
    }

    /// Whether a claim survives the longest possible analyzer pass without a checkpoint.
    pub fn lease_covers_analysis(&self) -> bool {
        self.lease_duration > self.analyzer.max_pass_duration()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_analyzer(mut self, analyzer: AnalyzerConfig) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }
}
