use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use paperlab_core::ProviderId;

use crate::provider::ProviderOutput;

/// Result of one provider's analysis of one paper.
///
/// Immutable once produced; jobs store a list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub provider_id: ProviderId,

    /// Structured findings (provider-specific shape).
    pub findings: JsonValue,

    /// Confidence in \[0, 1\].
    pub confidence: f64,

    pub summary: Option<String>,

    /// Wall time of the successful provider call.
    pub duration_ms: u64,

    pub completed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn from_output(provider_id: ProviderId, output: ProviderOutput, duration: Duration) -> Self {
        let confidence = if output.confidence.is_nan() {
            0.0
        } else {
            output.confidence.clamp(0.0, 1.0)
        };

        Self {
            provider_id,
            findings: output.findings,
            confidence,
            summary: output.summary,
            duration_ms: duration.as_millis().min(u64::MAX as u128) as u64,
            completed_at: Utc::now(),
        }
    }
}

/// Failure raised by a single provider call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid credentials: {0}")]
    Unauthorized(String),

    #[error("missing or invalid provider configuration: {0}")]
    Configuration(String),

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Timeouts, network faults, rate limits and upstream 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Network(_) | ProviderError::RateLimited { .. } => true,
            ProviderError::Upstream { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// Credential or configuration problems the owner has to fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProviderError::Unauthorized(_) | ProviderError::Configuration(_)
        ) || matches!(self, ProviderError::Upstream { status, .. } if *status == 401 || *status == 403)
    }

    /// Stable short code for payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Network(_) => "network",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Upstream { .. } => "upstream",
            ProviderError::Unauthorized(_) => "unauthorized",
            ProviderError::Configuration(_) => "configuration",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::NotFound(_) => "not_found",
            ProviderError::Other(_) => "provider_error",
        }
    }
}

/// A provider that did not produce a result in one analyzer pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider_id: ProviderId,
    pub error: ProviderError,
    /// Calls made in this pass (including in-pass retries).
    pub attempts: u32,
}

impl core::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.provider_id, self.error)
    }
}
