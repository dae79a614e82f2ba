//! Error classification: retryability and severity.
//!
//! Pure and deterministic; the same error always classifies the same way.

use serde::{Deserialize, Serialize};

use paperlab_ai::{ProviderError, ProviderFailure};

use super::error::PipelineError;

/// Outcome of classifying a failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Human-readable, shown to the owner.
    pub message: String,
    pub retryable: bool,
    /// Escalate to operators instead of retrying into the same outage.
    pub critical: bool,
    pub code: Option<String>,
}

impl ClassifiedError {
    fn new(message: impl Into<String>, retryable: bool, critical: bool, code: &str) -> Self {
        Self {
            message: message.into(),
            retryable,
            critical,
            code: Some(code.to_string()),
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "econnreset",
    "connection reset",
    "connection refused",
    "econnrefused",
    "socket hang up",
    "network",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "temporarily unavailable",
];

const PERMANENT_MARKERS: &[&str] = &[
    "unauthorized",
    "invalid api key",
    "invalid credentials",
    "401",
    "403",
    "forbidden",
    "permission",
    "malformed",
    "bad request",
    "400",
    "not found",
    "404",
];

const CONFIGURATION_HINT: &str = "check the provider API key and settings for your account";

/// Classify a worker-level failure.
pub fn classify(error: &PipelineError) -> ClassifiedError {
    match error {
        PipelineError::Validation(_) => ClassifiedError::new(error.to_string(), false, false, "validation"),
        PipelineError::NotFound(_) => ClassifiedError::new(error.to_string(), false, false, "not_found"),
        PipelineError::TransientProvider { source, .. } => {
            ClassifiedError::new(error.to_string(), source.is_transient(), false, "transient_provider")
        }
        PipelineError::AllProvidersFailed { failures } => classify_all_failed(error, failures),
        PipelineError::Configuration(_) => ClassifiedError::new(
            format!("{error}; {CONFIGURATION_HINT}"),
            false,
            false,
            "configuration",
        ),
        PipelineError::Infrastructure(_) => ClassifiedError::new(error.to_string(), false, true, "infrastructure"),
        PipelineError::AttemptsExhausted { .. } => {
            ClassifiedError::new(error.to_string(), false, true, "attempts_exhausted")
        }
        PipelineError::InvalidState(_) => ClassifiedError::new(error.to_string(), false, true, "invalid_state"),
        PipelineError::Cancelled => ClassifiedError::new(error.to_string(), false, false, "cancelled"),
        PipelineError::LeaseLost => ClassifiedError::new(error.to_string(), false, false, "lease_lost"),
        PipelineError::Other(message) => classify_message(message),
    }
}

/// Classify a single provider failure.
pub fn classify_provider(error: &ProviderError) -> ClassifiedError {
    if error.is_configuration() {
        return ClassifiedError::new(
            format!("{error}; {CONFIGURATION_HINT}"),
            false,
            false,
            "configuration",
        );
    }
    ClassifiedError::new(error.to_string(), error.is_transient(), false, error.code())
}

/// Retryable iff at least one provider failed transiently; retrying a set of
/// credential failures cannot help.
fn classify_all_failed(error: &PipelineError, failures: &[ProviderFailure]) -> ClassifiedError {
    let retryable = failures.iter().any(|f| classify_provider(&f.error).retryable);
    let configuration_only = !failures.is_empty() && failures.iter().all(|f| f.error.is_configuration());

    let message = if configuration_only {
        format!("{error}; {CONFIGURATION_HINT}")
    } else {
        error.to_string()
    };
    ClassifiedError::new(message, retryable, false, "all_providers_failed")
}

/// Phrases match as substrings; numeric status codes only as whole tokens,
/// so "4000ms" is not a 400.
fn has_marker(lower: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| {
        if marker.bytes().all(|b| b.is_ascii_digit()) {
            lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == *marker)
        } else {
            lower.contains(marker)
        }
    })
}

/// Unrecognised failures are presumed transient; `max_attempts` bounds them.
fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    if has_marker(&lower, PERMANENT_MARKERS) {
        return ClassifiedError {
            message: message.to_string(),
            retryable: false,
            critical: false,
            code: None,
        };
    }

    let transient = has_marker(&lower, TRANSIENT_MARKERS);
    ClassifiedError {
        message: message.to_string(),
        retryable: true,
        critical: false,
        code: transient.then(|| "transient".to_string()),
    }
}
