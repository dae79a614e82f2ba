use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use paperlab_core::{ProviderId, SubjectId};

use crate::result::ProviderError;

/// Snapshot of the paper handed to providers.
///
/// Owned by the external paper store; the pipeline only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: SubjectId,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub content: Option<String>,
}

impl Paper {
    pub fn new(id: SubjectId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            authors: Vec::new(),
            abstract_text: String::new(),
            content: None,
        }
    }

    pub fn with_authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = abstract_text.into();
        self
    }
}

/// What a provider returns for one paper, before the analyzer stamps
/// provider id, duration and completion time onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Structured findings (provider-specific shape).
    pub findings: JsonValue,

    /// Confidence in \[0, 1\]; clamped when turned into an `AnalysisResult`.
    pub confidence: f64,

    /// Optional human-readable summary.
    pub summary: Option<String>,
}

impl ProviderOutput {
    pub fn new(findings: JsonValue, confidence: f64) -> Self {
        Self {
            findings,
            confidence,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A provider-specific analysis capability.
///
/// Each capability is constructed independently (per owner, with that owner's
/// credentials) and may fail independently of the others.
#[async_trait]
pub trait AnalysisProvider: Send + Sync + 'static {
    fn id(&self) -> &ProviderId;

    /// Analyze one paper. Must not retry internally; the analyzer owns retries.
    async fn analyze(&self, paper: &Paper) -> Result<ProviderOutput, ProviderError>;
}
