//! `paperlab-ai`
//!
//! **Responsibility:** analysis subsystem boundary.
//!
//! - Providers are opaque capabilities: `analyze(paper) -> output | error`.
//! - This crate does not persist anything and knows nothing about jobs.
//! - It fans a paper out to providers and reports what succeeded.

pub mod analyzer;
pub mod provider;
pub mod registry;
pub mod result;

pub use analyzer::{
    AnalysisObserver, AnalysisReport, AnalyzeError, AnalyzerConfig, MultiProviderAnalyzer, NoopObserver,
    ObserverSignal,
};
pub use provider::{AnalysisProvider, Paper, ProviderOutput};
pub use registry::{CapabilityResolver, ProviderFactory, ProviderRegistry};
pub use result::{AnalysisResult, ProviderError, ProviderFailure};
