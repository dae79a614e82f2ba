//! Infrastructure layer: job records, queue, workers, config.

pub mod config;
pub mod jobs;

pub use config::PipelineConfig;
