//! `paperlab-core` — shared building blocks for the analysis pipeline.
//!
//! This crate contains identifiers and domain errors only (no IO, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OwnerId, ProviderId, SubjectId};
