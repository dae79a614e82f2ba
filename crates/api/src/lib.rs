//! HTTP API: routing and request/response mapping for the analysis job queue.

pub mod app;
