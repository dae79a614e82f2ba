//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: job store, queue manager and worker pool wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and query parameters
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(services))
}
