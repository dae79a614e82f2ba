use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

/// Router for the job queue endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(system::stats))
        .nest("/jobs", jobs::router())
}
