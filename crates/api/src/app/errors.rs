use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use paperlab_core::DomainError;
use paperlab_infra::jobs::{JobId, JobStatus, JobStoreError, QueueError};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        e @ QueueError::InvalidState { .. } => json_error(StatusCode::CONFLICT, "invalid_state", e.to_string()),
        QueueError::Store(JobStoreError::Unavailable(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        QueueError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub fn parse_status(s: &str) -> Result<JobStatus, axum::response::Response> {
    s.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: pending, processing, retry-scheduled, completed, failed, cancelled",
        )
    })
}
