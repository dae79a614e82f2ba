use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use paperlab_core::{OwnerId, ProviderId, SubjectId};

use crate::app::dto::{self, EnqueueJobRequest, ListJobsQuery};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<EnqueueJobRequest>,
) -> axum::response::Response {
    let subject_id = match SubjectId::parse(body.subject_id) {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let owner_id = match OwnerId::parse(body.owner_id) {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let capabilities: Vec<ProviderId> = match body.capabilities.into_iter().map(ProviderId::parse).collect() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.manager.enqueue(subject_id, owner_id, capabilities).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": id.to_string(),
                "status": "pending",
            })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.manager.get_status(job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.manager.cancel(job_id).await {
        Ok(cancelled) => Json(serde_json::json!({
            "id": job_id.to_string(),
            "cancelled": cancelled,
        }))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.manager.retry(job_id).await {
        Ok(new_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": new_id.to_string(),
                "retried_from": job_id.to_string(),
            })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let owner = match query.owner_id.map(OwnerId::parse).transpose() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let status = match query.status.as_deref().map(errors::parse_status).transpose() {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = query
        .limit
        .unwrap_or(dto::DEFAULT_LIST_LIMIT)
        .clamp(1, dto::MAX_LIST_LIMIT);

    match services.manager.list(owner.as_ref(), status, limit).await {
        Ok(jobs) => Json(serde_json::json!({
            "count": jobs.len(),
            "jobs": jobs,
        }))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
