use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use paperlab_core::OwnerId;

use crate::app::dto::StatsQuery;
use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    if services.is_healthy().await {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        )
            .into_response()
    }
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<StatsQuery>,
) -> axum::response::Response {
    let owner = match query.owner_id.map(OwnerId::parse).transpose() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let jobs = match services.manager.stats(owner.as_ref()).await {
        Ok(s) => s,
        Err(e) => return errors::queue_error_to_response(e),
    };

    Json(serde_json::json!({
        "jobs": jobs,
        "workers": services.pool.as_ref().map(|p| p.stats()),
    }))
    .into_response()
}
