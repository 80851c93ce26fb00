//! Single-job inspection and operator actions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::info;

use crate::app::AdminState;
use crate::app::errors;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_job))
        .route("/:id/retry", post(retry_job))
        .route("/:id/cancel", post(cancel_job))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /jobs/:id
///
/// Status, attempts, result or last error and timestamps of one job.
pub async fn get_job(Extension(state): Extension<Arc<AdminState>>, Path(id): Path<String>) -> Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.get(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /jobs/:id/retry
///
/// Replay a dead job with a fresh attempt budget.
pub async fn retry_job(Extension(state): Extension<Arc<AdminState>>, Path(id): Path<String>) -> Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.retry_dead(job_id).await {
        Ok(()) => {
            info!(job_id = %job_id, "dead job requeued by operator");
            (StatusCode::ACCEPTED, Json(json!({ "id": job_id, "status": "pending" }))).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /jobs/:id/cancel
///
/// Only pending jobs can be cancelled; anything else is a conflict.
pub async fn cancel_job(Extension(state): Extension<Arc<AdminState>>, Path(id): Path<String>) -> Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.cancel(job_id).await {
        Ok(true) => Json(json!({ "id": job_id, "status": "cancelled" })).into_response(),
        Ok(false) => errors::json_error(
            StatusCode::CONFLICT,
            "invalid_state",
            format!("job {job_id} is not pending"),
        ),
        Err(e) => errors::queue_error_to_response(e),
    }
}
