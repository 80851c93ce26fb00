//! Per-topic operator actions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::app::AdminState;
use crate::app::errors;

const DEFAULT_DEAD_LIMIT: usize = 50;
const MAX_DEAD_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DeadQuery {
    pub limit: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/:topic/dead", get(list_dead))
        .route("/:topic/dead/retry", post(retry_dead))
        .route("/:topic/pause", post(pause))
        .route("/:topic/resume", post(resume))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /topics/:topic/dead?limit=N
pub async fn list_dead(
    Extension(state): Extension<Arc<AdminState>>,
    Path(topic): Path<String>,
    Query(query): Query<DeadQuery>,
) -> Response {
    let topic = match errors::parse_topic(&topic) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LIMIT).min(MAX_DEAD_LIMIT);
    match state.manager.list_dead(&topic, limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /topics/:topic/dead/retry?limit=N
///
/// Requeue dead jobs in bulk; jobs blocked by a dedupe conflict stay dead.
pub async fn retry_dead(
    Extension(state): Extension<Arc<AdminState>>,
    Path(topic): Path<String>,
    Query(query): Query<DeadQuery>,
) -> Response {
    let topic = match errors::parse_topic(&topic) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(MAX_DEAD_LIMIT).min(MAX_DEAD_LIMIT);
    match state.manager.retry_dead_bulk(Some(&topic), limit).await {
        Ok(requeued) => Json(json!({ "topic": topic, "requeued": requeued })).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /topics/:topic/pause
pub async fn pause(Extension(state): Extension<Arc<AdminState>>, Path(topic): Path<String>) -> Response {
    let topic = match errors::parse_topic(&topic) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.manager.pause(&topic).await {
        Ok(()) => {
            info!(topic = %topic, "topic paused");
            Json(json!({ "topic": topic, "paused": true })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /topics/:topic/resume
pub async fn resume(Extension(state): Extension<Arc<AdminState>>, Path(topic): Path<String>) -> Response {
    let topic = match errors::parse_topic(&topic) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.manager.resume(&topic).await {
        Ok(()) => {
            info!(topic = %topic, "topic resumed");
            Json(json!({ "topic": topic, "paused": false })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}
