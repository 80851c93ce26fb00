use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::app::AdminState;
use crate::app::errors;

pub async fn health(Extension(state): Extension<Arc<AdminState>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "backend": state.manager.backend_kind().as_str(),
        })),
    )
        .into_response()
}

/// GET /stats
pub async fn stats(Extension(state): Extension<Arc<AdminState>>) -> Response {
    match state.stats.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /stats/:topic
pub async fn topic_stats(Extension(state): Extension<Arc<AdminState>>, Path(topic): Path<String>) -> Response {
    let topic = match errors::parse_topic(&topic) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.stats.topic(&topic).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
