use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use lingoq_core::{JobId, Topic};
use lingoq_infra::QueueError;

pub fn queue_error_to_response(err: QueueError) -> Response {
    match err {
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        QueueError::InvalidState(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
        QueueError::LeaseLost(id) => {
            json_error(StatusCode::CONFLICT, "lease_lost", format!("lease lost for job {id}"))
        }
        QueueError::Unsupported(msg) => json_error(StatusCode::NOT_IMPLEMENTED, "unsupported", msg),
        QueueError::Transient(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", msg),
        QueueError::Backend(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "backend_error", msg),
        QueueError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_topic(raw: &str) -> Result<Topic, Response> {
    Topic::new(raw).map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_topic", e.to_string()))
}

pub fn parse_job_id(raw: &str) -> Result<JobId, Response> {
    raw.parse::<JobId>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("'{raw}' is not a job id")))
}
