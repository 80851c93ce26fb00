use axum::{Router, routing::get};

pub mod event_stream;
pub mod jobs;
pub mod system;
pub mod topics;

/// Router for every admin endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(system::stats))
        .route("/stats/:topic", get(system::topic_stats))
        .nest("/jobs", jobs::router())
        .nest("/topics", topics::router())
        .merge(event_stream::router())
}
