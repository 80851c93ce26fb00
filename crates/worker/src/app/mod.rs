//! Admin HTTP surface of the worker process.
//!
//! - `routes/`: handlers, one file per area (jobs, topics, stats, event stream)
//! - `errors.rs`: consistent JSON error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tokio::sync::watch;
use tower::ServiceBuilder;

use lingoq_infra::{QueueManager, StatsAggregator};

pub mod errors;
pub mod routes;

/// Shared state behind every admin route.
#[derive(Clone)]
pub struct AdminState {
    pub manager: QueueManager,
    pub stats: StatsAggregator,
    /// Flips to `true` when the process shuts down; long-lived responses end.
    pub shutdown: watch::Receiver<bool>,
}

impl AdminState {
    pub fn new(manager: QueueManager, stats: StatsAggregator) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            manager,
            stats,
            shutdown,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Build the admin router (used by `runtime` and the tests).
pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(Arc::new(state))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use lingoq_core::{Topic, WorkerId};
    use lingoq_infra::EnqueueOptions;
    use serde_json::{Value as JsonValue, json};
    use std::time::Duration;
    use tower::ServiceExt;

    fn router() -> (Router, QueueManager) {
        let manager = QueueManager::in_memory();
        let stats = StatsAggregator::new(manager.clone());
        (build_router(AdminState::new(manager.clone(), stats)), manager)
    }

    async fn send(router: Router, req: Request<Body>) -> (StatusCode, JsonValue) {
        let res = router.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _) = router();
        let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
    }

    #[tokio::test]
    async fn cancel_then_fetch_job() {
        let (app, qm) = router();
        let topic = Topic::new("emails").unwrap();
        let id = qm.enqueue(&topic, json!({"to": "a"}), EnqueueOptions::default()).await.unwrap();

        let (status, body) = send(app.clone(), post(&format!("/jobs/{id}/cancel"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, body) = send(app, Request::get(format!("/jobs/{id}")).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["payload"]["to"], "a");
    }

    #[tokio::test]
    async fn pause_and_resume_topic() {
        let (app, qm) = router();
        let topic = Topic::new("emails").unwrap();

        let (status, body) = send(app.clone(), post("/topics/emails/pause")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], true);
        assert!(qm.is_paused(&topic).await.unwrap());

        send(app, post("/topics/emails/resume")).await;
        assert!(!qm.is_paused(&topic).await.unwrap());
    }

    #[tokio::test]
    async fn retry_of_pending_job_conflicts() {
        let (app, qm) = router();
        let topic = Topic::new("emails").unwrap();
        let id = qm.enqueue(&topic, json!({}), EnqueueOptions::default()).await.unwrap();

        let (status, body) = send(app, post(&format!("/jobs/{id}/retry"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_state");
    }

    #[tokio::test]
    async fn bulk_retry_requeues_dead_jobs_of_topic() {
        let (app, qm) = router();
        let topic = Topic::new("emails").unwrap();
        let id = qm
            .enqueue(&topic, json!({}), EnqueueOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        let claimed = qm.claim(&topic, &WorkerId::new("w/0")).await.unwrap().unwrap();
        qm.fail(&claimed.job, &claimed.lease, "boom").await.unwrap();

        let (status, body) = send(app.clone(), post("/topics/emails/dead/retry?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requeued"], 1);
        assert_eq!(qm.get(id).await.unwrap().unwrap().attempts, 0);

        let (_, body) = send(app, post("/topics/emails/dead/retry")).await;
        assert_eq!(body["requeued"], 0);
    }

    #[tokio::test]
    async fn stats_snapshot_lists_known_topics() {
        let (app, qm) = router();
        let topic = Topic::new("emails").unwrap();
        qm.enqueue(&topic, json!({}), EnqueueOptions::default()).await.unwrap();

        let (status, body) = send(app, Request::get("/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["topics"]["emails"]["pending"], 1);
        assert_eq!(body["totals"]["pending"], 1);
    }

    #[tokio::test]
    async fn event_stream_is_sse() {
        let (app, _) = router();
        let res = app
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");
    }

    #[tokio::test]
    async fn event_stream_ends_when_shutdown_flips() {
        let qm = QueueManager::in_memory();
        let (stop, stop_rx) = watch::channel(false);
        let state = AdminState::new(qm.clone(), StatsAggregator::new(qm)).with_shutdown(stop_rx);

        let res = build_router(state)
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        stop.send_replace(true);

        let body = tokio::time::timeout(Duration::from_secs(5), axum::body::to_bytes(res.into_body(), usize::MAX)).await;
        assert!(body.is_ok(), "stream still open after shutdown");
    }
}
