//! Live lifecycle feed for dashboards and debugging.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::Extension,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::get,
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::app::AdminState;

const HEARTBEAT_EVERY: Duration = Duration::from_secs(15);
const POLL_EVERY: Duration = Duration::from_millis(250);

pub fn router() -> Router {
    Router::new().route("/events", get(stream_events))
}

/// GET /events
///
/// Server-Sent Events stream: one `job` event per lifecycle event, with the
/// serialized `JobLifecycleEvent` as data.
pub async fn stream_events(Extension(state): Extension<Arc<AdminState>>) -> Response {
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();

    // The lifecycle bus is a blocking channel; bridge it on a blocking thread.
    let subscription = state.manager.events();
    let shutdown = state.shutdown.clone();
    tokio::task::spawn_blocking(move || {
        let mut last_sent = Instant::now();
        loop {
            // Ending the stream lets the server's graceful shutdown complete.
            if *shutdown.borrow() {
                break;
            }
            match subscription.recv_timeout(POLL_EVERY) {
                Ok(event) => {
                    let data = match serde_json::to_string(&event) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    if tx.send(Ok(SseEvent::default().event("job").data(data))).is_err() {
                        break;
                    }
                    last_sent = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                    if last_sent.elapsed() > HEARTBEAT_EVERY {
                        if tx.send(Ok(SseEvent::default().event("heartbeat").data("{}"))).is_err() {
                            break;
                        }
                        last_sent = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("event stream closed");
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_EVERY))
        .into_response()
}
