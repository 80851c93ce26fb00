//! Handler seam between the worker runtime and job-type code.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use lingoq_core::{JobId, Topic, WorkerId};
use lingoq_events::{EventBus, InMemoryEventBus, JobLifecycleEvent, LifecycleKind};
use lingoq_translation::ProgressSink;

/// Error returned by a job handler.
///
/// Any error type converts into it with `?`; the message is what gets
/// recorded on the job.
pub struct HandlerError(anyhow::Error);

impl HandlerError {
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::msg(message))
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self(anyhow::Error::new(err))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{:#}` keeps the whole context chain on one line.
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Publishes handler progress as `Progress` lifecycle events.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    topic: Topic,
    attempt: u32,
    worker: WorkerId,
    events: Arc<InMemoryEventBus<JobLifecycleEvent>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl ProgressSink for ProgressReporter {
    fn report(&self, step: &str, percent: u8) {
        let event = JobLifecycleEvent::new(
            self.job_id,
            self.topic.clone(),
            self.attempt,
            LifecycleKind::Progress {
                step: step.to_string(),
                percent: percent.min(100),
            },
        )
        .with_worker(self.worker.clone());

        if let Err(err) = self.events.publish(event) {
            debug!(job_id = %self.job_id, error = ?err, "dropped progress event");
        }
    }
}

/// What a handler knows about the execution it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub topic: Topic,
    /// 1-based execution number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Consumer slot running the job.
    pub worker: WorkerId,
    pub progress: ProgressReporter,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        topic: Topic,
        attempt: u32,
        max_attempts: u32,
        worker: WorkerId,
        events: Arc<InMemoryEventBus<JobLifecycleEvent>>,
    ) -> Self {
        let progress = ProgressReporter {
            job_id,
            topic: topic.clone(),
            attempt,
            worker: worker.clone(),
            events,
        };
        Self {
            job_id,
            topic,
            attempt,
            max_attempts,
            worker,
            progress,
        }
    }

    /// `true` when a failure of this execution exhausts the job.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job handler.
///
/// Delivery is at-least-once: a handler may see the same payload again after
/// a crash or lease expiry, so its side effects must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: JsonValue, ctx: JobContext) -> Result<JsonValue, HandlerError>;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, payload: JsonValue, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        (**self).handle(payload, ctx).await
    }
}

/// Closure-backed handler; see [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JsonValue, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: JsonValue, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        (self.0)(payload, ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JsonValue, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
