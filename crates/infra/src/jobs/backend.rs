//! The queue backend contract shared by every engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use lingoq_core::{DomainError, JobId, Topic, WorkerId};

use super::types::{ClaimedJob, FailureDisposition, Job, Lease, NewJob, QueueStats, ReclaimedJob};
use crate::config::BackendKind;

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Malformed payload/options or bad topic. Terminal, never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Connection-level failure; safe to retry the call.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The caller's lease was reclaimed or already acknowledged.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Queue backend.
///
/// Implementations own all job state. Callers never mutate jobs except
/// through these operations, and every acknowledgement must present the
/// lease obtained from `claim`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert a job, or return the id of the active job holding the same
    /// dedupe key on the same topic.
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId>;

    /// Atomically lease the next eligible job of `topic`.
    ///
    /// Returns `None` when the topic is paused or nothing is due. Two
    /// concurrent claims never return the same job.
    async fn claim(&self, topic: &Topic, owner: &WorkerId, lease_for: Duration) -> QueueResult<Option<ClaimedJob>>;

    /// Extend a held lease.
    async fn renew(&self, lease: &Lease, lease_for: Duration) -> QueueResult<Lease>;

    /// Handler success: `completed`, `attempts += 1`, result stored.
    async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()>;

    /// Handler failure: `attempts += 1`, then apply `disposition`.
    async fn fail(&self, lease: &Lease, error: &str, disposition: FailureDisposition) -> QueueResult<()>;

    /// Return every job with an expired lease to `pending`, `attempts`
    /// untouched.
    async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>>;

    async fn pause(&self, topic: &Topic) -> QueueResult<()>;

    async fn resume(&self, topic: &Topic) -> QueueResult<()>;

    async fn is_paused(&self, topic: &Topic) -> QueueResult<bool>;

    async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats>;

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>>;

    /// Cancel a pending job. `false` if it is no longer pending.
    async fn cancel(&self, job_id: JobId) -> QueueResult<bool>;

    /// Dead jobs of `topic`, most recently failed first.
    async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>>;

    /// Operator replay: dead → pending with a fresh retry budget.
    async fn retry_dead(&self, job_id: JobId) -> QueueResult<()>;

    /// Delete terminal jobs last updated before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64>;

    /// Topics that have ever held a job or a pause flag.
    async fn topics(&self) -> QueueResult<Vec<Topic>>;

    /// Release connections. Idempotent.
    async fn close(&self) -> QueueResult<()>;
}

#[async_trait]
impl<B> QueueBackend for Arc<B>
where
    B: QueueBackend + ?Sized,
{
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        (**self).enqueue(job).await
    }

    async fn claim(&self, topic: &Topic, owner: &WorkerId, lease_for: Duration) -> QueueResult<Option<ClaimedJob>> {
        (**self).claim(topic, owner, lease_for).await
    }

    async fn renew(&self, lease: &Lease, lease_for: Duration) -> QueueResult<Lease> {
        (**self).renew(lease, lease_for).await
    }

    async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()> {
        (**self).complete(lease, result).await
    }

    async fn fail(&self, lease: &Lease, error: &str, disposition: FailureDisposition) -> QueueResult<()> {
        (**self).fail(lease, error, disposition).await
    }

    async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>> {
        (**self).reclaim_expired().await
    }

    async fn pause(&self, topic: &Topic) -> QueueResult<()> {
        (**self).pause(topic).await
    }

    async fn resume(&self, topic: &Topic) -> QueueResult<()> {
        (**self).resume(topic).await
    }

    async fn is_paused(&self, topic: &Topic) -> QueueResult<bool> {
        (**self).is_paused(topic).await
    }

    async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats> {
        (**self).stats(topic).await
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        (**self).get(job_id).await
    }

    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        (**self).cancel(job_id).await
    }

    async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>> {
        (**self).list_dead(topic, limit).await
    }

    async fn retry_dead(&self, job_id: JobId) -> QueueResult<()> {
        (**self).retry_dead(job_id).await
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        (**self).purge_terminal(older_than).await
    }

    async fn topics(&self) -> QueueResult<Vec<Topic>> {
        (**self).topics().await
    }

    async fn close(&self) -> QueueResult<()> {
        (**self).close().await
    }
}
