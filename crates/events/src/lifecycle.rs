//! Job lifecycle events emitted by worker processes.

use chrono::{DateTime, Utc};
use lingoq_core::{JobId, Topic, WorkerId};
use serde::{Deserialize, Serialize};

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleKind {
    /// Handler succeeded; the job is `completed`.
    Completed { duration_ms: u64 },
    /// Handler failed. `will_retry` tells whether the job went back to
    /// `pending` (with `next_run_at`) or is now `dead`.
    Failed {
        error: String,
        will_retry: bool,
        next_run_at: Option<DateTime<Utc>>,
    },
    /// Retries exhausted; the job is `dead`.
    Dead { error: String },
    /// The lease expired without an acknowledgement and the job was
    /// returned to `pending`.
    Stalled,
    /// Handler-reported progress.
    Progress { step: String, percent: u8 },
}

/// A single lifecycle event, as published on the worker's bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLifecycleEvent {
    pub job_id: JobId,
    pub topic: Topic,
    /// 1-based execution attempt the event refers to; `0` for stalled jobs
    /// reported by the reclaimer, which do not know the attempt in flight.
    pub attempt: u32,
    pub worker: Option<WorkerId>,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LifecycleKind,
}

impl JobLifecycleEvent {
    pub fn new(job_id: JobId, topic: Topic, attempt: u32, kind: LifecycleKind) -> Self {
        Self {
            job_id,
            topic,
            attempt,
            worker: None,
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self.kind {
            LifecycleKind::Completed { .. } => "job.completed",
            LifecycleKind::Failed { .. } => "job.failed",
            LifecycleKind::Dead { .. } => "job.dead",
            LifecycleKind::Stalled => "job.stalled",
            LifecycleKind::Progress { .. } => "job.progress",
        }
    }

    /// `true` for events that end a job's life (completed or dead).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            LifecycleKind::Completed { .. } | LifecycleKind::Dead { .. }
        )
    }
}
