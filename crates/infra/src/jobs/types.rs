//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use lingoq_core::{JobId, LeaseId, Topic, WorkerId};

/// Job status as stored by every engine.
///
/// A handler failure is a decision point, not a resting state: the engine
/// writes either `Pending` (retry scheduled) or `Dead` in the same atomic
/// update that releases the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for `scheduled_at` and a free consumer slot
    Pending,
    /// Leased by a worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Retry budget exhausted
    Dead,
    /// Withdrawn before any lease was taken
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Dead => "dead",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "dead" => Some(Self::Dead),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead | Self::Cancelled)
    }

    /// Pending or processing: the states a dedupe key guards.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// Used twice: for handler failures (the job's retry budget) and by the
/// manager for connection-level retries of transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, first run included
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic "jitter" keyed on the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what happens to a job whose handler just failed.
    ///
    /// `attempts` is the number of executions finished *before* this one and
    /// `max_attempts` the job's own budget.
    pub fn on_failure(&self, attempts: u32, max_attempts: u32) -> FailureDisposition {
        let executed = attempts.saturating_add(1);
        if executed < max_attempts {
            FailureDisposition::Retry {
                delay: self.delay_for_attempt(executed),
            }
        } else {
            FailureDisposition::Dead
        }
    }
}

/// Outcome of a handler failure, decided by the caller and applied
/// atomically by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, eligible again after `delay`
    Retry { delay: Duration },
    /// Terminal
    Dead,
}

/// Per-call enqueue options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Higher runs first among eligible jobs of a topic.
    #[serde(default)]
    pub priority: i32,
    /// Delay before the first execution, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// Overrides the configured default budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Idempotency key, scoped to the topic and to active jobs.
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// A fully-resolved job ready to be inserted by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub topic: Topic,
    pub payload: JsonValue,
    pub priority: i32,
    pub max_attempts: u32,
    pub dedupe_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// A job as observed through `get`/`list_dead`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub topic: Topic,
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Finished executions (success or handler failure)
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub dedupe_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Claim time of the most recent execution
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a freshly enqueued job.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            topic: new.topic,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            priority: new.priority,
            dedupe_key: new.dedupe_key,
            scheduled_at: new.scheduled_at,
            lease_owner: None,
            lease_expires_at: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Processing time of a completed job.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.status, self.started_at, self.completed_at) {
            (JobStatus::Completed, Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Proof of a held lease; required for every acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub topic: Topic,
    pub lease_id: LeaseId,
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
    /// Engine-specific delivery handle (e.g. a stream entry id).
    pub receipt: Option<String>,
}

/// What `claim` hands to a consumer slot.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease: Lease,
}

/// A job whose lease expired and that went back to `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedJob {
    pub job_id: JobId,
    pub topic: Topic,
    pub previous_owner: Option<WorkerId>,
}

/// Per-topic counters.
///
/// `failed` counts dead jobs. At a quiescent point
/// `pending + processing + completed + failed + cancelled` equals the number
/// of jobs ever enqueued on the topic (minus purged ones).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_processing_time_seconds: f64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }

    /// Fold `other` into `self`, weighting the average by completed jobs.
    pub fn merge(&mut self, other: &QueueStats) {
        let completed = self.completed + other.completed;
        if completed > 0 {
            self.avg_processing_time_seconds = (self.avg_processing_time_seconds * self.completed as f64
                + other.avg_processing_time_seconds * other.completed as f64)
                / completed as f64;
        }
        self.pending += other.pending;
        self.processing += other.processing;
        self.completed = completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}
