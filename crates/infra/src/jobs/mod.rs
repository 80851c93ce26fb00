//! Durable job queue with leases, retries and dead-lettering.
//!
//! ## Design
//!
//! - Jobs are topic-scoped JSON payloads, delivered at least once
//! - A claim takes a time-bounded lease; acks must present it
//! - Expired leases are reclaimed without touching the retry budget
//! - Retry/backoff is decided here (`RetryPolicy`), engines only apply it
//!
//! ## Components
//!
//! - `QueueBackend`: engine contract (`PostgresBackend`, `RedisBackend`, `MemoryBackend`)
//! - `QueueManager`: the facade producers and workers hold
//! - `Worker`: subscriptions, heartbeats, reclaim loop and graceful shutdown
//! - `StatsAggregator`: cross-topic counters

pub mod backend;
pub mod handler;
pub mod manager;
pub mod memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod stats;
pub mod subscription;
pub mod types;
pub mod worker;

pub use backend::{QueueBackend, QueueError, QueueResult};
pub use handler::{FnHandler, HandlerError, JobContext, JobHandler, ProgressReporter, handler_fn};
pub use manager::{ManagerSettings, QueueManager};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;
pub use stats::{StatsAggregator, StatsSnapshot};
pub use subscription::{SubscribeOptions, SubscriptionHandle};
pub use types::{
    BackoffStrategy, ClaimedJob, EnqueueOptions, FailureDisposition, Job, JobStatus, Lease, NewJob,
    QueueStats, ReclaimedJob, RetryPolicy,
};
pub use worker::{ShutdownReport, Worker, WorkerOptions};
