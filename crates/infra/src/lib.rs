//! Infrastructure layer: queue engines, worker runtime, config.

pub mod config;
pub mod jobs;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{BackendKind, ConfigError, JobTypeConfig, QueueConfig};
pub use jobs::{
    EnqueueOptions, HandlerError, Job, JobContext, JobHandler, JobStatus, QueueBackend, QueueError,
    QueueManager, QueueResult, QueueStats, StatsAggregator, StatsSnapshot, Worker, WorkerOptions,
    handler_fn,
};
