//! One structured log line per job lifecycle event.

use tracing::{debug, error, info, warn};

use lingoq_events::{JobLifecycleEvent, LifecycleKind, Subscription};

use super::event_drain::{DrainHandle, EventDrain};

/// Spawn the log drain for a lifecycle subscription.
pub fn spawn_lifecycle_logger(sub: Subscription<JobLifecycleEvent>) -> std::io::Result<DrainHandle> {
    EventDrain::spawn("lifecycle-logger", sub, |event: JobLifecycleEvent| {
        log_event(&event);
        Ok::<_, ()>(())
    })
}

pub fn log_event(event: &JobLifecycleEvent) {
    let worker = event.worker.as_ref().map(|w| w.as_str()).unwrap_or("-");
    let (job_id, topic, attempt, name) = (&event.job_id, &event.topic, event.attempt, event.name());

    match &event.kind {
        LifecycleKind::Completed { duration_ms } => {
            info!(event = name, %job_id, %topic, attempt, worker, duration_ms, "job completed")
        }
        LifecycleKind::Failed {
            error,
            will_retry,
            next_run_at,
        } => warn!(
            event = name,
            %job_id,
            %topic,
            attempt,
            worker,
            error = %error,
            will_retry,
            next_run_at = ?next_run_at,
            "job failed"
        ),
        LifecycleKind::Dead { error } => {
            error!(event = name, %job_id, %topic, attempt, worker, error = %error, "job dead")
        }
        LifecycleKind::Stalled => {
            warn!(event = name, %job_id, %topic, worker, "job stalled, lease expired")
        }
        LifecycleKind::Progress { step, percent } => {
            debug!(event = name, %job_id, %topic, attempt, step = %step, percent, "job progress")
        }
    }
}
