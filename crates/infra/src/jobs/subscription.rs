//! Consumer slots: the claim → run → ack loop behind `subscribe`.
//!
//! Each unit of concurrency is one tokio task ("slot") with its own lease
//! owner name. A slot never holds more than one lease, so a subscription
//! never runs more than `concurrency` handlers at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use lingoq_core::{JobId, Topic, WorkerId};
use lingoq_events::{JobLifecycleEvent, LifecycleKind};

use super::backend::QueueError;
use super::handler::{JobContext, JobHandler};
use super::manager::QueueManager;
use super::memory::to_chrono;
use super::types::{ClaimedJob, FailureDisposition};

/// Shortest heartbeat period, whatever the lease.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Parallel handler invocations; `0` is treated as `1`.
    pub concurrency: usize,
}

impl SubscribeOptions {
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Running subscription. Dropping it stops the slots after their current job.
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: Topic,
    stop: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn concurrency(&self) -> usize {
        self.slots.len()
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop claiming; running handlers keep going.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop, then wait up to `timeout` for running handlers.
    ///
    /// Returns how many slots had to be aborted. An aborted job keeps its
    /// lease until it expires and is then reclaimed.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        self.stop();
        self.drain_until(tokio::time::Instant::now() + timeout).await
    }

    pub(crate) async fn drain_until(self, deadline: tokio::time::Instant) -> usize {
        let mut aborted = 0;
        for mut slot in self.slots {
            if tokio::time::timeout_at(deadline, &mut slot).await.is_err() {
                slot.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(topic = %self.topic, aborted, "aborted slots still running at shutdown deadline");
        }
        aborted
    }
}

pub(crate) fn spawn(
    manager: QueueManager,
    topic: Topic,
    handler: Arc<dyn JobHandler>,
    options: SubscribeOptions,
    owner: &WorkerId,
) -> SubscriptionHandle {
    let concurrency = options.concurrency.max(1);
    let (stop, stop_rx) = watch::channel(false);
    let in_flight = Arc::new(AtomicUsize::new(0));

    let slots = (0..concurrency)
        .map(|i| {
            let slot = Slot {
                manager: manager.clone(),
                topic: topic.clone(),
                handler: Arc::clone(&handler),
                name: owner.slot(topic.as_str(), i),
                in_flight: Arc::clone(&in_flight),
            };
            tokio::spawn(slot.run(stop_rx.clone()))
        })
        .collect();

    info!(topic = %topic, concurrency, "subscribed");
    SubscriptionHandle {
        topic,
        stop,
        slots,
        in_flight,
    }
}

/// Aborts the wrapped task when dropped, so aborting a slot also aborts the
/// handler it is waiting on.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Slot {
    manager: QueueManager,
    topic: Topic,
    handler: Arc<dyn JobHandler>,
    name: WorkerId,
    in_flight: Arc<AtomicUsize>,
}

impl Slot {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let poll = self.manager.settings().poll_interval;
        debug!(worker = %self.name, "slot started");

        loop {
            if *stop.borrow() {
                break;
            }

            let idle = match self.manager.claim(&self.topic, &self.name).await {
                Ok(Some(claimed)) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.execute(claimed).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "claim failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = stop.changed() => {
                        // Sender gone: the handle was dropped.
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }

        debug!(worker = %self.name, "slot stopped");
    }

    async fn execute(&self, claimed: ClaimedJob) {
        let ClaimedJob { job, lease } = claimed;
        let attempt = job.attempts.saturating_add(1);
        let span = info_span!("job", job_id = %job.id, topic = %job.topic, attempt, worker = %self.name);

        async move {
            let mut lease = lease;
            let ctx = JobContext::new(
                job.id,
                job.topic.clone(),
                attempt,
                job.max_attempts,
                self.name.clone(),
                self.manager.event_bus(),
            );

            let handler = Arc::clone(&self.handler);
            let payload = job.payload.clone();
            let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(payload, ctx).await }));

            let period = (self.manager.settings().lease_duration / 3).max(MIN_HEARTBEAT);
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut lease_lost = false;
            let started = Instant::now();

            let joined = loop {
                tokio::select! {
                    joined = &mut task.0 => break joined,
                    _ = heartbeat.tick(), if !lease_lost => {
                        match self.manager.renew(&lease).await {
                            Ok(renewed) => lease = renewed,
                            Err(QueueError::LeaseLost(_)) => {
                                warn!("lease lost while the handler is running");
                                lease_lost = true;
                            }
                            Err(err) => warn!(error = %err, "lease renewal failed"),
                        }
                    }
                }
            };
            let duration_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;

            match handler_outcome(joined) {
                Ok(result) => match self.manager.complete(&lease, result).await {
                    Ok(()) => {
                        debug!(duration_ms, "handler succeeded");
                        self.publish(attempt, &job.id, LifecycleKind::Completed { duration_ms });
                    }
                    Err(QueueError::LeaseLost(_)) => {
                        warn!("lease lost before completion was recorded; result discarded")
                    }
                    Err(err) => error!(error = %err, "failed to record completion"),
                },
                Err(message) => match self.manager.fail(&job, &lease, &message).await {
                    Ok(FailureDisposition::Retry { delay }) => {
                        debug!(error = %message, delay_ms = delay.as_millis() as u64, "handler failed, retry scheduled");
                        self.publish(
                            attempt,
                            &job.id,
                            LifecycleKind::Failed {
                                error: message,
                                will_retry: true,
                                next_run_at: Some(Utc::now() + to_chrono(delay)),
                            },
                        );
                    }
                    Ok(FailureDisposition::Dead) => {
                        debug!(error = %message, "handler failed, retries exhausted");
                        self.publish(
                            attempt,
                            &job.id,
                            LifecycleKind::Failed {
                                error: message.clone(),
                                will_retry: false,
                                next_run_at: None,
                            },
                        );
                        self.publish(attempt, &job.id, LifecycleKind::Dead { error: message });
                    }
                    Err(QueueError::LeaseLost(_)) => {
                        warn!(error = %message, "lease lost before failure was recorded")
                    }
                    Err(err) => error!(error = %err, "failed to record handler failure"),
                },
            }
        }
        .instrument(span)
        .await
    }

    fn publish(&self, attempt: u32, job_id: &JobId, kind: LifecycleKind) {
        let event = JobLifecycleEvent::new(*job_id, self.topic.clone(), attempt, kind).with_worker(self.name.clone());
        self.manager.publish_event(event);
    }
}

fn handler_outcome(
    joined: Result<Result<serde_json::Value, super::handler::HandlerError>, JoinError>,
) -> Result<serde_json::Value, String> {
    match joined {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) if err.is_panic() => {
            let panic = err.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(format!("handler panicked: {msg}"))
        }
        Err(_) => Err("handler task was cancelled".to_string()),
    }
}
