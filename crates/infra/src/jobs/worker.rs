//! Worker process runtime.
//!
//! A `Worker` owns the subscriptions of one process plus the reclaim loop
//! that returns expired leases to `pending`. Many workers (processes) may
//! share one backend; they coordinate only through atomic claims.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use lingoq_core::{Topic, WorkerId};
use lingoq_events::{JobLifecycleEvent, LifecycleKind, Subscription};

use super::backend::{QueueError, QueueResult};
use super::handler::JobHandler;
use super::manager::QueueManager;
use super::subscription::{SubscribeOptions, SubscriptionHandle};
use crate::config::QueueConfig;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Prefix of every lease owner name of this process.
    pub worker_id: WorkerId,
    pub reclaim_interval: Duration,
    /// Bound on waiting for in-flight handlers at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl WorkerOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            reclaim_interval: config.reclaim_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// How a shutdown went, counted in consumer slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Slots that finished their current job before the deadline.
    pub drained: usize,
    /// Slots aborted at the deadline; their jobs wait for lease expiry.
    pub aborted: usize,
}

pub struct Worker {
    manager: QueueManager,
    options: WorkerOptions,
    subscriptions: Vec<SubscriptionHandle>,
    stop: watch::Sender<bool>,
    reclaimer: JoinHandle<()>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.options.worker_id)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Start the reclaim loop. Must be called from within a tokio runtime.
    pub fn start(manager: QueueManager, options: WorkerOptions) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let reclaimer = tokio::spawn(reclaim_loop(manager.clone(), options.reclaim_interval, stop_rx));
        info!(worker = %options.worker_id, backend = manager.backend_kind().as_str(), "worker started");

        Self {
            manager,
            options,
            subscriptions: Vec::new(),
            stop,
            reclaimer,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.options.worker_id
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Run `handler` for `topic` with `concurrency` parallel slots.
    pub fn subscribe(&mut self, topic: Topic, handler: Arc<dyn JobHandler>, concurrency: usize) -> QueueResult<()> {
        if self.subscriptions.iter().any(|s| s.topic() == &topic) {
            return Err(QueueError::InvalidState(format!("already subscribed to '{topic}'")));
        }
        let handle = self.manager.subscribe(
            topic,
            handler,
            SubscribeOptions::new(concurrency),
            &self.options.worker_id,
        );
        self.subscriptions.push(handle);
        Ok(())
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscriptions
    }

    /// Handlers currently running across all subscriptions.
    pub fn in_flight(&self) -> usize {
        self.subscriptions.iter().map(SubscriptionHandle::in_flight).sum()
    }

    pub fn events(&self) -> Subscription<JobLifecycleEvent> {
        self.manager.events()
    }

    /// Stop new claims on `topic` for every worker; running jobs finish.
    pub async fn pause(&self, topic: &Topic) -> QueueResult<()> {
        self.manager.pause(topic).await
    }

    pub async fn resume(&self, topic: &Topic) -> QueueResult<()> {
        self.manager.resume(topic).await
    }

    /// Stop claiming, wait for in-flight handlers up to the shutdown
    /// timeout, then close the backend.
    pub async fn shutdown(self) -> QueueResult<ShutdownReport> {
        let Self {
            manager,
            options,
            subscriptions,
            stop,
            mut reclaimer,
        } = self;
        info!(worker = %options.worker_id, in_flight = subscriptions.iter().map(SubscriptionHandle::in_flight).sum::<usize>(), "worker shutting down");

        stop.send_replace(true);
        for sub in &subscriptions {
            sub.stop();
        }

        let deadline = Instant::now() + options.shutdown_timeout;
        let mut report = ShutdownReport::default();
        for sub in subscriptions {
            let slots = sub.concurrency();
            let aborted = sub.drain_until(deadline).await;
            report.aborted += aborted;
            report.drained += slots - aborted;
        }
        if tokio::time::timeout_at(deadline, &mut reclaimer).await.is_err() {
            reclaimer.abort();
        }

        manager.close().await?;
        info!(
            worker = %options.worker_id,
            drained = report.drained,
            aborted = report.aborted,
            "worker stopped"
        );
        Ok(report)
    }
}

async fn reclaim_loop(manager: QueueManager, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => match manager.reclaim_expired().await {
                Ok(reclaimed) => {
                    for job in reclaimed {
                        let mut event = JobLifecycleEvent::new(job.job_id, job.topic, 0, LifecycleKind::Stalled);
                        if let Some(owner) = job.previous_owner {
                            event = event.with_worker(owner);
                        }
                        manager.publish_event(event);
                    }
                }
                Err(err) => error!(error = %err, "reclaim pass failed"),
            }
        }
    }
}
