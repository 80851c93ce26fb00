//! Process wiring: backend, worker subscriptions, background loops and the
//! admin server, plus their ordered teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use lingoq_core::Topic;
use lingoq_infra::jobs::ShutdownReport;
use lingoq_infra::workers::{DrainHandle, spawn_lifecycle_logger};
use lingoq_infra::{JobHandler, QueueConfig, QueueManager, StatsAggregator, Worker, WorkerOptions};
use lingoq_translation::{
    DOCUMENT_TRANSLATION_TOPIC, EchoTranslationEngine, IMPROVEMENT_TOPIC, InMemoryArtifactStore,
    TEXT_TRANSLATION_TOPIC,
};

use crate::app::{self, AdminState};
use crate::handlers::{
    DocumentTranslationHandler, ImprovementHandler, TextTranslationHandler, TranslationServices,
};
use crate::settings::WorkerSettings;

/// A running worker process.
pub struct Runtime {
    manager: QueueManager,
    worker: Worker,
    admin_addr: Option<SocketAddr>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    logger: DrainHandle,
    shutdown_timeout: Duration,
}

impl Runtime {
    /// Connect the backend and start consuming every enabled topic.
    pub async fn start(settings: WorkerSettings) -> anyhow::Result<Self> {
        let manager = QueueManager::connect(&settings.queue)
            .await
            .context("failed to connect queue backend")?;
        let services = TranslationServices::new(Arc::new(EchoTranslationEngine), InMemoryArtifactStore::arc());
        Self::start_with(settings, manager, services).await
    }

    /// Like [`Runtime::start`] with an already connected manager and explicit
    /// collaborators. On error nothing is left running and `manager` is closed.
    pub async fn start_with(
        settings: WorkerSettings,
        manager: QueueManager,
        services: TranslationServices,
    ) -> anyhow::Result<Self> {
        // Bind before consuming anything: a taken port must not leave slots running.
        let admin = match bind_admin(settings.admin_addr).await {
            Ok(admin) => admin,
            Err(e) => {
                close_quietly(&manager).await;
                return Err(e);
            }
        };
        let logger = match spawn_lifecycle_logger(manager.events()) {
            Ok(logger) => logger,
            Err(e) => {
                close_quietly(&manager).await;
                return Err(anyhow::Error::new(e).context("failed to spawn lifecycle logger"));
            }
        };

        let mut worker = Worker::start(manager.clone(), WorkerOptions::from_config(&settings.queue));
        let topics = match register_handlers(&mut worker, &settings.queue, &services) {
            Ok(topics) => topics,
            Err(e) => {
                if let Err(err) = worker.shutdown().await {
                    warn!(error = %err, "worker shutdown after failed start");
                }
                if let Err(err) = tokio::task::spawn_blocking(move || logger.shutdown()).await {
                    warn!(error = %err, "lifecycle logger ended abnormally");
                }
                return Err(e.context("failed to subscribe handlers"));
            }
        };

        let (stop, stop_rx) = watch::channel(false);
        let stats = StatsAggregator::new(manager.clone()).with_topics(topics);
        let mut tasks = vec![
            stats.spawn_reporter(settings.stats_interval, stop_rx.clone()),
            tokio::spawn(purge_loop(
                manager.clone(),
                settings.retention,
                settings.purge_interval,
                stop_rx.clone(),
            )),
        ];

        let admin_addr = admin.map(|(listener, local)| {
            let state = AdminState::new(manager.clone(), stats).with_shutdown(stop_rx.clone());
            let router = app::build_router(state);
            let mut stop_rx = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let stopped = async move {
                    while stop_rx.changed().await.is_ok() {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                };
                if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stopped).await {
                    error!(error = %e, "admin server failed");
                }
            }));
            info!(addr = %local, "admin server listening");
            local
        });

        Ok(Self {
            manager,
            worker,
            admin_addr,
            stop,
            tasks,
            logger,
            shutdown_timeout: settings.queue.shutdown_timeout,
        })
    }

    /// Bound admin address, once the server is listening.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Stop background loops, drain the worker, then flush the lifecycle log.
    pub async fn shutdown(self) -> anyhow::Result<ShutdownReport> {
        let Self {
            worker,
            stop,
            tasks,
            logger,
            shutdown_timeout,
            ..
        } = self;

        stop.send_replace(true);
        let report = worker.shutdown().await.context("worker shutdown failed")?;

        // Slow admin clients must not hold the process past the drain bound.
        let deadline = Instant::now() + shutdown_timeout;
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "background task ended abnormally"),
                Err(_) => {
                    warn!("background task still running at shutdown deadline, aborting");
                    task.abort();
                }
            }
        }

        let logged = tokio::task::spawn_blocking(move || logger.shutdown()).await?;
        info!(
            drained = report.drained,
            aborted = report.aborted,
            events_logged = logged,
            "worker process stopped"
        );
        Ok(report)
    }
}

async fn bind_admin(addr: Option<SocketAddr>) -> anyhow::Result<Option<(TcpListener, SocketAddr)>> {
    let Some(addr) = addr else {
        return Ok(None);
    };
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin address {addr}"))?;
    let local = listener.local_addr()?;
    Ok(Some((listener, local)))
}

async fn close_quietly(manager: &QueueManager) {
    if let Err(e) = manager.close().await {
        warn!(error = %e, "failed to close queue backend");
    }
}

/// Subscribe the handler of every enabled job type; returns the topics.
fn register_handlers(
    worker: &mut Worker,
    config: &QueueConfig,
    services: &TranslationServices,
) -> anyhow::Result<Vec<Topic>> {
    let candidates: [(&str, _, Arc<dyn JobHandler>); 3] = [
        (
            DOCUMENT_TRANSLATION_TOPIC,
            config.document,
            Arc::new(DocumentTranslationHandler::new(services.clone())),
        ),
        (
            TEXT_TRANSLATION_TOPIC,
            config.text,
            Arc::new(TextTranslationHandler::new(services.clone())),
        ),
        (
            IMPROVEMENT_TOPIC,
            config.improvement,
            Arc::new(ImprovementHandler::new(services.clone())),
        ),
    ];

    let mut topics = Vec::new();
    for (name, job_type, handler) in candidates {
        if !job_type.enabled {
            info!(topic = name, "job type disabled");
            continue;
        }
        let topic = Topic::new(name)?;
        worker.subscribe(topic.clone(), handler, job_type.concurrency)?;
        info!(topic = name, concurrency = job_type.concurrency, "subscribed");
        topics.push(topic);
    }
    Ok(topics)
}

/// Retention: delete terminal jobs older than `retention` every `every`.
async fn purge_loop(manager: QueueManager, retention: Duration, every: Duration, mut stop: watch::Receiver<bool>) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => match manager.purge_terminal(Utc::now() - retention).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged terminal jobs"),
                Err(e) => warn!(error = %e, "purge failed"),
            }
        }
    }
}
