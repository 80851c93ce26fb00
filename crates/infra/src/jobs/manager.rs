//! Queue manager: the single entry point producers and workers talk to.
//!
//! Built once at process start and passed explicitly to every component.
//! It owns the selected engine, the retry policy, and the lifecycle bus, and
//! it shields callers from transient connection errors by retrying them
//! with backoff.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use lingoq_core::{JobId, Topic, WorkerId};
use lingoq_events::{EventBus, InMemoryEventBus, JobLifecycleEvent, Subscription};
use lingoq_translation::{
    DOCUMENT_TRANSLATION_TOPIC, DocumentTranslationJob, IMPROVEMENT_TOPIC, ImprovementJob,
    TEXT_TRANSLATION_TOPIC, TextTranslationJob,
};

use super::backend::{QueueBackend, QueueError, QueueResult};
use super::handler::JobHandler;
use super::memory::{MemoryBackend, to_chrono};
use super::postgres::PostgresBackend;
use super::subscription::{self, SubscribeOptions, SubscriptionHandle};
use super::types::{
    ClaimedJob, EnqueueOptions, FailureDisposition, Job, JobStatus, Lease, NewJob, QueueStats, ReclaimedJob,
    RetryPolicy,
};
use crate::config::{BackendKind, JobTypeConfig, QueueConfig};

/// Tunables the manager needs at runtime (a subset of [`QueueConfig`]).
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Handler-failure policy (backoff curve); budgets come from each job.
    pub retry: RetryPolicy,
    pub default_max_attempts: u32,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    /// Connection-level retries for transient backend errors.
    pub connect_retry: RetryPolicy,
    pub document: JobTypeConfig,
    pub text: JobTypeConfig,
    pub improvement: JobTypeConfig,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl ManagerSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            default_max_attempts: config.default_max_attempts,
            lease_duration: config.lease_duration,
            poll_interval: config.poll_interval,
            connect_retry: RetryPolicy::exponential(
                config.connect_attempts,
                Duration::from_millis(100),
                Duration::from_secs(5),
            ),
            document: config.document,
            text: config.text,
            improvement: config.improvement,
        }
    }
}

/// Facade over exactly one queue engine.
#[derive(Clone)]
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    settings: Arc<ManagerSettings>,
    events: Arc<InMemoryEventBus<JobLifecycleEvent>>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("backend", &self.backend.kind())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: ManagerSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            events: Arc::new(InMemoryEventBus::new()),
        }
    }

    /// In-memory manager with default settings (tests, local dev).
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::arc(), ManagerSettings::default())
    }

    /// Instantiate the engine selected by `config.backend`.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        config
            .validate()
            .map_err(|e| QueueError::Validation(e.to_string()))?;
        let settings = ManagerSettings::from_config(config);

        let backend: Arc<dyn QueueBackend> = match config.backend {
            BackendKind::Memory => MemoryBackend::arc(),
            BackendKind::Relational => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| QueueError::Validation("DATABASE_URL is required".to_string()))?;
                let max = config.database_max_connections;
                let pg = retry_transient("connect", &settings.connect_retry, move || {
                    PostgresBackend::connect(url, max)
                })
                .await?;
                pg.migrate().await?;
                Arc::new(pg)
            }
            BackendKind::Broker => connect_broker(config, &settings).await?,
        };

        info!(backend = backend.kind().as_str(), "queue manager ready");
        Ok(Self::new(backend, settings))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, f: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        retry_transient(op, &self.settings.connect_retry, f).await
    }

    // --- producer side --------------------------------------------------

    fn prepare(&self, topic: &Topic, payload: JsonValue, options: EnqueueOptions) -> QueueResult<NewJob> {
        if !payload.is_object() {
            return Err(QueueError::Validation("payload must be a JSON object".to_string()));
        }
        let max_attempts = options.max_attempts.unwrap_or(self.settings.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation("max_attempts must be at least 1".to_string()));
        }
        if let Some(key) = &options.dedupe_key {
            if key.trim().is_empty() {
                return Err(QueueError::Validation("dedupe_key must not be empty".to_string()));
            }
        }

        Ok(NewJob {
            id: JobId::new(),
            topic: topic.clone(),
            payload,
            priority: options.priority,
            max_attempts,
            dedupe_key: options.dedupe_key,
            scheduled_at: Utc::now() + to_chrono(Duration::from_millis(options.delay_ms)),
        })
    }

    /// Enqueue a job; returns the id of the existing active job on a dedupe hit.
    #[instrument(skip(self, payload, options), fields(topic = %topic), err)]
    pub async fn enqueue(&self, topic: &Topic, payload: JsonValue, options: EnqueueOptions) -> QueueResult<JobId> {
        let job = self.prepare(topic, payload, options)?;
        let id = job.id;

        let inserted = self
            .retry("enqueue", move || {
                let job = job.clone();
                async move { self.backend.enqueue(job).await }
            })
            .await;

        match inserted {
            // An earlier attempt landed before its reply was lost.
            Err(QueueError::InvalidState(msg)) => match self.backend.get(id).await? {
                Some(_) => Ok(id),
                None => Err(QueueError::InvalidState(msg)),
            },
            other => other,
        }
    }

    fn ensure_enabled(&self, topic: &str, config: JobTypeConfig) -> QueueResult<Topic> {
        if !config.enabled {
            return Err(QueueError::Validation(format!("job type '{topic}' is disabled")));
        }
        Ok(Topic::new(topic)?)
    }

    /// Publish a document translation; one active job per document and
    /// target language unless `options` carries its own dedupe key.
    pub async fn publish_document_translation(
        &self,
        job: &DocumentTranslationJob,
        mut options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        job.validate()?;
        let topic = self.ensure_enabled(DOCUMENT_TRANSLATION_TOPIC, self.settings.document)?;
        if options.dedupe_key.is_none() {
            options.dedupe_key = Some(job.dedupe_key());
        }
        self.enqueue(&topic, serde_json::to_value(job)?, options).await
    }

    pub async fn publish_text_translation(
        &self,
        job: &TextTranslationJob,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        job.validate()?;
        let topic = self.ensure_enabled(TEXT_TRANSLATION_TOPIC, self.settings.text)?;
        self.enqueue(&topic, serde_json::to_value(job)?, options).await
    }

    pub async fn publish_improvement(&self, job: &ImprovementJob, options: EnqueueOptions) -> QueueResult<JobId> {
        job.validate()?;
        let topic = self.ensure_enabled(IMPROVEMENT_TOPIC, self.settings.improvement)?;
        self.enqueue(&topic, serde_json::to_value(job)?, options).await
    }

    // --- consumer side --------------------------------------------------

    /// Start `options.concurrency` consumer slots for `topic`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn JobHandler>,
        options: SubscribeOptions,
        owner: &WorkerId,
    ) -> SubscriptionHandle {
        subscription::spawn(self.clone(), topic, handler, options, owner)
    }

    pub async fn claim(&self, topic: &Topic, owner: &WorkerId) -> QueueResult<Option<ClaimedJob>> {
        let lease_for = self.settings.lease_duration;
        self.retry("claim", move || self.backend.claim(topic, owner, lease_for))
            .await
    }

    pub async fn renew(&self, lease: &Lease) -> QueueResult<Lease> {
        let lease_for = self.settings.lease_duration;
        self.retry("renew", move || self.backend.renew(lease, lease_for)).await
    }

    pub async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()> {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let acked = self
            .retry("complete", move || {
                counter.fetch_add(1, Ordering::Relaxed);
                self.backend.complete(lease, result.clone())
            })
            .await;

        match acked {
            // An earlier attempt landed before its reply was lost.
            Err(QueueError::LeaseLost(id)) if calls.load(Ordering::Relaxed) > 1 => {
                match self.backend.get(id).await? {
                    Some(job) if job.status == JobStatus::Completed => Ok(()),
                    _ => Err(QueueError::LeaseLost(id)),
                }
            }
            other => other,
        }
    }

    /// Record a handler failure; returns what happened to the job.
    pub async fn fail(&self, job: &Job, lease: &Lease, error: &str) -> QueueResult<FailureDisposition> {
        let disposition = self.settings.retry.on_failure(job.attempts, job.max_attempts);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let nacked = self
            .retry("fail", move || {
                counter.fetch_add(1, Ordering::Relaxed);
                self.backend.fail(lease, error, disposition)
            })
            .await;

        match nacked {
            Ok(()) => Ok(disposition),
            Err(QueueError::LeaseLost(id)) if calls.load(Ordering::Relaxed) > 1 => {
                match self.backend.get(id).await? {
                    Some(current)
                        if current.attempts > job.attempts
                            && matches!(current.status, JobStatus::Pending | JobStatus::Dead) =>
                    {
                        Ok(disposition)
                    }
                    _ => Err(QueueError::LeaseLost(id)),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>> {
        self.retry("reclaim", move || self.backend.reclaim_expired()).await
    }

    // --- operator side --------------------------------------------------

    #[instrument(skip(self), fields(topic = %topic), err)]
    pub async fn pause(&self, topic: &Topic) -> QueueResult<()> {
        self.retry("pause", move || self.backend.pause(topic)).await?;
        info!(topic = %topic, "topic paused");
        Ok(())
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    pub async fn resume(&self, topic: &Topic) -> QueueResult<()> {
        self.retry("resume", move || self.backend.resume(topic)).await?;
        info!(topic = %topic, "topic resumed");
        Ok(())
    }

    pub async fn is_paused(&self, topic: &Topic) -> QueueResult<bool> {
        self.retry("is_paused", move || self.backend.is_paused(topic)).await
    }

    pub async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats> {
        self.retry("stats", move || self.backend.stats(topic)).await
    }

    /// Result fetch: status, result and error of a job.
    pub async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.retry("get", move || self.backend.get(job_id)).await
    }

    /// Cancel a pending job. `Ok(false)` when it is no longer pending.
    pub async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        self.retry("cancel", move || self.backend.cancel(job_id)).await
    }

    pub async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>> {
        self.retry("list_dead", move || self.backend.list_dead(topic, limit))
            .await
    }

    pub async fn retry_dead(&self, job_id: JobId) -> QueueResult<()> {
        self.retry("retry_dead", move || self.backend.retry_dead(job_id)).await?;
        info!(job_id = %job_id, "dead job requeued");
        Ok(())
    }

    /// Requeue up to `limit` dead jobs of `topic`, or of every known topic.
    /// Jobs whose dedupe key is held by another active job stay dead.
    #[instrument(skip(self), fields(topic = ?topic.map(Topic::as_str)), err)]
    pub async fn retry_dead_bulk(&self, topic: Option<&Topic>, limit: usize) -> QueueResult<u64> {
        let topics = match topic {
            Some(t) => vec![t.clone()],
            None => self.topics().await?,
        };

        let mut requeued = 0u64;
        for topic in &topics {
            let budget = limit.saturating_sub(requeued as usize);
            if budget == 0 {
                break;
            }
            for job in self.list_dead(topic, budget).await? {
                match self.retry("retry_dead", move || self.backend.retry_dead(job.id)).await {
                    Ok(()) => requeued += 1,
                    Err(QueueError::InvalidState(msg)) => {
                        debug!(job_id = %job.id, reason = %msg, "dead job left in place");
                    }
                    // Removed or replayed concurrently.
                    Err(QueueError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        if requeued > 0 {
            info!(requeued, "dead jobs requeued");
        }
        Ok(requeued)
    }

    /// Delete terminal jobs last updated before `older_than`.
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let removed = self
            .retry("purge", move || self.backend.purge_terminal(older_than))
            .await?;
        if removed > 0 {
            info!(removed, "purged terminal jobs");
        }
        Ok(removed)
    }

    pub async fn topics(&self) -> QueueResult<Vec<Topic>> {
        self.retry("topics", move || self.backend.topics()).await
    }

    /// Release backend connections. Idempotent.
    pub async fn close(&self) -> QueueResult<()> {
        self.backend.close().await?;
        info!(backend = self.backend.kind().as_str(), "queue backend closed");
        Ok(())
    }

    // --- lifecycle events -----------------------------------------------

    /// Subscribe to lifecycle events published from now on.
    pub fn events(&self) -> Subscription<JobLifecycleEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_bus(&self) -> Arc<InMemoryEventBus<JobLifecycleEvent>> {
        Arc::clone(&self.events)
    }

    pub(crate) fn publish_event(&self, event: JobLifecycleEvent) {
        if let Err(err) = self.events.publish(event) {
            debug!(error = ?err, "dropped lifecycle event");
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_broker(config: &QueueConfig, settings: &ManagerSettings) -> QueueResult<Arc<dyn QueueBackend>> {
    let url = config.redis_url.as_str();
    let prefix = config.key_prefix.as_str();
    let redis = retry_transient("connect", &settings.connect_retry, move || {
        super::redis::RedisBackend::connect(url, prefix)
    })
    .await?;
    Ok(Arc::new(redis))
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(_config: &QueueConfig, _settings: &ManagerSettings) -> QueueResult<Arc<dyn QueueBackend>> {
    Err(QueueError::Unsupported(
        "broker backend requires the `redis` feature".to_string(),
    ))
}

/// Run `f`, retrying transient errors with `policy`'s backoff.
pub(crate) async fn retry_transient<T, F, Fut>(op: &'static str, policy: &RetryPolicy, mut f: F) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingoq_translation::LanguageCode;
    use serde_json::json;

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn doc_job(id: &str) -> DocumentTranslationJob {
        DocumentTranslationJob {
            document_id: id.to_string(),
            source_language: LanguageCode::new("en").unwrap(),
            target_language: LanguageCode::new("es").unwrap(),
            translation_style: "general".to_string(),
            specialization: None,
        }
    }

    #[tokio::test]
    async fn rejects_malformed_enqueues() {
        let qm = QueueManager::in_memory();
        let t = topic("text-translation");

        let err = qm.enqueue(&t, json!("just a string"), EnqueueOptions::default()).await;
        assert!(matches!(err, Err(QueueError::Validation(_))));

        let err = qm
            .enqueue(&t, json!({}), EnqueueOptions::default().with_max_attempts(0))
            .await;
        assert!(matches!(err, Err(QueueError::Validation(_))));

        let err = qm
            .enqueue(&t, json!({}), EnqueueOptions::default().with_dedupe_key("  "))
            .await;
        assert!(matches!(err, Err(QueueError::Validation(_))));

        assert_eq!(qm.stats(&t).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn applies_default_budget_and_delay() {
        let qm = QueueManager::in_memory();
        let t = topic("text-translation");
        let before = Utc::now();

        let id = qm
            .enqueue(&t, json!({"a": 1}), EnqueueOptions::default().with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 3);
        assert!(job.scheduled_at >= before + chrono::Duration::seconds(60));
        assert!(qm.claim(&t, &WorkerId::new("w")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn document_jobs_dedupe_per_document_and_language() {
        let qm = QueueManager::in_memory();

        let a = qm.publish_document_translation(&doc_job("d1"), EnqueueOptions::default()).await.unwrap();
        let b = qm.publish_document_translation(&doc_job("d1"), EnqueueOptions::default()).await.unwrap();
        let c = qm.publish_document_translation(&doc_job("d2"), EnqueueOptions::default()).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        let job = qm.get(a).await.unwrap().unwrap();
        assert_eq!(job.topic.as_str(), DOCUMENT_TRANSLATION_TOPIC);
        assert_eq!(job.dedupe_key.as_deref(), Some("doc:d1:es"));
    }

    #[tokio::test]
    async fn convenience_methods_validate_and_honour_enable_flags() {
        let mut settings = ManagerSettings::default();
        settings.improvement.enabled = false;
        let qm = QueueManager::new(MemoryBackend::arc(), settings);

        let mut bad = doc_job("d1");
        bad.target_language = bad.source_language.clone();
        let err = qm.publish_document_translation(&bad, EnqueueOptions::default()).await;
        assert!(matches!(err, Err(QueueError::Validation(_))));

        let job = ImprovementJob {
            document_id: "d1".to_string(),
            target_language: LanguageCode::new("es").unwrap(),
            instructions: None,
        };
        let err = qm.publish_improvement(&job, EnqueueOptions::default()).await;
        assert!(matches!(err, Err(QueueError::Validation(msg)) if msg.contains("disabled")));
    }

    #[tokio::test]
    async fn fail_schedules_retry_with_backoff() {
        let qm = QueueManager::in_memory();
        let t = topic("improvement");
        let owner = WorkerId::new("w/improvement/0");
        let id = qm
            .enqueue(&t, json!({}), EnqueueOptions::default().with_max_attempts(2))
            .await
            .unwrap();

        let first = qm.claim(&t, &owner).await.unwrap().unwrap();
        let d = qm.fail(&first.job, &first.lease, "boom").await.unwrap();
        assert!(matches!(d, FailureDisposition::Retry { .. }));

        // Backoff pushed the job into the future.
        assert!(qm.claim(&t, &owner).await.unwrap().is_none());
        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    /// Memory engine whose acks commit but whose first ack reply is lost.
    struct LostAckReply {
        inner: MemoryBackend,
        lost: AtomicU32,
    }

    impl LostAckReply {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                lost: AtomicU32::new(0),
            }
        }

        fn drop_reply<T>(&self, out: QueueResult<T>) -> QueueResult<T> {
            if out.is_ok() && self.lost.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(QueueError::Transient("connection reset".into()));
            }
            out
        }
    }

    #[async_trait::async_trait]
    impl QueueBackend for LostAckReply {
        fn kind(&self) -> BackendKind {
            self.inner.kind()
        }
        async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
            self.inner.enqueue(job).await
        }
        async fn claim(&self, topic: &Topic, owner: &WorkerId, lease_for: Duration) -> QueueResult<Option<ClaimedJob>> {
            self.inner.claim(topic, owner, lease_for).await
        }
        async fn renew(&self, lease: &Lease, lease_for: Duration) -> QueueResult<Lease> {
            self.inner.renew(lease, lease_for).await
        }
        async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()> {
            let out = self.inner.complete(lease, result).await;
            self.drop_reply(out)
        }
        async fn fail(&self, lease: &Lease, error: &str, disposition: FailureDisposition) -> QueueResult<()> {
            let out = self.inner.fail(lease, error, disposition).await;
            self.drop_reply(out)
        }
        async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>> {
            self.inner.reclaim_expired().await
        }
        async fn pause(&self, topic: &Topic) -> QueueResult<()> {
            self.inner.pause(topic).await
        }
        async fn resume(&self, topic: &Topic) -> QueueResult<()> {
            self.inner.resume(topic).await
        }
        async fn is_paused(&self, topic: &Topic) -> QueueResult<bool> {
            self.inner.is_paused(topic).await
        }
        async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats> {
            self.inner.stats(topic).await
        }
        async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
            self.inner.get(job_id).await
        }
        async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
            self.inner.cancel(job_id).await
        }
        async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>> {
            self.inner.list_dead(topic, limit).await
        }
        async fn retry_dead(&self, job_id: JobId) -> QueueResult<()> {
            self.inner.retry_dead(job_id).await
        }
        async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
            self.inner.purge_terminal(older_than).await
        }
        async fn topics(&self) -> QueueResult<Vec<Topic>> {
            self.inner.topics().await
        }
        async fn close(&self) -> QueueResult<()> {
            self.inner.close().await
        }
    }

    fn lossy_manager() -> QueueManager {
        let settings = ManagerSettings {
            connect_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..ManagerSettings::default()
        };
        QueueManager::new(Arc::new(LostAckReply::new()), settings)
    }

    #[tokio::test]
    async fn complete_survives_lost_reply_of_committed_ack() {
        let qm = lossy_manager();
        let t = topic("text-translation");
        let owner = WorkerId::new("w/text/0");
        let id = qm.enqueue(&t, json!({}), EnqueueOptions::default()).await.unwrap();

        let claimed = qm.claim(&t, &owner).await.unwrap().unwrap();
        qm.complete(&claimed.lease, json!({"ok": true})).await.unwrap();

        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));

        // A genuinely stale lease still reports the loss.
        let err = qm.complete(&claimed.lease, json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(j) if j == id));
    }

    #[tokio::test]
    async fn fail_survives_lost_reply_of_committed_nack() {
        let qm = lossy_manager();
        let t = topic("text-translation");
        let owner = WorkerId::new("w/text/0");
        let id = qm
            .enqueue(&t, json!({}), EnqueueOptions::default().with_max_attempts(2))
            .await
            .unwrap();

        let claimed = qm.claim(&t, &owner).await.unwrap().unwrap();
        let d = qm.fail(&claimed.job, &claimed.lease, "boom").await.unwrap();
        assert!(matches!(d, FailureDisposition::Retry { .. }));

        let job = qm.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn bulk_retry_requeues_dead_jobs_and_skips_dedupe_conflicts() {
        let qm = QueueManager::in_memory();
        let emails = topic("emails");
        let reports = topic("reports");
        let owner = WorkerId::new("w/0");
        let once = || EnqueueOptions::default().with_max_attempts(1);

        let mut dead = Vec::new();
        for (t, key) in [(&emails, None), (&emails, Some("k")), (&reports, None)] {
            let opts = match key {
                Some(k) => once().with_dedupe_key(k),
                None => once(),
            };
            dead.push(qm.enqueue(t, json!({}), opts).await.unwrap());
            let claimed = qm.claim(t, &owner).await.unwrap().unwrap();
            qm.fail(&claimed.job, &claimed.lease, "boom").await.unwrap();
        }
        // Holds the dedupe key of the second dead job.
        qm.enqueue(&emails, json!({}), EnqueueOptions::default().with_dedupe_key("k"))
            .await
            .unwrap();

        assert_eq!(qm.retry_dead_bulk(Some(&emails), 10).await.unwrap(), 1);
        assert_eq!(qm.get(dead[0]).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(qm.get(dead[1]).await.unwrap().unwrap().status, JobStatus::Dead);
        assert_eq!(qm.get(dead[2]).await.unwrap().unwrap().status, JobStatus::Dead);

        assert_eq!(qm.retry_dead_bulk(None, 0).await.unwrap(), 0);
        assert_eq!(qm.retry_dead_bulk(None, 10).await.unwrap(), 1);
        let reports_stats = qm.stats(&reports).await.unwrap();
        assert_eq!((reports_stats.pending, reports_stats.failed), (1, 0));
    }

    #[tokio::test]
    async fn broker_without_feature_or_memory_selection() {
        let qm = QueueManager::connect(&QueueConfig::default()).await.unwrap();
        assert_eq!(qm.backend_kind(), BackendKind::Memory);

        #[cfg(not(feature = "redis"))]
        {
            let config = QueueConfig {
                backend: BackendKind::Broker,
                ..QueueConfig::default()
            };
            assert!(matches!(
                QueueManager::connect(&config).await,
                Err(QueueError::Unsupported(_))
            ));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_budget() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let out = retry_transient("test", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(QueueError::Transient("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);

        calls.store(0, Ordering::SeqCst);
        let out: QueueResult<()> = retry_transient("test", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueueError::Transient("down".into())) }
        })
        .await;
        assert!(out.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let out: QueueResult<()> = retry_transient("test", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueueError::Validation("bad".into())) }
        })
        .await;
        assert!(matches!(out, Err(QueueError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
