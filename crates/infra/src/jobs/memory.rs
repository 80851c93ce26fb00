//! In-process queue engine for tests/dev.
//!
//! All state sits behind one mutex, so every operation is trivially atomic.
//! The engine keeps its own clock (wall clock + adjustable offset) so lease
//! expiry and backoff can be tested without sleeping.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use lingoq_core::{JobId, LeaseId, Topic, WorkerId};

use super::backend::{QueueBackend, QueueError, QueueResult};
use super::types::{
    ClaimedJob, FailureDisposition, Job, JobStatus, Lease, NewJob, QueueStats, ReclaimedJob,
};
use crate::config::BackendKind;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// Active lease token per processing job.
    leases: HashMap<JobId, LeaseId>,
    paused: HashSet<Topic>,
    topics: BTreeSet<Topic>,
    closed: bool,
}

/// In-memory queue backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    clock_offset: Mutex<chrono::Duration>,
}

/// Saturates at a century so `DateTime + Duration` never overflows.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d)
        .unwrap_or_else(|_| chrono::Duration::days(36_500))
        .min(chrono::Duration::days(36_500))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current time as seen by this engine.
    pub fn now(&self) -> DateTime<Utc> {
        let offset = self
            .clock_offset
            .lock()
            .map(|o| *o)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + offset
    }

    /// Move this engine's clock forward (lease expiry, backoff).
    pub fn advance_clock(&self, by: Duration) {
        if let Ok(mut offset) = self.clock_offset.lock() {
            *offset += to_chrono(by);
        }
    }

    /// Number of jobs currently stored.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("memory backend lock poisoned".to_string()))
    }
}

impl State {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed {
            return Err(QueueError::Backend("queue backend is closed".to_string()));
        }
        Ok(())
    }

    /// The job behind `lease`, if the lease is still the active one.
    fn leased_job(&mut self, lease: &Lease) -> QueueResult<&mut Job> {
        if self.leases.get(&lease.job_id) != Some(&lease.lease_id) {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        match self.jobs.get_mut(&lease.job_id) {
            Some(job) if job.status == JobStatus::Processing => Ok(job),
            Some(_) => Err(QueueError::LeaseLost(lease.job_id)),
            None => Err(QueueError::NotFound(lease.job_id)),
        }
    }

    fn release(job: &mut Job, now: DateTime<Utc>) {
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;
    }

    fn active_with_key(&self, topic: &Topic, key: &str) -> Option<JobId> {
        self.jobs
            .values()
            .find(|j| j.topic == *topic && j.status.is_active() && j.dedupe_key.as_deref() == Some(key))
            .map(|j| j.id)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        let now = self.now();
        let mut state = self.lock()?;
        state.ensure_open()?;

        if let Some(key) = job.dedupe_key.as_deref() {
            if let Some(existing) = state.active_with_key(&job.topic, key) {
                debug!(topic = %job.topic, job_id = %existing, dedupe_key = key, "dedupe hit");
                return Ok(existing);
            }
        }

        let id = job.id;
        state.topics.insert(job.topic.clone());
        state.jobs.insert(id, Job::from_new(job, now));
        Ok(id)
    }

    async fn claim(&self, topic: &Topic, owner: &WorkerId, lease_for: Duration) -> QueueResult<Option<ClaimedJob>> {
        let now = self.now();
        let mut state = self.lock()?;
        state.ensure_open()?;
        if state.paused.contains(topic) {
            return Ok(None);
        }

        let next = state
            .jobs
            .values()
            .filter(|j| j.topic == *topic && j.status == JobStatus::Pending && j.scheduled_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let expires_at = now + to_chrono(lease_for);
        state.leases.insert(job_id, lease_id);

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.status = JobStatus::Processing;
        job.lease_owner = Some(owner.clone());
        job.lease_expires_at = Some(expires_at);
        job.started_at = Some(now);
        job.updated_at = now;

        let lease = Lease {
            job_id,
            topic: topic.clone(),
            lease_id,
            owner: owner.clone(),
            expires_at,
            receipt: None,
        };
        Ok(Some(ClaimedJob {
            job: job.clone(),
            lease,
        }))
    }

    async fn renew(&self, lease: &Lease, lease_for: Duration) -> QueueResult<Lease> {
        let now = self.now();
        let mut state = self.lock()?;
        let job = state.leased_job(lease)?;
        let expires_at = now + to_chrono(lease_for);
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()> {
        let now = self.now();
        let mut state = self.lock()?;
        let job = state.leased_job(lease)?;
        job.status = JobStatus::Completed;
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.result = Some(result);
        job.error = None;
        job.completed_at = Some(now);
        State::release(job, now);
        state.leases.remove(&lease.job_id);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: &str, disposition: FailureDisposition) -> QueueResult<()> {
        let now = self.now();
        let mut state = self.lock()?;
        let job = state.leased_job(lease)?;
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.error = Some(error.to_string());

        match disposition {
            FailureDisposition::Retry { delay } if job.attempts < job.max_attempts => {
                job.status = JobStatus::Pending;
                job.scheduled_at = now + to_chrono(delay);
            }
            _ => {
                job.status = JobStatus::Dead;
                job.completed_at = Some(now);
            }
        }
        State::release(job, now);
        state.leases.remove(&lease.job_id);
        Ok(())
    }

    async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>> {
        let now = self.now();
        let mut state = self.lock()?;
        let mut reclaimed = Vec::new();

        for job in state.jobs.values_mut() {
            let expired = job.status == JobStatus::Processing
                && job.lease_expires_at.is_some_and(|at| at < now);
            if !expired {
                continue;
            }
            reclaimed.push(ReclaimedJob {
                job_id: job.id,
                topic: job.topic.clone(),
                previous_owner: job.lease_owner.clone(),
            });
            job.status = JobStatus::Pending;
            job.scheduled_at = now;
            State::release(job, now);
        }
        for r in &reclaimed {
            state.leases.remove(&r.job_id);
        }
        Ok(reclaimed)
    }

    async fn pause(&self, topic: &Topic) -> QueueResult<()> {
        let mut state = self.lock()?;
        state.topics.insert(topic.clone());
        state.paused.insert(topic.clone());
        Ok(())
    }

    async fn resume(&self, topic: &Topic) -> QueueResult<()> {
        let mut state = self.lock()?;
        state.paused.remove(topic);
        Ok(())
    }

    async fn is_paused(&self, topic: &Topic) -> QueueResult<bool> {
        Ok(self.lock()?.paused.contains(topic))
    }

    async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats> {
        let state = self.lock()?;
        let mut stats = QueueStats::default();
        let mut total_secs = 0.0;

        for job in state.jobs.values().filter(|j| j.topic == *topic) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(d) = job.processing_time() {
                        total_secs += d.num_milliseconds().max(0) as f64 / 1000.0;
                    }
                }
                JobStatus::Dead => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if stats.completed > 0 {
            stats.avg_processing_time_seconds = total_secs / stats.completed as f64;
        }
        Ok(stats)
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        let now = self.now();
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.updated_at = now;
        Ok(true)
    }

    async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>> {
        let state = self.lock()?;
        let mut dead: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.topic == *topic && j.status == JobStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn retry_dead(&self, job_id: JobId) -> QueueResult<()> {
        let now = self.now();
        let mut state = self.lock()?;

        let (topic, key) = match state.jobs.get(&job_id) {
            None => return Err(QueueError::NotFound(job_id)),
            Some(job) if job.status != JobStatus::Dead => {
                return Err(QueueError::InvalidState(format!("job {job_id} is {}, not dead", job.status)));
            }
            Some(job) => (job.topic.clone(), job.dedupe_key.clone()),
        };
        if let Some(key) = key.as_deref() {
            if let Some(active) = state.active_with_key(&topic, key) {
                return Err(QueueError::InvalidState(format!(
                    "job {active} already holds dedupe key '{key}'"
                )));
            }
        }

        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.scheduled_at = now;
        job.completed_at = None;
        job.started_at = None;
        job.updated_at = now;
        Ok(())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status.is_terminal() && j.updated_at < older_than));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn topics(&self) -> QueueResult<Vec<Topic>> {
        Ok(self.lock()?.topics.iter().cloned().collect())
    }

    async fn close(&self) -> QueueResult<()> {
        self.lock()?.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn topic() -> Topic {
        Topic::new("text-translation").unwrap()
    }

    fn worker() -> WorkerId {
        WorkerId::new("w/test/0")
    }

    fn new_job(priority: i32, dedupe: Option<&str>, max_attempts: u32) -> NewJob {
        NewJob {
            id: JobId::new(),
            topic: topic(),
            payload: json!({"n": 1}),
            priority,
            max_attempts,
            dedupe_key: dedupe.map(str::to_string),
            scheduled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claims_highest_priority_first() {
        let q = MemoryBackend::new();
        let low = q.enqueue(new_job(0, None, 3)).await.unwrap();
        let high = q.enqueue(new_job(10, None, 3)).await.unwrap();

        let first = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        let second = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        assert_eq!((first.job.id, second.job.id), (high, low));
        assert!(q.claim(&topic(), &worker(), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_schedule() {
        let q = MemoryBackend::new();
        let mut job = new_job(0, None, 3);
        job.scheduled_at = q.now() + chrono::Duration::seconds(30);
        q.enqueue(job).await.unwrap();

        assert!(q.claim(&topic(), &worker(), LEASE).await.unwrap().is_none());
        q.advance_clock(Duration::from_secs(31));
        assert!(q.claim(&topic(), &worker(), LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dedupe_returns_active_job_then_allows_new_one() {
        let q = MemoryBackend::new();
        let a = q.enqueue(new_job(0, Some("doc:1:fr"), 3)).await.unwrap();
        let b = q.enqueue(new_job(0, Some("doc:1:fr"), 3)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(q.len(), 1);

        let claimed = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        q.complete(&claimed.lease, json!({})).await.unwrap();

        let c = q.enqueue(new_job(0, Some("doc:1:fr"), 3)).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn failure_retries_then_dies() {
        let q = MemoryBackend::new();
        let id = q.enqueue(new_job(0, None, 2)).await.unwrap();

        let c = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        q.fail(&c.lease, "boom", FailureDisposition::Retry { delay: Duration::from_secs(5) })
            .await
            .unwrap();
        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Pending, 1));
        assert!(job.lease_owner.is_none());
        assert!(q.claim(&topic(), &worker(), LEASE).await.unwrap().is_none());

        q.advance_clock(Duration::from_secs(6));
        let c = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        // a retry past the budget is still dead
        q.fail(&c.lease, "boom", FailureDisposition::Retry { delay: Duration::ZERO })
            .await
            .unwrap();
        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Dead, 2));
        assert_eq!(q.stats(&topic()).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_without_spending_attempts() {
        let q = MemoryBackend::new();
        let id = q.enqueue(new_job(0, None, 3)).await.unwrap();
        let stale = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();

        assert!(q.reclaim_expired().await.unwrap().is_empty());
        q.advance_clock(LEASE + Duration::from_secs(1));
        let reclaimed = q.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].previous_owner, Some(worker()));

        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Pending, 0));

        let fresh = q
            .claim(&topic(), &WorkerId::new("w/test/1"), LEASE)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            q.complete(&stale.lease, json!({})).await,
            Err(QueueError::LeaseLost(_))
        ));
        q.complete(&fresh.lease, json!({"ok": true})).await.unwrap();
        assert_eq!(q.get(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let q = MemoryBackend::new();
        q.enqueue(new_job(0, None, 3)).await.unwrap();
        let c = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();

        q.advance_clock(Duration::from_secs(50));
        let renewed = q.renew(&c.lease, LEASE).await.unwrap();
        assert!(renewed.expires_at > c.lease.expires_at);

        q.advance_clock(Duration::from_secs(20));
        assert!(q.reclaim_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_blocks_claims_only() {
        let q = MemoryBackend::new();
        q.enqueue(new_job(0, None, 3)).await.unwrap();
        q.enqueue(new_job(0, None, 3)).await.unwrap();
        let running = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();

        q.pause(&topic()).await.unwrap();
        assert!(q.is_paused(&topic()).await.unwrap());
        assert!(q.claim(&topic(), &worker(), LEASE).await.unwrap().is_none());
        q.complete(&running.lease, json!({})).await.unwrap();

        q.resume(&topic()).await.unwrap();
        assert!(q.claim(&topic(), &worker(), LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_only_while_pending() {
        let q = MemoryBackend::new();
        let a = q.enqueue(new_job(0, None, 3)).await.unwrap();
        assert!(q.cancel(a).await.unwrap());
        assert!(!q.cancel(a).await.unwrap());
        assert!(matches!(q.cancel(JobId::new()).await, Err(QueueError::NotFound(_))));

        let b = q.enqueue(new_job(0, None, 3)).await.unwrap();
        q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        assert!(!q.cancel(b).await.unwrap());

        let stats = q.stats(&topic()).await.unwrap();
        assert_eq!((stats.cancelled, stats.processing, stats.total()), (1, 1, 2));
    }

    #[tokio::test]
    async fn dead_jobs_can_be_listed_and_replayed() {
        let q = MemoryBackend::new();
        let id = q.enqueue(new_job(0, None, 1)).await.unwrap();
        let c = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        q.fail(&c.lease, "bad input", FailureDisposition::Dead).await.unwrap();

        let dead = q.list_dead(&topic(), 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error.as_deref(), Some("bad input"));

        q.retry_dead(id).await.unwrap();
        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Pending, 0));
        assert!(matches!(q.retry_dead(id).await, Err(QueueError::InvalidState(_))));
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_jobs() {
        let q = MemoryBackend::new();
        let done = q.enqueue(new_job(0, None, 3)).await.unwrap();
        q.enqueue(new_job(0, None, 3)).await.unwrap();
        let c = q.claim(&topic(), &worker(), LEASE).await.unwrap().unwrap();
        assert_eq!(c.job.id, done);
        q.complete(&c.lease, json!({})).await.unwrap();

        assert_eq!(q.purge_terminal(q.now() - chrono::Duration::days(7)).await.unwrap(), 0);
        q.advance_clock(Duration::from_secs(8 * 24 * 3600));
        assert_eq!(q.purge_terminal(q.now() - chrono::Duration::days(7)).await.unwrap(), 1);
        assert!(q.get(done).await.unwrap().is_none());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn closed_backend_rejects_new_work() {
        let q = MemoryBackend::new();
        q.close().await.unwrap();
        assert!(q.enqueue(new_job(0, None, 3)).await.is_err());
        assert!(q.claim(&topic(), &worker(), LEASE).await.is_err());
    }
}
