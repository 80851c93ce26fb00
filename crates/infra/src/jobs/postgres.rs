//! Postgres-backed queue engine.
//!
//! Jobs live in one table partitioned logically by `topic`. Claims use
//! `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... WHERE id = (SELECT ...)`
//! statement, so concurrent claimants never see the same row and no
//! transaction is held while a handler runs: the lease columns are the only
//! guard during execution.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (connection exception) | `08xxx` | `Transient` |
//! | Database (serialization failure / deadlock) | `40001`, `40P01` | `Transient` |
//! | Database (admin/crash shutdown) | `57P01`..`57P03` | `Transient` |
//! | Database (unique violation) | `23505` | `InvalidState` |
//! | Database (other) | Any other | `Backend` |
//! | Io / Tls / PoolTimedOut | N/A | `Transient` |
//! | PoolClosed | N/A | `Backend` |
//! | Other | N/A | `Backend` |
//!
//! ## Clock
//!
//! Every timestamp comparison uses the database's `now()`, so workers with
//! skewed clocks still agree on lease expiry and schedule eligibility.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use lingoq_core::{JobId, LeaseId, Topic, WorkerId};

use super::backend::{QueueBackend, QueueError, QueueResult};
use super::types::{
    ClaimedJob, FailureDisposition, Job, JobStatus, Lease, NewJob, QueueStats, ReclaimedJob,
};
use crate::config::BackendKind;

/// Columns selected whenever a full job is returned.
const JOB_COLUMNS: &str = "id, topic, payload, status, attempts, max_attempts, priority, dedupe_key, \
     scheduled_at, lease_owner, lease_expires_at, result, error, created_at, updated_at, started_at, completed_at";

/// Schema, applied statement by statement by `migrate`.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_jobs (
        id               UUID PRIMARY KEY,
        topic            TEXT NOT NULL,
        payload          JSONB NOT NULL,
        status           TEXT NOT NULL
                         CHECK (status IN ('pending', 'processing', 'completed', 'dead', 'cancelled')),
        attempts         INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts     INTEGER NOT NULL CHECK (max_attempts >= 1),
        priority         INTEGER NOT NULL DEFAULT 0,
        dedupe_key       TEXT,
        scheduled_at     TIMESTAMPTZ NOT NULL,
        lease_owner      TEXT,
        lease_id         UUID,
        lease_expires_at TIMESTAMPTZ,
        result           JSONB,
        error            TEXT,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_at       TIMESTAMPTZ,
        completed_at     TIMESTAMPTZ,
        CHECK (attempts <= max_attempts)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_jobs_claim_idx
        ON queue_jobs (topic, status, scheduled_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_jobs_lease_idx
        ON queue_jobs (lease_expires_at)
        WHERE status = 'processing'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS queue_jobs_dedupe_idx
        ON queue_jobs (topic, dedupe_key)
        WHERE dedupe_key IS NOT NULL AND status IN ('pending', 'processing')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_topics (
        topic      TEXT PRIMARY KEY,
        paused     BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Insert attempts when a dedupe holder finishes between our insert and
/// our lookup.
const DEDUPE_RACE_ATTEMPTS: usize = 3;

/// Postgres-backed queue.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Arc<PgPool>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool. Connection failures surface as `Transient`.
    pub async fn connect(database_url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        info!("queue schema ready");
        Ok(())
    }

    async fn insert(&self, job: &NewJob) -> QueueResult<Option<JobId>> {
        let row = sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (id, topic, payload, status, attempts, max_attempts, priority, dedupe_key, scheduled_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $7)
            ON CONFLICT (topic, dedupe_key)
                WHERE dedupe_key IS NOT NULL AND status IN ('pending', 'processing')
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.topic.as_str())
        .bind(&job.payload)
        .bind(to_i32(job.max_attempts))
        .bind(job.priority)
        .bind(job.dedupe_key.as_deref())
        .bind(job.scheduled_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        row.map(|r| r.try_get::<Uuid, _>("id").map(JobId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("enqueue", e))
    }

    async fn active_with_key(&self, topic: &Topic, key: &str) -> QueueResult<Option<JobId>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM queue_jobs
            WHERE topic = $1 AND dedupe_key = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(topic.as_str())
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(id.map(JobId::from_uuid))
    }

    async fn exists(&self, job_id: JobId, operation: &str) -> QueueResult<bool> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM queue_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(found.is_some())
    }

    async fn set_paused(&self, topic: &Topic, paused: bool) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_topics (topic, paused, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (topic) DO UPDATE SET paused = EXCLUDED.paused, updated_at = now()
            "#,
        )
        .bind(topic.as_str())
        .bind(paused)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pause", e))?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    #[instrument(skip(self, job), fields(topic = %job.topic, job_id = %job.id), err)]
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        for _ in 0..DEDUPE_RACE_ATTEMPTS {
            if let Some(id) = self.insert(&job).await? {
                return Ok(id);
            }
            // Only a dedupe conflict suppresses the insert.
            let Some(key) = job.dedupe_key.as_deref() else {
                return Err(QueueError::Backend("insert returned no row".to_string()));
            };
            if let Some(existing) = self.active_with_key(&job.topic, key).await? {
                debug!(job_id = %existing, dedupe_key = key, "dedupe hit");
                return Ok(existing);
            }
        }
        Err(QueueError::Transient(format!(
            "dedupe key '{}' kept changing owner during enqueue",
            job.dedupe_key.as_deref().unwrap_or_default()
        )))
    }

    #[instrument(skip(self), fields(topic = %topic, owner = %owner), err)]
    async fn claim(&self, topic: &Topic, owner: &WorkerId, lease_for: Duration) -> QueueResult<Option<ClaimedJob>> {
        let lease_id = LeaseId::new();
        let sql = format!(
            r#"
            UPDATE queue_jobs AS j
            SET status = 'processing',
                lease_owner = $2,
                lease_id = $3,
                lease_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                started_at = now(),
                updated_at = now()
            WHERE j.id = (
                SELECT c.id FROM queue_jobs c
                WHERE c.topic = $1
                  AND c.status = 'pending'
                  AND c.scheduled_at <= now()
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_topics t WHERE t.topic = c.topic AND t.paused
                  )
                ORDER BY c.priority DESC, c.scheduled_at ASC, c.created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(topic.as_str())
            .bind(owner.as_str())
            .bind(lease_id.as_uuid())
            .bind(millis(lease_for))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;
        let expires_at = job
            .lease_expires_at
            .ok_or_else(|| QueueError::Backend("claimed row has no lease expiry".to_string()))?;

        let lease = Lease {
            job_id: job.id,
            topic: topic.clone(),
            lease_id,
            owner: owner.clone(),
            expires_at,
            receipt: None,
        };
        Ok(Some(ClaimedJob { job, lease }))
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id), err)]
    async fn renew(&self, lease: &Lease, lease_for: Duration) -> QueueResult<Lease> {
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE queue_jobs
            SET lease_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND lease_id = $2
            RETURNING lease_expires_at
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.lease_id.as_uuid())
        .bind(millis(lease_for))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?;

        match expires_at {
            Some(expires_at) => Ok(Lease {
                expires_at,
                ..lease.clone()
            }),
            None => Err(QueueError::LeaseLost(lease.job_id)),
        }
    }

    #[instrument(skip(self, lease, result), fields(job_id = %lease.job_id, topic = %lease.topic), err)]
    async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed',
                attempts = LEAST(attempts + 1, max_attempts),
                result = $3,
                error = NULL,
                completed_at = now(),
                updated_at = now(),
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'processing' AND lease_id = $2
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.lease_id.as_uuid())
        .bind(&result)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, lease, error), fields(job_id = %lease.job_id, topic = %lease.topic), err)]
    async fn fail(&self, lease: &Lease, error: &str, disposition: FailureDisposition) -> QueueResult<()> {
        let (retry, delay) = match disposition {
            FailureDisposition::Retry { delay } => (true, delay),
            FailureDisposition::Dead => (false, Duration::ZERO),
        };

        // SET expressions see the pre-update row.
        let updated = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET attempts = LEAST(attempts + 1, max_attempts),
                error = $3,
                status = CASE WHEN $4 AND attempts + 1 < max_attempts
                              THEN 'pending' ELSE 'dead' END,
                scheduled_at = CASE WHEN $4 AND attempts + 1 < max_attempts
                                    THEN now() + ($5::bigint * interval '1 millisecond')
                                    ELSE scheduled_at END,
                completed_at = CASE WHEN $4 AND attempts + 1 < max_attempts
                                    THEN NULL ELSE now() END,
                updated_at = now(),
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'processing' AND lease_id = $2
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.lease_id.as_uuid())
        .bind(error)
        .bind(retry)
        .bind(millis(delay))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>> {
        let rows = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id, lease_owner FROM queue_jobs
                WHERE status = 'processing' AND lease_expires_at < now()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs AS j
            SET status = 'pending',
                scheduled_at = now(),
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            FROM expired e
            WHERE j.id = e.id
            RETURNING j.id, j.topic, e.lease_owner AS previous_owner
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let r = ReclaimedRow::from_row(&row).map_err(|e| map_sqlx_error("reclaim_expired", e))?;
            reclaimed.push(ReclaimedJob {
                job_id: JobId::from_uuid(r.id),
                topic: Topic::new(r.topic)?,
                previous_owner: r.previous_owner.map(WorkerId::new),
            });
        }
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    async fn pause(&self, topic: &Topic) -> QueueResult<()> {
        self.set_paused(topic, true).await
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    async fn resume(&self, topic: &Topic) -> QueueResult<()> {
        self.set_paused(topic, false).await
    }

    async fn is_paused(&self, topic: &Topic) -> QueueResult<bool> {
        let paused: Option<bool> = sqlx::query_scalar("SELECT paused FROM queue_topics WHERE topic = $1")
            .bind(topic.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("is_paused", e))?;
        Ok(paused.unwrap_or(false))
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status,
                   COUNT(*) AS count,
                   AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))::float8 AS avg_secs
            FROM queue_jobs
            WHERE topic = $1
            GROUP BY status
            "#,
        )
        .bind(topic.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let count = count.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => {
                    stats.completed = count;
                    let avg: Option<f64> = row.try_get("avg_secs").map_err(|e| map_sqlx_error("stats", e))?;
                    stats.avg_processing_time_seconds = avg.unwrap_or(0.0);
                }
                Some(JobStatus::Dead) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                None => warn!(status = %status, "unknown job status in queue_jobs"),
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'cancelled', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;

        if updated.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(job_id, "cancel").await? {
            Ok(false)
        } else {
            Err(QueueError::NotFound(job_id))
        }
    }

    async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM queue_jobs
            WHERE topic = $1 AND status = 'dead'
            ORDER BY updated_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(topic.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn retry_dead(&self, job_id: JobId) -> QueueResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempts = 0,
                scheduled_at = now(),
                started_at = NULL,
                completed_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'dead'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_dead", e))?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }
        if self.exists(job_id, "retry_dead").await? {
            Err(QueueError::InvalidState(format!("job {job_id} is not dead")))
        } else {
            Err(QueueError::NotFound(job_id))
        }
    }

    #[instrument(skip(self), err)]
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE status IN ('completed', 'dead', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_terminal", e))?;
        Ok(deleted.rows_affected())
    }

    async fn topics(&self) -> QueueResult<Vec<Topic>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT topic FROM queue_jobs
            UNION
            SELECT topic FROM queue_topics
            ORDER BY topic
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("topics", e))?;

        Ok(names
            .into_iter()
            .filter_map(|name| match Topic::new(name.clone()) {
                Ok(topic) => Some(topic),
                Err(e) => {
                    warn!(topic = %name, error = %e, "skipping invalid topic name");
                    None
                }
            })
            .collect())
    }

    async fn close(&self) -> QueueResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn to_i32(n: u32) -> i32 {
    n.min(i32::MAX as u32) as i32
}

fn job_from_row(row: &PgRow) -> QueueResult<Job> {
    JobRow::from_row(row)
        .map_err(|e| QueueError::Backend(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Map a SQLx error to the queue error taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(code) if code.starts_with("08") => QueueError::Transient(msg),
                Some("40001" | "40P01" | "57P01" | "57P02" | "57P03") => QueueError::Transient(msg),
                // Unique violation: only the active-dedupe index can fire here
                Some("23505") => QueueError::InvalidState(msg),
                _ => QueueError::Backend(msg),
            }
        }
        sqlx::Error::Io(e) => QueueError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => QueueError::Transient(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => QueueError::Transient(format!("connection pool timed out in {operation}")),
        sqlx::Error::PoolClosed => QueueError::Backend(format!("connection pool closed in {operation}")),
        _ => QueueError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    topic: String,
    payload: JsonValue,
    status: String,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    dedupe_key: Option<String>,
    scheduled_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    result: Option<JsonValue>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            dedupe_key: row.try_get("dedupe_key")?,
            scheduled_at: row.try_get("scheduled_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| QueueError::Backend(format!("unknown job status '{}'", row.status)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            topic: Topic::new(row.topic)?,
            payload: row.payload,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            priority: row.priority,
            dedupe_key: row.dedupe_key,
            scheduled_at: row.scheduled_at,
            lease_owner: row.lease_owner.map(WorkerId::new),
            lease_expires_at: row.lease_expires_at,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug)]
struct ReclaimedRow {
    id: Uuid,
    topic: String,
    previous_owner: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ReclaimedRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReclaimedRow {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            previous_owner: row.try_get("previous_owner")?,
        })
    }
}
