//! Redis-backed queue engine (streams + consumer groups).
//!
//! ## Layout (per topic `T`, key prefix `P`)
//!
//! - `P:T:stream`: ready jobs, one entry (`job_id`) per delivery; the
//!   `workers` consumer group hands each entry to exactly one consumer
//! - `P:T:delayed`: sorted set of delayed/backoff job ids scored by due time,
//!   promoted into the stream by the claim script once due
//! - `P:T:leases`: sorted set of processing job ids scored by lease expiry
//! - `P:T:paused`: pause flag shared by every worker
//! - `P:T:dedupe:<key>`: active job id for a dedupe key
//! - `P:T:counts`: per-status counters plus total completed processing time
//! - `P:T:dead` / `P:T:terminal`: indexes for dead-job listing and retention
//! - `P:job:<id>`: the job itself (hash)
//! - `P:topics`: every topic seen
//!
//! Every state transition is a Lua script, so transitions are atomic across
//! worker processes and use the Redis server clock. The pending-entries list
//! of the group mirrors the lease: renewals `XCLAIM` the entry to reset its
//! idle time and acknowledgements `XACK` + `XDEL` it.
//!
//! Priority is stored but dispatch is stream order (FIFO).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use lingoq_core::{JobId, LeaseId, Topic, WorkerId};

use super::backend::{QueueBackend, QueueError, QueueResult};
use super::types::{
    ClaimedJob, FailureDisposition, Job, JobStatus, Lease, NewJob, QueueStats, ReclaimedJob,
};
use crate::config::BackendKind;

/// Consumer group shared by every worker of a topic.
const GROUP: &str = "workers";

/// Stream entries whose job is no longer pending (cancelled while queued)
/// are dropped by the claim script; bound how many one claim may skip.
const MAX_STALE_SKIPS: usize = 16;

/// Shared helpers prepended to every script.
/// ARGV[1] is always the key prefix and ARGV[2] the topic.
const LUA_PRELUDE: &str = r#"
local P, T = ARGV[1], ARGV[2]
local function tkey(suffix) return P .. ':' .. T .. ':' .. suffix end
local function jkey(id) return P .. ':job:' .. id end
local function now_ms()
  local t = redis.call('TIME')
  return tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end
local function drop_entry(jk)
  local entry = redis.call('HGET', jk, 'entry_id')
  if entry then
    redis.call('XACK', tkey('stream'), 'workers', entry)
    redis.call('XDEL', tkey('stream'), entry)
  end
end
local function clear_lease(jk, id)
  drop_entry(jk)
  redis.call('HDEL', jk, 'lease_owner', 'lease_id', 'lease_expires_at', 'entry_id')
  redis.call('ZREM', tkey('leases'), id)
end
local function clear_dedupe(jk, id)
  local dk = redis.call('HGET', jk, 'dedupe_key')
  if dk and dk ~= '' then
    local k = tkey('dedupe:' .. dk)
    if redis.call('GET', k) == id then redis.call('DEL', k) end
  end
end
local function holds_lease(jk, lease_id)
  return redis.call('HGET', jk, 'status') == 'processing'
     and redis.call('HGET', jk, 'lease_id') == lease_id
end
"#;

/// ARGV: prefix, topic, id, payload, priority, max_attempts, dedupe_key, delay_ms
const ENQUEUE: &str = r#"
local id, dk, delay = ARGV[3], ARGV[7], tonumber(ARGV[8])
if dk ~= '' then
  local existing = redis.call('GET', tkey('dedupe:' .. dk))
  if existing then return existing end
end
local now = now_ms()
local sched = now + delay
redis.call('HSET', jkey(id),
  'id', id, 'topic', T, 'payload', ARGV[4], 'status', 'pending',
  'attempts', 0, 'max_attempts', ARGV[6], 'priority', ARGV[5], 'dedupe_key', dk,
  'scheduled_at', sched, 'created_at', now, 'updated_at', now)
if dk ~= '' then redis.call('SET', tkey('dedupe:' .. dk), id) end
if delay > 0 then
  redis.call('ZADD', tkey('delayed'), sched, id)
else
  redis.call('XADD', tkey('stream'), '*', 'job_id', id)
end
redis.call('HINCRBY', tkey('counts'), 'pending', 1)
redis.call('SADD', P .. ':topics', T)
return id
"#;

/// ARGV: prefix, topic, consumer, lease_ms, lease_id
const CLAIM: &str = r#"
if redis.call('EXISTS', tkey('paused')) == 1 then return false end
local now = now_ms()
local due = redis.call('ZRANGEBYSCORE', tkey('delayed'), '-inf', now, 'LIMIT', 0, 100)
for _, id in ipairs(due) do
  redis.call('ZREM', tkey('delayed'), id)
  redis.call('XADD', tkey('stream'), '*', 'job_id', id)
end
local res = redis.call('XREADGROUP', 'GROUP', 'workers', ARGV[3], 'COUNT', 1, 'STREAMS', tkey('stream'), '>')
if not res then return false end
local entry = res[1][2][1]
local entry_id, id = entry[1], entry[2][2]
local jk = jkey(id)
if redis.call('HGET', jk, 'status') ~= 'pending' then
  redis.call('XACK', tkey('stream'), 'workers', entry_id)
  redis.call('XDEL', tkey('stream'), entry_id)
  return {'skip'}
end
local exp = now + tonumber(ARGV[4])
redis.call('HSET', jk, 'status', 'processing', 'lease_owner', ARGV[3], 'lease_id', ARGV[5],
  'lease_expires_at', exp, 'started_at', now, 'updated_at', now, 'entry_id', entry_id)
redis.call('ZADD', tkey('leases'), exp, id)
redis.call('HINCRBY', tkey('counts'), 'pending', -1)
redis.call('HINCRBY', tkey('counts'), 'processing', 1)
return {'ok', id}
"#;

/// ARGV: prefix, topic, id, lease_id, lease_ms, consumer
const RENEW: &str = r#"
local id = ARGV[3]
local jk = jkey(id)
if not holds_lease(jk, ARGV[4]) then return false end
local exp = now_ms() + tonumber(ARGV[5])
redis.call('HSET', jk, 'lease_expires_at', exp)
redis.call('ZADD', tkey('leases'), exp, id)
local entry = redis.call('HGET', jk, 'entry_id')
if entry then
  redis.call('XCLAIM', tkey('stream'), 'workers', ARGV[6], 0, entry, 'JUSTID')
end
return tostring(exp)
"#;

/// ARGV: prefix, topic, id, lease_id, result
const COMPLETE: &str = r#"
local id = ARGV[3]
local jk = jkey(id)
if not holds_lease(jk, ARGV[4]) then return 0 end
local now = now_ms()
local attempts = math.min(tonumber(redis.call('HGET', jk, 'attempts')) + 1,
                          tonumber(redis.call('HGET', jk, 'max_attempts')))
local started = tonumber(redis.call('HGET', jk, 'started_at')) or now
clear_lease(jk, id)
clear_dedupe(jk, id)
redis.call('HSET', jk, 'status', 'completed', 'attempts', attempts, 'result', ARGV[5],
  'completed_at', now, 'updated_at', now)
redis.call('HDEL', jk, 'error')
redis.call('HINCRBY', tkey('counts'), 'processing', -1)
redis.call('HINCRBY', tkey('counts'), 'completed', 1)
redis.call('HINCRBY', tkey('counts'), 'completed_ms', math.max(now - started, 0))
redis.call('ZADD', tkey('terminal'), now, id)
return 1
"#;

/// ARGV: prefix, topic, id, lease_id, error, retry (0|1), delay_ms
const FAIL: &str = r#"
local id = ARGV[3]
local jk = jkey(id)
if not holds_lease(jk, ARGV[4]) then return 0 end
local now = now_ms()
local max = tonumber(redis.call('HGET', jk, 'max_attempts'))
local attempts = math.min(tonumber(redis.call('HGET', jk, 'attempts')) + 1, max)
clear_lease(jk, id)
redis.call('HINCRBY', tkey('counts'), 'processing', -1)
if ARGV[6] == '1' and attempts < max then
  local delay = tonumber(ARGV[7])
  local sched = now + delay
  redis.call('HSET', jk, 'status', 'pending', 'attempts', attempts, 'error', ARGV[5],
    'scheduled_at', sched, 'updated_at', now)
  if delay > 0 then
    redis.call('ZADD', tkey('delayed'), sched, id)
  else
    redis.call('XADD', tkey('stream'), '*', 'job_id', id)
  end
  redis.call('HINCRBY', tkey('counts'), 'pending', 1)
  return 1
end
clear_dedupe(jk, id)
redis.call('HSET', jk, 'status', 'dead', 'attempts', attempts, 'error', ARGV[5],
  'completed_at', now, 'updated_at', now)
redis.call('HINCRBY', tkey('counts'), 'dead', 1)
redis.call('ZADD', tkey('dead'), now, id)
redis.call('ZADD', tkey('terminal'), now, id)
return 2
"#;

/// ARGV: prefix, topic
const RECLAIM: &str = r#"
local now = now_ms()
local ids = redis.call('ZRANGEBYSCORE', tkey('leases'), '-inf', '(' .. now)
local out = {}
for _, id in ipairs(ids) do
  local jk = jkey(id)
  if redis.call('HGET', jk, 'status') == 'processing' then
    local owner = redis.call('HGET', jk, 'lease_owner') or ''
    clear_lease(jk, id)
    redis.call('HSET', jk, 'status', 'pending', 'scheduled_at', now, 'updated_at', now)
    redis.call('XADD', tkey('stream'), '*', 'job_id', id)
    redis.call('HINCRBY', tkey('counts'), 'processing', -1)
    redis.call('HINCRBY', tkey('counts'), 'pending', 1)
    table.insert(out, id)
    table.insert(out, owner)
  else
    redis.call('ZREM', tkey('leases'), id)
  end
end
return out
"#;

/// ARGV: prefix, topic, id
const CANCEL: &str = r#"
local id = ARGV[3]
local jk = jkey(id)
if redis.call('HGET', jk, 'status') ~= 'pending' then return 0 end
local now = now_ms()
redis.call('ZREM', tkey('delayed'), id)
clear_dedupe(jk, id)
redis.call('HSET', jk, 'status', 'cancelled', 'updated_at', now)
redis.call('HINCRBY', tkey('counts'), 'pending', -1)
redis.call('HINCRBY', tkey('counts'), 'cancelled', 1)
redis.call('ZADD', tkey('terminal'), now, id)
return 1
"#;

/// ARGV: prefix, topic, id
const RETRY_DEAD: &str = r#"
local id = ARGV[3]
local jk = jkey(id)
if redis.call('HGET', jk, 'status') ~= 'dead' then return 0 end
local dk = redis.call('HGET', jk, 'dedupe_key')
if dk and dk ~= '' then
  if redis.call('EXISTS', tkey('dedupe:' .. dk)) == 1 then return -2 end
  redis.call('SET', tkey('dedupe:' .. dk), id)
end
local now = now_ms()
redis.call('HSET', jk, 'status', 'pending', 'attempts', 0, 'scheduled_at', now, 'updated_at', now)
redis.call('HDEL', jk, 'started_at', 'completed_at')
redis.call('XADD', tkey('stream'), '*', 'job_id', id)
redis.call('ZREM', tkey('dead'), id)
redis.call('ZREM', tkey('terminal'), id)
redis.call('HINCRBY', tkey('counts'), 'dead', -1)
redis.call('HINCRBY', tkey('counts'), 'pending', 1)
return 1
"#;

/// ARGV: prefix, topic, cutoff_ms
const PURGE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', tkey('terminal'), '-inf', '(' .. ARGV[3])
local removed = 0
for _, id in ipairs(ids) do
  local jk = jkey(id)
  local status = redis.call('HGET', jk, 'status')
  if status == 'completed' then
    local started = tonumber(redis.call('HGET', jk, 'started_at'))
    local finished = tonumber(redis.call('HGET', jk, 'completed_at'))
    if started and finished then
      redis.call('HINCRBY', tkey('counts'), 'completed_ms', -math.max(finished - started, 0))
    end
  end
  if status then redis.call('HINCRBY', tkey('counts'), status, -1) end
  redis.call('DEL', jk)
  redis.call('ZREM', tkey('terminal'), id)
  redis.call('ZREM', tkey('dead'), id)
  removed = removed + 1
end
return removed
"#;

#[derive(Debug)]
struct Scripts {
    enqueue: Script,
    claim: Script,
    renew: Script,
    complete: Script,
    fail: Script,
    reclaim: Script,
    cancel: Script,
    retry_dead: Script,
    purge: Script,
}

impl Scripts {
    fn load() -> Self {
        let s = |body: &str| Script::new(&format!("{LUA_PRELUDE}{body}"));
        Self {
            enqueue: s(ENQUEUE),
            claim: s(CLAIM),
            renew: s(RENEW),
            complete: s(COMPLETE),
            fail: s(FAIL),
            reclaim: s(RECLAIM),
            cancel: s(CANCEL),
            retry_dead: s(RETRY_DEAD),
            purge: s(PURGE),
        }
    }
}

/// Redis-backed queue.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    prefix: String,
    scripts: Scripts,
    groups: Mutex<HashSet<Topic>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to `redis_url`; every key is namespaced under `prefix`.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "connected to redis");

        Ok(Self {
            conn,
            prefix,
            scripts: Scripts::load(),
            groups: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> QueueResult<MultiplexedConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Backend("queue backend is closed".to_string()));
        }
        Ok(self.conn.clone())
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn topic_key(&self, topic: &Topic, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, topic, suffix)
    }

    /// Create the topic's consumer group (idempotent).
    async fn ensure_group(&self, topic: &Topic) -> QueueResult<()> {
        if self.groups.lock().map(|g| g.contains(topic)).unwrap_or(false) {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.topic_key(topic, "stream"))
            .arg(GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => debug!(topic = %topic, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(map_redis_error(e)),
        }

        if let Ok(mut groups) = self.groups.lock() {
            groups.insert(topic.clone());
        }
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn()?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await.map_err(map_redis_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_hash(&fields).map(Some)
    }

    async fn job_topic(&self, id: JobId) -> QueueResult<Topic> {
        let mut conn = self.conn()?;
        let topic: Option<String> = conn
            .hget(self.job_key(id), "topic")
            .await
            .map_err(map_redis_error)?;
        match topic {
            Some(t) => Ok(Topic::new(t)?),
            None => Err(QueueError::NotFound(id)),
        }
    }

    async fn reclaim_topic(&self, topic: &Topic) -> QueueResult<Vec<ReclaimedJob>> {
        let mut conn = self.conn()?;
        let flat: Vec<String> = self
            .scripts
            .reclaim
            .arg(&self.prefix)
            .arg(topic.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut out = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks(2) {
            let [id, owner] = pair else { continue };
            let job_id: JobId = id.parse()?;
            out.push(ReclaimedJob {
                job_id,
                topic: topic.clone(),
                previous_owner: (!owner.is_empty()).then(|| WorkerId::new(owner.clone())),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Broker
    }

    #[instrument(skip(self, job), fields(topic = %job.topic, job_id = %job.id), err)]
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        self.ensure_group(&job.topic).await?;
        let payload = serde_json::to_string(&job.payload)?;
        let delay_ms = (job.scheduled_at - Utc::now()).num_milliseconds().max(0);

        let mut conn = self.conn()?;
        let id: String = self
            .scripts
            .enqueue
            .arg(&self.prefix)
            .arg(job.topic.as_str())
            .arg(job.id.to_string())
            .arg(payload)
            .arg(job.priority)
            .arg(job.max_attempts)
            .arg(job.dedupe_key.as_deref().unwrap_or_default())
            .arg(delay_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let id: JobId = id.parse()?;
        if id != job.id {
            debug!(job_id = %id, "dedupe hit");
        }
        Ok(id)
    }

    #[instrument(skip(self), fields(topic = %topic, owner = %owner), err)]
    async fn claim(&self, topic: &Topic, owner: &WorkerId, lease_for: Duration) -> QueueResult<Option<ClaimedJob>> {
        self.ensure_group(topic).await?;
        let lease_id = LeaseId::new();

        for _ in 0..MAX_STALE_SKIPS {
            let mut conn = self.conn()?;
            let reply: Option<Vec<String>> = self
                .scripts
                .claim
                .arg(&self.prefix)
                .arg(topic.as_str())
                .arg(owner.as_str())
                .arg(lease_for.as_millis().min(i64::MAX as u128) as i64)
                .arg(lease_id.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            let Some(reply) = reply else {
                return Ok(None);
            };
            match reply.as_slice() {
                [tag] if tag == "skip" => continue,
                [tag, id] if tag == "ok" => {
                    let job_id: JobId = id.parse()?;
                    let job = self
                        .load_job(job_id)
                        .await?
                        .ok_or(QueueError::NotFound(job_id))?;
                    let expires_at = job
                        .lease_expires_at
                        .ok_or_else(|| QueueError::Backend("claimed job has no lease expiry".to_string()))?;
                    let lease = Lease {
                        job_id,
                        topic: topic.clone(),
                        lease_id,
                        owner: owner.clone(),
                        expires_at,
                        receipt: None,
                    };
                    return Ok(Some(ClaimedJob { job, lease }));
                }
                other => {
                    return Err(QueueError::Backend(format!("unexpected claim reply {other:?}")));
                }
            }
        }
        Ok(None)
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id), err)]
    async fn renew(&self, lease: &Lease, lease_for: Duration) -> QueueResult<Lease> {
        let mut conn = self.conn()?;
        let expires: Option<String> = self
            .scripts
            .renew
            .arg(&self.prefix)
            .arg(lease.topic.as_str())
            .arg(lease.job_id.to_string())
            .arg(lease.lease_id.to_string())
            .arg(lease_for.as_millis().min(i64::MAX as u128) as i64)
            .arg(lease.owner.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let expires = expires.ok_or(QueueError::LeaseLost(lease.job_id))?;
        Ok(Lease {
            expires_at: parse_millis(&expires)?,
            ..lease.clone()
        })
    }

    #[instrument(skip(self, lease, result), fields(job_id = %lease.job_id, topic = %lease.topic), err)]
    async fn complete(&self, lease: &Lease, result: JsonValue) -> QueueResult<()> {
        let result = serde_json::to_string(&result)?;
        let mut conn = self.conn()?;
        let done: i64 = self
            .scripts
            .complete
            .arg(&self.prefix)
            .arg(lease.topic.as_str())
            .arg(lease.job_id.to_string())
            .arg(lease.lease_id.to_string())
            .arg(result)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if done == 0 {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, lease, error), fields(job_id = %lease.job_id, topic = %lease.topic), err)]
    async fn fail(&self, lease: &Lease, error: &str, disposition: FailureDisposition) -> QueueResult<()> {
        let (retry, delay) = match disposition {
            FailureDisposition::Retry { delay } => ("1", delay),
            FailureDisposition::Dead => ("0", Duration::ZERO),
        };
        let mut conn = self.conn()?;
        let done: i64 = self
            .scripts
            .fail
            .arg(&self.prefix)
            .arg(lease.topic.as_str())
            .arg(lease.job_id.to_string())
            .arg(lease.lease_id.to_string())
            .arg(error)
            .arg(retry)
            .arg(delay.as_millis().min(i64::MAX as u128) as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if done == 0 {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(&self) -> QueueResult<Vec<ReclaimedJob>> {
        let mut reclaimed = Vec::new();
        for topic in self.topics().await? {
            reclaimed.extend(self.reclaim_topic(&topic).await?);
        }
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    async fn pause(&self, topic: &Topic) -> QueueResult<()> {
        let mut conn = self.conn()?;
        let _: () = conn
            .set(self.topic_key(topic, "paused"), 1)
            .await
            .map_err(map_redis_error)?;
        let _: () = conn
            .sadd(format!("{}:topics", self.prefix), topic.as_str())
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    async fn resume(&self, topic: &Topic) -> QueueResult<()> {
        let mut conn = self.conn()?;
        let _: () = conn
            .del(self.topic_key(topic, "paused"))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn is_paused(&self, topic: &Topic) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        conn.exists(self.topic_key(topic, "paused"))
            .await
            .map_err(map_redis_error)
    }

    #[instrument(skip(self), fields(topic = %topic), err)]
    async fn stats(&self, topic: &Topic) -> QueueResult<QueueStats> {
        let mut conn = self.conn()?;
        let counts: HashMap<String, i64> = conn
            .hgetall(self.topic_key(topic, "counts"))
            .await
            .map_err(map_redis_error)?;
        let get = |k: &str| counts.get(k).copied().unwrap_or(0).max(0) as u64;

        let completed = get("completed");
        let avg = if completed > 0 {
            get("completed_ms") as f64 / 1000.0 / completed as f64
        } else {
            0.0
        };
        Ok(QueueStats {
            pending: get("pending"),
            processing: get("processing"),
            completed,
            failed: get("dead"),
            cancelled: get("cancelled"),
            avg_processing_time_seconds: avg,
        })
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.load_job(job_id).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        let topic = self.job_topic(job_id).await?;
        let mut conn = self.conn()?;
        let done: i64 = self
            .scripts
            .cancel
            .arg(&self.prefix)
            .arg(topic.as_str())
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(done == 1)
    }

    async fn list_dead(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn
            .zrevrange(self.topic_key(topic, "dead"), 0, limit as isize - 1)
            .await
            .map_err(map_redis_error)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(id.parse()?).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn retry_dead(&self, job_id: JobId) -> QueueResult<()> {
        let topic = self.job_topic(job_id).await?;
        let mut conn = self.conn()?;
        let outcome: i64 = self
            .scripts
            .retry_dead
            .arg(&self.prefix)
            .arg(topic.as_str())
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match outcome {
            1 => Ok(()),
            -2 => Err(QueueError::InvalidState(format!(
                "another active job holds the dedupe key of {job_id}"
            ))),
            _ => Err(QueueError::InvalidState(format!("job {job_id} is not dead"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let mut removed = 0u64;
        for topic in self.topics().await? {
            let mut conn = self.conn()?;
            let n: i64 = self
                .scripts
                .purge
                .arg(&self.prefix)
                .arg(topic.as_str())
                .arg(older_than.timestamp_millis())
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            removed += n.max(0) as u64;
        }
        Ok(removed)
    }

    async fn topics(&self) -> QueueResult<Vec<Topic>> {
        let mut conn = self.conn()?;
        let mut names: Vec<String> = conn
            .smembers(format!("{}:topics", self.prefix))
            .await
            .map_err(map_redis_error)?;
        names.sort();
        Ok(names.into_iter().filter_map(|n| Topic::new(n).ok()).collect())
    }

    async fn close(&self) -> QueueResult<()> {
        // The multiplexed connection closes once the last clone drops.
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn map_redis_error(err: redis::RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        QueueError::Transient(format!("redis: {err}"))
    } else {
        QueueError::Backend(format!("redis: {err}"))
    }
}

fn parse_millis(raw: &str) -> QueueResult<DateTime<Utc>> {
    let ms: i64 = raw
        .parse()
        .map_err(|_| QueueError::Backend(format!("invalid timestamp '{raw}'")))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| QueueError::Backend(format!("timestamp out of range: {ms}")))
}

fn job_from_hash(h: &HashMap<String, String>) -> QueueResult<Job> {
    let field = |k: &str| {
        h.get(k)
            .ok_or_else(|| QueueError::Backend(format!("job hash is missing '{k}'")))
    };
    let opt = |k: &str| h.get(k).filter(|v| !v.is_empty());
    let time = |k: &str| field(k).and_then(|v| parse_millis(v));
    let opt_time = |k: &str| opt(k).map(|v| parse_millis(v)).transpose();
    let num = |k: &str| {
        field(k).and_then(|v| {
            v.parse::<i64>()
                .map_err(|_| QueueError::Backend(format!("invalid number in '{k}'")))
        })
    };

    let status = field("status")?;
    Ok(Job {
        id: field("id")?.parse()?,
        topic: Topic::new(field("topic")?.clone())?,
        payload: serde_json::from_str(field("payload")?)?,
        status: JobStatus::parse(status)
            .ok_or_else(|| QueueError::Backend(format!("unknown job status '{status}'")))?,
        attempts: num("attempts")?.max(0) as u32,
        max_attempts: num("max_attempts")?.max(0) as u32,
        priority: num("priority")?.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        dedupe_key: opt("dedupe_key").cloned(),
        scheduled_at: time("scheduled_at")?,
        lease_owner: opt("lease_owner").map(|o| WorkerId::new(o.clone())),
        lease_expires_at: opt_time("lease_expires_at")?,
        result: opt("result").map(|r| serde_json::from_str(r)).transpose()?,
        error: opt("error").cloned(),
        created_at: time("created_at")?,
        updated_at: time("updated_at")?,
        started_at: opt_time("started_at")?,
        completed_at: opt_time("completed_at")?,
    })
}
