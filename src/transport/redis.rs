//! Redis-backed queue transport
//!
//! Distributed backend sharing one key layout across worker processes:
//!
//! - `{prefix}queue:{type}:waiting` - zset of claimable ids, scored by priority
//! - `{prefix}queue:{type}:active` - zset of claimed ids, scored by claim time
//! - `{prefix}queue:{type}:completed` / `:failed` - zsets scored by event time
//! - `{prefix}job:{id}` - hash holding the job body (JSON) plus denormalized
//!   `status` and `type` fields
//! - `{prefix}delayed` - global zset of not-yet-eligible ids scored by due time
//!   (scheduled jobs and backed-off retries)
//! - `{prefix}types` - set of every job type seen
//! - `{prefix}paused` / `{prefix}paused:all` - pause flags
//! - `{prefix}notify:{type}` - pub/sub wake channel (best effort; the poll
//!   loop is the correctness backstop)
//!
//! Multi-step mutations run inside MULTI/EXEC so a body update and its queue
//! membership move apply atomically. The claim winner is decided by the ZREM
//! count on the waiting zset: exactly one caller observes 1. Promotion and
//! removal serialize on the same primitive, so once one of them wins an id's
//! membership no other path can write that job back.

use crate::backoff;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::health::HealthReport;
use crate::job::{Job, JobFailure, JobOptions, JobStatus, QueueStats};
use crate::transport::registry::HandlerRegistry;
use crate::transport::{
    require_terminal, JobContext, JobHandler, Transport, DEFAULT_CLEAN_GRACE_MS,
    DEFAULT_JOB_LIST_LIMIT,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Poll interval; longer than the memory transport given network cost
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Max due jobs promoted per tick
const PROMOTE_BATCH: usize = 100;

struct RedisState {
    client: redis::Client,
    config: QueueConfig,
    prefix: String,
    registry: HandlerRegistry,
    in_flight: Mutex<HashSet<String>>,
    shutdown: AtomicBool,
    /// Pub/sub wake signal short-circuiting the poll interval
    wake: tokio::sync::Notify,
}

impl RedisState {
    fn waiting_key(&self, job_type: &str) -> String {
        format!("{}queue:{}:waiting", self.prefix, job_type)
    }

    fn active_key(&self, job_type: &str) -> String {
        format!("{}queue:{}:active", self.prefix, job_type)
    }

    fn terminal_key(&self, job_type: &str, status: JobStatus) -> String {
        format!("{}queue:{}:{}", self.prefix, job_type, status)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}job:{}", self.prefix, id)
    }

    fn delayed_key(&self) -> String {
        format!("{}delayed", self.prefix)
    }

    fn types_key(&self) -> String {
        format!("{}types", self.prefix)
    }

    fn paused_key(&self) -> String {
        format!("{}paused", self.prefix)
    }

    fn paused_all_key(&self) -> String {
        format!("{}paused:all", self.prefix)
    }

    fn notify_channel(&self, job_type: &str) -> String {
        format!("{}notify:{}", self.prefix, job_type)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let attempts = self.config.redis.max_retries_per_request.max(1);
        let mut last_err = None;
        for _ in 0..attempts {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }
        let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(QueueError::not_connected(format!(
            "Redis connection failed after {} attempts: {}",
            attempts, detail
        )))
    }

    /// Load and parse a job body; `None` when the hash is gone
    async fn load_job(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &str,
    ) -> Result<Option<Job>> {
        let body: Option<String> = redis::cmd("HGET")
            .arg(self.job_key(id))
            .arg("body")
            .query_async(conn)
            .await
            .map_err(|e| QueueError::backend_for_job("HGET", id, e))?;

        match body {
            Some(json) => {
                let job: Job = serde_json::from_str(&json).map_err(|e| {
                    QueueError::backend_for_job("deserialize", id, e)
                })?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Add the body/status writes for `job` to an open transaction
    fn stage_body(&self, pipe: &mut redis::Pipeline, job: &Job) -> Result<()> {
        let body = serde_json::to_string(job)
            .map_err(|e| QueueError::backend_for_job("serialize", &job.id, e))?;
        pipe.hset(self.job_key(&job.id), "body", body)
            .hset(self.job_key(&job.id), "status", job.status.as_str())
            .hset(self.job_key(&job.id), "type", &job.job_type);
        Ok(())
    }

    async fn pause_flags(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(bool, HashSet<String>)> {
        let all: bool = redis::cmd("EXISTS")
            .arg(self.paused_all_key())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::backend("EXISTS", e))?;
        let paused: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.paused_key())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::backend("SMEMBERS", e))?;
        Ok((all, paused.into_iter().collect()))
    }

    fn is_paused(all: bool, paused: &HashSet<String>, job_type: &str) -> bool {
        all || paused.contains(job_type)
    }
}

/// Redis-backed job queue transport
#[derive(Clone)]
pub struct RedisTransport {
    state: Arc<RedisState>,
    poll_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    notify_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RedisTransport {
    /// Create a new Redis transport
    ///
    /// Requires `config.redis.url`. Starts the poll and pub/sub listener
    /// tasks unless `worker.enabled` is off. Call `close()` before dropping.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let url = config.redis.url.clone().ok_or_else(|| {
            QueueError::configuration_missing("redis.url is required for the Redis backend")
        })?;
        let client = redis::Client::open(url.as_str())
            .map_err(|e| QueueError::not_connected(format!("Failed to create Redis client: {}", e)))?;

        let prefix = config.redis.key_prefix.clone();
        let state = Arc::new(RedisState {
            client,
            config,
            prefix,
            registry: HandlerRegistry::new(),
            in_flight: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
            wake: tokio::sync::Notify::new(),
        });

        let transport = Self {
            state,
            poll_handle: Arc::new(Mutex::new(None)),
            notify_handle: Arc::new(Mutex::new(None)),
        };

        if transport.state.config.worker.enabled {
            transport.start_poll_task();
            transport.start_notify_task();
        }

        Ok(transport)
    }

    fn start_poll_task(&self) {
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);

            loop {
                if state.shutdown.load(Ordering::Acquire) {
                    tracing::debug!("Redis transport poll loop shutting down");
                    break;
                }

                tokio::select! {
                    _ = interval.tick() => {}
                    _ = state.wake.notified() => {}
                }

                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }

                if let Err(e) = Self::run_tick(&state).await {
                    tracing::error!(error = %e, "Redis poll tick failed");
                }
            }
        });

        if let Ok(mut guard) = self.poll_handle.try_lock() {
            *guard = Some(handle);
        } else {
            handle.abort();
            tracing::error!("Failed to store Redis poll handle");
        }
    }

    /// Subscribe to `notify:*` and nudge the poll loop on every message
    fn start_notify_task(&self) {
        let state = self.state.clone();
        let pattern = format!("{}notify:*", self.state.prefix);

        let handle = tokio::spawn(async move {
            loop {
                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }

                match state.client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe(&pattern).await {
                            tracing::warn!(error = %e, "Job notification subscribe failed");
                        } else {
                            let mut messages = pubsub.on_message();
                            while let Some(_msg) = messages.next().await {
                                if state.shutdown.load(Ordering::Acquire) {
                                    return;
                                }
                                state.wake.notify_one();
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Job notification connection failed");
                    }
                }

                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        });

        if let Ok(mut guard) = self.notify_handle.try_lock() {
            *guard = Some(handle);
        } else {
            handle.abort();
            tracing::error!("Failed to store Redis notify handle");
        }
    }

    /// One poll tick: promote due delayed jobs, then claim and dispatch up
    /// to remaining capacity across non-paused registered types
    async fn run_tick(state: &Arc<RedisState>) -> Result<()> {
        let mut conn = state.conn().await?;
        let now = Utc::now();

        Self::promote_due(state, &mut conn, now).await?;

        let (all_paused, paused) = state.pause_flags(&mut conn).await?;

        let mut handlers: HashMap<String, JobHandler> = HashMap::new();
        for job_type in state.registry.registered_types().await {
            if Self::is_eligible_type(all_paused, &paused, &job_type) {
                if let Some(handler) = state.registry.get(&job_type).await {
                    handlers.insert(job_type, handler);
                }
            }
        }

        let mut capacity = {
            let in_flight = state.in_flight.lock().await;
            state.config.concurrency.saturating_sub(in_flight.len())
        };

        for (job_type, handler) in handlers {
            if capacity == 0 {
                break;
            }

            // Highest priority first
            let candidates: Vec<String> = redis::cmd("ZREVRANGE")
                .arg(state.waiting_key(&job_type))
                .arg(0)
                .arg((capacity - 1) as isize)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend("ZREVRANGE", e))?;

            for id in candidates {
                if capacity == 0 {
                    break;
                }
                if Self::claim_and_dispatch(state, &mut conn, &job_type, &id, handler.clone(), now)
                    .await?
                {
                    capacity -= 1;
                }
            }
        }

        Ok(())
    }

    fn is_eligible_type(all_paused: bool, paused: &HashSet<String>, job_type: &str) -> bool {
        !RedisState::is_paused(all_paused, paused, job_type)
    }

    /// Move due members of the delayed zset into their waiting queues
    async fn promote_due(
        state: &Arc<RedisState>,
        conn: &mut redis::aio::MultiplexedConnection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(state.delayed_key())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::backend("ZRANGEBYSCORE", e))?;

        for id in due {
            // Winning this ZREM serializes promotion against concurrent
            // promoters and `remove`
            let removed: i64 = redis::cmd("ZREM")
                .arg(state.delayed_key())
                .arg(&id)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::backend_for_job("ZREM", id.as_str(), e))?;
            if removed != 1 {
                continue;
            }

            let Some(mut job) = state.load_job(conn, &id).await? else {
                // Body removed out from under the index; nothing to promote
                continue;
            };

            if job.status == JobStatus::Delayed {
                job.promote();
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.zadd(state.waiting_key(&job.job_type), &id, job.priority as f64);
            state.stage_body(&mut pipe, &job)?;
            pipe.query_async::<()>(conn)
                .await
                .map_err(|e| QueueError::backend_for_job("promote", &id, e))?;

            tracing::debug!(job_id = %id, job_type = %job.job_type, "Promoted delayed job");
        }

        Ok(())
    }

    /// Attempt the atomic claim for one candidate id
    ///
    /// Returns true when this process won and dispatched the job. The ZREM
    /// count is the serialization point across worker processes.
    async fn claim_and_dispatch(
        state: &Arc<RedisState>,
        conn: &mut redis::aio::MultiplexedConnection,
        job_type: &str,
        id: &str,
        handler: JobHandler,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(state.waiting_key(job_type))
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::backend_for_job("ZREM", id, e))?;
        if removed != 1 {
            // Another worker won this id
            return Ok(false);
        }

        let Some(mut job) = state.load_job(conn, id).await? else {
            tracing::warn!(job_id = %id, "Claimed id has no job body; skipping");
            return Ok(false);
        };
        job.mark_active(now);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zadd(state.active_key(job_type), id, now.timestamp_millis() as f64);
        state.stage_body(&mut pipe, &job)?;
        pipe.query_async::<()>(conn)
            .await
            .map_err(|e| QueueError::backend_for_job("claim", id, e))?;

        state.in_flight.lock().await.insert(id.to_string());

        let state = state.clone();
        tokio::spawn(async move {
            Self::execute_claimed(state, job, handler).await;
        });
        Ok(true)
    }

    /// Run a claimed job's handler and persist the resulting transition
    ///
    /// Handler errors become the `active -> waiting|failed` transition.
    /// Backend errors while persisting are logged and the job is left in
    /// the active queue for re-inspection.
    async fn execute_claimed(state: Arc<RedisState>, mut job: Job, handler: JobHandler) {
        let ctx = JobContext::for_job(&job);
        let job_id = job.id.clone();
        tracing::debug!(job_id = %job_id, job_type = %job.job_type, attempt = job.attempts, "Processing job");

        let outcome = handler(ctx).await;
        let now = Utc::now();

        let persisted: Result<()> = async {
            let mut conn = state.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.zrem(state.active_key(&job.job_type), &job_id);

            match outcome {
                Ok(result) => {
                    job.mark_completed(now, result);
                    pipe.zadd(
                        state.terminal_key(&job.job_type, JobStatus::Completed),
                        &job_id,
                        now.timestamp_millis() as f64,
                    );
                    tracing::info!(job_id = %job_id, "Job completed");
                }
                Err(e) => {
                    let retry_at = backoff::next_run_at(&state.config, job.attempts, now);
                    job.mark_failed_attempt(now, JobFailure::from_message(e.to_string()), retry_at);
                    match job.status {
                        JobStatus::Waiting => {
                            pipe.zadd(
                                state.delayed_key(),
                                &job_id,
                                retry_at.timestamp_millis() as f64,
                            );
                            tracing::warn!(
                                job_id = %job_id,
                                attempt = job.attempts,
                                error = %e,
                                "Job failed, retry scheduled"
                            );
                        }
                        _ => {
                            pipe.zadd(
                                state.terminal_key(&job.job_type, JobStatus::Failed),
                                &job_id,
                                now.timestamp_millis() as f64,
                            );
                            tracing::warn!(
                                job_id = %job_id,
                                attempts = job.attempts,
                                error = %e,
                                "Job failed permanently"
                            );
                        }
                    }
                }
            }

            state.stage_body(&mut pipe, &job)?;
            pipe.query_async::<()>(&mut conn)
                .await
                .map_err(|e| QueueError::backend_for_job("finalize", &job_id, e))?;
            Ok(())
        }
        .await;

        if let Err(e) = persisted {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job outcome; job left active for re-inspection");
        }

        state.in_flight.lock().await.remove(&job_id);
    }

    /// Collect candidate ids for a status listing
    async fn status_members(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        status: JobStatus,
        types: &[String],
    ) -> Result<Vec<String>> {
        let state = &self.state;
        let mut ids = Vec::new();

        match status {
            JobStatus::Delayed | JobStatus::Waiting => {
                // Both live partly in the global delayed zset (scheduled
                // jobs vs backed-off retries); the body's status decides
                let delayed: Vec<String> = redis::cmd("ZRANGE")
                    .arg(state.delayed_key())
                    .arg(0)
                    .arg(-1)
                    .query_async(conn)
                    .await
                    .map_err(|e| QueueError::backend("ZRANGE", e))?;
                ids.extend(delayed);

                if status == JobStatus::Waiting {
                    for job_type in types {
                        let waiting: Vec<String> = redis::cmd("ZRANGE")
                            .arg(state.waiting_key(job_type))
                            .arg(0)
                            .arg(-1)
                            .query_async(conn)
                            .await
                            .map_err(|e| QueueError::backend("ZRANGE", e))?;
                        ids.extend(waiting);
                    }
                }
            }
            JobStatus::Active => {
                for job_type in types {
                    let active: Vec<String> = redis::cmd("ZRANGE")
                        .arg(state.active_key(job_type))
                        .arg(0)
                        .arg(-1)
                        .query_async(conn)
                        .await
                        .map_err(|e| QueueError::backend("ZRANGE", e))?;
                    ids.extend(active);
                }
            }
            JobStatus::Completed | JobStatus::Failed => {
                for job_type in types {
                    let members: Vec<String> = redis::cmd("ZRANGE")
                        .arg(state.terminal_key(job_type, status))
                        .arg(0)
                        .arg(-1)
                        .query_async(conn)
                        .await
                        .map_err(|e| QueueError::backend("ZRANGE", e))?;
                    ids.extend(members);
                }
            }
        }

        Ok(ids)
    }

    async fn known_types(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_type: Option<&str>,
    ) -> Result<Vec<String>> {
        match job_type {
            Some(t) => Ok(vec![t.to_string()]),
            None => {
                let types: Vec<String> = redis::cmd("SMEMBERS")
                    .arg(self.state.types_key())
                    .query_async(conn)
                    .await
                    .map_err(|e| QueueError::backend("SMEMBERS", e))?;
                Ok(types)
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn add(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<()> {
        let state = &self.state;
        let mut conn = state.conn().await?;

        let exists: bool = redis::cmd("EXISTS")
            .arg(state.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::backend_for_job("EXISTS", id, e))?;
        if exists {
            return Err(QueueError::invalid_state(format!("job '{}' already exists", id)));
        }

        let mut job = Job::new(id, job_type, data, &options, &state.config);
        if let Some(delay_ms) = options.delay_ms {
            if delay_ms > 0 {
                job.status = JobStatus::Delayed;
                job.run_at = job.created_at + Duration::milliseconds(delay_ms as i64);
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(state.types_key(), job_type);
        if job.status == JobStatus::Delayed {
            pipe.zadd(state.delayed_key(), id, job.run_at.timestamp_millis() as f64);
        } else {
            pipe.zadd(state.waiting_key(job_type), id, job.priority as f64);
        }
        state.stage_body(&mut pipe, &job)?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::backend_for_job("add", id, e))?;

        // Best-effort worker wake; the poll loop catches anything missed
        let _: std::result::Result<i64, _> = redis::cmd("PUBLISH")
            .arg(state.notify_channel(job_type))
            .arg(id)
            .query_async(&mut conn)
            .await;

        Ok(())
    }

    async fn schedule(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<()> {
        let state = &self.state;
        let mut conn = state.conn().await?;

        let exists: bool = redis::cmd("EXISTS")
            .arg(state.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::backend_for_job("EXISTS", id, e))?;
        if exists {
            return Err(QueueError::invalid_state(format!("job '{}' already exists", id)));
        }

        let job = Job::scheduled(id, job_type, data, delay_ms, &state.config);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(state.types_key(), job_type);
        pipe.zadd(state.delayed_key(), id, job.run_at.timestamp_millis() as f64);
        state.stage_body(&mut pipe, &job)?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::backend_for_job("schedule", id, e))?;

        Ok(())
    }

    async fn process(&self, job_type: &str, handler: JobHandler) -> Result<()> {
        self.state.registry.register(job_type, handler).await;
        self.state.wake.notify_one();
        Ok(())
    }

    async fn pause(&self, job_type: Option<&str>) -> Result<()> {
        let state = &self.state;
        let mut conn = state.conn().await?;
        match job_type {
            Some(t) => {
                redis::cmd("SADD")
                    .arg(state.paused_key())
                    .arg(t)
                    .query_async::<i64>(&mut conn)
                    .await
                    .map_err(|e| QueueError::backend("SADD", e))?;
            }
            None => {
                redis::cmd("SET")
                    .arg(state.paused_all_key())
                    .arg(1)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| QueueError::backend("SET", e))?;
            }
        }
        Ok(())
    }

    async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        let state = &self.state;
        let mut conn = state.conn().await?;
        match job_type {
            Some(t) => {
                redis::cmd("SREM")
                    .arg(state.paused_key())
                    .arg(t)
                    .query_async::<i64>(&mut conn)
                    .await
                    .map_err(|e| QueueError::backend("SREM", e))?;
            }
            None => {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.del(state.paused_all_key());
                pipe.del(state.paused_key());
                pipe.query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| QueueError::backend("resume", e))?;
            }
        }
        self.state.wake.notify_one();
        Ok(())
    }

    async fn get_stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        let state = &self.state;
        let mut conn = state.conn().await?;
        let types = self.known_types(&mut conn, job_type).await?;
        let (all_paused, paused) = state.pause_flags(&mut conn).await?;

        let mut stats = QueueStats::default();

        for t in &types {
            let waiting: u64 = redis::cmd("ZCARD")
                .arg(state.waiting_key(t))
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend("ZCARD", e))?;
            let active: u64 = redis::cmd("ZCARD")
                .arg(state.active_key(t))
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend("ZCARD", e))?;
            let completed: u64 = redis::cmd("ZCARD")
                .arg(state.terminal_key(t, JobStatus::Completed))
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend("ZCARD", e))?;
            let failed: u64 = redis::cmd("ZCARD")
                .arg(state.terminal_key(t, JobStatus::Failed))
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend("ZCARD", e))?;

            stats.waiting += waiting;
            stats.active += active;
            stats.completed += completed;
            stats.failed += failed;
            if RedisState::is_paused(all_paused, &paused, t) {
                stats.paused += waiting;
            }
        }

        // The delayed zset mixes scheduled jobs (delayed) and backed-off
        // retries (waiting); split by the body status
        let delayed_ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(state.delayed_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::backend("ZRANGE", e))?;

        for id in delayed_ids {
            let fields: (Option<String>, Option<String>) = redis::cmd("HMGET")
                .arg(state.job_key(&id))
                .arg("status")
                .arg("type")
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend_for_job("HMGET", &id, e))?;
            let (Some(status), Some(t)) = fields else {
                continue;
            };
            if let Some(scope) = job_type {
                if t != scope {
                    continue;
                }
            }
            match JobStatus::parse(&status) {
                Some(JobStatus::Delayed) => stats.delayed += 1,
                Some(JobStatus::Waiting) => {
                    stats.waiting += 1;
                    if RedisState::is_paused(all_paused, &paused, &t) {
                        stats.paused += 1;
                    }
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn get_jobs(
        &self,
        status: JobStatus,
        job_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        let state = &self.state;
        let mut conn = state.conn().await?;
        let types = self.known_types(&mut conn, job_type).await?;
        let ids = self.status_members(&mut conn, status, &types).await?;

        let mut jobs = Vec::new();
        for id in ids {
            if let Some(job) = state.load_job(&mut conn, &id).await? {
                if job.status == status && job_type.map_or(true, |t| job.job_type == t) {
                    jobs.push(job);
                }
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.unwrap_or(DEFAULT_JOB_LIST_LIMIT));
        Ok(jobs)
    }

    async fn retry(&self, id: &str) -> Result<()> {
        let state = &self.state;
        let mut conn = state.conn().await?;

        let mut job = state
            .load_job(&mut conn, id)
            .await?
            .ok_or_else(|| QueueError::not_found(format!("job '{}'", id)))?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(format!(
                "cannot retry job '{}' in status '{}'",
                id, job.status
            )));
        }

        job.reset_for_retry(Utc::now());

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(state.terminal_key(&job.job_type, JobStatus::Failed), id);
        pipe.zadd(state.waiting_key(&job.job_type), id, job.priority as f64);
        state.stage_body(&mut pipe, &job)?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::backend_for_job("retry", id, e))?;

        self.state.wake.notify_one();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let state = &self.state;
        let mut conn = state.conn().await?;

        let job = state
            .load_job(&mut conn, id)
            .await?
            .ok_or_else(|| QueueError::not_found(format!("job '{}'", id)))?;
        if job.status == JobStatus::Active {
            return Err(QueueError::invalid_state(format!(
                "cannot remove active job '{}'",
                id
            )));
        }

        // Win the id's queue membership before touching the body. Claiming
        // and promotion serialize on the same ZREM counts, so a winner here
        // owns the job outright and the finalize path can never write a
        // deleted hash back.
        let (from_waiting, from_delayed, from_completed, from_failed): (i64, i64, i64, i64) =
            redis::pipe()
                .zrem(state.waiting_key(&job.job_type), id)
                .zrem(state.delayed_key(), id)
                .zrem(state.terminal_key(&job.job_type, JobStatus::Completed), id)
                .zrem(state.terminal_key(&job.job_type, JobStatus::Failed), id)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend_for_job("remove", id, e))?;

        if from_waiting + from_delayed + from_completed + from_failed == 0 {
            // A worker claimed the job between the status read and the
            // ZREMs; the job is now active (or already gone)
            return match state.load_job(&mut conn, id).await? {
                Some(_) => Err(QueueError::invalid_state(format!(
                    "cannot remove active job '{}'",
                    id
                ))),
                None => Err(QueueError::not_found(format!("job '{}'", id))),
            };
        }

        redis::cmd("DEL")
            .arg(state.job_key(id))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| QueueError::backend_for_job("remove", id, e))?;
        Ok(())
    }

    async fn clean(&self, status: JobStatus, grace_ms: Option<u64>) -> Result<()> {
        require_terminal(status)?;
        let state = &self.state;
        let mut conn = state.conn().await?;
        let grace = grace_ms.unwrap_or(DEFAULT_CLEAN_GRACE_MS);
        let cutoff = Utc::now().timestamp_millis() - grace as i64;

        let types = self.known_types(&mut conn, None).await?;
        for t in types {
            let key = state.terminal_key(&t, status);
            let old: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(cutoff)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::backend("ZRANGEBYSCORE", e))?;

            if old.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &old {
                pipe.zrem(&key, id);
                pipe.del(state.job_key(id));
            }
            pipe.query_async::<()>(&mut conn)
                .await
                .map_err(|e| QueueError::backend("clean", e))?;

            tracing::debug!(job_type = %t, removed = old.len(), status = %status, "Cleaned old terminal jobs");
        }
        Ok(())
    }

    async fn get_health(&self) -> HealthReport {
        match self.state.conn().await {
            Ok(mut conn) => {
                let ping: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                match ping {
                    Ok(_) => HealthReport::healthy(),
                    Err(e) => HealthReport::degraded(format!("Redis ping failed: {}", e)),
                }
            }
            Err(e) => HealthReport::unhealthy(format!("Redis disconnected: {}", e)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.wake.notify_waiters();

        for handle_slot in [&self.poll_handle, &self.notify_handle] {
            let mut guard = handle_slot.lock().await;
            if let Some(handle) = guard.take() {
                let abort = handle.abort_handle();
                match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                    Ok(_) => tracing::debug!("Redis transport task stopped cleanly"),
                    Err(_) => {
                        // The pub/sub listener can be parked on a message
                        // stream with nothing arriving
                        abort.abort();
                        tracing::warn!("Redis transport task did not stop within timeout");
                    }
                }
            }
        }

        let deadline = std::time::Duration::from_millis(
            self.state.config.worker.graceful_shutdown_timeout_ms,
        );
        let drained = tokio::time::timeout(deadline, async {
            loop {
                if self.state.in_flight.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            let remaining = self.state.in_flight.lock().await.len();
            tracing::warn!(remaining, "Closed Redis transport with jobs still in flight");
        }

        // The shared redis::Client stays untouched; other subsystems may
        // still hold connections from it
        Ok(())
    }
}
