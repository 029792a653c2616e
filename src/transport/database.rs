//! Relational-table polling queue transport
//!
//! Durable backend for low-throughput queuing against a `conveyor_jobs`
//! table. Multiple worker processes may share the table; the conditional
//! claim update (`... WHERE id = $n AND status = 'pending'`, affected rows
//! checked) is the sole serialization point between them.
//!
//! Storage uses a 4-state vocabulary (`pending`, `processing`, `completed`,
//! `failed`). The public `delayed` status maps to `pending` rows whose
//! `run_at` lies in the future with no attempts yet, and paused types are
//! an in-process set only; neither distinction survives a restart. This
//! mirrors the storage schema rather than papering over it.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE conveyor_jobs (
//!     id           TEXT PRIMARY KEY,
//!     queue        TEXT NOT NULL,
//!     payload      JSONB NOT NULL DEFAULT 'null',
//!     status       TEXT NOT NULL DEFAULT 'pending',
//!     priority     INT NOT NULL DEFAULT 0,
//!     attempts     INT NOT NULL DEFAULT 0,
//!     max_attempts INT NOT NULL DEFAULT 3,
//!     run_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     processed_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     failed_at    TIMESTAMPTZ,
//!     result       JSONB,
//!     error        JSONB
//! );
//! CREATE INDEX conveyor_jobs_claim_idx ON conveyor_jobs (status, run_at, priority DESC);
//! ```

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
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Postgres SQLSTATE for "relation does not exist"
const UNDEFINED_TABLE: &str = "42P01";

/// Postgres SQLSTATE for unique constraint violation
const UNIQUE_VIOLATION: &str = "23505";

struct DatabaseState {
    pool: PgPool,
    config: QueueConfig,
    registry: HandlerRegistry,
    in_flight: Mutex<HashSet<String>>,
    paused: Mutex<HashSet<String>>,
    shutdown: AtomicBool,
}

/// Database-polling job queue transport
#[derive(Clone)]
pub struct DatabaseTransport {
    state: Arc<DatabaseState>,
    poll_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl DatabaseTransport {
    /// Create a new database transport over an existing pool
    ///
    /// Verifies the `conveyor_jobs` table exists and fails fast with
    /// `ConfigurationMissing` if not. Starts the poll task unless
    /// `worker.enabled` is off.
    pub async fn new(pool: PgPool, config: QueueConfig) -> Result<Self> {
        Self::check_table(&pool).await?;

        let state = Arc::new(DatabaseState {
            pool,
            config,
            registry: HandlerRegistry::new(),
            in_flight: Mutex::new(HashSet::new()),
            paused: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        });

        let transport = Self {
            state,
            poll_handle: Arc::new(Mutex::new(None)),
        };

        if transport.state.config.worker.enabled {
            transport.start_poll_task();
        }

        Ok(transport)
    }

    async fn check_table(pool: &PgPool) -> Result<()> {
        match sqlx::query("SELECT 1 FROM conveyor_jobs LIMIT 1")
            .execute(pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
                Err(QueueError::configuration_missing(
                    "table 'conveyor_jobs' does not exist; create it with the schema documented \
                     in the database transport module before using the database backend",
                ))
            }
            Err(e) => Err(QueueError::backend("check_table", e)),
        }
    }

    fn start_poll_task(&self) {
        let state = self.state.clone();
        let interval_ms = self.state.config.database.poll_interval_ms.max(100);

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));

            loop {
                if state.shutdown.load(Ordering::Acquire) {
                    tracing::debug!("Database transport poll loop shutting down");
                    break;
                }

                interval.tick().await;

                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }

                if let Err(e) = Self::run_tick(&state).await {
                    tracing::error!(error = %e, "Database poll tick failed");
                }
            }
        });

        if let Ok(mut guard) = self.poll_handle.try_lock() {
            *guard = Some(handle);
        } else {
            handle.abort();
            tracing::error!("Failed to store database poll handle");
        }
    }

    /// One poll tick: select claimable candidates and attempt the
    /// conditional claim on each
    ///
    /// No separate promotion step exists; `run_at <= now` on `pending`
    /// rows covers delayed jobs and backed-off retries alike.
    async fn run_tick(state: &Arc<DatabaseState>) -> Result<()> {
        let paused = state.paused.lock().await.clone();

        let mut handlers: HashMap<String, JobHandler> = HashMap::new();
        for job_type in state.registry.registered_types().await {
            if !paused.contains(&job_type) {
                if let Some(handler) = state.registry.get(&job_type).await {
                    handlers.insert(job_type, handler);
                }
            }
        }
        if handlers.is_empty() {
            return Ok(());
        }

        let capacity = {
            let in_flight = state.in_flight.lock().await;
            state.config.concurrency.saturating_sub(in_flight.len())
        };
        if capacity == 0 {
            return Ok(());
        }

        let types: Vec<String> = handlers.keys().cloned().collect();
        let now = Utc::now();
        let candidates: Vec<String> = sqlx::query(
            "SELECT id FROM conveyor_jobs \
             WHERE status = 'pending' AND run_at <= $1 AND queue = ANY($2) \
             ORDER BY priority DESC, created_at ASC LIMIT $3",
        )
        .bind(now)
        .bind(&types)
        .bind(capacity as i64)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| QueueError::backend("select_candidates", e))?
        .into_iter()
        .map(|row| row.get::<String, _>("id"))
        .collect();

        for id in candidates {
            match Self::claim(state, &id, now).await {
                Ok(Some(job)) => {
                    let Some(handler) = handlers.get(&job.job_type).cloned() else {
                        continue;
                    };
                    state.in_flight.lock().await.insert(id.clone());
                    let state = state.clone();
                    tokio::spawn(async move {
                        Self::execute_claimed(state, job, handler).await;
                    });
                }
                Ok(None) => {
                    // Another worker process claimed this row first
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Claim attempt failed");
                }
            }
        }

        Ok(())
    }

    /// Conditional row update; exactly one process sees an affected count
    /// of 1 for a given pending row
    async fn claim(
        state: &Arc<DatabaseState>,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let result = sqlx::query(
            "UPDATE conveyor_jobs \
             SET status = 'processing', attempts = attempts + 1, processed_at = $1 \
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(now)
        .bind(id)
        .execute(&state.pool)
        .await
        .map_err(|e| QueueError::backend_for_job("claim", id, e))?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM conveyor_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.pool)
            .await
            .map_err(|e| QueueError::backend_for_job("fetch_claimed", id, e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Run a claimed job's handler and persist the resulting transition
    async fn execute_claimed(state: Arc<DatabaseState>, job: Job, handler: JobHandler) {
        let ctx = JobContext::for_job(&job);
        let job_id = job.id.clone();
        tracing::debug!(job_id = %job_id, job_type = %job.job_type, attempt = job.attempts, "Processing job");

        let outcome = handler(ctx).await;
        let now = Utc::now();

        let persisted: Result<()> = async {
            match outcome {
                Ok(result) => {
                    let stored = if result.is_null() { None } else { Some(result) };
                    sqlx::query(
                        "UPDATE conveyor_jobs \
                         SET status = 'completed', completed_at = $1, result = $2 \
                         WHERE id = $3 AND status = 'processing'",
                    )
                    .bind(now)
                    .bind(stored)
                    .bind(&job_id)
                    .execute(&state.pool)
                    .await
                    .map_err(|e| QueueError::backend_for_job("complete", &job_id, e))?;
                    tracing::info!(job_id = %job_id, "Job completed");
                }
                Err(e) => {
                    let failure = JobFailure::from_message(e.to_string());
                    let error_json = serde_json::to_value(&failure)
                        .unwrap_or(serde_json::Value::Null);

                    if job.attempts < job.max_attempts {
                        let retry_at = backoff::next_run_at(&state.config, job.attempts, now);
                        sqlx::query(
                            "UPDATE conveyor_jobs \
                             SET status = 'pending', run_at = $1, error = $2 \
                             WHERE id = $3 AND status = 'processing'",
                        )
                        .bind(retry_at)
                        .bind(&error_json)
                        .bind(&job_id)
                        .execute(&state.pool)
                        .await
                        .map_err(|err| QueueError::backend_for_job("fail_retry", &job_id, err))?;
                        tracing::warn!(
                            job_id = %job_id,
                            attempt = job.attempts,
                            error = %e,
                            "Job failed, retry scheduled"
                        );
                    } else {
                        sqlx::query(
                            "UPDATE conveyor_jobs \
                             SET status = 'failed', failed_at = $1, error = $2 \
                             WHERE id = $3 AND status = 'processing'",
                        )
                        .bind(now)
                        .bind(&error_json)
                        .bind(&job_id)
                        .execute(&state.pool)
                        .await
                        .map_err(|err| QueueError::backend_for_job("fail_final", &job_id, err))?;
                        tracing::warn!(
                            job_id = %job_id,
                            attempts = job.attempts,
                            error = %e,
                            "Job failed permanently"
                        );
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = persisted {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job outcome; row left processing for re-inspection");
        }

        state.in_flight.lock().await.remove(&job_id);
    }

    /// SQL predicate matching rows in the given public status
    ///
    /// Every predicate consumes one `$1` timestamp bind so callers can
    /// bind uniformly regardless of status.
    fn status_predicate(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Waiting => {
                "status = 'pending' AND NOT (run_at > $1 AND attempts = 0)"
            }
            JobStatus::Delayed => "status = 'pending' AND run_at > $1 AND attempts = 0",
            JobStatus::Active => "status = 'processing' AND $1::timestamptz IS NOT NULL",
            JobStatus::Completed => "status = 'completed' AND $1::timestamptz IS NOT NULL",
            JobStatus::Failed => "status = 'failed' AND $1::timestamptz IS NOT NULL",
        }
    }

    async fn count_where(&self, predicate: &str, job_type: Option<&str>) -> Result<u64> {
        let now = Utc::now();
        let count: i64 = match job_type {
            Some(t) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM conveyor_jobs WHERE {} AND queue = $2",
                    predicate
                );
                sqlx::query_scalar(&sql)
                    .bind(now)
                    .bind(t)
                    .fetch_one(&self.state.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT COUNT(*) FROM conveyor_jobs WHERE {}", predicate);
                sqlx::query_scalar(&sql)
                    .bind(now)
                    .fetch_one(&self.state.pool)
                    .await
            }
        }
        .map_err(|e| QueueError::backend("count", e))?;
        Ok(count as u64)
    }
}

/// Map a table row onto the public job record
///
/// The public status is derived from the stored 4-state vocabulary:
/// `pending` splits into `delayed` (future `run_at`, no attempts) and
/// `waiting`.
fn job_from_row(row: &PgRow) -> Result<Job> {
    let wrap = |e: sqlx::Error| QueueError::backend("decode_row", e);

    let stored: String = row.try_get("status").map_err(wrap)?;
    let run_at: DateTime<Utc> = row.try_get("run_at").map_err(wrap)?;
    let attempts: i32 = row.try_get("attempts").map_err(wrap)?;

    let status = match stored.as_str() {
        "pending" => {
            if run_at > Utc::now() && attempts == 0 {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            }
        }
        "processing" => JobStatus::Active,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        other => {
            return Err(QueueError::backend(
                "decode_row",
                format!("unknown stored status '{}'", other),
            ))
        }
    };

    let error: Option<serde_json::Value> = row.try_get("error").map_err(wrap)?;
    let error = error
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value::<JobFailure>(v).ok());

    Ok(Job {
        id: row.try_get("id").map_err(wrap)?,
        job_type: row.try_get("queue").map_err(wrap)?,
        data: row.try_get("payload").map_err(wrap)?,
        status,
        priority: row.try_get("priority").map_err(wrap)?,
        attempts: attempts.max(0) as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(wrap)?.max(1) as u32,
        created_at: row.try_get("created_at").map_err(wrap)?,
        run_at,
        processed_at: row.try_get("processed_at").map_err(wrap)?,
        completed_at: row.try_get("completed_at").map_err(wrap)?,
        failed_at: row.try_get("failed_at").map_err(wrap)?,
        result: row
            .try_get::<Option<serde_json::Value>, _>("result")
            .map_err(wrap)?
            .filter(|v| !v.is_null()),
        error,
    })
}

#[async_trait]
impl Transport for DatabaseTransport {
    async fn add(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<()> {
        let config = &self.state.config;
        let now = Utc::now();
        let run_at = match options.delay_ms {
            Some(delay_ms) if delay_ms > 0 => now + Duration::milliseconds(delay_ms as i64),
            _ => now,
        };
        let priority = options.priority.unwrap_or(config.default_priority);
        let max_attempts = options.attempts.unwrap_or(config.max_attempts).max(1);

        let result = sqlx::query(
            "INSERT INTO conveyor_jobs \
             (id, queue, payload, status, priority, attempts, max_attempts, run_at, created_at) \
             VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6, $7)",
        )
        .bind(id)
        .bind(job_type)
        .bind(&data)
        .bind(priority)
        .bind(max_attempts as i32)
        .bind(run_at)
        .bind(now)
        .execute(&self.state.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(QueueError::invalid_state(format!("job '{}' already exists", id)))
            }
            Err(e) => Err(QueueError::backend_for_job("add", id, e)),
        }
    }

    async fn schedule(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<()> {
        self.add(
            id,
            job_type,
            data,
            JobOptions {
                delay_ms: Some(delay_ms),
                ..Default::default()
            },
        )
        .await
    }

    async fn process(&self, job_type: &str, handler: JobHandler) -> Result<()> {
        self.state.registry.register(job_type, handler).await;
        Ok(())
    }

    async fn pause(&self, job_type: Option<&str>) -> Result<()> {
        let mut paused = self.state.paused.lock().await;
        match job_type {
            Some(t) => {
                paused.insert(t.to_string());
            }
            None => {
                for t in self.state.registry.registered_types().await {
                    paused.insert(t);
                }
            }
        }
        Ok(())
    }

    async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        let mut paused = self.state.paused.lock().await;
        match job_type {
            Some(t) => {
                paused.remove(t);
            }
            None => paused.clear(),
        }
        Ok(())
    }

    async fn get_stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        let mut stats = QueueStats {
            waiting: self
                .count_where(Self::status_predicate(JobStatus::Waiting), job_type)
                .await?,
            active: self
                .count_where(Self::status_predicate(JobStatus::Active), job_type)
                .await?,
            completed: self
                .count_where(Self::status_predicate(JobStatus::Completed), job_type)
                .await?,
            failed: self
                .count_where(Self::status_predicate(JobStatus::Failed), job_type)
                .await?,
            delayed: self
                .count_where(Self::status_predicate(JobStatus::Delayed), job_type)
                .await?,
            paused: 0,
        };

        let paused_types: Vec<String> = {
            let paused = self.state.paused.lock().await;
            match job_type {
                Some(t) if !paused.contains(t) => Vec::new(),
                Some(t) => vec![t.to_string()],
                None => paused.iter().cloned().collect(),
            }
        };
        if !paused_types.is_empty() {
            let now = Utc::now();
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM conveyor_jobs \
                 WHERE status = 'pending' AND NOT (run_at > $1 AND attempts = 0) \
                 AND queue = ANY($2)",
            )
            .bind(now)
            .bind(&paused_types)
            .fetch_one(&self.state.pool)
            .await
            .map_err(|e| QueueError::backend("count_paused", e))?;
            stats.paused = count as u64;
        }

        Ok(stats)
    }

    async fn get_jobs(
        &self,
        status: JobStatus,
        job_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        let predicate = Self::status_predicate(status);
        let limit = limit.unwrap_or(DEFAULT_JOB_LIST_LIMIT) as i64;
        let now = Utc::now();

        let rows = match job_type {
            Some(t) => {
                let sql = format!(
                    "SELECT * FROM conveyor_jobs WHERE {} AND queue = $2 \
                     ORDER BY created_at DESC LIMIT $3",
                    predicate
                );
                sqlx::query(&sql)
                    .bind(now)
                    .bind(t)
                    .bind(limit)
                    .fetch_all(&self.state.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT * FROM conveyor_jobs WHERE {} \
                     ORDER BY created_at DESC LIMIT $2",
                    predicate
                );
                sqlx::query(&sql)
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&self.state.pool)
                    .await
            }
        }
        .map_err(|e| QueueError::backend("get_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn retry(&self, id: &str) -> Result<()> {
        let row = sqlx::query("SELECT status FROM conveyor_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.state.pool)
            .await
            .map_err(|e| QueueError::backend_for_job("retry", id, e))?
            .ok_or_else(|| QueueError::not_found(format!("job '{}'", id)))?;

        let stored: String = row
            .try_get("status")
            .map_err(|e| QueueError::backend_for_job("retry", id, e))?;
        if stored != "failed" {
            return Err(QueueError::invalid_state(format!(
                "cannot retry job '{}' in status '{}'",
                id, stored
            )));
        }

        sqlx::query(
            "UPDATE conveyor_jobs \
             SET status = 'pending', attempts = 0, error = NULL, failed_at = NULL, run_at = $1 \
             WHERE id = $2 AND status = 'failed'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.state.pool)
        .await
        .map_err(|e| QueueError::backend_for_job("retry", id, e))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let row = sqlx::query("SELECT status FROM conveyor_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.state.pool)
            .await
            .map_err(|e| QueueError::backend_for_job("remove", id, e))?
            .ok_or_else(|| QueueError::not_found(format!("job '{}'", id)))?;

        let stored: String = row
            .try_get("status")
            .map_err(|e| QueueError::backend_for_job("remove", id, e))?;
        if stored == "processing" {
            return Err(QueueError::invalid_state(format!(
                "cannot remove active job '{}'",
                id
            )));
        }

        sqlx::query("DELETE FROM conveyor_jobs WHERE id = $1 AND status != 'processing'")
            .bind(id)
            .execute(&self.state.pool)
            .await
            .map_err(|e| QueueError::backend_for_job("remove", id, e))?;
        Ok(())
    }

    async fn clean(&self, status: JobStatus, grace_ms: Option<u64>) -> Result<()> {
        require_terminal(status)?;
        let grace = grace_ms.unwrap_or(DEFAULT_CLEAN_GRACE_MS);
        let cutoff = Utc::now() - Duration::milliseconds(grace as i64);

        let (stored, timestamp_col) = match status {
            JobStatus::Completed => ("completed", "completed_at"),
            _ => ("failed", "failed_at"),
        };
        let sql = format!(
            "DELETE FROM conveyor_jobs WHERE status = $1 AND COALESCE({}, created_at) < $2",
            timestamp_col
        );
        let result = sqlx::query(&sql)
            .bind(stored)
            .bind(cutoff)
            .execute(&self.state.pool)
            .await
            .map_err(|e| QueueError::backend("clean", e))?;

        if result.rows_affected() > 0 {
            tracing::debug!(removed = result.rows_affected(), status = %status, "Cleaned old terminal jobs");
        }
        Ok(())
    }

    async fn get_health(&self) -> HealthReport {
        let probe = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            sqlx::query("SELECT 1").execute(&self.state.pool),
        )
        .await;

        match probe {
            Ok(Ok(_)) => HealthReport::healthy(),
            Ok(Err(e)) => HealthReport::unhealthy(format!("database probe failed: {}", e)),
            Err(_) => HealthReport::degraded("database probe timed out".to_string()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::Release);

        let mut guard = self.poll_handle.lock().await;
        if let Some(handle) = guard.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(
                (self.state.config.database.poll_interval_ms / 1000).max(5),
            ), handle)
            .await
            {
                Ok(_) => tracing::debug!("Database transport poll task stopped cleanly"),
                Err(_) => tracing::warn!("Database transport poll task did not stop within timeout"),
            }
        }
        drop(guard);

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
            tracing::warn!(remaining, "Closed database transport with jobs still in flight");
        }

        // The pool is caller-owned; leave it open
        Ok(())
    }
}
