//! Queue transports
//!
//! A transport is a backend-specific implementation of the uniform job-queue
//! contract. Three backends are provided: in-process memory, Redis, and
//! relational-table polling.

mod memory;
mod registry;

#[cfg(feature = "redis-backend")]
mod redis;

#[cfg(feature = "postgres-backend")]
mod database;

pub use memory::MemoryTransport;
pub use registry::HandlerRegistry;

#[cfg(feature = "redis-backend")]
pub use redis::RedisTransport;

#[cfg(feature = "postgres-backend")]
pub use database::DatabaseTransport;

use crate::error::Result;
use crate::health::HealthReport;
use crate::job::{Job, JobOptions, JobStatus, QueueStats};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Default result cap for `get_jobs`
pub const DEFAULT_JOB_LIST_LIMIT: usize = 100;

/// Default grace period for `clean`: 24 hours
pub const DEFAULT_CLEAN_GRACE_MS: u64 = 24 * 60 * 60 * 1000;

/// Execution context handed to a job handler
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: String,
    pub job_type: String,
    pub data: serde_json::Value,
    /// 1-based attempt number for this execution
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub(crate) fn for_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type.clone(),
            data: job.data.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
        }
    }
}

/// Future type returned by job handlers
pub type HandlerFuture = BoxFuture<'static, Result<serde_json::Value>>;

/// Type alias for registered job handler functions
///
/// A handler receives the [`JobContext`] and returns a JSON value that is
/// stored as the job's `result` (return `Value::Null` to store nothing).
pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Uniform job-queue contract implemented by every backend
///
/// All transports share the same state machine (`delayed -> waiting ->
/// active -> completed | waiting | failed`) and honor the same error
/// taxonomy; only the storage and claim primitives differ.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Insert a job in `waiting` state, eligible immediately
    ///
    /// Fails with `CapacityExceeded` when a backend job ceiling is reached
    /// and `InvalidState` when the id already exists.
    async fn add(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<()>;

    /// Insert a job in `delayed` state with `run_at = now + delay_ms`
    async fn schedule(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<()>;

    /// Register the handler for a job type
    ///
    /// A second registration for the same type replaces the first
    /// (last wins, not an error).
    async fn process(&self, job_type: &str, handler: JobHandler) -> Result<()>;

    /// Pause claiming for one type, or for all registered types when `None`
    ///
    /// Queued jobs of a paused type stay in place. Idempotent.
    async fn pause(&self, job_type: Option<&str>) -> Result<()>;

    /// Resume claiming for one type, or all. A no-op for types never paused.
    async fn resume(&self, job_type: Option<&str>) -> Result<()>;

    /// Per-status counts, optionally scoped to one job type
    async fn get_stats(&self, job_type: Option<&str>) -> Result<QueueStats>;

    /// Jobs in a given status, newest first, capped at `limit` (default 100)
    async fn get_jobs(
        &self,
        status: JobStatus,
        job_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>>;

    /// Reset a `failed` job to `waiting` with attempts and error cleared
    ///
    /// Fails with `NotFound` for an unknown id and `InvalidState` for a job
    /// that is not `failed`; neither failure mutates the job.
    async fn retry(&self, id: &str) -> Result<()>;

    /// Delete a job that is not `active`
    ///
    /// Fails with `NotFound` for an unknown id and `InvalidState` for an
    /// `active` job.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Delete terminal jobs older than `grace_ms` (default 24h)
    ///
    /// The age check uses the terminal-transition timestamp, falling back
    /// to creation time. Non-terminal statuses are rejected.
    async fn clean(&self, status: JobStatus, grace_ms: Option<u64>) -> Result<()>;

    /// Backend capacity/connectivity probe
    async fn get_health(&self) -> HealthReport;

    /// Stop internal timers, wait up to the graceful-shutdown timeout for
    /// in-flight jobs, then release resources
    ///
    /// Shared connections owned by other subsystems are left untouched.
    async fn close(&self) -> Result<()>;
}

/// Validate that `status` is terminal, as `clean` requires
pub(crate) fn require_terminal(status: JobStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(crate::error::QueueError::invalid_state(format!(
            "clean() only accepts terminal statuses, got '{}'",
            status
        )))
    }
}
