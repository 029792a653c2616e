//! Queue facade
//!
//! Selects a transport from configuration and exposes the public job-queue
//! API to application code. All transports honor the same contract, so the
//! facade is a thin delegation layer plus ergonomic helpers.

use crate::config::{QueueBackend, QueueConfig};
use crate::error::Result;
use crate::health::HealthReport;
use crate::job::{Job, JobOptions, JobStatus, QueueStats};
use crate::transport::{HandlerFuture, JobContext, JobHandler, MemoryTransport, Transport};
use std::sync::Arc;

#[cfg(feature = "redis-backend")]
use crate::transport::RedisTransport;

#[cfg(feature = "postgres-backend")]
use crate::transport::DatabaseTransport;

/// A background job queue over a configured backend
///
/// # Example
///
/// ```rust,no_run
/// use conveyor::{Queue, QueueConfig, JobOptions};
///
/// # async fn run() -> conveyor::Result<()> {
/// let queue = Queue::memory(QueueConfig::default());
///
/// queue
///     .process("email", |ctx| {
///         Box::pin(async move {
///             let to = ctx.data["to"].as_str().unwrap_or_default().to_string();
///             // ... send the email ...
///             Ok(serde_json::json!({ "delivered_to": to }))
///         })
///     })
///     .await?;
///
/// queue
///     .add("j1", "email", serde_json::json!({"to": "a@b.com"}), JobOptions::with_priority(5))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Queue {
    transport: Arc<dyn Transport>,
}

impl Queue {
    /// Create a queue over the in-memory transport
    pub fn memory(config: QueueConfig) -> Self {
        Self {
            transport: Arc::new(MemoryTransport::new(config)),
        }
    }

    /// Create a queue over the Redis transport (`config.redis.url` required)
    #[cfg(feature = "redis-backend")]
    pub fn redis(config: QueueConfig) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(RedisTransport::new(config)?),
        })
    }

    /// Create a queue over the database transport using an existing pool
    #[cfg(feature = "postgres-backend")]
    pub async fn database(pool: sqlx::PgPool, config: QueueConfig) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(DatabaseTransport::new(pool, config).await?),
        })
    }

    /// Create a queue selecting the backend from `config.backend`
    ///
    /// The database backend connects via `config.database.url`; use
    /// [`Queue::database`] to supply an existing pool instead.
    pub async fn from_config(config: QueueConfig) -> Result<Self> {
        match config.backend {
            QueueBackend::Memory => Ok(Self::memory(config)),
            #[cfg(feature = "redis-backend")]
            QueueBackend::Redis => Self::redis(config),
            #[cfg(feature = "postgres-backend")]
            QueueBackend::Database => {
                let url = config.database.url.clone().ok_or_else(|| {
                    crate::error::QueueError::configuration_missing(
                        "database.url is required for the database backend",
                    )
                })?;
                let pool = sqlx::PgPool::connect(&url).await.map_err(|e| {
                    crate::error::QueueError::not_connected(format!(
                        "Failed to connect to database: {}",
                        e
                    ))
                })?;
                Self::database(pool, config).await
            }
        }
    }

    /// Wrap a pre-built transport (useful for tests and custom backends)
    pub fn from_transport(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Insert a job with a caller-supplied id, eligible immediately
    pub async fn add(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<()> {
        self.transport.add(id, job_type, data, options).await
    }

    /// Insert a job with a generated id; returns the id
    pub async fn add_job(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.transport.add(&id, job_type, data, options).await?;
        Ok(id)
    }

    /// Insert a delayed job with a caller-supplied id
    pub async fn schedule(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<()> {
        self.transport.schedule(id, job_type, data, delay_ms).await
    }

    /// Insert a delayed job with a generated id; returns the id
    pub async fn schedule_job(
        &self,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.transport
            .schedule(&id, job_type, data, delay_ms)
            .await?;
        Ok(id)
    }

    /// Register the handler for a job type (last registration wins)
    pub async fn process<F>(&self, job_type: &str, handler: F) -> Result<()>
    where
        F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
    {
        let handler: JobHandler = Arc::new(handler);
        self.transport.process(job_type, handler).await
    }

    /// Pause claiming for one type, or all registered types when `None`
    pub async fn pause(&self, job_type: Option<&str>) -> Result<()> {
        self.transport.pause(job_type).await
    }

    /// Resume claiming for one type, or all
    pub async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        self.transport.resume(job_type).await
    }

    /// Per-status counts, optionally scoped to one job type
    pub async fn get_stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        self.transport.get_stats(job_type).await
    }

    /// Jobs in a given status, newest first
    pub async fn get_jobs(
        &self,
        status: JobStatus,
        job_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        self.transport.get_jobs(status, job_type, limit).await
    }

    /// Reset a failed job to waiting
    pub async fn retry(&self, id: &str) -> Result<()> {
        self.transport.retry(id).await
    }

    /// Delete a job that is not active
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.transport.remove(id).await
    }

    /// Delete terminal jobs older than the grace period (default 24h)
    pub async fn clean(&self, status: JobStatus, grace_ms: Option<u64>) -> Result<()> {
        self.transport.clean(status, grace_ms).await
    }

    /// Backend capacity/connectivity probe
    pub async fn get_health(&self) -> HealthReport {
        self.transport.get_health().await
    }

    /// Stop timers, drain in-flight jobs up to the configured timeout, and
    /// release resources
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
