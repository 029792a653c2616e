//! Conveyor - a multi-backend background job queue
//!
//! Conveyor provides one uniform job-queue interface over three storage
//! backends: in-process memory, Redis, and relational-table polling. All
//! backends share the same job lifecycle (`delayed -> waiting -> active ->
//! completed | waiting | failed`), retry/backoff behavior, priority
//! scheduling and concurrency-bounded worker loop.
//!
//! # Features
//!
//! - **Backends**: memory (development/testing), Redis (distributed
//!   workers), Postgres (durable low-throughput queuing)
//! - **Atomic claiming**: at most one worker wins a job, enforced with
//!   backend-native primitives
//! - **Retries**: fixed or exponential backoff with ±25% jitter
//! - **Scheduling**: delayed jobs promoted once due
//! - **Priorities**: higher priority claimed first
//! - **Graceful shutdown**: bounded wait for in-flight jobs on `close()`
//!
//! Delivery is at-least-once; handlers are expected to be idempotent.
//! There is no per-job execution timeout: a hung handler occupies a
//! concurrency slot until shutdown.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use conveyor::{Queue, QueueConfig, JobOptions};
//!
//! #[tokio::main]
//! async fn main() -> conveyor::Result<()> {
//!     let queue = Queue::from_config(QueueConfig::from_env()).await?;
//!
//!     queue
//!         .process("email", |ctx| {
//!             Box::pin(async move {
//!                 // deliver ctx.data ...
//!                 Ok(serde_json::Value::Null)
//!             })
//!         })
//!         .await?;
//!
//!     queue
//!         .add("welcome-1", "email", serde_json::json!({"to": "a@b.com"}), JobOptions::default())
//!         .await?;
//!
//!     // ... on shutdown:
//!     queue.close().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod config;
mod error;
mod health;
mod job;
mod queue;
pub mod transport;

// Re-exports for public API
pub use config::{
    DatabaseConfig, MemoryConfig, QueueBackend, QueueConfig, RedisConfig, RetryBackoff,
    WorkerConfig,
};
pub use error::{QueueError, Result};
pub use health::{HealthReport, HealthStatus};
pub use job::{Job, JobFailure, JobOptions, JobStatus, QueueStats};
pub use queue::Queue;
pub use transport::{HandlerFuture, JobContext, JobHandler, MemoryTransport, Transport};

#[cfg(feature = "redis-backend")]
pub use transport::RedisTransport;

#[cfg(feature = "postgres-backend")]
pub use transport::DatabaseTransport;
