//! Configuration for the job queue
//!
//! All knobs can be loaded from the environment via [`QueueConfig::from_env`],
//! checking `CONVEYOR_{KEY}` first and falling back to `{KEY}`.

use serde::{Deserialize, Serialize};

/// Get environment variable with CONVEYOR_ prefix, falling back to the
/// unprefixed name
pub(crate) fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("CONVEYOR_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Queue backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process queue (for development, testing and single instances)
    Memory,
    /// Redis-backed distributed queue
    #[cfg(feature = "redis-backend")]
    Redis,
    /// Relational-table polling queue (durable, low throughput)
    #[cfg(feature = "postgres-backend")]
    Database,
}

impl Default for QueueBackend {
    fn default() -> Self {
        Self::Memory
    }
}

/// Retry delay growth mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// Same delay on every retry
    Fixed,
    /// Delay doubles per attempt: `base * 2^(attempts-1)`
    Exponential,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Worker loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// When false the transport never starts poll/cleanup tasks
    /// (producer-only mode)
    #[serde(default = "default_worker_enabled")]
    pub enabled: bool,

    /// Bounded wait for in-flight jobs during `close()`, in milliseconds
    #[serde(default = "default_graceful_shutdown_timeout_ms")]
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_worker_enabled(),
            graceful_shutdown_timeout_ms: default_graceful_shutdown_timeout_ms(),
        }
    }
}

/// Memory transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Total stored job ceiling, enforced at add/schedule time
    #[serde(default = "default_memory_max_jobs")]
    pub max_jobs: usize,

    /// Interval between automatic terminal-job cleanup sweeps, in milliseconds
    #[serde(default = "default_memory_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_memory_max_jobs(),
            cleanup_interval_ms: default_memory_cleanup_interval_ms(),
        }
    }
}

/// Redis transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379")
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix applied to every key this queue touches
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,

    /// Connection attempts per operation before giving up
    #[serde(default = "default_redis_max_retries")]
    pub max_retries_per_request: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_redis_key_prefix(),
            max_retries_per_request: default_redis_max_retries(),
        }
    }
}

/// Database transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL (only needed when the caller does not
    /// provide a pool)
    #[serde(default)]
    pub url: Option<String>,

    /// Poll loop interval in milliseconds
    #[serde(default = "default_database_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            poll_interval_ms: default_database_poll_interval_ms(),
        }
    }
}

/// Configuration for a job queue instance
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Queue backend type
    #[serde(default)]
    pub backend: QueueBackend,

    /// Maximum jobs concurrently in the `active` state
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default attempt ceiling (overridable per job)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Priority assigned when the caller specifies none
    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Retry delay growth mode
    #[serde(default)]
    pub retry_backoff: RetryBackoff,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            default_priority: default_priority(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: RetryBackoff::default(),
            worker: WorkerConfig::default(),
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load queue configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(backend) = get_env_with_prefix("QUEUE_BACKEND") {
            config.backend = match backend.to_lowercase().as_str() {
                #[cfg(feature = "redis-backend")]
                "redis" => QueueBackend::Redis,
                #[cfg(feature = "postgres-backend")]
                "database" | "postgres" => QueueBackend::Database,
                _ => QueueBackend::Memory,
            };
        }

        if let Some(v) = get_env_with_prefix("QUEUE_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                config.concurrency = n;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                config.max_attempts = n;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_DEFAULT_PRIORITY") {
            if let Ok(n) = v.parse() {
                config.default_priority = n;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_RETRY_DELAY_MS") {
            if let Ok(n) = v.parse() {
                config.retry_delay_ms = n;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_RETRY_BACKOFF") {
            config.retry_backoff = match v.to_lowercase().as_str() {
                "fixed" => RetryBackoff::Fixed,
                _ => RetryBackoff::Exponential,
            };
        }

        if let Some(v) = get_env_with_prefix("QUEUE_WORKER_ENABLED") {
            if let Ok(b) = v.parse() {
                config.worker.enabled = b;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_SHUTDOWN_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                config.worker.graceful_shutdown_timeout_ms = n;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_MEMORY_MAX_JOBS") {
            if let Ok(n) = v.parse() {
                config.memory.max_jobs = n;
            }
        }

        if let Some(v) = get_env_with_prefix("QUEUE_MEMORY_CLEANUP_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                config.memory.cleanup_interval_ms = n;
            }
        }

        if let Some(url) = get_env_with_prefix("QUEUE_REDIS_URL") {
            config.redis.url = Some(url);
        }

        if let Some(prefix) = get_env_with_prefix("QUEUE_REDIS_KEY_PREFIX") {
            config.redis.key_prefix = prefix;
        }

        if let Some(v) = get_env_with_prefix("QUEUE_REDIS_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                config.redis.max_retries_per_request = n;
            }
        }

        if let Some(url) = get_env_with_prefix("QUEUE_DATABASE_URL") {
            config.database.url = Some(url);
        }

        if let Some(v) = get_env_with_prefix("QUEUE_DATABASE_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                config.database.poll_interval_ms = n;
            }
        }

        config
    }
}

fn default_worker_enabled() -> bool {
    true
}

fn default_graceful_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_memory_max_jobs() -> usize {
    10_000
}

fn default_memory_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_redis_key_prefix() -> String {
    "conveyor:".to_string()
}

fn default_redis_max_retries() -> u32 {
    3
}

fn default_database_poll_interval_ms() -> u64 {
    5_000
}

fn default_concurrency() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_priority() -> i32 {
    0
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = QueueConfig::default();
        assert_eq!(config.backend, QueueBackend::Memory);
        assert!(config.concurrency > 0);
        assert!(config.max_attempts > 0);
        assert_eq!(config.retry_backoff, RetryBackoff::Exponential);
        assert!(config.worker.enabled);
    }

    #[test]
    fn malformed_worker_enabled_keeps_prior_value() {
        std::env::set_var("CONVEYOR_QUEUE_WORKER_ENABLED", "definitely");
        assert!(QueueConfig::from_env().worker.enabled);

        std::env::set_var("CONVEYOR_QUEUE_WORKER_ENABLED", "false");
        assert!(!QueueConfig::from_env().worker.enabled);

        std::env::remove_var("CONVEYOR_QUEUE_WORKER_ENABLED");
    }

    #[test]
    fn deserializes_partial_config() {
        let config: QueueConfig = serde_json::from_str(
            r#"{"concurrency": 2, "retry_backoff": "fixed", "memory": {"max_jobs": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.retry_backoff, RetryBackoff::Fixed);
        assert_eq!(config.memory.max_jobs, 50);
        assert_eq!(config.max_attempts, default_max_attempts());
    }
}
