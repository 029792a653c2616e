//! In-memory queue transport
//!
//! Stores jobs in a single map keyed by job id and runs a timer-driven poll
//! loop. Suitable for development, testing and single-instance deployments;
//! jobs do not survive a restart.

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
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Scheduler tick interval
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Age after which completed jobs are swept automatically
const COMPLETED_RETENTION_MS: i64 = 60 * 60 * 1000;

/// Age after which failed jobs are swept automatically
const FAILED_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

struct MemoryState {
    config: QueueConfig,
    jobs: Mutex<HashMap<String, Job>>,
    /// Job ids currently executing; membership bounds concurrency
    in_flight: Mutex<HashSet<String>>,
    paused: Mutex<HashSet<String>>,
    registry: HandlerRegistry,
    shutdown: AtomicBool,
}

/// In-memory job queue transport
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<MemoryState>,
    scheduler_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    cleanup_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl MemoryTransport {
    /// Create a new in-memory transport
    ///
    /// Starts the scheduler and cleanup tasks unless `worker.enabled` is
    /// off. Call `close()` before dropping to stop them cleanly.
    pub fn new(config: QueueConfig) -> Self {
        let state = Arc::new(MemoryState {
            config,
            jobs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            paused: Mutex::new(HashSet::new()),
            registry: HandlerRegistry::new(),
            shutdown: AtomicBool::new(false),
        });

        let transport = Self {
            state,
            scheduler_handle: Arc::new(Mutex::new(None)),
            cleanup_handle: Arc::new(Mutex::new(None)),
        };

        if transport.state.config.worker.enabled {
            transport.start_scheduler_task();
            transport.start_cleanup_task();
        }

        transport
    }

    /// Start the recurring tick that promotes due jobs and dispatches
    /// claimable ones up to remaining capacity
    fn start_scheduler_task(&self) {
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);

            loop {
                if state.shutdown.load(Ordering::Acquire) {
                    tracing::debug!("Memory transport scheduler shutting down");
                    break;
                }

                interval.tick().await;

                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }

                Self::run_tick(&state).await;
            }
        });

        if let Ok(mut guard) = self.scheduler_handle.try_lock() {
            *guard = Some(handle);
        } else {
            handle.abort();
            tracing::error!("Failed to store memory scheduler handle");
        }
    }

    /// Start the slower sweep removing old terminal jobs
    fn start_cleanup_task(&self) {
        let state = self.state.clone();
        let period =
            std::time::Duration::from_millis(self.state.config.memory.cleanup_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }

                interval.tick().await;

                if state.shutdown.load(Ordering::Acquire) {
                    break;
                }

                let now = Utc::now();
                let mut jobs = state.jobs.lock().await;
                let before = jobs.len();
                jobs.retain(|_, job| match job.status {
                    JobStatus::Completed => {
                        (now - job.clean_timestamp()).num_milliseconds() < COMPLETED_RETENTION_MS
                    }
                    JobStatus::Failed => {
                        (now - job.clean_timestamp()).num_milliseconds() < FAILED_RETENTION_MS
                    }
                    _ => true,
                });
                let removed = before - jobs.len();
                if removed > 0 {
                    tracing::debug!(removed, "Swept old terminal jobs from memory queue");
                }
            }
        });

        if let Ok(mut guard) = self.cleanup_handle.try_lock() {
            *guard = Some(handle);
        } else {
            handle.abort();
            tracing::error!("Failed to store memory cleanup handle");
        }
    }

    /// One scheduler tick: promotion, then claim and dispatch up to capacity
    async fn run_tick(state: &Arc<MemoryState>) {
        let now = Utc::now();
        let paused = state.paused.lock().await.clone();

        // Snapshot handlers before taking the job lock so claiming stays
        // a single critical section
        let mut handlers: HashMap<String, JobHandler> = HashMap::new();
        for job_type in state.registry.registered_types().await {
            if let Some(handler) = state.registry.get(&job_type).await {
                handlers.insert(job_type, handler);
            }
        }

        let claimed: Vec<Job> = {
            let mut jobs = state.jobs.lock().await;
            let mut in_flight = state.in_flight.lock().await;

            // Promotion always precedes selection within a tick
            for job in jobs.values_mut() {
                if job.is_due(now) {
                    job.promote();
                    tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Promoted delayed job");
                }
            }

            let capacity = state.config.concurrency.saturating_sub(in_flight.len());
            if capacity == 0 {
                return;
            }

            let mut eligible: Vec<&Job> = jobs
                .values()
                .filter(|job| {
                    job.is_claimable(now)
                        && handlers.contains_key(&job.job_type)
                        && !paused.contains(&job.job_type)
                })
                .collect();
            eligible.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });

            let ids: Vec<String> = eligible
                .into_iter()
                .take(capacity)
                .map(|job| job.id.clone())
                .collect();

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(job) = jobs.get_mut(&id) {
                    job.mark_active(now);
                    in_flight.insert(id.clone());
                    claimed.push(job.clone());
                }
            }
            claimed
        };

        for job in claimed {
            let handler = match handlers.get(&job.job_type) {
                Some(h) => h.clone(),
                None => continue,
            };
            let state = state.clone();
            tokio::spawn(async move {
                Self::execute_claimed(state, job, handler).await;
            });
        }
    }

    /// Run a claimed job's handler and apply the resulting transition
    ///
    /// Handler errors are captured here and never escape to the poll loop.
    async fn execute_claimed(state: Arc<MemoryState>, job: Job, handler: JobHandler) {
        let ctx = JobContext::for_job(&job);
        let job_id = job.id.clone();
        tracing::debug!(job_id = %job_id, job_type = %job.job_type, attempt = job.attempts, "Processing job");

        let outcome = handler(ctx).await;
        let now = Utc::now();

        {
            let mut jobs = state.jobs.lock().await;
            if let Some(stored) = jobs.get_mut(&job_id) {
                match outcome {
                    Ok(result) => {
                        stored.mark_completed(now, result);
                        tracing::info!(job_id = %job_id, "Job completed");
                    }
                    Err(e) => {
                        let retry_at = backoff::next_run_at(&state.config, stored.attempts, now);
                        stored.mark_failed_attempt(now, JobFailure::from_message(e.to_string()), retry_at);
                        match stored.status {
                            JobStatus::Waiting => tracing::warn!(
                                job_id = %job_id,
                                attempt = stored.attempts,
                                error = %e,
                                "Job failed, retry scheduled"
                            ),
                            _ => tracing::warn!(
                                job_id = %job_id,
                                attempts = stored.attempts,
                                error = %e,
                                "Job failed permanently"
                            ),
                        }
                    }
                }
            }
        }

        state.in_flight.lock().await.remove(&job_id);
    }

    fn check_capacity(&self, jobs: &HashMap<String, Job>, id: &str) -> Result<()> {
        if jobs.contains_key(id) {
            return Err(QueueError::invalid_state(format!(
                "job '{}' already exists",
                id
            )));
        }
        if jobs.len() >= self.state.config.memory.max_jobs {
            return Err(QueueError::capacity_exceeded(format!(
                "memory queue is full ({} jobs)",
                self.state.config.memory.max_jobs
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn add(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<()> {
        let mut jobs = self.state.jobs.lock().await;
        self.check_capacity(&jobs, id)?;

        let mut job = Job::new(id, job_type, data, &options, &self.state.config);
        if let Some(delay_ms) = options.delay_ms {
            if delay_ms > 0 {
                job.status = JobStatus::Delayed;
                job.run_at = job.created_at + Duration::milliseconds(delay_ms as i64);
            }
        }
        jobs.insert(id.to_string(), job);
        Ok(())
    }

    async fn schedule(
        &self,
        id: &str,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<()> {
        let mut jobs = self.state.jobs.lock().await;
        self.check_capacity(&jobs, id)?;

        let job = Job::scheduled(id, job_type, data, delay_ms, &self.state.config);
        jobs.insert(id.to_string(), job);
        Ok(())
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
        let jobs = self.state.jobs.lock().await;
        let paused = self.state.paused.lock().await;

        let mut stats = QueueStats::default();
        for job in jobs.values() {
            if let Some(t) = job_type {
                if job.job_type != t {
                    continue;
                }
            }
            match job.status {
                JobStatus::Waiting => {
                    stats.waiting += 1;
                    if paused.contains(&job.job_type) {
                        stats.paused += 1;
                    }
                }
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
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
        let jobs = self.state.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| {
                job.status == status && job_type.map_or(true, |t| job.job_type == t)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.unwrap_or(DEFAULT_JOB_LIST_LIMIT));
        Ok(matching)
    }

    async fn retry(&self, id: &str) -> Result<()> {
        let mut jobs = self.state.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(format!("job '{}'", id)))?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(format!(
                "cannot retry job '{}' in status '{}'",
                id, job.status
            )));
        }
        job.reset_for_retry(Utc::now());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut jobs = self.state.jobs.lock().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| QueueError::not_found(format!("job '{}'", id)))?;
        if job.status == JobStatus::Active {
            return Err(QueueError::invalid_state(format!(
                "cannot remove active job '{}'",
                id
            )));
        }
        jobs.remove(id);
        Ok(())
    }

    async fn clean(&self, status: JobStatus, grace_ms: Option<u64>) -> Result<()> {
        require_terminal(status)?;
        let grace = grace_ms.unwrap_or(DEFAULT_CLEAN_GRACE_MS);
        let cutoff = Utc::now() - Duration::milliseconds(grace as i64);

        let mut jobs = self.state.jobs.lock().await;
        jobs.retain(|_, job| job.status != status || job.clean_timestamp() > cutoff);
        Ok(())
    }

    async fn get_health(&self) -> HealthReport {
        let jobs = self.state.jobs.lock().await;
        let used = jobs.len();
        let max = self.state.config.memory.max_jobs;
        if used >= max {
            HealthReport::unhealthy(format!("memory queue full ({}/{} jobs)", used, max))
        } else if used * 10 >= max * 9 {
            HealthReport::degraded(format!("memory queue nearly full ({}/{} jobs)", used, max))
        } else {
            HealthReport::healthy()
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::Release);

        for handle_slot in [&self.scheduler_handle, &self.cleanup_handle] {
            let mut guard = handle_slot.lock().await;
            if let Some(handle) = guard.take() {
                match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                    Ok(_) => tracing::debug!("Memory transport task stopped cleanly"),
                    Err(_) => tracing::warn!("Memory transport task did not stop within timeout"),
                }
            }
        }

        // Bounded wait for in-flight jobs, then abandon whatever remains
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
            tracing::warn!(remaining, "Closed memory transport with jobs still in flight");
        }
        Ok(())
    }
}
