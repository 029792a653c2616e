//! Job record and lifecycle state
//!
//! A [`Job`] is one unit of work plus its lifecycle metadata. Transports
//! persist jobs in backend-specific shapes but all share this record and
//! its transition rules.

use crate::config::QueueConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for claiming once `run_at` has passed
    Waiting,
    /// Scheduled for the future; promoted to waiting when due
    Delayed,
    /// Claimed by a worker, handler running
    Active,
    /// Handler finished successfully (terminal)
    Completed,
    /// Attempts exhausted (terminal, re-enterable via retry)
    Failed,
}

impl JobStatus {
    /// Terminal statuses are only left via an explicit `retry()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job overrides supplied at enqueue time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Max attempt override (falls back to the queue default)
    pub attempts: Option<u32>,
    /// Higher priority is processed first
    pub priority: Option<i32>,
    /// Deferred start offset in milliseconds
    pub delay_ms: Option<u64>,
}

impl JobOptions {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            ..Default::default()
        }
    }
}

/// Structured failure detail captured from a handler error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    /// Error kind or type name, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Trace or backtrace text, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl JobFailure {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            trace: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// A queued unit of work and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, immutable once created
    pub id: String,
    /// Job category, routes to a registered handler
    pub job_type: String,
    /// Opaque payload handed to the handler
    pub data: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    /// Execution attempts made so far
    pub attempts: u32,
    /// Resolved attempt ceiling
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant (delay and retry backoff)
    pub run_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Value returned by a successful handler, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl Job {
    /// Create a job in `waiting` state, eligible immediately
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        data: serde_json::Value,
        options: &JobOptions,
        config: &QueueConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_type: job_type.into(),
            data,
            status: JobStatus::Waiting,
            priority: options.priority.unwrap_or(config.default_priority),
            attempts: 0,
            max_attempts: options.attempts.unwrap_or(config.max_attempts).max(1),
            created_at: now,
            run_at: now,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
        }
    }

    /// Create a job in `delayed` state with `run_at = now + delay`
    pub fn scheduled(
        id: impl Into<String>,
        job_type: impl Into<String>,
        data: serde_json::Value,
        delay_ms: u64,
        config: &QueueConfig,
    ) -> Self {
        let mut job = Self::new(
            id,
            job_type,
            data,
            &JobOptions::default(),
            config,
        );
        job.status = JobStatus::Delayed;
        job.run_at = job.created_at + Duration::milliseconds(delay_ms as i64);
        job
    }

    /// Whether this job may be claimed right now
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.run_at <= now
    }

    /// Whether this job is past due for promotion to `waiting`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Delayed && self.run_at <= now
    }

    /// `delayed -> waiting` promotion
    pub fn promote(&mut self) {
        self.status = JobStatus::Waiting;
    }

    /// `waiting -> active` claim; increments attempts
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.processed_at = Some(now);
    }

    /// `active -> completed`; stores a non-null handler result
    pub fn mark_completed(&mut self, now: DateTime<Utc>, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        if !result.is_null() {
            self.result = Some(result);
        }
    }

    /// `active -> waiting` (retry with backoff) or `active -> failed`
    /// (attempts exhausted), depending on remaining attempts
    pub fn mark_failed_attempt(
        &mut self,
        now: DateTime<Utc>,
        failure: JobFailure,
        retry_at: DateTime<Utc>,
    ) {
        self.error = Some(failure);
        if self.attempts < self.max_attempts {
            self.status = JobStatus::Waiting;
            self.run_at = retry_at;
        } else {
            self.status = JobStatus::Failed;
            self.failed_at = Some(now);
        }
    }

    /// Explicit retry of a failed job: attempts and error reset, eligible now
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Waiting;
        self.attempts = 0;
        self.error = None;
        self.failed_at = None;
        self.run_at = now;
    }

    /// Timestamp used by `clean()` age checks: the terminal-transition
    /// timestamp, falling back to creation time
    pub fn clean_timestamp(&self) -> DateTime<Utc> {
        match self.status {
            JobStatus::Completed => self.completed_at.unwrap_or(self.created_at),
            JobStatus::Failed => self.failed_at.unwrap_or(self.created_at),
            _ => self.created_at,
        }
    }
}

/// Per-status counts returned by `get_stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Waiting jobs whose type is currently paused
    pub paused: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig::default()
    }

    #[test]
    fn new_job_is_waiting_and_eligible() {
        let job = Job::new("j1", "email", serde_json::json!({}), &JobOptions::default(), &config());
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
        assert!(job.run_at >= job.created_at);
        assert!(job.is_claimable(Utc::now()));
    }

    #[test]
    fn scheduled_job_is_delayed_until_due() {
        let job = Job::scheduled("j2", "report", serde_json::json!({}), 60_000, &config());
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn failed_attempt_retries_until_exhausted() {
        let mut job = Job::new(
            "j3",
            "flaky",
            serde_json::json!({}),
            &JobOptions::with_attempts(2),
            &config(),
        );
        let now = Utc::now();

        job.mark_active(now);
        assert_eq!(job.attempts, 1);
        job.mark_failed_attempt(now, JobFailure::from_message("boom"), now);
        assert_eq!(job.status, JobStatus::Waiting);

        job.mark_active(now);
        assert_eq!(job.attempts, 2);
        job.mark_failed_attempt(now, JobFailure::from_message("boom"), now);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failed_at.is_some());
        assert!(job.attempts <= job.max_attempts);
    }

    #[test]
    fn reset_for_retry_clears_failure_state() {
        let mut job = Job::new(
            "j4",
            "broken",
            serde_json::json!({}),
            &JobOptions::with_attempts(1),
            &config(),
        );
        let now = Utc::now();
        job.mark_active(now);
        job.mark_failed_attempt(now, JobFailure::from_message("boom"), now);
        assert_eq!(job.status, JobStatus::Failed);

        job.reset_for_retry(now);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());
        assert!(job.failed_at.is_none());
    }

    #[test]
    fn completed_result_skips_null() {
        let mut job = Job::new("j5", "email", serde_json::json!({}), &JobOptions::default(), &config());
        let now = Utc::now();
        job.mark_active(now);
        job.mark_completed(now, serde_json::Value::Null);
        assert!(job.result.is_none());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Delayed,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }
}
