//! Error types for queue operations

/// The main error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backend cannot accept another job (e.g. in-memory job ceiling)
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Backend connectivity not established or lost
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A referenced job id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The job's current status disallows the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The underlying store rejected a read or write
    #[error("Backend operation '{operation}' failed{}: {message}", fmt_job(.job_id))]
    BackendOperationFailed {
        operation: String,
        job_id: Option<String>,
        message: String,
    },

    /// Required schema or configuration absent at startup
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn fmt_job(job_id: &Option<String>) -> String {
    match job_id {
        Some(id) => format!(" for job {}", id),
        None => String::new(),
    }
}

impl QueueError {
    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn configuration_missing(msg: impl Into<String>) -> Self {
        Self::ConfigurationMissing(msg.into())
    }

    /// Wrap a backend store error with operation context
    pub fn backend(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::BackendOperationFailed {
            operation: operation.into(),
            job_id: None,
            message: message.to_string(),
        }
    }

    /// Wrap a backend store error with operation and job context
    pub fn backend_for_job(
        operation: impl Into<String>,
        job_id: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::BackendOperationFailed {
            operation: operation.into(),
            job_id: Some(job_id.into()),
            message: message.to_string(),
        }
    }

    /// Whether this error indicates a missing job id
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error indicates a status that disallows the operation
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

/// Convenience Result type using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_includes_operation_and_job() {
        let err = QueueError::backend_for_job("hset", "j1", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("hset"));
        assert!(msg.contains("j1"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn predicates_match_variants() {
        assert!(QueueError::not_found("x").is_not_found());
        assert!(QueueError::invalid_state("x").is_invalid_state());
        assert!(!QueueError::capacity_exceeded("x").is_not_found());
    }
}
