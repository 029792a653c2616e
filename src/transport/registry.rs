//! Handler registry mapping job types to handler functions
//!
//! Registration is per transport instance, not process-global, so multiple
//! independently configured queues can coexist in one process.

use crate::transport::JobHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry for mapping job types to their handlers
///
/// Thread-safe and cheap to clone; shared between a transport's public API
/// and its poll loop.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<tokio::sync::RwLock<HashMap<String, JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type; a later registration for the
    /// same type replaces the earlier one
    pub async fn register(&self, job_type: &str, handler: JobHandler) {
        let mut handlers = self.handlers.write().await;
        if handlers.insert(job_type.to_string(), handler).is_some() {
            tracing::debug!(job_type = %job_type, "Replaced existing job handler");
        }
    }

    /// Look up the handler for a job type
    pub async fn get(&self, job_type: &str) -> Option<JobHandler> {
        let handlers = self.handlers.read().await;
        handlers.get(job_type).cloned()
    }

    /// Check if a job type is registered
    pub async fn is_registered(&self, job_type: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers.contains_key(job_type)
    }

    /// Get all registered job types
    pub async fn registered_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop_handler(marker: &'static str) -> JobHandler {
        Arc::new(move |_ctx| Box::pin(async move { Ok(serde_json::json!(marker)) }))
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        assert!(!registry.is_registered("email").await);

        registry.register("email", noop_handler("a")).await;
        assert!(registry.is_registered("email").await);
        assert!(registry.get("email").await.is_some());
        assert!(registry.get("other").await.is_none());
    }

    #[tokio::test]
    async fn second_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register("email", noop_handler("first")).await;
        registry.register("email", noop_handler("second")).await;

        let handler = registry.get("email").await.unwrap();
        let ctx = crate::transport::JobContext {
            id: "j1".into(),
            job_type: "email".into(),
            data: serde_json::Value::Null,
            attempt: 1,
            max_attempts: 3,
        };
        let result = handler(ctx).await.unwrap();
        assert_eq!(result, serde_json::json!("second"));
    }
}
