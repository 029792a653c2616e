//! Redis transport tests against a live server.
//!
//! Every test is a no-op unless `REDIS_URL` is set (e.g.
//! `redis://127.0.0.1:6379`). Each run uses a unique key prefix so
//! concurrent runs and leftover keys cannot interfere.

#![cfg(feature = "redis-backend")]

use conveyor::{JobOptions, JobStatus, Queue, QueueConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn redis_config() -> Option<QueueConfig> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let url = std::env::var("REDIS_URL").ok()?;
    let mut config = QueueConfig::default();
    config.redis.url = Some(url);
    config.redis.key_prefix = format!("conveyor-test:{}:", uuid::Uuid::new_v4());
    config.retry_delay_ms = 50;
    config.worker.graceful_shutdown_timeout_ms = 5_000;
    Some(config)
}

/// Poll until `check` passes or the deadline expires
async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn add_then_complete_with_result() {
    let Some(config) = redis_config() else {
        return;
    };
    let queue = Queue::redis(config).unwrap();

    queue
        .process("email", |ctx| {
            Box::pin(async move {
                let to = ctx.data["to"].as_str().unwrap_or_default().to_string();
                Ok(serde_json::json!({ "sent_to": to }))
            })
        })
        .await
        .unwrap();

    queue
        .add("j1", "email", serde_json::json!({"to": "a@b.com"}), JobOptions::default())
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(10), || {
        let q = queue.clone();
        async move {
            !q.get_jobs(JobStatus::Completed, None, None).await.unwrap().is_empty()
        }
    })
    .await;
    assert!(completed, "job never completed");

    let jobs = queue.get_jobs(JobStatus::Completed, None, None).await.unwrap();
    assert_eq!(jobs[0].id, "j1");
    assert_eq!(jobs[0].result, Some(serde_json::json!({ "sent_to": "a@b.com" })));

    queue.close().await.unwrap();
}

#[tokio::test]
async fn remove_rejects_active_job() {
    let Some(config) = redis_config() else {
        return;
    };
    let queue = Queue::redis(config).unwrap();

    queue
        .process("slow", |_ctx| {
            Box::pin(async move {
                sleep(Duration::from_secs(2)).await;
                Ok(serde_json::Value::Null)
            })
        })
        .await
        .unwrap();

    queue
        .add("s1", "slow", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    let active = wait_until(Duration::from_secs(10), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().active == 1 }
    })
    .await;
    assert!(active, "job never became active");

    let err = queue.remove("s1").await.unwrap_err();
    assert!(err.is_invalid_state(), "expected InvalidState, got {}", err);

    let completed = wait_until(Duration::from_secs(10), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().completed == 1 }
    })
    .await;
    assert!(completed, "job never completed after failed remove");

    queue.close().await.unwrap();
}

#[tokio::test]
async fn removed_jobs_never_resurrect_under_claim_pressure() {
    let Some(config) = redis_config() else {
        return;
    };
    let queue = Queue::redis(config).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    queue
        .process("bulk", {
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .await
        .unwrap();

    let total = 12usize;
    for i in 0..total {
        queue
            .add(&format!("bulk-{}", i), "bulk", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    // Race removals against the poll loop's claims; a failed remove must
    // be a clean rejection, a successful one must delete the job for good
    let mut removed = Vec::new();
    for i in 0..total {
        let id = format!("bulk-{}", i);
        match queue.remove(&id).await {
            Ok(()) => removed.push(id),
            Err(e) => assert!(
                e.is_invalid_state() || e.is_not_found(),
                "unexpected remove error: {}",
                e
            ),
        }
    }

    let drained = wait_until(Duration::from_secs(15), || {
        let q = queue.clone();
        async move {
            let stats = q.get_stats(None).await.unwrap();
            stats.waiting == 0 && stats.delayed == 0 && stats.active == 0
        }
    })
    .await;
    assert!(drained, "queue never drained");

    for id in &removed {
        for status in [
            JobStatus::Waiting,
            JobStatus::Delayed,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let jobs = queue.get_jobs(status, None, None).await.unwrap();
            assert!(
                jobs.iter().all(|j| &j.id != id),
                "removed job {} resurrected as {}",
                id,
                status
            );
        }
    }

    // Every job either survived to completion or was removed, never both
    let stats = queue.get_stats(None).await.unwrap();
    assert_eq!(stats.completed as usize + removed.len(), total);

    queue.close().await.unwrap();
}
