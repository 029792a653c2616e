use conveyor::{
    JobOptions, JobStatus, MemoryTransport, Queue, QueueConfig, QueueError, RetryBackoff,
    Transport,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Fast-retry config so backoff does not dominate test time; also installs
/// the tracing subscriber so RUST_LOG surfaces queue internals on failures
fn test_config() -> QueueConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut config = QueueConfig::default();
    config.retry_delay_ms = 50;
    config.retry_backoff = RetryBackoff::Fixed;
    config.worker.graceful_shutdown_timeout_ms = 3_000;
    config
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
    let queue = Queue::memory(test_config());

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
        .add(
            "j1",
            "email",
            serde_json::json!({"to": "a@b.com"}),
            JobOptions::with_priority(5),
        )
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(5), || {
        let q = queue.clone();
        async move {
            let jobs = q.get_jobs(JobStatus::Completed, None, None).await.unwrap();
            !jobs.is_empty()
        }
    })
    .await;
    assert!(completed, "job never completed");

    let jobs = queue.get_jobs(JobStatus::Completed, None, None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "j1");
    assert_eq!(
        jobs[0].result,
        Some(serde_json::json!({ "sent_to": "a@b.com" }))
    );
    assert_eq!(jobs[0].attempts, 1);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn scheduled_job_counts_delayed_then_promotes() {
    let queue = Queue::memory(test_config());

    queue
        .process("report", |_ctx| {
            Box::pin(async move { Ok(serde_json::Value::Null) })
        })
        .await
        .unwrap();

    queue
        .schedule("j2", "report", serde_json::json!({}), 2_000)
        .await
        .unwrap();

    let stats = queue.get_stats(None).await.unwrap();
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.waiting, 0);

    // After the delay passes and a promotion tick runs, the job leaves
    // delayed (and in this setup completes shortly after)
    let promoted = wait_until(Duration::from_secs(6), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().delayed == 0 }
    })
    .await;
    assert!(promoted, "delayed job never promoted");

    queue.close().await.unwrap();
}

#[tokio::test]
async fn flaky_handler_succeeds_on_third_attempt() {
    let queue = Queue::memory(test_config());
    let calls = Arc::new(AtomicU32::new(0));

    queue
        .process("flaky", {
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(QueueError::invalid_state("transient"))
                    } else {
                        Ok(serde_json::Value::Null)
                    }
                })
            }
        })
        .await
        .unwrap();

    queue
        .add(
            "j3",
            "flaky",
            serde_json::json!({}),
            JobOptions::with_attempts(3),
        )
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(15), || {
        let q = queue.clone();
        async move {
            !q.get_jobs(JobStatus::Completed, None, None).await.unwrap().is_empty()
        }
    })
    .await;
    assert!(completed, "flaky job never completed");

    let jobs = queue.get_jobs(JobStatus::Completed, None, None).await.unwrap();
    assert_eq!(jobs[0].attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn broken_handler_fails_permanently_then_retries_on_request() {
    let queue = Queue::memory(test_config());

    queue
        .process("broken", |_ctx| {
            Box::pin(async move { Err(QueueError::invalid_state("always broken")) })
        })
        .await
        .unwrap();

    queue
        .add(
            "j4",
            "broken",
            serde_json::json!({}),
            JobOptions::with_attempts(2),
        )
        .await
        .unwrap();

    let failed = wait_until(Duration::from_secs(15), || {
        let q = queue.clone();
        async move {
            !q.get_jobs(JobStatus::Failed, None, None).await.unwrap().is_empty()
        }
    })
    .await;
    assert!(failed, "broken job never failed permanently");

    let jobs = queue.get_jobs(JobStatus::Failed, None, None).await.unwrap();
    assert_eq!(jobs[0].attempts, 2);
    let error = jobs[0].error.as_ref().expect("error detail populated");
    assert!(error.message.contains("always broken"));

    // Explicit retry resets the job
    queue.retry("j4").await.unwrap();
    let jobs = queue.get_jobs(JobStatus::Waiting, None, None).await.unwrap();
    let job = jobs.iter().find(|j| j.id == "j4").expect("job back in waiting");
    assert_eq!(job.attempts, 0);
    assert!(job.error.is_none());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn higher_priority_claimed_first() {
    let mut config = test_config();
    config.concurrency = 1;
    let queue = Queue::memory(config);

    let order = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));

    // Enqueue before registering so both jobs are eligible on the same tick
    queue
        .add("low", "t", serde_json::json!({}), JobOptions::with_priority(1))
        .await
        .unwrap();
    queue
        .add("high", "t", serde_json::json!({}), JobOptions::with_priority(10))
        .await
        .unwrap();

    queue
        .process("t", {
            let order = order.clone();
            move |ctx| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().await.push(ctx.id);
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .await
        .unwrap();

    let done = wait_until(Duration::from_secs(10), || {
        let order = order.clone();
        async move { order.lock().await.len() == 2 }
    })
    .await;
    assert!(done, "jobs never both ran");

    let order = order.lock().await;
    assert_eq!(order.as_slice(), ["high".to_string(), "low".to_string()]);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn remove_rejects_active_job_then_succeeds_after_completion() {
    let queue = Queue::memory(test_config());

    queue
        .process("slow", |_ctx| {
            Box::pin(async move {
                sleep(Duration::from_secs(3)).await;
                Ok(serde_json::Value::Null)
            })
        })
        .await
        .unwrap();

    queue
        .add("j6", "slow", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    let active = wait_until(Duration::from_secs(5), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().active == 1 }
    })
    .await;
    assert!(active, "job never became active");

    let err = queue.remove("j6").await.unwrap_err();
    assert!(err.is_invalid_state(), "expected InvalidState, got {}", err);

    let completed = wait_until(Duration::from_secs(10), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().completed == 1 }
    })
    .await;
    assert!(completed, "job never completed");

    queue.remove("j6").await.unwrap();
    assert!(queue.remove("j6").await.unwrap_err().is_not_found());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn single_job_executes_exactly_once_despite_spare_capacity() {
    let mut config = test_config();
    config.concurrency = 8;
    let queue = Queue::memory(config);
    let calls = Arc::new(AtomicU32::new(0));

    queue
        .process("once", {
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .await
        .unwrap();

    queue
        .add("solo", "once", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    // Let several ticks pass; the claim must only ever succeed once
    sleep(Duration::from_millis(3_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn claim_pressure_executes_each_job_exactly_once() {
    let mut config = test_config();
    config.concurrency = 8;
    let queue = Queue::memory(config);
    let calls = Arc::new(AtomicU32::new(0));

    // Many same-priority jobs dispatched across overlapping ticks; the
    // total execution count must equal the job count
    queue
        .process("bulk", {
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(25)).await;
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .await
        .unwrap();

    let total = 25u32;
    for i in 0..total {
        queue
            .add(&format!("bulk-{}", i), "bulk", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let done = wait_until(Duration::from_secs(20), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().completed == 25 }
    })
    .await;
    assert!(done, "jobs never all completed");
    assert_eq!(calls.load(Ordering::SeqCst), total);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn paused_type_is_skipped_until_resumed() {
    let queue = Queue::memory(test_config());
    let calls = Arc::new(AtomicU32::new(0));

    queue
        .process("paused_type", {
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .await
        .unwrap();

    // Pausing twice has the same effect as once
    queue.pause(Some("paused_type")).await.unwrap();
    queue.pause(Some("paused_type")).await.unwrap();

    queue
        .add("j7", "paused_type", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    sleep(Duration::from_millis(2_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0, "paused type must not run");
    let stats = queue.get_stats(Some("paused_type")).await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.paused, 1);

    queue.resume(Some("paused_type")).await.unwrap();
    // Resuming a never-paused type is a no-op
    queue.resume(Some("never_paused")).await.unwrap();

    let ran = wait_until(Duration::from_secs(5), || {
        let calls = calls.clone();
        async move { calls.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(ran, "job never ran after resume");

    queue.close().await.unwrap();
}

#[tokio::test]
async fn retry_rejects_non_failed_jobs() {
    let mut config = test_config();
    config.worker.enabled = false;
    let queue = Queue::memory(config);

    queue
        .add("j8", "t", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    let err = queue.retry("j8").await.unwrap_err();
    assert!(err.is_invalid_state());
    // No mutation happened
    let stats = queue.get_stats(None).await.unwrap();
    assert_eq!(stats.waiting, 1);

    assert!(queue.retry("missing").await.unwrap_err().is_not_found());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn capacity_ceiling_is_enforced() {
    let mut config = test_config();
    config.worker.enabled = false;
    config.memory.max_jobs = 2;
    let queue = Queue::memory(config);

    queue
        .add("a", "t", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    queue
        .add("b", "t", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    let err = queue
        .add("c", "t", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::CapacityExceeded(_)));

    // Duplicate ids are rejected outright
    let err = queue
        .add("a", "t", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn clean_respects_grace_period() {
    let queue = Queue::memory(test_config());

    queue
        .process("quick", |_ctx| {
            Box::pin(async move { Ok(serde_json::Value::Null) })
        })
        .await
        .unwrap();
    queue
        .add("j9", "quick", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(5), || {
        let q = queue.clone();
        async move { q.get_stats(None).await.unwrap().completed == 1 }
    })
    .await;
    assert!(completed);

    // Young jobs survive a generous grace period
    queue
        .clean(JobStatus::Completed, Some(60 * 60 * 1000))
        .await
        .unwrap();
    assert_eq!(queue.get_stats(None).await.unwrap().completed, 1);

    // Zero grace removes them
    queue.clean(JobStatus::Completed, Some(0)).await.unwrap();
    assert_eq!(queue.get_stats(None).await.unwrap().completed, 0);

    // Only terminal statuses are cleanable
    let err = queue.clean(JobStatus::Waiting, None).await.unwrap_err();
    assert!(err.is_invalid_state());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn stats_never_double_count() {
    let mut config = test_config();
    config.worker.enabled = false;
    let queue = Queue::memory(config);

    queue
        .add("s1", "a", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    queue
        .add("s2", "b", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    queue
        .schedule("s3", "a", serde_json::json!({}), 60_000)
        .await
        .unwrap();

    let stats = queue.get_stats(None).await.unwrap();
    assert_eq!(stats.total(), 3);
    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.delayed, 1);

    let scoped = queue.get_stats(Some("a")).await.unwrap();
    assert_eq!(scoped.total(), 2);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn transport_can_be_used_directly() {
    let mut config = test_config();
    config.worker.enabled = false;
    let transport = MemoryTransport::new(config);

    transport
        .add("d1", "t", serde_json::json!({"k": 1}), JobOptions::default())
        .await
        .unwrap();
    let jobs = transport
        .get_jobs(JobStatus::Waiting, Some("t"), None)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].data, serde_json::json!({"k": 1}));

    transport.close().await.unwrap();
}
