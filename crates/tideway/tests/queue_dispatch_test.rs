// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for queued execution: dispatch, admission control, priority
//! ordering, partitioning, and enqueue deduplication.

mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::TestContext;
use serde_json::json;
use tideway::{Engine, EngineConfig, EnqueueOptions, QueueConfig, RunStatus};

#[tokio::test]
async fn test_enqueue_dispatch_and_wait() {
    let ctx = TestContext::new().await;
    ctx.engine.register_queue(QueueConfig::new("jobs"));
    ctx.engine.register_workflow("double", |inputs| async move {
        Ok(json!(inputs["n"].as_i64().unwrap_or(0) * 2))
    });

    ctx.engine.start().await.unwrap();

    let created = ctx
        .engine
        .enqueue_workflow(
            "jobs",
            "double",
            json!({"n": 21}),
            EnqueueOptions {
                run_id: Some("job-1".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!created.deduplicated);

    let result = ctx.engine.wait_for_result("job-1").await.unwrap();
    assert_eq!(result, json!(42));

    let row = ctx.engine.get_run("job-1").await.unwrap();
    assert_eq!(row.status, RunStatus::Success.as_str());
    assert_eq!(row.queue_name.as_deref(), Some("jobs"));
    assert!(row.executor_id.is_some());
    assert!(row.started_at.is_some());
}

#[tokio::test]
async fn test_worker_concurrency_cap_is_honored() {
    let ctx = TestContext::new().await;
    ctx.engine
        .register_queue(QueueConfig::new("serial").with_worker_concurrency(1));

    let current = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    {
        let current = current.clone();
        let peak = peak.clone();
        ctx.engine.register_workflow("tracked", move |_inputs| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });
    }

    for i in 0..3 {
        ctx.engine
            .enqueue_workflow(
                "serial",
                "tracked",
                json!(null),
                EnqueueOptions {
                    run_id: Some(format!("serial-{i}")),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }
    ctx.engine.start().await.unwrap();

    for i in 0..3 {
        tokio::time::timeout(
            Duration::from_secs(10),
            ctx.engine.wait_for_result(&format!("serial-{i}")),
        )
        .await
        .expect("queued run should complete")
        .unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_priority_order_wins_over_arrival_order() {
    let ctx = TestContext::new().await;
    ctx.engine.register_queue(
        QueueConfig::new("ranked")
            .with_priority()
            .with_worker_concurrency(1),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = order.clone();
        ctx.engine.register_workflow("note-order", move |inputs| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(inputs.as_i64().unwrap_or(-1));
                Ok(json!(null))
            }
        });
    }

    // Enqueued 5, 1, 3; dequeue order must follow priority, not arrival.
    for priority in [5, 1, 3] {
        ctx.engine
            .enqueue_workflow(
                "ranked",
                "note-order",
                json!(priority),
                EnqueueOptions {
                    run_id: Some(format!("ranked-{priority}")),
                    priority: Some(priority as i32),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }
    ctx.engine.start().await.unwrap();

    for priority in [1, 3, 5] {
        tokio::time::timeout(
            Duration::from_secs(10),
            ctx.engine.wait_for_result(&format!("ranked-{priority}")),
        )
        .await
        .expect("queued run should complete")
        .unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 3, 5]);
}

#[tokio::test]
async fn test_enqueue_deduplication() {
    let ctx = TestContext::new().await;
    ctx.engine.register_queue(QueueConfig::new("dedup-q"));
    ctx.engine
        .register_workflow("noop", |_inputs| async move { Ok(json!(null)) });

    // Engine not started: runs stay queued, keeping the dedup key live.
    let first = ctx
        .engine
        .enqueue_workflow(
            "dedup-q",
            "noop",
            json!(null),
            EnqueueOptions {
                run_id: Some("q-1".to_string()),
                deduplication_id: Some("order-77".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!first.deduplicated);

    let second = ctx
        .engine
        .enqueue_workflow(
            "dedup-q",
            "noop",
            json!(null),
            EnqueueOptions {
                run_id: Some("q-2".to_string()),
                deduplication_id: Some("order-77".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.run_id, "q-1");

    let third = ctx
        .engine
        .enqueue_workflow(
            "dedup-q",
            "noop",
            json!(null),
            EnqueueOptions {
                run_id: Some("q-3".to_string()),
                deduplication_id: Some("order-78".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!third.deduplicated);
}

#[tokio::test]
async fn test_enqueue_requires_declared_queue() {
    let ctx = TestContext::new().await;
    ctx.engine
        .register_workflow("noop", |_inputs| async move { Ok(json!(null)) });

    let err = ctx
        .engine
        .enqueue_workflow("ghost-queue", "noop", json!(null), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "QUEUE_NOT_FOUND");
}

#[tokio::test]
async fn test_partitioned_queue_dispatches_every_partition() {
    let ctx = TestContext::new().await;
    ctx.engine.register_queue(
        QueueConfig::new("sharded")
            .with_partitioning()
            .with_worker_concurrency(1),
    );
    ctx.engine
        .register_workflow("noop", |_inputs| async move { Ok(json!(null)) });

    for (i, partition) in [(0, "alpha"), (1, "alpha"), (2, "beta")] {
        ctx.engine
            .enqueue_workflow(
                "sharded",
                "noop",
                json!(null),
                EnqueueOptions {
                    run_id: Some(format!("shard-{i}")),
                    partition_key: Some(partition.to_string()),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }
    ctx.engine.start().await.unwrap();

    for i in 0..3 {
        tokio::time::timeout(
            Duration::from_secs(10),
            ctx.engine.wait_for_result(&format!("shard-{i}")),
        )
        .await
        .expect("partitioned run should complete")
        .unwrap();
    }

    let alpha = ctx.engine.get_run("shard-0").await.unwrap();
    assert_eq!(alpha.queue_partition_key.as_deref(), Some("alpha"));
    let beta = ctx.engine.get_run("shard-2").await.unwrap();
    assert_eq!(beta.queue_partition_key.as_deref(), Some("beta"));
}

#[tokio::test]
async fn test_competing_executors_never_double_claim() {
    let ctx = TestContext::new().await;

    // Second executor over the same database, distinct identity.
    let engine_b = Engine::new(
        ctx.store.clone(),
        EngineConfig {
            executor_id: "second-executor".to_string(),
            queue_poll_interval: Duration::from_millis(50),
            event_poll_interval: Duration::from_millis(100),
            ..EngineConfig::default()
        },
    );

    let current = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    let executed = Arc::new(Mutex::new(Vec::new()));
    for engine in [&ctx.engine, &engine_b] {
        engine.register_queue(QueueConfig::new("shared").with_global_concurrency(2));
        let current = current.clone();
        let peak = peak.clone();
        let executed = executed.clone();
        engine.register_workflow("tracked", move |inputs| {
            let current = current.clone();
            let peak = peak.clone();
            let executed = executed.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                executed.lock().unwrap().push(inputs.as_i64().unwrap_or(-1));
                Ok(json!(null))
            }
        });
    }

    for i in 0..8 {
        ctx.engine
            .enqueue_workflow(
                "shared",
                "tracked",
                json!(i),
                EnqueueOptions {
                    run_id: Some(format!("shared-{i}")),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }
    ctx.engine.start().await.unwrap();
    engine_b.start().await.unwrap();

    for i in 0..8 {
        tokio::time::timeout(
            Duration::from_secs(15),
            ctx.engine.wait_for_result(&format!("shared-{i}")),
        )
        .await
        .expect("shared-queue run should complete")
        .unwrap();
    }

    // No run body ran twice, on either executor.
    let mut ran = executed.lock().unwrap().clone();
    ran.sort();
    assert_eq!(ran, (0..8).collect::<Vec<i64>>());
    // The global cap bounds both executors' claims combined.
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "in-flight peak {} exceeded the global cap",
        peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_rate_limit_spaces_out_starts() {
    let ctx = TestContext::new().await;
    // SQLite timestamps carry second precision, so the window must be coarse.
    ctx.engine
        .register_queue(QueueConfig::new("metered").with_rate_limit(1, Duration::from_secs(2)));
    ctx.engine
        .register_workflow("noop", |_inputs| async move { Ok(json!(null)) });

    for i in 0..2 {
        ctx.engine
            .enqueue_workflow(
                "metered",
                "noop",
                json!(null),
                EnqueueOptions {
                    run_id: Some(format!("metered-{i}")),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }
    ctx.engine.start().await.unwrap();

    for i in 0..2 {
        tokio::time::timeout(
            Duration::from_secs(15),
            ctx.engine.wait_for_result(&format!("metered-{i}")),
        )
        .await
        .expect("rate-limited run should eventually complete")
        .unwrap();
    }

    // Claim order between the two is unspecified (creation timestamps tie at
    // SQLite's second precision); only the spacing matters.
    let a = ctx.engine.get_run("metered-0").await.unwrap().started_at.unwrap();
    let b = ctx.engine.get_run("metered-1").await.unwrap().started_at.unwrap();
    let gap = if a > b { a - b } else { b - a };
    assert!(
        gap.num_milliseconds() >= 1000,
        "starts only {}ms apart",
        gap.num_milliseconds()
    );
}
