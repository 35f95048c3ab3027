// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for cancellation, timeouts, and deadlines.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::TestContext;
use serde_json::json;
use tideway::{EngineError, RunOptions, RunStatus, steps};

fn register_sleeper(ctx: &TestContext) {
    ctx.engine.register_workflow("sleeper", |_inputs| async move {
        steps::sleep(Duration::from_secs(600)).await?;
        Ok(json!("woke"))
    });
}

#[tokio::test]
async fn test_cancel_preempts_sleeping_run() {
    let ctx = TestContext::new().await;
    register_sleeper(&ctx);
    ctx.engine.start().await.unwrap();

    let engine = ctx.engine.clone();
    let handle = tokio::spawn(async move {
        engine
            .run_workflow(
                "sleeper",
                json!(null),
                RunOptions {
                    run_id: Some("s-1".to_string()),
                    ..RunOptions::default()
                },
            )
            .await
    });
    ctx.wait_for_status("s-1", RunStatus::Pending).await;
    // Let the run register its cancellation token before firing it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = ctx.engine.cancel_run("s-1", false).await.unwrap();
    assert_eq!(cancelled, vec!["s-1".to_string()]);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::RunCancelled { run_id } if run_id == "s-1"));
    ctx.wait_for_status("s-1", RunStatus::Cancelled).await;
}

#[tokio::test]
async fn test_terminal_run_is_not_cancellable() {
    let ctx = TestContext::new().await;
    ctx.engine
        .register_workflow("noop", |_inputs| async move { Ok(json!(null)) });

    ctx.engine
        .run_workflow(
            "noop",
            json!(null),
            RunOptions {
                run_id: Some("done-1".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    let err = ctx.engine.cancel_run("done-1", false).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RunNotCancellable { ref status, .. } if status == "success"
    ));

    let err = ctx.engine.cancel_run("never-existed", false).await.unwrap_err();
    assert_eq!(err.error_code(), "RUN_NOT_FOUND");
}

#[tokio::test]
async fn test_cascading_cancel_reaches_descendants() {
    let ctx = TestContext::new().await;
    register_sleeper(&ctx);
    ctx.engine.register_workflow("parent", |_inputs| async move {
        let result = steps::run_workflow("sleeper", json!(null), RunOptions::default()).await?;
        Ok(result)
    });
    ctx.engine.start().await.unwrap();

    let engine = ctx.engine.clone();
    let handle = tokio::spawn(async move {
        engine
            .run_workflow(
                "parent",
                json!(null),
                RunOptions {
                    run_id: Some("p-1".to_string()),
                    ..RunOptions::default()
                },
            )
            .await
    });
    // The child's id is derived from the parent and the step position.
    ctx.wait_for_status("p-1-0", RunStatus::Pending).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut cancelled = ctx.engine.cancel_run("p-1", true).await.unwrap();
    cancelled.sort();
    assert_eq!(cancelled, vec!["p-1".to_string(), "p-1-0".to_string()]);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::RunCancelled { run_id } if run_id == "p-1"));
    ctx.wait_for_status("p-1", RunStatus::Cancelled).await;
    ctx.wait_for_status("p-1-0", RunStatus::Cancelled).await;
}

#[tokio::test]
async fn test_cancelled_child_is_ordinary_failure_for_parent() {
    let ctx = TestContext::new().await;
    register_sleeper(&ctx);
    ctx.engine.register_workflow("parent", |_inputs| async move {
        let result = steps::run_workflow("sleeper", json!(null), RunOptions::default()).await?;
        Ok(result)
    });
    ctx.engine.start().await.unwrap();

    let engine = ctx.engine.clone();
    let handle = tokio::spawn(async move {
        engine
            .run_workflow(
                "parent",
                json!(null),
                RunOptions {
                    run_id: Some("p-2".to_string()),
                    ..RunOptions::default()
                },
            )
            .await
    });
    ctx.wait_for_status("p-2-0", RunStatus::Pending).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Cancel only the child; the parent sees a failed child step.
    ctx.engine.cancel_run("p-2-0", false).await.unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::RunCancelled { run_id } if run_id == "p-2-0"));

    ctx.wait_for_status("p-2-0", RunStatus::Cancelled).await;
    // The parent itself was never cancelled, so its terminal status is error.
    ctx.wait_for_status("p-2", RunStatus::Error).await;
}

#[tokio::test]
async fn test_timeout_finalizes_as_error() {
    let ctx = TestContext::new().await;
    register_sleeper(&ctx);

    let err = ctx
        .engine
        .run_workflow(
            "sleeper",
            json!(null),
            RunOptions {
                run_id: Some("t-1".to_string()),
                timeout_ms: Some(100),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunTimedOut { timeout_ms: 100, .. }));

    let row = ctx.engine.get_run("t-1").await.unwrap();
    assert_eq!(row.status, RunStatus::Error.as_str());
}

#[tokio::test]
async fn test_deadline_finalizes_as_error() {
    let ctx = TestContext::new().await;
    register_sleeper(&ctx);

    let deadline = Utc::now().timestamp_millis() + 150;
    let err = ctx
        .engine
        .run_workflow(
            "sleeper",
            json!(null),
            RunOptions {
                run_id: Some("d-1".to_string()),
                deadline_epoch_ms: Some(deadline),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunDeadlineExceeded { .. }));

    let row = ctx.engine.get_run("d-1").await.unwrap();
    assert_eq!(row.status, RunStatus::Error.as_str());
}

#[tokio::test]
async fn test_earlier_of_timeout_and_deadline_wins() {
    let ctx = TestContext::new().await;
    register_sleeper(&ctx);

    // Timeout fires well before the distant deadline.
    let err = ctx
        .engine
        .run_workflow(
            "sleeper",
            json!(null),
            RunOptions {
                timeout_ms: Some(100),
                deadline_epoch_ms: Some(Utc::now().timestamp_millis() + 60_000),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunTimedOut { .. }));

    // Deadline fires well before the distant timeout.
    let err = ctx
        .engine
        .run_workflow(
            "sleeper",
            json!(null),
            RunOptions {
                timeout_ms: Some(60_000),
                deadline_epoch_ms: Some(Utc::now().timestamp_millis() + 100),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunDeadlineExceeded { .. }));
}
