// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store-level tests against the SQLite backend: lifecycle guards, change-id
//! monotonicity, mailbox semantics, and recovery-attempt accounting.

mod common;

use common::TestContext;
use tideway::model::{NewRun, RecoveryDecision};
use tideway::{EngineError, RunStatus, Store};

fn new_run(id: &str, status: RunStatus) -> NewRun {
    NewRun {
        id: id.to_string(),
        path: vec![id.to_string()],
        workflow_name: "wf".to_string(),
        inputs: "null".to_string(),
        status,
        executor_id: None,
        timeout_ms: None,
        deadline_epoch_ms: None,
        queue_name: None,
        queue_partition_key: None,
        queue_deduplication_id: None,
        priority: None,
    }
}

#[tokio::test]
async fn test_create_run_is_idempotent_on_id() {
    let ctx = TestContext::new().await;

    let first = ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();
    assert!(!first.deduplicated);

    let second = ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.run_id, "r-1");
}

#[tokio::test]
async fn test_finalize_never_overwrites_terminal_status() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();

    let finalized = ctx
        .store
        .finalize_run("r-1", RunStatus::Success, Some("\"out\""), None)
        .await
        .unwrap();
    assert!(finalized);

    // A late competing finalize is a no-op, not an error.
    let finalized = ctx
        .store
        .finalize_run("r-1", RunStatus::Error, None, Some("\"late\""))
        .await
        .unwrap();
    assert!(!finalized);

    let row = ctx.store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Success.as_str());
    assert_eq!(row.output.as_deref(), Some("\"out\""));
    assert!(row.error.is_none());

    let err = ctx
        .store
        .finalize_run("ghost", RunStatus::Success, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "RUN_NOT_FOUND");
}

#[tokio::test]
async fn test_change_id_increases_on_every_write() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();

    let v1 = ctx.store.get_run("r-1").await.unwrap().unwrap().change_id;
    ctx.store
        .record_run_error_keeping_status("r-1", "\"transient note\"")
        .await
        .unwrap();
    let v2 = ctx.store.get_run("r-1").await.unwrap().unwrap().change_id;
    ctx.store
        .finalize_run("r-1", RunStatus::Success, Some("null"), None)
        .await
        .unwrap();
    let v3 = ctx.store.get_run("r-1").await.unwrap().unwrap().change_id;

    assert!(v1 < v2, "{v1} !< {v2}");
    assert!(v2 < v3, "{v2} !< {v3}");
}

#[tokio::test]
async fn test_cancel_cascade_follows_path_prefix() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("root", RunStatus::Pending)).await.unwrap();

    let mut child = new_run("child", RunStatus::Pending);
    child.path = vec!["root".to_string(), "child".to_string()];
    ctx.store.create_run(&child).await.unwrap();

    let mut grandchild = new_run("leaf", RunStatus::Pending);
    grandchild.path = vec!["root".to_string(), "child".to_string(), "leaf".to_string()];
    ctx.store.create_run(&grandchild).await.unwrap();

    // Unrelated run must not be touched.
    ctx.store.create_run(&new_run("other", RunStatus::Pending)).await.unwrap();

    let mut cancelled = ctx.store.cancel_runs("root", true).await.unwrap();
    cancelled.sort();
    assert_eq!(cancelled, vec!["child", "leaf", "root"]);

    let other = ctx.store.get_run("other").await.unwrap().unwrap();
    assert_eq!(other.status, RunStatus::Pending.as_str());
}

#[tokio::test]
async fn test_cancel_cascade_treats_wildcard_ids_literally() {
    let ctx = TestContext::new().await;

    // Run ids are caller-supplied and may contain LIKE metacharacters.
    ctx.store.create_run(&new_run("a%", RunStatus::Pending)).await.unwrap();
    let mut own_child = new_run("a%-kid", RunStatus::Pending);
    own_child.path = vec!["a%".to_string(), "a%-kid".to_string()];
    ctx.store.create_run(&own_child).await.unwrap();

    // "a%/%" as a raw pattern would also match this family.
    ctx.store.create_run(&new_run("ax", RunStatus::Pending)).await.unwrap();
    let mut stranger = new_run("ax-child", RunStatus::Pending);
    stranger.path = vec!["ax".to_string(), "ax-child".to_string()];
    ctx.store.create_run(&stranger).await.unwrap();

    let mut cancelled = ctx.store.cancel_runs("a%", true).await.unwrap();
    cancelled.sort();
    assert_eq!(cancelled, vec!["a%", "a%-kid"]);

    let ax = ctx.store.get_run("ax").await.unwrap().unwrap();
    assert_eq!(ax.status, RunStatus::Pending.as_str());
    let ax_child = ctx.store.get_run("ax-child").await.unwrap().unwrap();
    assert_eq!(ax_child.status, RunStatus::Pending.as_str());
}

#[tokio::test]
async fn test_cancel_rejects_terminal_and_unknown_runs() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();
    ctx.store
        .finalize_run("r-1", RunStatus::Success, None, None)
        .await
        .unwrap();

    let err = ctx.store.cancel_runs("r-1", false).await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotCancellable { .. }));

    let err = ctx.store.cancel_runs("ghost", false).await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound { .. }));
}

#[tokio::test]
async fn test_messages_are_fifo_per_type() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("inbox", RunStatus::Pending)).await.unwrap();

    ctx.store.send_message(None, "inbox", "order", "\"m1\"").await.unwrap();
    ctx.store.send_message(None, "inbox", "order", "\"m2\"").await.unwrap();
    ctx.store.send_message(None, "inbox", "alert", "\"a1\"").await.unwrap();

    let first = ctx.store.consume_message(None, "inbox", "order").await.unwrap();
    assert_eq!(first.as_deref(), Some("\"m1\""));
    let second = ctx.store.consume_message(None, "inbox", "order").await.unwrap();
    assert_eq!(second.as_deref(), Some("\"m2\""));
    let drained = ctx.store.consume_message(None, "inbox", "order").await.unwrap();
    assert!(drained.is_none());

    // The other type's mailbox is untouched.
    let alert = ctx.store.consume_message(None, "inbox", "alert").await.unwrap();
    assert_eq!(alert.as_deref(), Some("\"a1\""));

    let err = ctx
        .store
        .send_message(None, "ghost", "order", "\"m\"")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "RUN_NOT_FOUND");
}

#[tokio::test]
async fn test_matching_message_keys_supports_wildcard() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("inbox", RunStatus::Pending)).await.unwrap();
    ctx.store.send_message(None, "inbox", "order", "\"m1\"").await.unwrap();
    ctx.store.send_message(None, "inbox", "alert", "\"a1\"").await.unwrap();

    let keys = vec![
        ("inbox".to_string(), "order".to_string()),
        ("inbox".to_string(), "*".to_string()),
        ("inbox".to_string(), "absent".to_string()),
    ];
    let matches = ctx.store.matching_message_keys(&keys).await.unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.contains(&("inbox".to_string(), "order".to_string(), 1)));
    assert!(matches.contains(&("inbox".to_string(), "*".to_string(), 2)));
}

#[tokio::test]
async fn test_consuming_send_records_operation_atomically() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("sender", RunStatus::Pending)).await.unwrap();
    ctx.store.create_run(&new_run("inbox", RunStatus::Pending)).await.unwrap();

    ctx.store
        .send_message(Some(("sender", 0)), "inbox", "order", "\"m1\"")
        .await
        .unwrap();

    let operations = ctx.store.load_operations("sender").await.unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].sequence_id, 0);

    // A consume with a record keeps the payload as the operation output.
    ctx.store
        .consume_message(Some(("inbox", 0)), "inbox", "order")
        .await
        .unwrap();
    let operations = ctx.store.load_operations("inbox").await.unwrap();
    assert_eq!(operations[0].output.as_deref(), Some("\"m1\""));
}

#[tokio::test]
async fn test_operations_load_in_sequence_order() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();

    ctx.store.append_operation("r-1", 2, Some("\"c\""), None).await.unwrap();
    ctx.store.append_operation("r-1", 0, Some("\"a\""), None).await.unwrap();
    ctx.store.append_operation("r-1", 1, None, Some("\"boom\"")).await.unwrap();

    let operations = ctx.store.load_operations("r-1").await.unwrap();
    let sequence: Vec<i64> = operations.iter().map(|op| op.sequence_id).collect();
    assert_eq!(sequence, vec![0, 1, 2]);
    assert_eq!(operations[1].error.as_deref(), Some("\"boom\""));
}

#[tokio::test]
async fn test_state_latest_wins_with_version_bump() {
    let ctx = TestContext::new().await;
    ctx.store.create_run(&new_run("r-1", RunStatus::Pending)).await.unwrap();

    ctx.store.set_state("r-1", 0, "phase", "\"loading\"").await.unwrap();
    ctx.store.set_state("r-1", 1, "phase", "\"complete\"").await.unwrap();

    let value = ctx.store.get_state("r-1", "phase").await.unwrap();
    assert_eq!(value.as_deref(), Some("\"complete\""));

    let states = ctx
        .store
        .get_states(&[("r-1".to_string(), "phase".to_string())])
        .await
        .unwrap();
    assert_eq!(states.len(), 1);
    let (_, _, value, change_id) = &states[0];
    assert_eq!(value, "\"complete\"");
    assert_eq!(*change_id, 2);
}

#[tokio::test]
async fn test_recovery_attempt_accounting() {
    let ctx = TestContext::new().await;
    let mut stranded = new_run("r-1", RunStatus::Pending);
    stranded.executor_id = Some("exec-1".to_string());
    ctx.store.create_run(&stranded).await.unwrap();

    match ctx.store.begin_recovery_attempt("r-1", 2).await.unwrap() {
        RecoveryDecision::Resume(row) => assert_eq!(row.recovery_attempts, 1),
        other => panic!("expected Resume, got {:?}", other),
    }
    match ctx.store.begin_recovery_attempt("r-1", 2).await.unwrap() {
        RecoveryDecision::Resume(row) => assert_eq!(row.recovery_attempts, 2),
        other => panic!("expected Resume, got {:?}", other),
    }

    // Third attempt exceeds the cap and finalizes the run.
    assert!(matches!(
        ctx.store.begin_recovery_attempt("r-1", 2).await.unwrap(),
        RecoveryDecision::Exceeded
    ));
    let row = ctx.store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::MaxRecoveryAttemptsExceeded.as_str());

    // Non-pending runs are skipped outright.
    ctx.store.create_run(&new_run("r-2", RunStatus::Queued)).await.unwrap();
    assert!(matches!(
        ctx.store.begin_recovery_attempt("r-2", 2).await.unwrap(),
        RecoveryDecision::Skip
    ));
}

#[tokio::test]
async fn test_queued_partitions_lists_distinct_keys() {
    let ctx = TestContext::new().await;

    for (id, partition) in [("q-1", "alpha"), ("q-2", "alpha"), ("q-3", "beta")] {
        let mut run = new_run(id, RunStatus::Queued);
        run.queue_name = Some("sharded".to_string());
        run.queue_partition_key = Some(partition.to_string());
        ctx.store.create_run(&run).await.unwrap();
    }

    let mut partitions = ctx.store.queued_partitions("sharded").await.unwrap();
    partitions.sort();
    assert_eq!(partitions, vec!["alpha", "beta"]);
}
