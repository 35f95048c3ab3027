// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable step helpers, usable only inside an executing run.
//!
//! Every helper follows the replay rule: a previously-recorded outcome is
//! returned without re-running the side effect; a fresh execution performs
//! the effect and records its outcome under the next sequence id. Helpers
//! that pair a store write with their record (messaging, state) commit both
//! in one transaction. Calling any helper outside a run fails with
//! [`EngineError::RunOutsideOfWorkflow`].

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::context::RunContext;
use crate::engine::{self, EnqueueOptions, RunOptions, await_result, create_run_row, fetch_run};
use crate::error::EngineError;
use crate::model::{NewRun, RunStatus};
use crate::oplog::{execute_and_record, replayed_result};
use crate::serialization;

/// Retry policy for [`step`].
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay per subsequent retry.
    pub backoff_multiplier: f64,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

impl StepOptions {
    /// A single attempt, no retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Where a step stands after the replay and cancellation checks.
enum StepPhase {
    /// A recorded outcome exists; no effect runs.
    Replayed(Result<Value, EngineError>),
    /// First execution; the effect owns this reserved sequence id.
    Fresh(i64),
}

fn begin_step(ctx: &RunContext) -> Result<StepPhase, EngineError> {
    if let Some(record) = ctx.oplog().next_replayed() {
        return Ok(StepPhase::Replayed(replayed_result(&record)));
    }
    if let Some(reason) = ctx.cancel_token().fired_reason() {
        return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
    }
    Ok(StepPhase::Fresh(ctx.oplog().reserve_sequence_id()))
}

/// Run an arbitrary side effect durably, with per-step retries.
///
/// Transient failures are retried per `options` with exponential backoff;
/// a [`EngineError::Fatal`] stops retrying immediately. An exhausted budget
/// records [`EngineError::MaxRetriesExceeded`] carrying every attempt's
/// error. Only the final outcome is recorded, never individual attempts.
pub async fn step<F, Fut, T>(
    name: &str,
    options: StepOptions,
    effect: F,
) -> Result<T, EngineError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
    T: Serialize + DeserializeOwned,
{
    let ctx = RunContext::try_current("step")?;
    let step_name = name.to_string();

    let value = execute_and_record(&ctx, name, || async {
        let mut attempts: Vec<String> = Vec::new();
        let mut delay = options.base_delay;

        loop {
            match effect().await {
                Ok(value) => {
                    return serde_json::to_value(value).map_err(EngineError::from);
                }
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err @ EngineError::Fatal { .. }) => return Err(err),
                Err(err) => {
                    attempts.push(serialization::serialize_error(&err));
                    if attempts.len() as u32 > options.max_retries {
                        if options.max_retries == 0 {
                            // Single-attempt steps keep their original error.
                            return Err(err);
                        }
                        return Err(EngineError::MaxRetriesExceeded {
                            step: step_name.clone(),
                            attempts,
                        });
                    }
                    debug!(
                        step = %step_name,
                        attempt = attempts.len(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step attempt failed; backing off"
                    );
                    tokio::select! {
                        biased;
                        reason = ctx.cancel_token().fired() => {
                            return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.mul_f64(options.backoff_multiplier);
                }
            }
        }
    })
    .await?;

    serde_json::from_value(value).map_err(EngineError::from)
}

/// Durable sleep.
///
/// The absolute wake time is recorded before waiting, so a crash mid-sleep
/// replays into a wait for only the *remaining* duration (possibly zero).
pub async fn sleep(duration: Duration) -> Result<(), EngineError> {
    let ctx = RunContext::try_current("sleep")?;

    let wake_at = execute_and_record(&ctx, "sleep", || async {
        let wake_at = Utc::now().timestamp_millis() + duration.as_millis() as i64;
        Ok(Value::from(wake_at))
    })
    .await?;
    let wake_at_ms = wake_at.as_i64().ok_or_else(|| EngineError::Serialization {
        details: format!("recorded wake time is not an integer: {}", wake_at),
    })?;

    let remaining_ms = wake_at_ms - Utc::now().timestamp_millis();
    if remaining_ms > 0 {
        tokio::select! {
            biased;
            reason = ctx.cancel_token().fired() => {
                return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
            }
            _ = tokio::time::sleep(Duration::from_millis(remaining_ms as u64)) => {}
        }
    }
    Ok(())
}

/// Durable current time: recorded once, identical on every replay.
pub async fn now() -> Result<DateTime<Utc>, EngineError> {
    let ctx = RunContext::try_current("now")?;
    let recorded = execute_and_record(&ctx, "now", || async {
        Ok(Value::from(Utc::now().timestamp_millis()))
    })
    .await?;
    let epoch_ms = recorded.as_i64().ok_or_else(|| EngineError::Serialization {
        details: format!("recorded time is not an integer: {}", recorded),
    })?;
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .ok_or_else(|| EngineError::Serialization {
            details: format!("recorded time out of range: {}", epoch_ms),
        })
}

/// Durable random UUID: generated once, identical on every replay.
pub async fn random_uuid() -> Result<String, EngineError> {
    let ctx = RunContext::try_current("random_uuid")?;
    let recorded = execute_and_record(&ctx, "random_uuid", || async {
        Ok(Value::from(Uuid::new_v4().to_string()))
    })
    .await?;
    recorded
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::Serialization {
            details: format!("recorded uuid is not a string: {}", recorded),
        })
}

/// Durably send a message to another run's mailbox.
///
/// The insert and this run's operation record commit in one transaction, so
/// replay can never double-send.
pub async fn send_message(
    destination_run_id: &str,
    message_type: &str,
    payload: &Value,
) -> Result<(), EngineError> {
    let ctx = RunContext::try_current("send_message")?;
    match begin_step(&ctx)? {
        StepPhase::Replayed(result) => result.map(|_| ()),
        StepPhase::Fresh(sequence_id) => {
            let payload = serialization::serialize(payload)?;
            ctx.store()
                .send_message(
                    Some((ctx.run_id(), sequence_id)),
                    destination_run_id,
                    message_type,
                    &payload,
                )
                .await
        }
    }
}

/// Durably receive the oldest message of `message_type` addressed to this
/// run, waiting up to `timeout` (forever when `None`).
///
/// Returns `None` on timeout; the miss is recorded so replay stays
/// deterministic. Consumption and the operation record commit in one
/// transaction, so a message is delivered at most once even across replays.
pub async fn receive_message(
    message_type: &str,
    timeout: Option<Duration>,
) -> Result<Option<Value>, EngineError> {
    let ctx = RunContext::try_current("receive_message")?;
    let sequence_id = match begin_step(&ctx)? {
        StepPhase::Replayed(result) => {
            return match result? {
                Value::Null => Ok(None),
                payload => Ok(Some(payload)),
            };
        }
        StepPhase::Fresh(sequence_id) => sequence_id,
    };

    // Subscribe before the first consume attempt so a message arriving in
    // between wakes the wait.
    let mut availability = ctx
        .engine()
        .message_events
        .subscribe(ctx.run_id(), message_type);
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        if let Some(payload) = ctx
            .store()
            .consume_message(Some((ctx.run_id(), sequence_id)), ctx.run_id(), message_type)
            .await?
        {
            return Ok(Some(serialization::deserialize(&payload)?));
        }

        tokio::select! {
            biased;
            reason = ctx.cancel_token().fired() => {
                return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
            }
            _ = wait_until(deadline) => {
                // Record the miss; a replay must time out identically.
                ctx.store()
                    .append_operation(ctx.run_id(), sequence_id, None, None)
                    .await?;
                return Ok(None);
            }
            _ = availability.recv() => {
                // A pulse is a hint, not a guarantee; loop and race to consume.
            }
        }
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Durably write this run's shared state under `key` (latest value wins;
/// history is appended). Write and operation record commit together.
pub async fn set_state(key: &str, value: &Value) -> Result<(), EngineError> {
    let ctx = RunContext::try_current("set_state")?;
    match begin_step(&ctx)? {
        StepPhase::Replayed(result) => result.map(|_| ()),
        StepPhase::Fresh(sequence_id) => {
            let value = serialization::serialize(value)?;
            ctx.store()
                .set_state(ctx.run_id(), sequence_id, key, &value)
                .await
        }
    }
}

/// Durably read the latest shared-state value of any run under `key`.
pub async fn get_state(run_id: &str, key: &str) -> Result<Option<Value>, EngineError> {
    let ctx = RunContext::try_current("get_state")?;
    let run_id = run_id.to_string();
    let key = key.to_string();
    let recorded = execute_and_record(&ctx, "get_state", || async {
        match ctx.store().get_state(&run_id, &key).await? {
            Some(raw) => serialization::deserialize(&raw),
            None => Ok(Value::Null),
        }
    })
    .await?;
    match recorded {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

/// Durably execute a child workflow on this executor and wait for its result.
///
/// The child's run id is derived deterministically from this run and the
/// step's sequence id, so a replay re-attaches to the same child instead of
/// spawning a second one. The child's terminal outcome becomes this step's
/// recorded result.
pub async fn run_workflow(
    workflow_name: &str,
    inputs: Value,
    options: RunOptions,
) -> Result<Value, EngineError> {
    let ctx = RunContext::try_current("run_workflow")?;
    let sequence_id = match begin_step(&ctx)? {
        StepPhase::Replayed(result) => return result,
        StepPhase::Fresh(sequence_id) => sequence_id,
    };

    let child_id = child_run_id(&ctx, sequence_id, options.run_id);
    let mut child_path = ctx.path().to_vec();
    child_path.push(child_id.clone());

    let created = create_run_row(
        ctx.engine(),
        NewRun {
            id: child_id.clone(),
            path: child_path,
            workflow_name: workflow_name.to_string(),
            inputs: serialization::serialize(&inputs)?,
            status: RunStatus::Pending,
            executor_id: Some(ctx.executor_id().to_string()),
            timeout_ms: options.timeout_ms,
            deadline_epoch_ms: options.deadline_epoch_ms,
            queue_name: None,
            queue_partition_key: None,
            queue_deduplication_id: None,
            priority: None,
        },
    )
    .await?;

    if !created.deduplicated {
        let row = fetch_run(ctx.engine(), &child_id).await?;
        engine::execute_workflow(ctx.engine(), row, Vec::new()).await?;
    }
    // Deduplicated: the child already exists from a pre-crash execution of
    // this very step; just await its (possibly already terminal) result.

    let result = await_result(ctx.engine(), &child_id).await;
    record_child_outcome(&ctx, sequence_id, result).await
}

/// Durably enqueue a child workflow on a declared queue, without waiting.
/// Returns the child's run id.
///
/// The child row is created first (idempotent via its deterministic id),
/// then the step records the id; a crash in between replays into a
/// deduplicated re-create followed by the record.
pub async fn enqueue_workflow(
    queue_name: &str,
    workflow_name: &str,
    inputs: Value,
    options: EnqueueOptions,
) -> Result<String, EngineError> {
    let ctx = RunContext::try_current("enqueue_workflow")?;
    let sequence_id = match begin_step(&ctx)? {
        StepPhase::Replayed(result) => {
            return result?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| EngineError::Serialization {
                    details: "recorded child run id is not a string".to_string(),
                });
        }
        StepPhase::Fresh(sequence_id) => sequence_id,
    };

    {
        let queues = ctx.engine().queues.read().expect("queue registry poisoned");
        if !queues.contains_key(queue_name) {
            return Err(EngineError::QueueNotFound {
                name: queue_name.to_string(),
            });
        }
    }

    let child_id = child_run_id(&ctx, sequence_id, options.run_id);
    let mut child_path = ctx.path().to_vec();
    child_path.push(child_id.clone());

    create_run_row(
        ctx.engine(),
        NewRun {
            id: child_id.clone(),
            path: child_path,
            workflow_name: workflow_name.to_string(),
            inputs: serialization::serialize(&inputs)?,
            status: RunStatus::Queued,
            executor_id: None,
            timeout_ms: options.timeout_ms,
            deadline_epoch_ms: options.deadline_epoch_ms,
            queue_name: Some(queue_name.to_string()),
            queue_partition_key: options.partition_key,
            queue_deduplication_id: options.deduplication_id,
            priority: options.priority,
        },
    )
    .await?;

    let output = serialization::serialize(&Value::from(child_id.clone()))?;
    ctx.store()
        .append_operation(ctx.run_id(), sequence_id, Some(&output), None)
        .await?;
    Ok(child_id)
}

/// Deterministic child id: parent id plus the step's sequence position.
fn child_run_id(ctx: &RunContext, sequence_id: i64, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| format!("{}-{}", ctx.run_id(), sequence_id))
}

/// Record a child run's settled outcome as this step's result.
///
/// This run's *own* cancellation propagates un-recorded; a child's terminal
/// error (including a cancelled child) is a durable, deterministic outcome
/// and is recorded like any step failure.
async fn record_child_outcome(
    ctx: &RunContext,
    sequence_id: i64,
    result: Result<Value, EngineError>,
) -> Result<Value, EngineError> {
    if let Some(reason) = ctx.cancel_token().fired_reason() {
        return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
    }

    match result {
        Ok(value) => {
            let output = serialization::serialize(&value)?;
            ctx.store()
                .append_operation(ctx.run_id(), sequence_id, Some(&output), None)
                .await?;
            Ok(value)
        }
        Err(err) => {
            let serialized = serialization::serialize_error(&err);
            ctx.store()
                .append_operation(ctx.run_id(), sequence_id, None, Some(&serialized))
                .await?;
            Err(err)
        }
    }
}
