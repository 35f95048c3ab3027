// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation log replay: the deterministic-replay core.
//!
//! Every durable step follows one rule: *check for a replayed result first;
//! only if absent, perform the real effect, then record it.* The
//! [`OperationManager`] owns the replay cursor and sequence allocation for
//! one run; [`execute_and_record`] is the generic step wrapper.
//!
//! A manager instance belongs to exactly one run execution and is never
//! reused across runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;
use tracing::debug;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::model::OperationRecord;
use crate::serialization;

/// Replay cursor and sequence allocator for one run.
pub struct OperationManager {
    run_id: String,
    /// Previously-recorded outcomes, sequence ascending, loaded once.
    replay: Vec<OperationRecord>,
    /// Index of the next not-yet-consumed replayed outcome.
    cursor: Mutex<usize>,
    /// Next sequence id for brand-new operations.
    next_sequence_id: AtomicI64,
}

impl OperationManager {
    /// Build a manager for `run_id`, seeded with any previously-recorded
    /// operations (ordered by sequence id ascending). An empty list means a
    /// fresh first execution.
    pub fn new(run_id: impl Into<String>, replay: Vec<OperationRecord>) -> Self {
        let next = replay.last().map(|op| op.sequence_id + 1).unwrap_or(0);
        Self {
            run_id: run_id.into(),
            replay,
            cursor: Mutex::new(0),
            next_sequence_id: AtomicI64::new(next),
        }
    }

    /// The run this manager belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Consume the next not-yet-replayed recorded outcome, advancing the
    /// cursor. `None` means the step reaching this point has never run
    /// before and must execute for real.
    pub fn next_replayed(&self) -> Option<OperationRecord> {
        let mut cursor = self.cursor.lock().expect("oplog cursor poisoned");
        let record = self.replay.get(*cursor).cloned()?;
        *cursor += 1;
        Some(record)
    }

    /// Allocate the sequence id for a brand-new (non-replayed) operation.
    pub fn reserve_sequence_id(&self) -> i64 {
        self.next_sequence_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of replayed outcomes consumed so far.
    pub fn replayed_count(&self) -> usize {
        *self.cursor.lock().expect("oplog cursor poisoned")
    }
}

/// Convert a recorded outcome back into the step's result.
pub(crate) fn replayed_result(record: &OperationRecord) -> Result<Value, EngineError> {
    if let Some(error) = &record.error {
        return Err(serialization::deserialize_error(error));
    }
    match &record.output {
        Some(output) => serialization::deserialize(output),
        // Step executed with a void result.
        None => Ok(Value::Null),
    }
}

/// Run one durable step: replay check, cancellation checks, effect, record.
///
/// Thrown errors become recorded error entries — except the cancellation
/// family, which propagates un-recorded so the execution primitive can
/// finalize the run as cancelled exactly once.
pub(crate) async fn execute_and_record<F, Fut>(
    ctx: &RunContext,
    name: &str,
    effect: F,
) -> Result<Value, EngineError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Value, EngineError>>,
{
    let manager = ctx.oplog();

    if let Some(record) = manager.next_replayed() {
        debug!(
            run_id = %ctx.run_id(),
            step = name,
            sequence_id = record.sequence_id,
            "replaying recorded operation"
        );
        return replayed_result(&record);
    }

    // A cancellation observed before the effect starts must win without
    // leaving any record behind.
    if let Some(reason) = ctx.cancel_token().fired_reason() {
        return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
    }

    let sequence_id = manager.reserve_sequence_id();
    let outcome = effect().await;

    // Check again before committing: an abandoned run must not append new
    // durable results after its cancellation fired.
    if let Some(reason) = ctx.cancel_token().fired_reason() {
        return Err(EngineError::from_cancel_reason(ctx.run_id(), reason));
    }

    match outcome {
        Ok(value) => {
            let output = serialization::serialize(&value)?;
            ctx.store()
                .append_operation(ctx.run_id(), sequence_id, Some(&output), None)
                .await?;
            Ok(value)
        }
        Err(err) if err.is_cancellation() => Err(err),
        Err(err) => {
            let serialized = serialization::serialize_error(&err);
            ctx.store()
                .append_operation(ctx.run_id(), sequence_id, None, Some(&serialized))
                .await?;
            Err(err)
        }
    }
}
