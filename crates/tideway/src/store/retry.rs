// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transparent retry wrapper for transient store failures.
//!
//! Wraps any [`Store`] and retries calls that fail with a retryable database
//! error (connection drops, serialization/deadlock conflicts, lock
//! contention, resource exhaustion) using jittered exponential backoff.
//! Non-retryable errors and domain errors propagate immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::events::jittered;
use crate::model::{
    CreatedRun, NewRun, OperationRecord, RecoveryDecision, RunRecord, RunStatus,
};

use super::{PushNotification, Store};

/// Store decorator retrying transient failures.
pub struct RetryingStore {
    inner: Arc<dyn Store>,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryingStore {
    /// Wrap `inner`, allowing up to `max_attempts` attempts per call (a value
    /// of zero is treated as one) with `base_delay` backoff doubled per retry.
    pub fn new(inner: Arc<dyn Store>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        jittered(self.base_delay * 2u32.pow(exp))
    }
}

macro_rules! retry {
    ($self:ident, $operation:literal, $call:expr) => {{
        let mut attempt: u32 = 1;
        loop {
            match $call {
                Err(err) if err.is_retryable() && attempt < $self.max_attempts => {
                    let delay = $self.backoff(attempt);
                    warn!(
                        operation = $operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        }
    }};
}

#[async_trait]
impl Store for RetryingStore {
    async fn create_run(&self, new_run: &NewRun) -> Result<CreatedRun, EngineError> {
        retry!(self, "create_run", self.inner.create_run(new_run).await)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        retry!(self, "get_run", self.inner.get_run(run_id).await)
    }

    async fn get_runs(&self, run_ids: &[String]) -> Result<Vec<RunRecord>, EngineError> {
        retry!(self, "get_runs", self.inner.get_runs(run_ids).await)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, EngineError> {
        retry!(
            self,
            "finalize_run",
            self.inner.finalize_run(run_id, status, output, error).await
        )
    }

    async fn record_run_error_keeping_status(
        &self,
        run_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        retry!(
            self,
            "record_run_error_keeping_status",
            self.inner.record_run_error_keeping_status(run_id, error).await
        )
    }

    async fn cancel_runs(&self, run_id: &str, cascade: bool) -> Result<Vec<String>, EngineError> {
        retry!(self, "cancel_runs", self.inner.cancel_runs(run_id, cascade).await)
    }

    async fn claim_queued_runs(
        &self,
        queue: &QueueConfig,
        partition: Option<&str>,
        executor_id: &str,
    ) -> Result<Vec<RunRecord>, EngineError> {
        retry!(
            self,
            "claim_queued_runs",
            self.inner.claim_queued_runs(queue, partition, executor_id).await
        )
    }

    async fn queued_partitions(&self, queue_name: &str) -> Result<Vec<String>, EngineError> {
        retry!(
            self,
            "queued_partitions",
            self.inner.queued_partitions(queue_name).await
        )
    }

    async fn load_operations(&self, run_id: &str) -> Result<Vec<OperationRecord>, EngineError> {
        retry!(self, "load_operations", self.inner.load_operations(run_id).await)
    }

    async fn append_operation(
        &self,
        run_id: &str,
        sequence_id: i64,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        retry!(
            self,
            "append_operation",
            self.inner
                .append_operation(run_id, sequence_id, output, error)
                .await
        )
    }

    async fn send_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
        payload: &str,
    ) -> Result<(), EngineError> {
        retry!(
            self,
            "send_message",
            self.inner
                .send_message(recorded, destination_run_id, message_type, payload)
                .await
        )
    }

    async fn consume_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
    ) -> Result<Option<String>, EngineError> {
        retry!(
            self,
            "consume_message",
            self.inner
                .consume_message(recorded, destination_run_id, message_type)
                .await
        )
    }

    async fn matching_message_keys(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, String, i64)>, EngineError> {
        retry!(
            self,
            "matching_message_keys",
            self.inner.matching_message_keys(keys).await
        )
    }

    async fn set_state(
        &self,
        run_id: &str,
        sequence_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        retry!(
            self,
            "set_state",
            self.inner.set_state(run_id, sequence_id, key, value).await
        )
    }

    async fn get_state(&self, run_id: &str, key: &str) -> Result<Option<String>, EngineError> {
        retry!(self, "get_state", self.inner.get_state(run_id, key).await)
    }

    async fn get_states(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, String, String, i64)>, EngineError> {
        retry!(self, "get_states", self.inner.get_states(keys).await)
    }

    async fn runs_owned_by(&self, executor_id: &str) -> Result<Vec<RunRecord>, EngineError> {
        retry!(self, "runs_owned_by", self.inner.runs_owned_by(executor_id).await)
    }

    async fn begin_recovery_attempt(
        &self,
        run_id: &str,
        max_attempts: i32,
    ) -> Result<RecoveryDecision, EngineError> {
        retry!(
            self,
            "begin_recovery_attempt",
            self.inner.begin_recovery_attempt(run_id, max_attempts).await
        )
    }

    async fn subscribe_push(
        &self,
    ) -> Result<Option<broadcast::Receiver<PushNotification>>, EngineError> {
        // Subscription setup is not a per-call hot path; no retry.
        self.inner.subscribe_push().await
    }
}
