// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends.
//!
//! The [`Store`] trait is the engine's only view of durable truth. Two
//! backends are provided: [`postgres::PostgresStore`] (production, with
//! LISTEN/NOTIFY push) and [`sqlite::SqliteStore`] (embedded and test use,
//! poll-driven with an in-process push channel). [`retry::RetryingStore`]
//! wraps either and transparently retries transient failures.

pub mod postgres;
pub mod retry;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::retry::RetryingStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::model::{
    CreatedRun, NewRun, OperationRecord, RecoveryDecision, RunRecord, RunStatus,
};

/// Notification channel for run status changes.
pub const RUNS_CHANNEL: &str = "tideway_runs";
/// Notification channel for message availability.
pub const MESSAGES_CHANNEL: &str = "tideway_messages";
/// Notification channel for state writes.
pub const STATE_CHANNEL: &str = "tideway_state";

/// Which logical channel a push notification arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushChannel {
    /// Run status changes: `<runId>::<status>::<changeId>`.
    Runs,
    /// Message availability: `<destinationRunId>::<type>::<count>`.
    Messages,
    /// State writes: `<runId>::<key>::<changeId>`.
    State,
}

impl PushChannel {
    /// Map a raw channel name to its logical channel.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            RUNS_CHANNEL => Some(Self::Runs),
            MESSAGES_CHANNEL => Some(Self::Messages),
            STATE_CHANNEL => Some(Self::State),
            _ => None,
        }
    }
}

/// A parsed push notification.
#[derive(Debug, Clone)]
pub struct PushNotification {
    /// The logical channel.
    pub channel: PushChannel,
    /// Primary entity id (run id or destination run id).
    pub entity_id: String,
    /// Secondary key: status text, message type, or state key.
    pub secondary: String,
    /// Change id (runs/state) or message count (messages).
    pub change: i64,
}

/// Encode a push payload as `<entityId>::<secondaryKey>::<changeIdOrCount>`.
pub fn format_push_payload(entity_id: &str, secondary: &str, change: i64) -> String {
    format!("{}::{}::{}", entity_id, secondary, change)
}

/// Parse a push payload. Returns `None` for empty or malformed payloads;
/// consumers fall back to the poll path in that case.
pub fn parse_push_payload(channel: PushChannel, payload: &str) -> Option<PushNotification> {
    let mut parts = payload.splitn(3, "::");
    let entity_id = parts.next()?.to_string();
    let secondary = parts.next()?.to_string();
    let change: i64 = parts.next()?.parse().ok()?;
    if entity_id.is_empty() {
        return None;
    }
    Some(PushNotification {
        channel,
        entity_id,
        secondary,
        change,
    })
}

/// LIKE pattern matching every strict descendant of `path`.
///
/// Run ids are caller-supplied and may contain `%`, `_`, or `\`; those are
/// escaped so the pattern matches them literally. Queries binding this
/// pattern must declare `ESCAPE '\'`.
pub(crate) fn descendant_like_pattern(path: &str) -> String {
    let mut pattern = String::with_capacity(path.len() + 2);
    for c in path.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("/%");
    pattern
}

/// Durable storage contract used by the engine.
///
/// All mutating run writes bump the row's `change_id`; terminal statuses are
/// never overwritten. Methods that pair a side effect with an operation-log
/// record (`recorded` parameters) commit both in one transaction so replay
/// never observes the effect without its record or vice versa.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new run row.
    ///
    /// Deduplicates on the run id (deterministic child ids) and on the
    /// queue's `(queue_name, queue_deduplication_id)` pair; when an existing
    /// row absorbs the insert the returned [`CreatedRun`] points at it.
    async fn create_run(&self, new_run: &NewRun) -> Result<CreatedRun, EngineError>;

    /// Fetch one run row.
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError>;

    /// Batch-fetch run rows (poll path of the run event bus).
    async fn get_runs(&self, run_ids: &[String]) -> Result<Vec<RunRecord>, EngineError>;

    /// Transition a run to a terminal status with its output xor error.
    ///
    /// Returns `false` (without writing) if the run is already terminal.
    /// Errors with [`EngineError::RunNotFound`] if the row does not exist.
    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, EngineError>;

    /// Record an error detail on a run without touching its status.
    ///
    /// Used when the caller itself cancelled the run: the row is already
    /// `cancelled` and must not flip to `error`.
    async fn record_run_error_keeping_status(
        &self,
        run_id: &str,
        error: &str,
    ) -> Result<(), EngineError>;

    /// Cancel a run and, when `cascade` is set, every non-terminal descendant
    /// (path-prefix match) in the same transaction. Returns the ids that were
    /// actually flipped to `cancelled`.
    ///
    /// Errors with [`EngineError::RunNotFound`] if the target does not exist
    /// and [`EngineError::RunNotCancellable`] if it is already terminal.
    async fn cancel_runs(&self, run_id: &str, cascade: bool) -> Result<Vec<String>, EngineError>;

    /// Claim admissible queued runs for this executor in one transaction:
    /// rate-limit window check, concurrency budget, locked selection ordered
    /// by priority/creation, then `queued → pending` with owner and start
    /// time stamped. Returns the claimed rows.
    async fn claim_queued_runs(
        &self,
        queue: &QueueConfig,
        partition: Option<&str>,
        executor_id: &str,
    ) -> Result<Vec<RunRecord>, EngineError>;

    /// Distinct partition keys currently holding queued work for a queue.
    async fn queued_partitions(&self, queue_name: &str) -> Result<Vec<String>, EngineError>;

    /// Load a run's full operation log ordered by sequence id ascending.
    async fn load_operations(&self, run_id: &str) -> Result<Vec<OperationRecord>, EngineError>;

    /// Append one operation outcome. Append-only; `(run_id, sequence_id)` is
    /// unique and rows are never updated.
    async fn append_operation(
        &self,
        run_id: &str,
        sequence_id: i64,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Insert a message for a destination run, optionally recording the
    /// sender's operation in the same transaction.
    ///
    /// Errors with [`EngineError::RunNotFound`] if the destination does not
    /// exist.
    async fn send_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
        payload: &str,
    ) -> Result<(), EngineError>;

    /// Delete-and-return the oldest message for `(destination, type)`,
    /// optionally recording the consumer's operation in the same transaction.
    /// Returns `None` when the mailbox is empty (no record is written).
    async fn consume_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
    ) -> Result<Option<String>, EngineError>;

    /// For each `(destination, type)` key with at least one message, return
    /// `(destination, type, count)`. A type of `*` matches any message for
    /// the destination. Existence-based: never suppressed by change ids.
    async fn matching_message_keys(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, String, i64)>, EngineError>;

    /// Overwrite the latest value for `(run, key)`, append the write to the
    /// state history, and record the writer's operation, in one transaction.
    async fn set_state(
        &self,
        run_id: &str,
        sequence_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError>;

    /// Read the latest value for `(run, key)`.
    async fn get_state(&self, run_id: &str, key: &str) -> Result<Option<String>, EngineError>;

    /// Batch-read latest values for `(run, key)` pairs (state bus poll path).
    /// Returns `(run_id, key, value, change_id)` for keys that exist.
    async fn get_states(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, String, String, i64)>, EngineError>;

    /// Runs left `pending` under the given executor id (crash recovery sweep).
    async fn runs_owned_by(&self, executor_id: &str) -> Result<Vec<RunRecord>, EngineError>;

    /// Bump a stranded run's recovery attempt counter, finalizing it as
    /// `max_recovery_attempts_exceeded` when the cap is crossed.
    async fn begin_recovery_attempt(
        &self,
        run_id: &str,
        max_attempts: i32,
    ) -> Result<RecoveryDecision, EngineError>;

    /// Subscribe to the store's push notification stream.
    ///
    /// Returns `None` when the backend has no push support; the event buses
    /// then rely purely on their poll paths.
    async fn subscribe_push(
        &self,
    ) -> Result<Option<broadcast::Receiver<PushNotification>>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let payload = format_push_payload("run-1", "success", 7);
        assert_eq!(payload, "run-1::success::7");

        let parsed = parse_push_payload(PushChannel::Runs, &payload).unwrap();
        assert_eq!(parsed.entity_id, "run-1");
        assert_eq!(parsed.secondary, "success");
        assert_eq!(parsed.change, 7);
    }

    #[test]
    fn test_payload_with_separator_free_secondary() {
        let parsed = parse_push_payload(PushChannel::Messages, "run-2::ping::3").unwrap();
        assert_eq!(parsed.channel, PushChannel::Messages);
        assert_eq!(parsed.secondary, "ping");
        assert_eq!(parsed.change, 3);
    }

    #[test]
    fn test_malformed_payloads_are_tolerated() {
        assert!(parse_push_payload(PushChannel::Runs, "").is_none());
        assert!(parse_push_payload(PushChannel::Runs, "just-an-id").is_none());
        assert!(parse_push_payload(PushChannel::Runs, "a::b").is_none());
        assert!(parse_push_payload(PushChannel::Runs, "a::b::not-a-number").is_none());
        assert!(parse_push_payload(PushChannel::Runs, "::status::1").is_none());
    }

    #[test]
    fn test_descendant_pattern_escapes_metacharacters() {
        assert_eq!(descendant_like_pattern("run-1"), "run-1/%");
        assert_eq!(descendant_like_pattern("p-1/p-1-0"), "p-1/p-1-0/%");
        assert_eq!(descendant_like_pattern("a%"), r"a\%/%");
        assert_eq!(descendant_like_pattern("a_b"), r"a\_b/%");
        assert_eq!(descendant_like_pattern(r"a\b"), r"a\\b/%");
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(PushChannel::from_name(RUNS_CHANNEL), Some(PushChannel::Runs));
        assert_eq!(
            PushChannel::from_name(MESSAGES_CHANNEL),
            Some(PushChannel::Messages)
        );
        assert_eq!(
            PushChannel::from_name(STATE_CHANNEL),
            Some(PushChannel::State)
        );
        assert_eq!(PushChannel::from_name("tideway_other"), None);
    }
}
