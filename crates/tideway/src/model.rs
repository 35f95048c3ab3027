// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable record shapes and the run lifecycle state machine.
//!
//! The relational store is the single owner of run/operation/message/state
//! truth; everything in-process is a cache over these rows.

use chrono::{DateTime, Utc};

/// Lifecycle status of a run.
///
/// Created as `Pending` (direct execution) or `Queued` (deferred execution).
/// `Queued → Pending` on a successful dispatch claim. Once a terminal status
/// is reached no further transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Owned by an executor and executing (or stranded mid-flight by a crash).
    Pending,
    /// Waiting in a queue for a dispatch claim.
    Queued,
    /// Terminal: completed with an output.
    Success,
    /// Terminal: completed with an error.
    Error,
    /// Terminal: cancelled before completion.
    Cancelled,
    /// Terminal: recovery was attempted more times than allowed.
    MaxRecoveryAttemptsExceeded,
}

impl RunStatus {
    /// The persisted text form of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::MaxRecoveryAttemptsExceeded => "max_recovery_attempts_exceeded",
        }
    }

    /// Parse the persisted text form.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            "max_recovery_attempts_exceeded" => Some(Self::MaxRecoveryAttemptsExceeded),
            _ => None,
        }
    }

    /// True for statuses from which no further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Cancelled | Self::MaxRecoveryAttemptsExceeded
        )
    }
}

/// Separator for the persisted `path` column.
const PATH_SEPARATOR: char = '/';

/// Join a root-first ancestor id list (self last) into its persisted form.
pub fn join_path(ids: &[String]) -> String {
    ids.join(&PATH_SEPARATOR.to_string())
}

/// Split a persisted path back into its root-first id list.
pub fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.split(PATH_SEPARATOR).map(str::to_string).collect()
}

/// One run row: a single invocation of a workflow, root or nested.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Unique run identifier.
    pub id: String,
    /// Root-first ancestor ids joined with '/', self last. Descendants of a
    /// run are exactly the rows whose path extends this run's path.
    pub path: String,
    /// Declared name of the workflow to execute.
    pub workflow_name: String,
    /// Serialized argument payload.
    pub inputs: String,
    /// Serialized output; mutually exclusive with `error`.
    pub output: Option<String>,
    /// Serialized error; mutually exclusive with `output`.
    pub error: Option<String>,
    /// Persisted status text (see [`RunStatus`]).
    pub status: String,
    /// Executor currently (or last) owning execution; NULL while queued.
    pub executor_id: Option<String>,
    /// Monotonic version counter, bumped on every mutating write. Doubles as
    /// the notification dedup token.
    pub change_id: i64,
    /// Relative timeout in milliseconds, armed at execution start.
    pub timeout_ms: Option<i64>,
    /// Absolute deadline as epoch milliseconds.
    pub deadline_epoch_ms: Option<i64>,
    /// Queue this run was enqueued on, if deferred.
    pub queue_name: Option<String>,
    /// Partition key within the queue, if the queue partitions.
    pub queue_partition_key: Option<String>,
    /// Deduplication key; at most one queued run per (queue, key).
    pub queue_deduplication_id: Option<String>,
    /// Dequeue priority (lower first) when the queue honors priority.
    pub priority: Option<i32>,
    /// Number of crash-recovery attempts consumed so far.
    pub recovery_attempts: i32,
    /// When execution last started (stamped at claim/start).
    pub started_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// The parsed status, or `None` for a row written by a newer version.
    pub fn run_status(&self) -> Option<RunStatus> {
        RunStatus::parse(&self.status)
    }

    /// True once the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.run_status().map(|s| s.is_terminal()).unwrap_or(false)
    }

    /// Root-first id list decoded from the path column.
    pub fn path_ids(&self) -> Vec<String> {
        split_path(&self.path)
    }
}

/// One durable step's recorded outcome. Append-only: rows are never updated
/// or deleted once written, replay correctness depends on it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRecord {
    /// The run this operation belongs to.
    pub run_id: String,
    /// Position in the run's happens-before order.
    pub sequence_id: i64,
    /// Serialized step output. Absent together with `error` means the step
    /// executed with a void result.
    pub output: Option<String>,
    /// Serialized step error.
    pub error: Option<String>,
    /// When the outcome was recorded.
    pub created_at: DateTime<Utc>,
}

/// One inbound mailbox entry, consumed FIFO per (destination, type).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRecord {
    /// Database primary key.
    pub id: i64,
    /// The run this message is addressed to.
    pub destination_run_id: String,
    /// Message type; receive operations match on it.
    pub message_type: String,
    /// Serialized payload.
    pub payload: String,
    /// When the message was sent.
    pub created_at: DateTime<Utc>,
}

/// Latest shared-state value for one (run, key).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StateRecord {
    /// The run that owns the key.
    pub run_id: String,
    /// State key.
    pub key: String,
    /// Serialized latest value; overwritten on every write.
    pub value: String,
    /// Monotonic per-key version counter for notification dedup.
    pub change_id: i64,
    /// When the value was last written.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for inserting a new run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Unique run identifier.
    pub id: String,
    /// Root-first ancestor ids, self last.
    pub path: Vec<String>,
    /// Declared workflow name.
    pub workflow_name: String,
    /// Serialized argument payload.
    pub inputs: String,
    /// Initial status: `Pending` for direct runs, `Queued` for deferred.
    pub status: RunStatus,
    /// Owning executor; `None` for queued runs.
    pub executor_id: Option<String>,
    /// Relative timeout in milliseconds.
    pub timeout_ms: Option<i64>,
    /// Absolute deadline as epoch milliseconds.
    pub deadline_epoch_ms: Option<i64>,
    /// Target queue for deferred runs.
    pub queue_name: Option<String>,
    /// Partition key within the queue.
    pub queue_partition_key: Option<String>,
    /// Deduplication key within the queue.
    pub queue_deduplication_id: Option<String>,
    /// Dequeue priority (lower first).
    pub priority: Option<i32>,
}

/// Result of inserting a new run row.
#[derive(Debug, Clone)]
pub struct CreatedRun {
    /// The id of the effective run: the new row, or the existing one when
    /// deduplicated.
    pub run_id: String,
    /// True when an existing row (same id, or same queue deduplication key)
    /// absorbed the insert.
    pub deduplicated: bool,
}

/// Outcome of a recovery-attempt bump for one stranded run.
#[derive(Debug, Clone)]
pub enum RecoveryDecision {
    /// The attempt was granted; resume the run with this (updated) row.
    Resume(Box<RunRecord>),
    /// The configured maximum was exceeded; the run has been finalized as
    /// `max_recovery_attempts_exceeded`.
    Exceeded,
    /// The run is no longer pending (completed or cancelled since the sweep
    /// query); nothing to do.
    Skip,
}
