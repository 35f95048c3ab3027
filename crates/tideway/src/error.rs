// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the tideway engine.
//!
//! Every error carries a stable machine-readable code via [`EngineError::error_code`],
//! and the whole taxonomy round-trips through text (see [`crate::serialization`]) so
//! persisted run and operation errors stay reconstructable objects.

use crate::cancel::CancelReason;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine, its durable steps, and the store.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The referenced run does not exist.
    #[error("run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// No workflow is registered under the given name.
    #[error("workflow '{name}' is not registered")]
    WorkflowNotFound {
        /// The workflow name that was looked up.
        name: String,
    },

    /// No queue is declared under the given name.
    #[error("queue '{name}' is not declared")]
    QueueNotFound {
        /// The queue name that was looked up.
        name: String,
    },

    /// The run is in a state that does not admit cancellation.
    #[error("run '{run_id}' cannot be cancelled from status '{status}'")]
    RunNotCancellable {
        /// The run ID.
        run_id: String,
        /// The run's current status.
        status: String,
    },

    /// The run was cancelled by an explicit cancel request.
    #[error("run '{run_id}' was cancelled")]
    RunCancelled {
        /// The cancelled run ID.
        run_id: String,
    },

    /// The run exceeded its relative timeout.
    #[error("run '{run_id}' timed out after {timeout_ms}ms")]
    RunTimedOut {
        /// The run ID.
        run_id: String,
        /// The configured timeout in milliseconds.
        timeout_ms: i64,
    },

    /// The run crossed its absolute deadline.
    #[error("run '{run_id}' exceeded its deadline ({deadline_epoch_ms})")]
    RunDeadlineExceeded {
        /// The run ID.
        run_id: String,
        /// The deadline as epoch milliseconds.
        deadline_epoch_ms: i64,
    },

    /// The run was recovered more times than the configured maximum allows.
    #[error("run '{run_id}' exceeded {attempts} recovery attempts")]
    MaxRecoveryAttemptsExceeded {
        /// The run ID.
        run_id: String,
        /// The number of recovery attempts consumed.
        attempts: i32,
    },

    /// A step exhausted its retry budget. Carries every attempt's error, serialized.
    #[error("step '{step}' failed after {} attempts", attempts.len())]
    MaxRetriesExceeded {
        /// The step name.
        step: String,
        /// Each attempt's serialized error, oldest first.
        attempts: Vec<String>,
    },

    /// A step marked its own failure as non-retryable.
    #[error("fatal step error: {message}")]
    Fatal {
        /// The failure description.
        message: String,
    },

    /// A value or error could not be (de)serialized.
    #[error("serialization failed: {details}")]
    Serialization {
        /// Details of the serialization failure.
        details: String,
    },

    /// A step helper was invoked outside of an active run context.
    #[error("'{operation}' must be called from within a workflow run")]
    RunOutsideOfWorkflow {
        /// The operation that was misused.
        operation: String,
    },

    /// A database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
        /// Whether the failure class is transiently retryable.
        retryable: bool,
    },

    /// An error that could not be classified (including errors reconstructed
    /// from text whose code is not recognized by this version).
    #[error("{message}")]
    Unknown {
        /// The error description.
        message: String,
    },
}

impl EngineError {
    /// Get the stable error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::QueueNotFound { .. } => "QUEUE_NOT_FOUND",
            Self::RunNotCancellable { .. } => "RUN_NOT_CANCELLABLE",
            Self::RunCancelled { .. } => "RUN_CANCELLED",
            Self::RunTimedOut { .. } => "RUN_TIMED_OUT",
            Self::RunDeadlineExceeded { .. } => "RUN_DEADLINE_EXCEEDED",
            Self::MaxRecoveryAttemptsExceeded { .. } => "MAX_RECOVERY_ATTEMPTS_EXCEEDED",
            Self::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
            Self::Fatal { .. } => "FATAL_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::RunOutsideOfWorkflow { .. } => "RUN_OUTSIDE_OF_WORKFLOW",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    /// True for the cancellation family (explicit cancel, timeout, deadline).
    ///
    /// These must propagate out of a durable step *without* being recorded, so
    /// the execution primitive can finalize the run exactly once.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::RunCancelled { .. } | Self::RunTimedOut { .. } | Self::RunDeadlineExceeded { .. }
        )
    }

    /// True if the error is a transient database failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database { retryable: true, .. })
    }

    /// Build the cancellation-family error for a fired cancel reason.
    pub(crate) fn from_cancel_reason(run_id: &str, reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => Self::RunCancelled {
                run_id: run_id.to_string(),
            },
            CancelReason::TimedOut { timeout_ms } => Self::RunTimedOut {
                run_id: run_id.to_string(),
                timeout_ms,
            },
            CancelReason::DeadlineExceeded { deadline_epoch_ms } => Self::RunDeadlineExceeded {
                run_id: run_id.to_string(),
                deadline_epoch_ms,
            },
        }
    }
}

/// Transient failure classes worth retrying with backoff: connection drops,
/// serialization/deadlock conflicts, lock-not-available, resource exhaustion.
fn sqlx_error_is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => {
                let code = code.as_ref();
                // 40001 serialization_failure, 40P01 deadlock_detected,
                // 55P03 lock_not_available, 53xxx insufficient resources,
                // 08xxx connection exceptions. SQLITE_BUSY surfaces as code "5".
                code == "40001"
                    || code == "40P01"
                    || code == "55P03"
                    || code.starts_with("53")
                    || code.starts_with("08")
                    || code == "5"
            }
            None => false,
        },
        _ => false,
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        let retryable = sqlx_error_is_retryable(&err);
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
            retryable,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization {
            details: err.to_string(),
        }
    }
}
