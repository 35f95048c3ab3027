// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Text (de)serialization of user payloads and errors.
//!
//! The store persists arbitrary workflow inputs, outputs, state values, and
//! message payloads as JSON text. Errors are persisted as structured objects
//! ([`SerializedError`]) so a waiter on another process can reconstruct the
//! failure, never an opaque string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Serialize a JSON value to its persisted text form.
pub fn serialize(value: &Value) -> Result<String, EngineError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a persisted text payload back into a JSON value.
pub fn deserialize(text: &str) -> Result<Value, EngineError> {
    Ok(serde_json::from_str(text)?)
}

/// The persisted shape of an [`EngineError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedError {
    /// Stable error code, e.g. `RUN_CANCELLED`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Variant-specific detail used to rebuild structured errors.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Serialize an error to its persisted text form. Infallible: a failure to
/// encode details degrades to a bare code + message.
pub fn serialize_error(error: &EngineError) -> String {
    let details = match error {
        EngineError::RunTimedOut { timeout_ms, .. } => {
            serde_json::json!({ "timeout_ms": timeout_ms })
        }
        EngineError::RunDeadlineExceeded {
            deadline_epoch_ms, ..
        } => serde_json::json!({ "deadline_epoch_ms": deadline_epoch_ms }),
        EngineError::MaxRecoveryAttemptsExceeded { attempts, .. } => {
            serde_json::json!({ "attempts": attempts })
        }
        EngineError::MaxRetriesExceeded { step, attempts } => {
            serde_json::json!({ "step": step, "attempts": attempts })
        }
        EngineError::RunNotFound { run_id }
        | EngineError::RunCancelled { run_id }
        | EngineError::RunNotCancellable { run_id, .. } => {
            serde_json::json!({ "run_id": run_id })
        }
        _ => Value::Null,
    };

    let serialized = SerializedError {
        code: error.error_code().to_string(),
        message: error.to_string(),
        details,
    };
    serde_json::to_string(&serialized).unwrap_or_else(|_| {
        format!(
            r#"{{"code":"{}","message":"serialization of error details failed"}}"#,
            error.error_code()
        )
    })
}

/// Reconstruct an [`EngineError`] from its persisted text form.
///
/// Unrecognized codes (or malformed text) become [`EngineError::Unknown`]
/// preserving the message.
pub fn deserialize_error(text: &str) -> EngineError {
    let Ok(serialized) = serde_json::from_str::<SerializedError>(text) else {
        return EngineError::Unknown {
            message: text.to_string(),
        };
    };

    let run_id = serialized.details["run_id"].as_str().unwrap_or("").to_string();
    match serialized.code.as_str() {
        "RUN_NOT_FOUND" => EngineError::RunNotFound { run_id },
        "RUN_CANCELLED" => EngineError::RunCancelled { run_id },
        "RUN_TIMED_OUT" => EngineError::RunTimedOut {
            run_id,
            timeout_ms: serialized.details["timeout_ms"].as_i64().unwrap_or(0),
        },
        "RUN_DEADLINE_EXCEEDED" => EngineError::RunDeadlineExceeded {
            run_id,
            deadline_epoch_ms: serialized.details["deadline_epoch_ms"]
                .as_i64()
                .unwrap_or(0),
        },
        "MAX_RECOVERY_ATTEMPTS_EXCEEDED" => EngineError::MaxRecoveryAttemptsExceeded {
            run_id,
            attempts: serialized.details["attempts"].as_i64().unwrap_or(0) as i32,
        },
        "MAX_RETRIES_EXCEEDED" => EngineError::MaxRetriesExceeded {
            step: serialized.details["step"].as_str().unwrap_or("").to_string(),
            attempts: serialized.details["attempts"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        },
        "FATAL_ERROR" => EngineError::Fatal {
            message: serialized.message,
        },
        "SERIALIZATION_ERROR" => EngineError::Serialization {
            details: serialized.message,
        },
        _ => EngineError::Unknown {
            message: serialized.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let value = serde_json::json!({ "n": 1, "s": "x-y", "nested": [1, 2, 3] });
        let text = serialize(&value).unwrap();
        assert_eq!(deserialize(&text).unwrap(), value);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(deserialize("not json").is_err());
    }

    #[test]
    fn test_error_round_trip_timeout() {
        let err = EngineError::RunTimedOut {
            run_id: "r1".into(),
            timeout_ms: 50,
        };
        let text = serialize_error(&err);
        match deserialize_error(&text) {
            EngineError::RunTimedOut { run_id, timeout_ms } => {
                assert_eq!(run_id, "r1");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected reconstruction: {:?}", other),
        }
    }

    #[test]
    fn test_error_round_trip_max_retries() {
        let inner = serialize_error(&EngineError::Fatal {
            message: "attempt failed".into(),
        });
        let err = EngineError::MaxRetriesExceeded {
            step: "charge-card".into(),
            attempts: vec![inner.clone(), inner],
        };
        let text = serialize_error(&err);
        match deserialize_error(&text) {
            EngineError::MaxRetriesExceeded { step, attempts } => {
                assert_eq!(step, "charge-card");
                assert_eq!(attempts.len(), 2);
                assert!(matches!(
                    deserialize_error(&attempts[0]),
                    EngineError::Fatal { .. }
                ));
            }
            other => panic!("unexpected reconstruction: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_code_degrades_to_unknown() {
        let text = r#"{"code":"FROM_THE_FUTURE","message":"novel failure"}"#;
        match deserialize_error(text) {
            EngineError::Unknown { message } => assert_eq!(message, "novel failure"),
            other => panic!("unexpected reconstruction: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_text_degrades_to_unknown() {
        assert!(matches!(
            deserialize_error("plain failure text"),
            EngineError::Unknown { .. }
        ));
    }
}
