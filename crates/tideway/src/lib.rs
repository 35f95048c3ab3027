// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tideway - Durable Workflow Execution Engine
//!
//! Workflows run as ordinary async functions, but every side-effecting step
//! is durably logged: if the process crashes mid-execution, a replacement
//! executor resumes exactly where it left off without re-running completed
//! side effects. On top of the replay core the engine provides queued
//! execution with concurrency/rate/partition admission control, cross-run
//! messaging, shared key/value state, and cooperative cancellation with
//! timeout and deadline semantics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Workflow Functions                        │
//! │        (user code, calling the durable step helpers)         │
//! └──────────────────────────────────────────────────────────────┘
//!          │ steps::{step, sleep, send_message, run_workflow, …}
//!          ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  Execution Primitive · Run Registry · Queue Dispatcher       │
//! │  Recovery Sweep · Run/Message/State Event Buses              │
//! └──────────────────────────────────────────────────────────────┘
//!          │ Store trait (operation log, runs, mailboxes, state)
//!          ▼
//! ┌───────────────────────┐        ┌───────────────────────────┐
//! │      PostgreSQL       │        │          SQLite           │
//! │  (LISTEN/NOTIFY push) │        │  (embedded, in-proc push) │
//! └───────────────────────┘        └───────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use tideway::{Engine, EngineConfig, RunOptions, SqliteStore};
//!
//! let store = std::sync::Arc::new(SqliteStore::from_path(".data/app.db").await?);
//! let engine = Engine::new(store, EngineConfig::default());
//!
//! engine.register_workflow("greet", |inputs| async move {
//!     let name = tideway::steps::step("fetch-name", Default::default(), || async {
//!         Ok(inputs["name"].as_str().unwrap_or("world").to_string())
//!     })
//!     .await?;
//!     Ok(json!(format!("hello, {name}")))
//! });
//!
//! engine.start().await?;
//! let result = engine
//!     .run_workflow("greet", json!({"name": "tide"}), RunOptions::default())
//!     .await?;
//! ```

#![deny(missing_docs)]

/// Cancellation token combinator (explicit cancel, timeout, deadline).
pub mod cancel;

/// Engine and queue configuration.
pub mod config;

/// Ambient per-run execution context.
pub mod context;

/// Error taxonomy.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Durable record shapes and the run lifecycle state machine.
pub mod model;

/// Value and error (de)serialization.
pub mod serialization;

/// Durable step helpers, callable from inside workflow functions.
pub mod steps;

/// Persistence interfaces and backends.
pub mod store;

mod dispatcher;
mod engine;
mod events;
mod oplog;
mod recovery;
mod registry;

pub use cancel::{CancelReason, CancelToken};
pub use config::{EngineConfig, QueueConfig, RateLimit};
pub use engine::{Engine, EnqueueOptions, RunOptions};
pub use error::{EngineError, Result};
pub use model::{CreatedRun, RunRecord, RunStatus};
pub use steps::StepOptions;
pub use store::{PostgresStore, RetryingStore, SqliteStore, Store};
