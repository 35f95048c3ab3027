// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ambient per-run execution context.
//!
//! A [`RunContext`] is bound to a task-local for exactly the lifetime of one
//! run's execution, so nested step and workflow code can retrieve it without
//! explicit threading. Each run gets a fresh context; it never leaks into a
//! sibling run's call stack. Step helpers invoked outside an active run fail
//! fast with [`EngineError::RunOutsideOfWorkflow`].

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::oplog::OperationManager;
use crate::store::Store;

tokio::task_local! {
    static CURRENT_RUN: RunContext;
}

/// Per-run bundle of identity, cancellation, replay state, and engine handles.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    run_id: String,
    path: Vec<String>,
    cancel: CancelToken,
    oplog: OperationManager,
    engine: Arc<EngineInner>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.inner.run_id)
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub(crate) fn new(
        run_id: String,
        path: Vec<String>,
        cancel: CancelToken,
        oplog: OperationManager,
        engine: Arc<EngineInner>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                path,
                cancel,
                oplog,
                engine,
            }),
        }
    }

    /// The context of the run executing on the current task.
    ///
    /// `operation` names the caller for the misuse error message.
    pub fn try_current(operation: &str) -> Result<Self, EngineError> {
        CURRENT_RUN
            .try_with(|ctx| ctx.clone())
            .map_err(|_| EngineError::RunOutsideOfWorkflow {
                operation: operation.to_string(),
            })
    }

    /// Bind this context to the task-local for the duration of `fut`.
    pub(crate) async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_RUN.scope(self, fut).await
    }

    /// The id of this run.
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Root-first ancestor ids, self last.
    pub fn path(&self) -> &[String] {
        &self.inner.path
    }

    /// The executor owning this run's execution.
    pub fn executor_id(&self) -> &str {
        &self.inner.engine.config.executor_id
    }

    /// This run's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    /// This run's operation manager.
    pub(crate) fn oplog(&self) -> &OperationManager {
        &self.inner.oplog
    }

    /// The durable store.
    pub(crate) fn store(&self) -> Arc<dyn Store> {
        self.inner.engine.store.clone()
    }

    /// The owning engine internals.
    pub(crate) fn engine(&self) -> &Arc<EngineInner> {
        &self.inner.engine
    }
}
