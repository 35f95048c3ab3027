// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow handlers and the in-process registry of active runs.
//!
//! Workflows are looked up by declared name only, from a map built at
//! startup. The [`RunRegistry`] is a non-authoritative cache of runs
//! currently executing on *this* process: it avoids store round-trips for
//! status queries and holds the live cancellation handle. Recovery never
//! reads it; it is rebuilt empty after a crash.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use crate::cancel::CancelHandle;
use crate::error::EngineError;
use crate::model::RunStatus;

/// A registered workflow: an async function from a serialized-able argument
/// value to a result value.
pub type WorkflowFn = std::sync::Arc<
    dyn Fn(Value) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync,
>;

/// How a locally-resident run settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow function returned a value.
    Succeeded,
    /// The workflow function failed (including timeout/deadline).
    Failed,
}

/// Registry entry for one locally-executing run.
pub(crate) struct ActiveRun {
    /// Fires the run's cancellation signal.
    pub cancel: CancelHandle,
    /// Settles once the run completes; `None` while in flight.
    pub done: watch::Receiver<Option<RunOutcome>>,
}

impl ActiveRun {
    /// Derive the run's status without touching the store: a fired token
    /// means cancelled; an unsettled future means pending; otherwise the
    /// settled outcome decides.
    pub fn derived_status(&self) -> RunStatus {
        if self.cancel.fired_reason().is_some() {
            return RunStatus::Cancelled;
        }
        match *self.done.borrow() {
            None => RunStatus::Pending,
            Some(RunOutcome::Succeeded) => RunStatus::Success,
            Some(RunOutcome::Failed) => RunStatus::Error,
        }
    }
}

/// Map of run id to locally-active run handles.
#[derive(Default)]
pub(crate) struct RunRegistry {
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl RunRegistry {
    /// Insert a run. Must happen before the run's body starts executing so a
    /// cancel arriving between dispatch and start is never lost.
    pub fn register(&self, run_id: &str, entry: ActiveRun) {
        self.runs
            .lock()
            .expect("run registry poisoned")
            .insert(run_id.to_string(), entry);
    }

    /// Remove a run on completion.
    pub fn deregister(&self, run_id: &str) {
        self.runs
            .lock()
            .expect("run registry poisoned")
            .remove(run_id);
    }

    /// Derive the status of a resident run, or `None` if it is not local.
    pub fn derived_status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs
            .lock()
            .expect("run registry poisoned")
            .get(run_id)
            .map(ActiveRun::derived_status)
    }

    /// Fire the cancellation token of a resident run. Returns true when the
    /// run was local (instant preemption); remote runs converge via the
    /// store and event bus instead.
    pub fn fire_cancel(&self, run_id: &str) -> bool {
        let runs = self.runs.lock().expect("run registry poisoned");
        match runs.get(run_id) {
            Some(entry) => {
                entry.cancel.fire(crate::cancel::CancelReason::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Number of locally-active runs.
    pub fn len(&self) -> usize {
        self.runs.lock().expect("run registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelReason, CancelSignal};

    fn entry() -> (ActiveRun, watch::Sender<Option<RunOutcome>>, CancelSignal) {
        let signal = CancelSignal::new(None, None);
        let (done_tx, done_rx) = watch::channel(None);
        (
            ActiveRun {
                cancel: signal.handle.clone(),
                done: done_rx,
            },
            done_tx,
            signal,
        )
    }

    #[tokio::test]
    async fn test_derived_status_transitions() {
        let (active, done_tx, _signal) = entry();
        assert_eq!(active.derived_status(), RunStatus::Pending);

        done_tx.send(Some(RunOutcome::Succeeded)).unwrap();
        assert_eq!(active.derived_status(), RunStatus::Success);
    }

    #[tokio::test]
    async fn test_derived_status_cancel_wins_over_settlement() {
        let (active, done_tx, signal) = entry();
        signal.handle.fire(CancelReason::Cancelled);
        done_tx.send(Some(RunOutcome::Failed)).unwrap();
        assert_eq!(active.derived_status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_registry_register_cancel_deregister() {
        let registry = RunRegistry::default();
        let (active, _done_tx, signal) = entry();
        registry.register("run-1", active);

        assert_eq!(registry.derived_status("run-1"), Some(RunStatus::Pending));
        assert!(registry.fire_cancel("run-1"));
        assert_eq!(signal.token.fired_reason(), Some(CancelReason::Cancelled));
        assert_eq!(registry.derived_status("run-1"), Some(RunStatus::Cancelled));

        registry.deregister("run-1");
        assert_eq!(registry.derived_status("run-1"), None);
        assert!(!registry.fire_cancel("run-1"));
        assert_eq!(registry.len(), 0);
    }
}
