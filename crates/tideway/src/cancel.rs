// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composable cancellation signal for run execution.
//!
//! One token, up to three independent triggers: an explicit cancel request, a
//! relative timeout, and an absolute deadline. Whichever fires first wins and
//! its [`CancelReason`] is recorded permanently; a fired token never un-fires.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Which trigger fired the cancellation signal.
///
/// The suspension mechanism is identical for all three, but the terminal error
/// reported for the run differs, so the reason is captured at fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An explicit external cancel request.
    Cancelled,
    /// The run's relative timeout elapsed.
    TimedOut {
        /// The configured timeout in milliseconds.
        timeout_ms: i64,
    },
    /// The run's absolute deadline was reached.
    DeadlineExceeded {
        /// The deadline as epoch milliseconds.
        deadline_epoch_ms: i64,
    },
}

/// Firing side of a cancellation signal.
///
/// Cloneable; the first [`fire`](CancelHandle::fire) wins and later calls are
/// no-ops.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Fire the signal with the given reason. Returns true if this call was
    /// the one that fired it (false if it had already fired).
    pub fn fire(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// The reason the signal fired, if it has.
    pub fn fired_reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }
}

/// Waiting side of a cancellation signal.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    /// The reason the signal fired, if it has.
    pub fn fired_reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Wait until the signal fires and return the reason.
    ///
    /// Pends forever if every handle is dropped without firing; callers race
    /// this against the work being guarded.
    pub async fn fired(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // All handles dropped without firing; nothing left to wait for.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A cancellation signal plus the timer tasks arming its timeout/deadline
/// triggers. Dropping or [`disarm`](CancelSignal::disarm)-ing aborts the
/// timers; the handle and token stay valid.
pub struct CancelSignal {
    /// Firing side.
    pub handle: CancelHandle,
    /// Waiting side.
    pub token: CancelToken,
    timers: Vec<JoinHandle<()>>,
}

impl CancelSignal {
    /// Build a signal whose triggers are an explicit cancel (via the handle),
    /// an optional relative timeout, and an optional absolute deadline.
    pub fn new(timeout_ms: Option<i64>, deadline: Option<DateTime<Utc>>) -> Self {
        let (tx, rx) = watch::channel(None);
        let handle = CancelHandle { tx: Arc::new(tx) };
        let token = CancelToken { rx };

        let mut timers = Vec::new();

        if let Some(timeout_ms) = timeout_ms {
            let h = handle.clone();
            let wait = std::time::Duration::from_millis(timeout_ms.max(0) as u64);
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                h.fire(CancelReason::TimedOut { timeout_ms });
            }));
        }

        if let Some(deadline) = deadline {
            let h = handle.clone();
            let deadline_epoch_ms = deadline.timestamp_millis();
            let remaining_ms = (deadline - Utc::now()).num_milliseconds().max(0) as u64;
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(remaining_ms)).await;
                h.fire(CancelReason::DeadlineExceeded { deadline_epoch_ms });
            }));
        }

        Self {
            handle,
            token,
            timers,
        }
    }

    /// Abort the timer tasks. Called once the guarded run has settled so a
    /// long deadline does not keep a task alive.
    pub fn disarm(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

impl Drop for CancelSignal {
    fn drop(&mut self) {
        self.disarm();
    }
}
