// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run status event bus.
//!
//! Keyed by run id, payload is the full run row. Push notifications are
//! deduplicated against the row's monotonic `change_id`, so a late or
//! repeated notification never delivers stale status. Intermediate statuses
//! may be skipped when pushes coalesce; the terminal status always arrives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::model::RunRecord;
use crate::store::{PushNotification, Store};

use super::{Emission, EventBus, PollBackend, Subscription};

pub(crate) struct RunEventBus {
    bus: EventBus<String, RunRecord>,
    store: Arc<dyn Store>,
}

struct RunPollBackend {
    store: Arc<dyn Store>,
}

#[async_trait]
impl PollBackend<String, RunRecord> for RunPollBackend {
    async fn poll(&self, keys: Vec<String>) -> Vec<Emission<String, RunRecord>> {
        match self.store.get_runs(&keys).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| Emission {
                    key: row.id.clone(),
                    change_id: Some(row.change_id),
                    // Poll emissions bypass dedup: a subscriber that missed a
                    // push must see the current row even if the change id was
                    // already marked by the push path.
                    dedup: false,
                    payload: row,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "run event poll pass failed");
                Vec::new()
            }
        }
    }
}

impl RunEventBus {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        let backend = Arc::new(RunPollBackend {
            store: store.clone(),
        });
        Self {
            bus: EventBus::new(backend, poll_interval, None),
            store,
        }
    }

    /// Subscribe to status changes of one run.
    pub fn subscribe(&self, run_id: &str) -> Subscription<String, RunRecord> {
        self.bus.subscribe(run_id.to_string())
    }

    /// Feed a push notification through the dedup-then-fetch pipeline.
    pub async fn handle_push(&self, notification: &PushNotification) {
        let run_id = &notification.entity_id;
        if !self.bus.has_subscribers(run_id) {
            return;
        }
        // Cheap staleness check before paying for the row fetch.
        if let Some(mark) = self.bus.last_change(run_id)
            && notification.change <= mark
        {
            return;
        }
        match self.store.get_run(run_id).await {
            Ok(Some(row)) => {
                let change_id = row.change_id;
                self.bus.emit_if_newer(run_id, row, change_id);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "run push fetch failed; poll path will recover");
            }
        }
    }
}
