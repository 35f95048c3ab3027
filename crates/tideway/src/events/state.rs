// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State value event bus.
//!
//! Keyed by `(run_id, state_key)`; the payload is the serialized current
//! value. Rapid successive writes may coalesce so watchers can miss
//! intermediate values, but the latest value always converges via change-id
//! dedup on the push path plus the unconditional poll path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::store::{PushNotification, Store};

use super::{Emission, EventBus, PollBackend, Subscription};

type StateKey = (String, String);

pub(crate) struct StateEventBus {
    bus: EventBus<StateKey, String>,
    store: Arc<dyn Store>,
}

struct StatePollBackend {
    store: Arc<dyn Store>,
}

#[async_trait]
impl PollBackend<StateKey, String> for StatePollBackend {
    async fn poll(&self, keys: Vec<StateKey>) -> Vec<Emission<StateKey, String>> {
        match self.store.get_states(&keys).await {
            Ok(rows) => rows
                .into_iter()
                .map(|(run_id, key, value, change_id)| Emission {
                    key: (run_id, key),
                    payload: value,
                    change_id: Some(change_id),
                    dedup: false,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "state event poll pass failed");
                Vec::new()
            }
        }
    }
}

impl StateEventBus {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        let backend = Arc::new(StatePollBackend {
            store: store.clone(),
        });
        Self {
            bus: EventBus::new(backend, poll_interval, None),
            store,
        }
    }

    /// Subscribe to value changes of `(run, key)`.
    pub fn subscribe(&self, run_id: &str, key: &str) -> Subscription<StateKey, String> {
        self.bus.subscribe((run_id.to_string(), key.to_string()))
    }

    /// Feed a push notification through the dedup-then-fetch pipeline.
    pub async fn handle_push(&self, notification: &PushNotification) {
        let key = (
            notification.entity_id.clone(),
            notification.secondary.clone(),
        );
        if !self.bus.has_subscribers(&key) {
            return;
        }
        if let Some(mark) = self.bus.last_change(&key)
            && notification.change <= mark
        {
            return;
        }
        match self.store.get_state(&key.0, &key.1).await {
            Ok(Some(value)) => {
                self.bus.emit_if_newer(&key, value, notification.change);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(run_id = %key.0, key = %key.1, error = %err, "state push fetch failed; poll path will recover");
            }
        }
    }
}
