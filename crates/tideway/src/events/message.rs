// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message availability event bus.
//!
//! Keyed by `(destination_run_id, message_type)`; the payload is a wake-up
//! pulse carrying the current message count. Availability is existence-based,
//! never deduplicated by change ids: a waiting receiver races to consume and
//! an empty mailbox just means another consumer won. The type `*` subscribes
//! to any message for a destination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::store::{PushNotification, Store};

use super::{Emission, EventBus, PollBackend, Subscription};

/// Wildcard message type matching any message for a destination.
pub(crate) const ANY_MESSAGE_TYPE: &str = "*";

type MessageKey = (String, String);

pub(crate) struct MessageEventBus {
    bus: EventBus<MessageKey, i64>,
}

struct MessagePollBackend {
    store: Arc<dyn Store>,
}

#[async_trait]
impl PollBackend<MessageKey, i64> for MessagePollBackend {
    async fn poll(&self, keys: Vec<MessageKey>) -> Vec<Emission<MessageKey, i64>> {
        match self.store.matching_message_keys(&keys).await {
            Ok(matches) => matches
                .into_iter()
                .map(|(destination, message_type, count)| Emission {
                    key: (destination, message_type),
                    payload: count,
                    change_id: None,
                    dedup: false,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "message event poll pass failed");
                Vec::new()
            }
        }
    }
}

fn wildcard_key(key: &MessageKey) -> MessageKey {
    (key.0.clone(), ANY_MESSAGE_TYPE.to_string())
}

impl MessageEventBus {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        let backend = Arc::new(MessagePollBackend { store });
        Self {
            bus: EventBus::new(backend, poll_interval, Some(wildcard_key)),
        }
    }

    /// Subscribe to availability pulses for `(destination, type)`. Pass
    /// [`ANY_MESSAGE_TYPE`] to wake on any message for the destination.
    pub fn subscribe(
        &self,
        destination_run_id: &str,
        message_type: &str,
    ) -> Subscription<MessageKey, i64> {
        self.bus
            .subscribe((destination_run_id.to_string(), message_type.to_string()))
    }

    /// Feed a push notification: availability pulses fan out unconditionally.
    pub fn handle_push(&self, notification: &PushNotification) {
        let key = (
            notification.entity_id.clone(),
            notification.secondary.clone(),
        );
        self.bus.emit(&key, notification.change, None);
    }
}
