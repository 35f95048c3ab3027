// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hybrid push/poll event notification layer.
//!
//! A generic keyed pub/sub core with three specializations (run status,
//! message availability, state values). Push notifications from the store
//! give sub-second latency but are not guaranteed delivery; a shared,
//! deliberately-slow jittered poll loop guarantees eventual convergence even
//! if every push is lost. The poll loop starts with the first subscriber for
//! a bus and stops with the last — a bus never polls when nobody listens.

pub(crate) mod message;
pub(crate) mod run;
pub(crate) mod state;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;

/// Apply ±25% jitter to a base interval (thundering-herd avoidance).
pub(crate) fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let spread = (base_ms / 4).max(1);
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(base_ms - spread + offset)
}

/// One payload produced by a poll pass.
pub(crate) struct Emission<K, P> {
    /// The concrete key this emission is for.
    pub key: K,
    /// The payload delivered to subscribers.
    pub payload: P,
    /// Change id to advance the key's high-water mark, when the source has one.
    pub change_id: Option<i64>,
    /// When true the emission is dropped unless its change id is newer than
    /// the high-water mark. Poll paths emit unconditionally (subscribers must
    /// tolerate seeing the same state twice); push paths dedup.
    pub dedup: bool,
}

/// Source of poll-path emissions for one bus.
#[async_trait]
pub(crate) trait PollBackend<K, P>: Send + Sync + 'static {
    /// Check the store for the given subscribed keys and produce emissions.
    /// Errors are handled (logged) by the implementation; a failed pass
    /// returns no emissions and the next tick retries.
    async fn poll(&self, keys: Vec<K>) -> Vec<Emission<K, P>>;
}

struct SubState<K, P> {
    next_id: u64,
    by_key: HashMap<K, HashMap<u64, mpsc::UnboundedSender<P>>>,
    high_water: HashMap<K, i64>,
    poller_running: bool,
}

impl<K, P> Default for SubState<K, P> {
    fn default() -> Self {
        Self {
            next_id: 0,
            by_key: HashMap::new(),
            high_water: HashMap::new(),
            poller_running: false,
        }
    }
}

struct BusShared<K, P> {
    subs: Mutex<SubState<K, P>>,
    backend: Arc<dyn PollBackend<K, P>>,
    poll_interval: Duration,
    /// Maps a concrete key to the wildcard key that also receives its events,
    /// for buses that allow wildcard subscriptions.
    wildcard: Option<fn(&K) -> K>,
}

/// Generic keyed pub/sub core shared by the three bus specializations.
pub(crate) struct EventBus<K, P> {
    shared: Arc<BusShared<K, P>>,
}

impl<K, P> Clone for EventBus<K, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A live subscription; unsubscribes on drop.
pub(crate) struct Subscription<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + 'static,
{
    rx: mpsc::UnboundedReceiver<P>,
    key: K,
    id: u64,
    shared: Weak<BusShared<K, P>>,
}

impl<K, P> Subscription<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + 'static,
{
    /// Receive the next event for this subscription.
    pub async fn recv(&mut self) -> Option<P> {
        self.rx.recv().await
    }
}

impl<K, P> Drop for Subscription<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut subs = shared.subs.lock().expect("event bus poisoned");
            if let Some(senders) = subs.by_key.get_mut(&self.key) {
                senders.remove(&self.id);
                if senders.is_empty() {
                    subs.by_key.remove(&self.key);
                    subs.high_water.remove(&self.key);
                }
            }
        }
    }
}

impl<K, P> EventBus<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + 'static,
{
    pub fn new(
        backend: Arc<dyn PollBackend<K, P>>,
        poll_interval: Duration,
        wildcard: Option<fn(&K) -> K>,
    ) -> Self {
        Self {
            shared: Arc::new(BusShared {
                subs: Mutex::new(SubState::default()),
                backend,
                poll_interval,
                wildcard,
            }),
        }
    }

    /// Subscribe to events for one key. The first live subscription starts
    /// the bus's shared poll loop.
    pub fn subscribe(&self, key: K) -> Subscription<K, P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, start_poller) = {
            let mut subs = self.shared.subs.lock().expect("event bus poisoned");
            let id = subs.next_id;
            subs.next_id += 1;
            subs.by_key.entry(key.clone()).or_default().insert(id, tx);
            let start = !subs.poller_running;
            if start {
                subs.poller_running = true;
            }
            (id, start)
        };

        if start_poller {
            let weak = Arc::downgrade(&self.shared);
            tokio::spawn(poll_loop(weak));
        }

        Subscription {
            rx,
            key,
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// True if anything listens on the key (exactly or via wildcard).
    pub fn has_subscribers(&self, key: &K) -> bool {
        let subs = self.shared.subs.lock().expect("event bus poisoned");
        if subs.by_key.contains_key(key) {
            return true;
        }
        match self.shared.wildcard {
            Some(wildcard_of) => subs.by_key.contains_key(&wildcard_of(key)),
            None => false,
        }
    }

    /// The key's last observed change id, if any event carried one.
    pub fn last_change(&self, key: &K) -> Option<i64> {
        self.shared
            .subs
            .lock()
            .expect("event bus poisoned")
            .high_water
            .get(key)
            .copied()
    }

    /// Fan out unconditionally, advancing the high-water mark if `change_id`
    /// is newer. Subscribers must be prepared to see the same state twice.
    pub fn emit(&self, key: &K, payload: P, change_id: Option<i64>) {
        let mut subs = self.shared.subs.lock().expect("event bus poisoned");
        if let Some(change_id) = change_id {
            let mark = subs.high_water.entry(key.clone()).or_insert(change_id);
            if change_id > *mark {
                *mark = change_id;
            }
        }
        Self::fan_out(&subs, self.shared.wildcard, key, payload);
    }

    /// Fan out only if `change_id` is strictly newer than the key's
    /// high-water mark. Stale and duplicate notifications are no-ops.
    pub fn emit_if_newer(&self, key: &K, payload: P, change_id: i64) -> bool {
        let mut subs = self.shared.subs.lock().expect("event bus poisoned");
        if let Some(mark) = subs.high_water.get(key)
            && change_id <= *mark
        {
            return false;
        }
        subs.high_water.insert(key.clone(), change_id);
        Self::fan_out(&subs, self.shared.wildcard, key, payload);
        true
    }

    fn fan_out(
        subs: &SubState<K, P>,
        wildcard: Option<fn(&K) -> K>,
        key: &K,
        payload: P,
    ) {
        if let Some(senders) = subs.by_key.get(key) {
            for sender in senders.values() {
                let _ = sender.send(payload.clone());
            }
        }
        if let Some(wildcard_of) = wildcard {
            let wildcard_key = wildcard_of(key);
            if wildcard_key != *key
                && let Some(senders) = subs.by_key.get(&wildcard_key)
            {
                for sender in senders.values() {
                    let _ = sender.send(payload.clone());
                }
            }
        }
    }
}

/// Shared poll loop: jittered sleeps, exits when the bus is dropped or the
/// last subscriber goes away.
async fn poll_loop<K, P>(weak: Weak<BusShared<K, P>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + 'static,
{
    loop {
        let interval = match weak.upgrade() {
            Some(shared) => shared.poll_interval,
            None => return,
        };
        tokio::time::sleep(jittered(interval)).await;

        let Some(shared) = weak.upgrade() else { return };

        let keys: Vec<K> = {
            let mut subs = shared.subs.lock().expect("event bus poisoned");
            if subs.by_key.is_empty() {
                subs.poller_running = false;
                debug!("event bus poll loop stopping: no subscribers");
                return;
            }
            subs.by_key.keys().cloned().collect()
        };

        let emissions = shared.backend.poll(keys).await;
        for emission in emissions {
            let mut subs = shared.subs.lock().expect("event bus poisoned");
            match (emission.dedup, emission.change_id) {
                (true, Some(change_id)) => {
                    let stale = subs
                        .high_water
                        .get(&emission.key)
                        .is_some_and(|mark| change_id <= *mark);
                    if stale {
                        continue;
                    }
                    subs.high_water.insert(emission.key.clone(), change_id);
                }
                _ => {
                    if let Some(change_id) = emission.change_id {
                        let mark = subs.high_water.entry(emission.key.clone()).or_insert(change_id);
                        if change_id > *mark {
                            *mark = change_id;
                        }
                    }
                }
            }
            EventBus::<K, P>::fan_out(&subs, shared.wildcard, &emission.key, emission.payload);
        }
    }
}
