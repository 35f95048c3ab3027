// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine: execution primitive, public operations, and lifecycle.
//!
//! An [`Engine`] owns the store handle, the workflow and queue registries,
//! the three event buses, and the background loops (push pump, queue
//! dispatcher, recovery sweep). One engine instance per executor process.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::config::{EngineConfig, QueueConfig};
use crate::context::RunContext;
use crate::error::EngineError;
use crate::events::message::MessageEventBus;
use crate::events::run::RunEventBus;
use crate::events::state::StateEventBus;
use crate::model::{
    CreatedRun, NewRun, OperationRecord, RunRecord, RunStatus,
};
use crate::oplog::OperationManager;
use crate::registry::{ActiveRun, RunOutcome, RunRegistry, WorkflowFn};
use crate::serialization;
use crate::store::{PushChannel, PushNotification, RetryingStore, Store};
use crate::{dispatcher, recovery};

/// Options for a direct (non-queued) run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit run id; a random UUID is generated when absent. Supplying an
    /// id makes the start idempotent (a second start joins the existing run).
    pub run_id: Option<String>,
    /// Relative timeout in milliseconds, armed at execution start.
    pub timeout_ms: Option<i64>,
    /// Absolute deadline as epoch milliseconds.
    pub deadline_epoch_ms: Option<i64>,
}

/// Options for a deferred (queued) run.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit run id; a random UUID is generated when absent.
    pub run_id: Option<String>,
    /// Relative timeout in milliseconds, armed when a dispatcher claims the run.
    pub timeout_ms: Option<i64>,
    /// Absolute deadline as epoch milliseconds.
    pub deadline_epoch_ms: Option<i64>,
    /// Partition key; meaningful only on partitioned queues.
    pub partition_key: Option<String>,
    /// Deduplication key: at most one live queued run per (queue, key).
    pub deduplication_id: Option<String>,
    /// Dequeue priority (lower first) on priority-enabled queues.
    pub priority: Option<i32>,
}

/// Durable workflow execution engine.
///
/// Cheap to clone; all clones share the same internals.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: EngineConfig,
    pub(crate) workflows: RwLock<HashMap<String, WorkflowFn>>,
    pub(crate) queues: RwLock<HashMap<String, QueueConfig>>,
    pub(crate) registry: RunRegistry,
    pub(crate) run_events: RunEventBus,
    pub(crate) message_events: MessageEventBus,
    pub(crate) state_events: StateEventBus,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl Engine {
    /// Build an engine over a store backend.
    ///
    /// The store is wrapped in a [`RetryingStore`] so transient database
    /// failures are retried with jittered backoff at every call site.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        let store: Arc<dyn Store> = Arc::new(RetryingStore::new(
            store,
            config.store_retry_attempts,
            config.store_retry_base_delay,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                run_events: RunEventBus::new(store.clone(), config.event_poll_interval),
                message_events: MessageEventBus::new(store.clone(), config.event_poll_interval),
                state_events: StateEventBus::new(store.clone(), config.event_poll_interval),
                store,
                config,
                workflows: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                registry: RunRegistry::default(),
                shutdown,
            }),
        }
    }

    /// Register a workflow function under its declared name.
    ///
    /// Later registrations under the same name replace earlier ones.
    pub fn register_workflow<F, Fut>(&self, name: impl Into<String>, workflow: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        let wrapped: WorkflowFn = Arc::new(move |inputs| workflow(inputs).boxed());
        self.inner
            .workflows
            .write()
            .expect("workflow registry poisoned")
            .insert(name.into(), wrapped);
    }

    /// Declare a queue. Enqueue operations referencing an undeclared queue
    /// fail with [`EngineError::QueueNotFound`].
    pub fn register_queue(&self, queue: QueueConfig) {
        self.inner
            .queues
            .write()
            .expect("queue registry poisoned")
            .insert(queue.name.clone(), queue);
    }

    /// Start background work: crash recovery for runs stranded under this
    /// executor id, the queue dispatcher loop, and the push notification pump.
    #[instrument(skip(self), fields(executor_id = %self.inner.config.executor_id))]
    pub async fn start(&self) -> Result<(), EngineError> {
        info!("starting engine");

        if let Some(push) = self.inner.store.subscribe_push().await? {
            tokio::spawn(push_pump(
                self.inner.clone(),
                push,
                self.inner.shutdown.subscribe(),
            ));
        } else {
            debug!("store has no push support; event buses run poll-only");
        }

        recovery::recover_stranded_runs(&self.inner).await?;

        tokio::spawn(dispatcher::run_dispatcher(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        ));

        Ok(())
    }

    /// Signal background loops to stop and wait up to `grace` for locally
    /// active runs to settle. Runs still in flight afterwards stay `pending`
    /// and are picked up by recovery on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        info!(active_runs = self.inner.registry.len(), "shutting down engine");
        let _ = self.inner.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.registry.len() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    active_runs = self.inner.registry.len(),
                    "shutdown grace elapsed with runs still active; they will be recovered"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Execute a workflow directly on this executor and wait for its result.
    #[instrument(skip(self, inputs, options))]
    pub async fn run_workflow(
        &self,
        workflow_name: &str,
        inputs: Value,
        options: RunOptions,
    ) -> Result<Value, EngineError> {
        let run_id = options
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let created = create_run_row(
            &self.inner,
            NewRun {
                id: run_id.clone(),
                path: vec![run_id.clone()],
                workflow_name: workflow_name.to_string(),
                inputs: serialization::serialize(&inputs)?,
                status: RunStatus::Pending,
                executor_id: Some(self.inner.config.executor_id.clone()),
                timeout_ms: options.timeout_ms,
                deadline_epoch_ms: options.deadline_epoch_ms,
                queue_name: None,
                queue_partition_key: None,
                queue_deduplication_id: None,
                priority: None,
            },
        )
        .await?;

        if created.deduplicated {
            // Someone already started this run id; join it instead.
            return self.wait_for_result(&created.run_id).await;
        }

        let row = fetch_run(&self.inner, &created.run_id).await?;
        let mut done = execute_workflow(&self.inner, row, Vec::new()).await?;
        while done.borrow().is_none() {
            if done.changed().await.is_err() {
                break;
            }
        }

        let row = fetch_run(&self.inner, &created.run_id).await?;
        decode_terminal(&row)
    }

    /// Create a deferred run on a declared queue. Returns the effective run id
    /// and whether an existing queued run absorbed it (deduplication).
    #[instrument(skip(self, inputs, options))]
    pub async fn enqueue_workflow(
        &self,
        queue_name: &str,
        workflow_name: &str,
        inputs: Value,
        options: EnqueueOptions,
    ) -> Result<CreatedRun, EngineError> {
        {
            let queues = self.inner.queues.read().expect("queue registry poisoned");
            if !queues.contains_key(queue_name) {
                return Err(EngineError::QueueNotFound {
                    name: queue_name.to_string(),
                });
            }
        }

        let run_id = options
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        create_run_row(
            &self.inner,
            NewRun {
                id: run_id.clone(),
                path: vec![run_id.clone()],
                workflow_name: workflow_name.to_string(),
                inputs: serialization::serialize(&inputs)?,
                status: RunStatus::Queued,
                executor_id: None,
                timeout_ms: options.timeout_ms,
                deadline_epoch_ms: options.deadline_epoch_ms,
                queue_name: Some(queue_name.to_string()),
                queue_partition_key: options.partition_key,
                queue_deduplication_id: options.deduplication_id,
                priority: options.priority,
            },
        )
        .await
    }

    /// Wait for a run to reach a terminal status and return its result.
    ///
    /// Succeeded runs yield their output; every other terminal status yields
    /// the reconstructed terminal error.
    #[instrument(skip(self))]
    pub async fn wait_for_result(&self, run_id: &str) -> Result<Value, EngineError> {
        await_result(&self.inner, run_id).await
    }

    /// Cancel a run, optionally cascading to all of its non-terminal
    /// descendants. Returns the ids actually flipped to `cancelled`.
    ///
    /// Rows flip first (durable truth), then the cancellation token of every
    /// locally-resident member of the set fires for instant preemption.
    /// Remotely-owned runs converge via their durable step checks and the run
    /// event bus.
    #[instrument(skip(self))]
    pub async fn cancel_run(
        &self,
        run_id: &str,
        cascade: bool,
    ) -> Result<Vec<String>, EngineError> {
        let cancelled = self.inner.store.cancel_runs(run_id, cascade).await?;
        for id in &cancelled {
            if self.inner.registry.fire_cancel(id) {
                debug!(run_id = %id, "fired local cancellation token");
            }
        }
        info!(run_id = %run_id, cascade, count = cancelled.len(), "cancelled runs");
        Ok(cancelled)
    }

    /// Send a message to a run's mailbox from outside any workflow.
    pub async fn send_message(
        &self,
        destination_run_id: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let payload = serialization::serialize(&payload)?;
        self.inner
            .store
            .send_message(None, destination_run_id, message_type, &payload)
            .await
    }

    /// Current status of a run. Locally-active runs answer from the in-memory
    /// registry without a store round trip.
    pub async fn get_run_status(&self, run_id: &str) -> Result<RunStatus, EngineError> {
        if let Some(status) = self.inner.registry.derived_status(run_id) {
            return Ok(status);
        }
        let row = fetch_run(&self.inner, run_id).await?;
        row.run_status().ok_or_else(|| EngineError::Unknown {
            message: format!("run '{}' has unrecognized status '{}'", run_id, row.status),
        })
    }

    /// Read the latest shared-state value for `(run, key)`.
    pub async fn get_state(
        &self,
        run_id: &str,
        key: &str,
    ) -> Result<Option<Value>, EngineError> {
        match self.inner.store.get_state(run_id, key).await? {
            Some(raw) => Ok(Some(serialization::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Fetch the full run row.
    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        fetch_run(&self.inner, run_id).await
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

// ============================================================================
// Execution primitive
// ============================================================================

/// Run a workflow function to completion under a combined
/// cancel/timeout/deadline signal, persisting the terminal result.
///
/// The run is registered into the run registry before its body starts so a
/// cancel arriving between dispatch and start is never lost, and always
/// deregistered on settlement. Returns a receiver that settles with the
/// outcome.
pub(crate) async fn execute_workflow(
    engine: &Arc<EngineInner>,
    row: RunRecord,
    operations: Vec<OperationRecord>,
) -> Result<watch::Receiver<Option<RunOutcome>>, EngineError> {
    let workflow = {
        let workflows = engine.workflows.read().expect("workflow registry poisoned");
        workflows
            .get(&row.workflow_name)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound {
                name: row.workflow_name.clone(),
            })?
    };

    let inputs: Value = serialization::deserialize(&row.inputs)?;
    let deadline = row.deadline_epoch_ms.and_then(epoch_ms_to_datetime);
    let mut signal = CancelSignal::new(row.timeout_ms, deadline);
    let (done_tx, done_rx) = watch::channel(None);

    // Register first, then start: a concurrent cancel must find the token.
    engine.registry.register(
        &row.id,
        ActiveRun {
            cancel: signal.handle.clone(),
            done: done_rx.clone(),
        },
    );

    let oplog = OperationManager::new(row.id.clone(), operations);
    let ctx = RunContext::new(
        row.id.clone(),
        row.path_ids(),
        signal.token.clone(),
        oplog,
        engine.clone(),
    );

    let engine = engine.clone();
    let run_id = row.id.clone();
    tokio::spawn(async move {
        let token = signal.token.clone();
        let race_id = run_id.clone();
        let body = AssertUnwindSafe(workflow(inputs)).catch_unwind();

        let result = ctx
            .scope(async move {
                tokio::select! {
                    biased;
                    reason = token.fired() => {
                        Err(EngineError::from_cancel_reason(&race_id, reason))
                    }
                    settled = body => match settled {
                        Ok(result) => result,
                        Err(panic) => Err(EngineError::Fatal {
                            message: panic_message(panic),
                        }),
                    },
                }
            })
            .await;

        signal.disarm();
        persist_terminal(&engine, &run_id, &result).await;

        let outcome = if result.is_ok() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };
        let _ = done_tx.send(Some(outcome));
        engine.registry.deregister(&run_id);
    });

    Ok(done_rx)
}

/// Persist a settled run's terminal state.
///
/// An explicit cancel means the row was already flipped to `cancelled` by the
/// cancellation transaction; only the error detail is recorded then, never a
/// `cancelled → error` overwrite. Timeouts and deadlines finalize as `error`.
async fn persist_terminal(
    engine: &Arc<EngineInner>,
    run_id: &str,
    result: &Result<Value, EngineError>,
) {
    let written = match result {
        Ok(value) => match serialization::serialize(value) {
            Ok(output) => {
                engine
                    .store
                    .finalize_run(run_id, RunStatus::Success, Some(&output), None)
                    .await
                    .map(|_| ())
            }
            Err(err) => {
                let serialized = serialization::serialize_error(&err);
                engine
                    .store
                    .finalize_run(run_id, RunStatus::Error, None, Some(&serialized))
                    .await
                    .map(|_| ())
            }
        },
        // Only this run's own cancellation keeps the row's status (the cancel
        // transaction already flipped it). A cancelled *child* bubbling up is
        // an ordinary failure of this run.
        Err(err @ EngineError::RunCancelled { run_id: rid }) if rid == run_id => {
            let serialized = serialization::serialize_error(err);
            engine
                .store
                .record_run_error_keeping_status(run_id, &serialized)
                .await
        }
        Err(err) => {
            let serialized = serialization::serialize_error(err);
            engine
                .store
                .finalize_run(run_id, RunStatus::Error, None, Some(&serialized))
                .await
                .map(|_| ())
        }
    };

    match written {
        Ok(()) => debug!(run_id = %run_id, ok = result.is_ok(), "run finalized"),
        Err(err) => {
            // The row stays pending; recovery will replay and re-finalize.
            error!(run_id = %run_id, error = %err, "failed to persist terminal run state");
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("workflow panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("workflow panicked: {}", s)
    } else {
        "workflow panicked".to_string()
    }
}

fn epoch_ms_to_datetime(epoch_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(epoch_ms).single()
}

// ============================================================================
// Shared helpers
// ============================================================================

pub(crate) async fn create_run_row(
    engine: &Arc<EngineInner>,
    new_run: NewRun,
) -> Result<CreatedRun, EngineError> {
    let created = engine.store.create_run(&new_run).await?;
    if created.deduplicated {
        debug!(
            run_id = %created.run_id,
            workflow = %new_run.workflow_name,
            "run creation deduplicated onto existing row"
        );
    }
    Ok(created)
}

pub(crate) async fn fetch_run(
    engine: &Arc<EngineInner>,
    run_id: &str,
) -> Result<RunRecord, EngineError> {
    engine
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })
}

/// Wait for a run to reach a terminal status and decode its result.
pub(crate) async fn await_result(
    engine: &Arc<EngineInner>,
    run_id: &str,
) -> Result<Value, EngineError> {
    // Subscribe before the first fetch so a terminal transition between the
    // two cannot be missed.
    let mut sub = engine.run_events.subscribe(run_id);

    let row = fetch_run(engine, run_id).await?;
    if row.is_terminal() {
        return decode_terminal(&row);
    }

    loop {
        match sub.recv().await {
            Some(row) if row.is_terminal() => return decode_terminal(&row),
            Some(_) => continue,
            // Bus dropped (engine torn down); fall back to one last fetch.
            None => {
                let row = fetch_run(engine, run_id).await?;
                return decode_terminal(&row);
            }
        }
    }
}

/// Convert a terminal run row into the caller-facing result.
pub(crate) fn decode_terminal(row: &RunRecord) -> Result<Value, EngineError> {
    match row.run_status() {
        Some(RunStatus::Success) => match &row.output {
            Some(output) => serialization::deserialize(output),
            None => Ok(Value::Null),
        },
        Some(status) if status.is_terminal() => {
            if let Some(error) = &row.error {
                return Err(serialization::deserialize_error(error));
            }
            Err(match status {
                RunStatus::Cancelled => EngineError::RunCancelled {
                    run_id: row.id.clone(),
                },
                RunStatus::MaxRecoveryAttemptsExceeded => {
                    EngineError::MaxRecoveryAttemptsExceeded {
                        run_id: row.id.clone(),
                        attempts: row.recovery_attempts,
                    }
                }
                _ => EngineError::Unknown {
                    message: format!("run '{}' failed without a recorded error", row.id),
                },
            })
        }
        _ => Err(EngineError::Unknown {
            message: format!(
                "run '{}' is not terminal (status '{}')",
                row.id, row.status
            ),
        }),
    }
}

// ============================================================================
// Push notification pump
// ============================================================================

/// Forward store push notifications into the event buses, and fire local
/// cancellation tokens when a resident run's row flipped to `cancelled`
/// elsewhere.
async fn push_pump(
    engine: Arc<EngineInner>,
    mut push: broadcast::Receiver<PushNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
            received = push.recv() => match received {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Dropped pushes are safe: the poll paths converge.
                    warn!(skipped, "push pump lagged behind notification stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        match notification.channel {
            PushChannel::Runs => {
                if notification.secondary == RunStatus::Cancelled.as_str() {
                    engine.registry.fire_cancel(&notification.entity_id);
                }
                engine.run_events.handle_push(&notification).await;
            }
            PushChannel::Messages => engine.message_events.handle_push(&notification),
            PushChannel::State => engine.state_events.handle_push(&notification).await,
        }
    }
}
