// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue dispatcher: the admission-control loop for deferred runs.
//!
//! Each jittered tick, every declared queue (and every partition of a
//! partitioned queue, independently) gets one claim pass. The admission
//! arithmetic lives here as a pure function; the locking claim itself runs
//! inside a single store transaction so concurrent dispatcher processes can
//! never double-claim a row.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::engine::{EngineInner, execute_workflow};
use crate::error::EngineError;
use crate::events::jittered;
use crate::model::RunRecord;

/// Hard cap on rows claimed per queue/partition per tick, so one tick on a
/// deep queue cannot flood the executor even when every limit is unbounded.
pub(crate) const MAX_CLAIM_BATCH: i64 = 100;

/// The counts the claim transaction measures before selecting rows.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AdmissionCounts {
    /// Non-queued runs in this queue(+partition) started within the trailing
    /// rate-limit window. Meaningless when the queue has no rate limit.
    pub started_in_window: i64,
    /// Currently-pending runs in this queue(+partition) across all executors.
    pub pending_total: i64,
    /// Currently-pending runs in this queue(+partition) owned by this executor.
    pub pending_for_executor: i64,
}

/// How many queued rows this executor may claim this tick.
///
/// Rate limit gates the whole tick; otherwise the budget is the minimum of
/// the per-executor and queue-wide remaining concurrency slots, with absent
/// limits treated as unbounded. Always capped at [`MAX_CLAIM_BATCH`].
pub(crate) fn admissible_claim_count(queue: &QueueConfig, counts: &AdmissionCounts) -> i64 {
    if let Some(rate) = &queue.rate_limit
        && counts.started_in_window >= rate.limit
    {
        return 0;
    }

    let worker_remaining = queue
        .worker_concurrency
        .map(|limit| (limit - counts.pending_for_executor).max(0))
        .unwrap_or(MAX_CLAIM_BATCH);
    let global_remaining = queue
        .global_concurrency
        .map(|limit| (limit - counts.pending_total).max(0))
        .unwrap_or(MAX_CLAIM_BATCH);

    let mut budget = worker_remaining.min(global_remaining);
    if let Some(rate) = &queue.rate_limit {
        budget = budget.min((rate.limit - counts.started_in_window).max(0));
    }
    budget.min(MAX_CLAIM_BATCH)
}

/// The dispatcher loop. Exits on shutdown.
pub(crate) async fn run_dispatcher(
    engine: Arc<EngineInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("queue dispatcher started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("queue dispatcher stopping");
                    return;
                }
            }
            _ = tokio::time::sleep(jittered(engine.config.queue_poll_interval)) => {
                dispatch_tick(&engine).await;
            }
        }
    }
}

/// One pass over every declared queue.
async fn dispatch_tick(engine: &Arc<EngineInner>) {
    let queues: Vec<QueueConfig> = {
        let queues = engine.queues.read().expect("queue registry poisoned");
        queues.values().cloned().collect()
    };

    for queue in queues {
        if queue.partitioned {
            let partitions = match engine.store.queued_partitions(&queue.name).await {
                Ok(partitions) => partitions,
                Err(err) => {
                    warn!(queue = %queue.name, error = %err, "partition discovery failed");
                    continue;
                }
            };
            // Each partition is its own concurrency and rate domain.
            for partition in partitions {
                claim_and_start(engine, &queue, Some(&partition)).await;
            }
        } else {
            claim_and_start(engine, &queue, None).await;
        }
    }
}

/// Claim admissible rows for one queue/partition and hand each to the
/// execution primitive.
async fn claim_and_start(engine: &Arc<EngineInner>, queue: &QueueConfig, partition: Option<&str>) {
    let claimed: Vec<RunRecord> = match engine
        .store
        .claim_queued_runs(queue, partition, &engine.config.executor_id)
        .await
    {
        Ok(claimed) => claimed,
        Err(err) => {
            warn!(queue = %queue.name, partition, error = %err, "queue claim failed");
            return;
        }
    };

    if claimed.is_empty() {
        return;
    }
    debug!(queue = %queue.name, partition, count = claimed.len(), "claimed queued runs");

    for row in claimed {
        let run_id = row.id.clone();
        // Deduplicated re-enqueues can carry a prior partial log.
        let operations = match engine.store.load_operations(&run_id).await {
            Ok(operations) => operations,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "failed to load operation log; run stays pending for recovery");
                continue;
            }
        };

        match execute_workflow(engine, row, operations).await {
            Ok(_) => {}
            Err(EngineError::WorkflowNotFound { name }) => {
                // Operational gap: the run stays claimed until a deploy adds
                // the workflow. Logged, not retried.
                warn!(run_id = %run_id, workflow = %name, "claimed run references unknown workflow");
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "failed to start claimed run");
            }
        }
    }
}
