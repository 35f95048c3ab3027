// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery: re-attachment to runs stranded by a previous incarnation.
//!
//! A crash leaves rows stuck `pending` with this executor stamped as owner.
//! On startup each such run either resumes (operation log pre-seeded, replay
//! fast-forwards through completed steps) or, past the configured attempt
//! cap, finalizes as `max_recovery_attempts_exceeded`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::{EngineInner, execute_workflow};
use crate::error::EngineError;
use crate::model::RecoveryDecision;

pub(crate) async fn recover_stranded_runs(engine: &Arc<EngineInner>) -> Result<(), EngineError> {
    let executor_id = &engine.config.executor_id;
    let stranded = engine.store.runs_owned_by(executor_id).await?;
    if stranded.is_empty() {
        debug!("no stranded runs to recover");
        return Ok(());
    }
    info!(count = stranded.len(), "recovering stranded runs");

    for row in stranded {
        let run_id = row.id.clone();

        let workflow_known = {
            let workflows = engine.workflows.read().expect("workflow registry poisoned");
            workflows.contains_key(&row.workflow_name)
        };
        if !workflow_known {
            // Operational gap: the run stays stuck until a deploy adds the
            // workflow. Logged, not counted as a recovery attempt.
            warn!(run_id = %run_id, workflow = %row.workflow_name, "stranded run references unknown workflow");
            continue;
        }

        let decision = match engine
            .store
            .begin_recovery_attempt(&run_id, engine.config.max_recovery_attempts)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "recovery attempt bump failed");
                continue;
            }
        };

        match decision {
            RecoveryDecision::Resume(row) => {
                let operations = match engine.store.load_operations(&run_id).await {
                    Ok(operations) => operations,
                    Err(err) => {
                        warn!(run_id = %run_id, error = %err, "failed to load operation log for recovery");
                        continue;
                    }
                };
                let replayable = operations.len();
                match execute_workflow(engine, *row, operations).await {
                    Ok(_) => {
                        info!(run_id = %run_id, replayable, "resumed stranded run");
                    }
                    Err(err) => {
                        warn!(run_id = %run_id, error = %err, "failed to resume stranded run");
                    }
                }
            }
            RecoveryDecision::Exceeded => {
                warn!(run_id = %run_id, "recovery attempt cap exceeded; run finalized");
            }
            RecoveryDecision::Skip => {
                debug!(run_id = %run_id, "run settled since the sweep query; skipping");
            }
        }
    }

    Ok(())
}
