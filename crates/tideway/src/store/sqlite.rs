// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Embedded and test backend. SQLite has no LISTEN/NOTIFY and no row-level
//! locking; instead, every mutating call serializes on a process-wide write
//! lock (claims can never double-claim within the process, and SQLite itself
//! rejects concurrent writers from other processes) and push notifications
//! are delivered on an in-process broadcast channel immediately after commit,
//! giving the same sub-second latency shape as the Postgres backend.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::{Mutex, broadcast};

use crate::config::QueueConfig;
use crate::dispatcher::{AdmissionCounts, admissible_claim_count};
use crate::error::EngineError;
use crate::model::{
    CreatedRun, NewRun, OperationRecord, RecoveryDecision, RunRecord, RunStatus, join_path,
};

use super::{PushChannel, PushNotification, Store, descendant_like_pattern};

const RUN_COLUMNS: &str = "id, path, workflow_name, inputs, output, error, status, executor_id, \
     change_id, timeout_ms, deadline_epoch_ms, queue_name, queue_partition_key, \
     queue_deduplication_id, priority, recovery_attempts, started_at, created_at, updated_at";

const TERMINAL_STATUSES: &str =
    "('success', 'error', 'cancelled', 'max_recovery_attempts_exceeded')";

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    push: broadcast::Sender<PushNotification>,
}

impl SqliteStore {
    /// Build a store over an existing pool. Run
    /// [`crate::migrations::run_sqlite`] before first use.
    pub fn new(pool: SqlitePool) -> Self {
        let (push, _) = broadcast::channel(1024);
        Self {
            pool,
            write_lock: Mutex::new(()),
            push,
        }
    }

    /// Create and initialize a store from a database file path: parent
    /// directories and the file are created as needed, and migrations run.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Database {
                operation: "create_dir".to_string(),
                details: format!("failed to create directory {:?}: {}", parent, e),
                retryable: false,
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| EngineError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
                retryable: false,
            })?;

        Ok(Self::new(pool))
    }

    /// Deliver a push notification to in-process subscribers. Called only
    /// after the corresponding transaction has committed.
    fn emit(&self, channel: PushChannel, entity_id: &str, secondary: &str, change: i64) {
        let _ = self.push.send(PushNotification {
            channel,
            entity_id: entity_id.to_string(),
            secondary: secondary.to_string(),
            change,
        });
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_run(&self, new_run: &NewRun) -> Result<CreatedRun, EngineError> {
        let _write = self.write_lock.lock().await;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (id, path, workflow_name, inputs, status, executor_id,
                              timeout_ms, deadline_epoch_ms, queue_name,
                              queue_partition_key, queue_deduplication_id, priority)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&new_run.id)
        .bind(join_path(&new_run.path))
        .bind(&new_run.workflow_name)
        .bind(&new_run.inputs)
        .bind(new_run.status.as_str())
        .bind(&new_run.executor_id)
        .bind(new_run.timeout_ms)
        .bind(new_run.deadline_epoch_ms)
        .bind(&new_run.queue_name)
        .bind(&new_run.queue_partition_key)
        .bind(&new_run.queue_deduplication_id)
        .bind(new_run.priority)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            if let Some(existing) = self.fetch_run(&new_run.id).await? {
                return Ok(CreatedRun {
                    run_id: existing.id,
                    deduplicated: true,
                });
            }
            let existing: Option<(String,)> = sqlx::query_as(&format!(
                r#"
                SELECT id FROM runs
                WHERE queue_name = ? AND queue_deduplication_id = ?
                  AND status NOT IN {}
                "#,
                TERMINAL_STATUSES
            ))
            .bind(&new_run.queue_name)
            .bind(&new_run.queue_deduplication_id)
            .fetch_optional(&self.pool)
            .await?;
            let run_id = existing
                .map(|(id,)| id)
                .unwrap_or_else(|| new_run.id.clone());
            return Ok(CreatedRun {
                run_id,
                deduplicated: true,
            });
        }

        self.emit(PushChannel::Runs, &new_run.id, new_run.status.as_str(), 1);
        Ok(CreatedRun {
            run_id: new_run.id.clone(),
            deduplicated: false,
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        self.fetch_run(run_id).await
    }

    async fn get_runs(&self, run_ids: &[String]) -> Result<Vec<RunRecord>, EngineError> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; run_ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM runs WHERE id IN ({})",
            RUN_COLUMNS, placeholders
        );
        let mut query = sqlx::query_as::<_, RunRecord>(&sql);
        for run_id in run_ids {
            query = query.bind(run_id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, EngineError> {
        let _write = self.write_lock.lock().await;

        let updated: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            UPDATE runs
            SET status = ?, output = ?, error = ?,
                change_id = change_id + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status NOT IN {}
            RETURNING change_id
            "#,
            TERMINAL_STATUSES
        ))
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((change_id,)) => {
                self.emit(PushChannel::Runs, run_id, status.as_str(), change_id);
                Ok(true)
            }
            None => match self.fetch_run(run_id).await? {
                Some(_) => Ok(false),
                None => Err(EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                }),
            },
        }
    }

    async fn record_run_error_keeping_status(
        &self,
        run_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;

        let updated: Option<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE runs
            SET error = ?, change_id = change_id + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            RETURNING change_id, status
            "#,
        )
        .bind(error)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((change_id, status)) => {
                self.emit(PushChannel::Runs, run_id, &status, change_id);
                Ok(())
            }
            None => Err(EngineError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    async fn cancel_runs(&self, run_id: &str, cascade: bool) -> Result<Vec<String>, EngineError> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let target: Option<(String, String)> =
            sqlx::query_as("SELECT status, path FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (status, path) = match target {
            Some(target) => target,
            None => {
                tx.rollback().await?;
                return Err(EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                });
            }
        };
        if RunStatus::parse(&status).map(|s| s.is_terminal()).unwrap_or(false) {
            tx.rollback().await?;
            return Err(EngineError::RunNotCancellable {
                run_id: run_id.to_string(),
                status,
            });
        }

        let flipped: Vec<(String, i64)> = if cascade {
            sqlx::query_as(&format!(
                r#"
                UPDATE runs
                SET status = 'cancelled', change_id = change_id + 1,
                    updated_at = CURRENT_TIMESTAMP
                WHERE (id = ? OR path LIKE ? ESCAPE '\') AND status NOT IN {}
                RETURNING id, change_id
                "#,
                TERMINAL_STATUSES
            ))
            .bind(run_id)
            .bind(descendant_like_pattern(&path))
            .fetch_all(&mut *tx)
            .await?
        } else {
            sqlx::query_as(&format!(
                r#"
                UPDATE runs
                SET status = 'cancelled', change_id = change_id + 1,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = ? AND status NOT IN {}
                RETURNING id, change_id
                "#,
                TERMINAL_STATUSES
            ))
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await?
        };

        tx.commit().await?;
        for (id, change_id) in &flipped {
            self.emit(PushChannel::Runs, id, RunStatus::Cancelled.as_str(), *change_id);
        }
        Ok(flipped.into_iter().map(|(id, _)| id).collect())
    }

    async fn claim_queued_runs(
        &self,
        queue: &QueueConfig,
        partition: Option<&str>,
        executor_id: &str,
    ) -> Result<Vec<RunRecord>, EngineError> {
        // The write lock is this backend's claim lock: no other claim in this
        // process can interleave between the counts and the update.
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let partition_clause = match partition {
            Some(_) => "AND queue_partition_key = ?",
            None => "AND ? IS NULL",
        };

        let mut counts = AdmissionCounts::default();
        if let Some(rate) = &queue.rate_limit {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(rate.period).unwrap_or(chrono::Duration::zero());
            let (started,): (i64,) = sqlx::query_as(&format!(
                r#"
                SELECT COUNT(*) FROM runs
                WHERE queue_name = ? {} AND status <> 'queued'
                  AND datetime(started_at) >= datetime(?)
                "#,
                partition_clause
            ))
            .bind(&queue.name)
            .bind(partition)
            .bind(cutoff)
            .fetch_one(&mut *tx)
            .await?;
            counts.started_in_window = started;
        }

        let (pending_total,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM runs WHERE queue_name = ? {} AND status = 'pending'",
            partition_clause
        ))
        .bind(&queue.name)
        .bind(partition)
        .fetch_one(&mut *tx)
        .await?;
        let (pending_mine,): (i64,) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*) FROM runs
            WHERE queue_name = ? {} AND status = 'pending' AND executor_id = ?
            "#,
            partition_clause
        ))
        .bind(&queue.name)
        .bind(partition)
        .bind(executor_id)
        .fetch_one(&mut *tx)
        .await?;
        counts.pending_total = pending_total;
        counts.pending_for_executor = pending_mine;

        let budget = admissible_claim_count(queue, &counts);
        if budget == 0 {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let order_clause = if queue.priority_enabled {
            "ORDER BY (priority IS NULL) ASC, priority ASC, created_at ASC"
        } else {
            "ORDER BY created_at ASC"
        };

        let selected: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT id FROM runs
            WHERE queue_name = ? {} AND status = 'queued'
            {} LIMIT ?
            "#,
            partition_clause, order_clause
        ))
        .bind(&queue.name)
        .bind(partition)
        .bind(budget)
        .fetch_all(&mut *tx)
        .await?;

        if selected.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(selected.len());
        for (id,) in selected {
            let row = sqlx::query_as::<_, RunRecord>(&format!(
                r#"
                UPDATE runs
                SET status = 'pending', executor_id = ?, started_at = CURRENT_TIMESTAMP,
                    change_id = change_id + 1, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                RETURNING {}
                "#,
                RUN_COLUMNS
            ))
            .bind(executor_id)
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
            claimed.push(row);
        }
        tx.commit().await?;

        for row in &claimed {
            self.emit(
                PushChannel::Runs,
                &row.id,
                RunStatus::Pending.as_str(),
                row.change_id,
            );
        }
        Ok(claimed)
    }

    async fn queued_partitions(&self, queue_name: &str) -> Result<Vec<String>, EngineError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT queue_partition_key FROM runs
            WHERE queue_name = ? AND status = 'queued' AND queue_partition_key IS NOT NULL
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn load_operations(&self, run_id: &str) -> Result<Vec<OperationRecord>, EngineError> {
        let records = sqlx::query_as::<_, OperationRecord>(
            r#"
            SELECT run_id, sequence_id, output, error, created_at
            FROM operations
            WHERE run_id = ?
            ORDER BY sequence_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn append_operation(
        &self,
        run_id: &str,
        sequence_id: i64,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO operations (run_id, sequence_id, output, error) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(sequence_id)
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
        payload: &str,
    ) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM runs WHERE id = ?")
            .bind(destination_run_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Err(EngineError::RunNotFound {
                run_id: destination_run_id.to_string(),
            });
        }

        sqlx::query(
            "INSERT INTO messages (destination_run_id, message_type, payload) VALUES (?, ?, ?)",
        )
        .bind(destination_run_id)
        .bind(message_type)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        if let Some((sender_run_id, sequence_id)) = recorded {
            sqlx::query("INSERT INTO operations (run_id, sequence_id) VALUES (?, ?)")
                .bind(sender_run_id)
                .bind(sequence_id)
                .execute(&mut *tx)
                .await?;
        }

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE destination_run_id = ? AND message_type = ?",
        )
        .bind(destination_run_id)
        .bind(message_type)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        self.emit(PushChannel::Messages, destination_run_id, message_type, count);
        Ok(())
    }

    async fn consume_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
    ) -> Result<Option<String>, EngineError> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let consumed: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM messages WHERE id = (
                SELECT id FROM messages
                WHERE destination_run_id = ? AND message_type = ?
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .bind(destination_run_id)
        .bind(message_type)
        .fetch_optional(&mut *tx)
        .await?;

        let payload = match consumed {
            Some((payload,)) => payload,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        if let Some((run_id, sequence_id)) = recorded {
            sqlx::query("INSERT INTO operations (run_id, sequence_id, output) VALUES (?, ?, ?)")
                .bind(run_id)
                .bind(sequence_id)
                .bind(&payload)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(Some(payload))
    }

    async fn matching_message_keys(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, String, i64)>, EngineError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // SQLite names VALUES-in-FROM columns column1, column2, ...
        let values = vec!["(?, ?)"; keys.len()].join(", ");
        let sql = format!(
            r#"
            SELECT k.column1, k.column2, COUNT(*)
            FROM messages m
            JOIN (VALUES {}) AS k
              ON m.destination_run_id = k.column1
             AND (k.column2 = '*' OR m.message_type = k.column2)
            GROUP BY k.column1, k.column2
            "#,
            values
        );
        let mut query = sqlx::query_as::<_, (String, String, i64)>(&sql);
        for (destination, message_type) in keys {
            query = query.bind(destination).bind(message_type);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn set_state(
        &self,
        run_id: &str,
        sequence_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let (change_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO state (run_id, key, value)
            VALUES (?, ?, ?)
            ON CONFLICT (run_id, key) DO UPDATE
            SET value = excluded.value,
                change_id = state.change_id + 1,
                updated_at = CURRENT_TIMESTAMP
            RETURNING change_id
            "#,
        )
        .bind(run_id)
        .bind(key)
        .bind(value)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO state_history (run_id, key, value) VALUES (?, ?, ?)")
            .bind(run_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO operations (run_id, sequence_id) VALUES (?, ?)")
            .bind(run_id)
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.emit(PushChannel::State, run_id, key, change_id);
        Ok(())
    }

    async fn get_state(&self, run_id: &str, key: &str) -> Result<Option<String>, EngineError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM state WHERE run_id = ? AND key = ?")
                .bind(run_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn get_states(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<(String, String, String, i64)>, EngineError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = vec!["(?, ?)"; keys.len()].join(", ");
        let sql = format!(
            r#"
            SELECT s.run_id, s.key, s.value, s.change_id
            FROM state s
            JOIN (VALUES {}) AS k ON s.run_id = k.column1 AND s.key = k.column2
            "#,
            values
        );
        let mut query = sqlx::query_as::<_, (String, String, String, i64)>(&sql);
        for (run_id, key) in keys {
            query = query.bind(run_id).bind(key);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn runs_owned_by(&self, executor_id: &str) -> Result<Vec<RunRecord>, EngineError> {
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE executor_id = ? AND status = 'pending'",
            RUN_COLUMNS
        ))
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn begin_recovery_attempt(
        &self,
        run_id: &str,
        max_attempts: i32,
    ) -> Result<RecoveryDecision, EngineError> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, i32)> =
            sqlx::query_as("SELECT status, recovery_attempts FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (status, attempts) = match current {
            Some(current) => current,
            None => {
                tx.rollback().await?;
                return Err(EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                });
            }
        };
        if status != RunStatus::Pending.as_str() {
            tx.rollback().await?;
            return Ok(RecoveryDecision::Skip);
        }

        if attempts + 1 > max_attempts {
            let (change_id,): (i64,) = sqlx::query_as(
                r#"
                UPDATE runs
                SET status = 'max_recovery_attempts_exceeded',
                    change_id = change_id + 1, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                RETURNING change_id
                "#,
            )
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            self.emit(
                PushChannel::Runs,
                run_id,
                RunStatus::MaxRecoveryAttemptsExceeded.as_str(),
                change_id,
            );
            return Ok(RecoveryDecision::Exceeded);
        }

        let row = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            UPDATE runs
            SET recovery_attempts = recovery_attempts + 1,
                change_id = change_id + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        self.emit(
            PushChannel::Runs,
            run_id,
            RunStatus::Pending.as_str(),
            row.change_id,
        );
        Ok(RecoveryDecision::Resume(Box::new(row)))
    }

    async fn subscribe_push(
        &self,
    ) -> Result<Option<broadcast::Receiver<PushNotification>>, EngineError> {
        Ok(Some(self.push.subscribe()))
    }
}
