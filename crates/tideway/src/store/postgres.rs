// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store.
//!
//! Production backend. Push notifications ride LISTEN/NOTIFY: every mutating
//! write issues `pg_notify` inside its own transaction, so a notification is
//! delivered exactly when its write commits. Queue claims lock selected rows
//! with `FOR UPDATE SKIP LOCKED` (unbounded queues) or `NOWAIT` (hard global
//! cap), so concurrent dispatcher processes never double-claim.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::config::QueueConfig;
use crate::dispatcher::{AdmissionCounts, admissible_claim_count};
use crate::error::EngineError;
use crate::model::{
    CreatedRun, NewRun, OperationRecord, RecoveryDecision, RunRecord, RunStatus, join_path,
};

use super::{
    MESSAGES_CHANNEL, PushChannel, PushNotification, RUNS_CHANNEL, STATE_CHANNEL, Store,
    descendant_like_pattern, format_push_payload, parse_push_payload,
};

const RUN_COLUMNS: &str = "id, path, workflow_name, inputs, output, error, status, executor_id, \
     change_id, timeout_ms, deadline_epoch_ms, queue_name, queue_partition_key, \
     queue_deduplication_id, priority, recovery_attempts, started_at, created_at, updated_at";

const TERMINAL_STATUSES: &str =
    "('success', 'error', 'cancelled', 'max_recovery_attempts_exceeded')";

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: PgPool,
    push: Mutex<Option<broadcast::Sender<PushNotification>>>,
}

impl PostgresStore {
    /// Build a store over an existing pool. Run
    /// [`crate::migrations::run_postgres`] before first use.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            push: Mutex::new(None),
        }
    }

    /// Connect to `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        let pool = PgPool::connect(url).await?;
        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| EngineError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
                retryable: false,
            })?;
        Ok(Self::new(pool))
    }
}

async fn notify(
    tx: &mut Transaction<'_, Postgres>,
    channel: &str,
    entity_id: &str,
    secondary: &str,
    change: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(format_push_payload(entity_id, secondary, change))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_run(&self, new_run: &NewRun) -> Result<CreatedRun, EngineError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (id, path, workflow_name, inputs, status, executor_id,
                              timeout_ms, deadline_epoch_ms, queue_name,
                              queue_partition_key, queue_deduplication_id, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;

            // Same id, or a live queued run under the same dedup key.
            if let Some(existing) = self.get_run(&new_run.id).await? {
                return Ok(CreatedRun {
                    run_id: existing.id,
                    deduplicated: true,
                });
            }
            let existing: Option<(String,)> = sqlx::query_as(&format!(
                r#"
                SELECT id FROM runs
                WHERE queue_name = $1 AND queue_deduplication_id = $2
                  AND status NOT IN {}
                "#,
                TERMINAL_STATUSES
            ))
            .bind(&new_run.queue_name)
            .bind(&new_run.queue_deduplication_id)
            .fetch_optional(&self.pool)
            .await?;
            return match existing {
                Some((run_id,)) => Ok(CreatedRun {
                    run_id,
                    deduplicated: true,
                }),
                // The absorbing row settled between the insert and the probe.
                None => Ok(CreatedRun {
                    run_id: new_run.id.clone(),
                    deduplicated: true,
                }),
            };
        }

        notify(&mut tx, RUNS_CHANNEL, &new_run.id, new_run.status.as_str(), 1).await?;
        tx.commit().await?;

        Ok(CreatedRun {
            run_id: new_run.id.clone(),
            deduplicated: false,
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_runs(&self, run_ids: &[String]) -> Result<Vec<RunRecord>, EngineError> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = ANY($1)",
            RUN_COLUMNS
        ))
        .bind(run_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, EngineError> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            UPDATE runs
            SET status = $2, output = $3, error = $4,
                change_id = change_id + 1, updated_at = NOW()
            WHERE id = $1 AND status NOT IN {}
            RETURNING change_id
            "#,
            TERMINAL_STATUSES
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some((change_id,)) => {
                notify(&mut tx, RUNS_CHANNEL, run_id, status.as_str(), change_id).await?;
                tx.commit().await?;
                Ok(true)
            }
            None => {
                tx.rollback().await?;
                match self.get_run(run_id).await? {
                    Some(_) => Ok(false),
                    None => Err(EngineError::RunNotFound {
                        run_id: run_id.to_string(),
                    }),
                }
            }
        }
    }

    async fn record_run_error_keeping_status(
        &self,
        run_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE runs
            SET error = $2, change_id = change_id + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING change_id, status
            "#,
        )
        .bind(run_id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some((change_id, status)) => {
                notify(&mut tx, RUNS_CHANNEL, run_id, &status, change_id).await?;
                tx.commit().await?;
                Ok(())
            }
            None => {
                tx.rollback().await?;
                Err(EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                })
            }
        }
    }

    async fn cancel_runs(&self, run_id: &str, cascade: bool) -> Result<Vec<String>, EngineError> {
        let mut tx = self.pool.begin().await?;

        let target: Option<(String, String)> =
            sqlx::query_as("SELECT status, path FROM runs WHERE id = $1 FOR UPDATE")
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
                SET status = 'cancelled', change_id = change_id + 1, updated_at = NOW()
                WHERE (id = $1 OR path LIKE $2 ESCAPE '\') AND status NOT IN {}
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
                SET status = 'cancelled', change_id = change_id + 1, updated_at = NOW()
                WHERE id = $1 AND status NOT IN {}
                RETURNING id, change_id
                "#,
                TERMINAL_STATUSES
            ))
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await?
        };

        for (id, change_id) in &flipped {
            notify(
                &mut tx,
                RUNS_CHANNEL,
                id,
                RunStatus::Cancelled.as_str(),
                *change_id,
            )
            .await?;
        }
        tx.commit().await?;

        Ok(flipped.into_iter().map(|(id, _)| id).collect())
    }

    async fn claim_queued_runs(
        &self,
        queue: &QueueConfig,
        partition: Option<&str>,
        executor_id: &str,
    ) -> Result<Vec<RunRecord>, EngineError> {
        let mut tx = self.pool.begin().await?;

        let partition_clause = match partition {
            Some(_) => "AND queue_partition_key = $2",
            None => "AND $2::text IS NULL",
        };

        let mut counts = AdmissionCounts::default();
        if let Some(rate) = &queue.rate_limit {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(rate.period).unwrap_or(chrono::Duration::zero());
            let (started,): (i64,) = sqlx::query_as(&format!(
                r#"
                SELECT COUNT(*) FROM runs
                WHERE queue_name = $1 {} AND status <> 'queued' AND started_at >= $3
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

        let (pending_total, pending_mine): (i64, i64) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE executor_id = $3)
            FROM runs
            WHERE queue_name = $1 {} AND status = 'pending'
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
            "ORDER BY priority ASC NULLS LAST, created_at ASC"
        } else {
            "ORDER BY created_at ASC"
        };
        // A hard global cap must never overcommit, so the selection fails
        // rather than waits when another dispatcher holds the rows; an
        // unbounded queue just skips them.
        let lock_clause = if queue.global_concurrency.is_some() {
            "FOR UPDATE NOWAIT"
        } else {
            "FOR UPDATE SKIP LOCKED"
        };

        let selected: Result<Vec<(String,)>, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            SELECT id FROM runs
            WHERE queue_name = $1 {} AND status = 'queued'
            {} LIMIT $3 {}
            "#,
            partition_clause, order_clause, lock_clause
        ))
        .bind(&queue.name)
        .bind(partition)
        .bind(budget)
        .fetch_all(&mut *tx)
        .await;

        let selected = match selected {
            Ok(selected) => selected,
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("55P03") => {
                // Rows are locked by a concurrent dispatcher; claim nothing
                // this tick rather than risk overcommitting the global cap.
                tx.rollback().await?;
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        if selected.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }
        let ids: Vec<String> = selected.into_iter().map(|(id,)| id).collect();

        let claimed = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            UPDATE runs
            SET status = 'pending', executor_id = $2, started_at = NOW(),
                change_id = change_id + 1, updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(&ids)
        .bind(executor_id)
        .fetch_all(&mut *tx)
        .await?;

        for row in &claimed {
            notify(
                &mut tx,
                RUNS_CHANNEL,
                &row.id,
                RunStatus::Pending.as_str(),
                row.change_id,
            )
            .await?;
        }
        tx.commit().await?;

        Ok(claimed)
    }

    async fn queued_partitions(&self, queue_name: &str) -> Result<Vec<String>, EngineError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT queue_partition_key FROM runs
            WHERE queue_name = $1 AND status = 'queued' AND queue_partition_key IS NOT NULL
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
            WHERE run_id = $1
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
        sqlx::query(
            r#"
            INSERT INTO operations (run_id, sequence_id, output, error)
            VALUES ($1, $2, $3, $4)
            "#,
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
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM runs WHERE id = $1")
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
            r#"
            INSERT INTO messages (destination_run_id, message_type, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(destination_run_id)
        .bind(message_type)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        if let Some((sender_run_id, sequence_id)) = recorded {
            sqlx::query("INSERT INTO operations (run_id, sequence_id) VALUES ($1, $2)")
                .bind(sender_run_id)
                .bind(sequence_id)
                .execute(&mut *tx)
                .await?;
        }

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE destination_run_id = $1 AND message_type = $2",
        )
        .bind(destination_run_id)
        .bind(message_type)
        .fetch_one(&mut *tx)
        .await?;
        notify(&mut tx, MESSAGES_CHANNEL, destination_run_id, message_type, count).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn consume_message(
        &self,
        recorded: Option<(&str, i64)>,
        destination_run_id: &str,
        message_type: &str,
    ) -> Result<Option<String>, EngineError> {
        let mut tx = self.pool.begin().await?;

        let consumed: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM messages WHERE id = (
                SELECT id FROM messages
                WHERE destination_run_id = $1 AND message_type = $2
                ORDER BY id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
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
            sqlx::query("INSERT INTO operations (run_id, sequence_id, output) VALUES ($1, $2, $3)")
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
        let destinations: Vec<String> = keys.iter().map(|(d, _)| d.clone()).collect();
        let types: Vec<String> = keys.iter().map(|(_, t)| t.clone()).collect();

        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT k.destination_run_id, k.message_type, COUNT(*)
            FROM messages m
            JOIN UNNEST($1::text[], $2::text[]) AS k(destination_run_id, message_type)
              ON m.destination_run_id = k.destination_run_id
             AND (k.message_type = '*' OR m.message_type = k.message_type)
            GROUP BY k.destination_run_id, k.message_type
            "#,
        )
        .bind(&destinations)
        .bind(&types)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_state(
        &self,
        run_id: &str,
        sequence_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        let (change_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO state (run_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id, key) DO UPDATE
            SET value = EXCLUDED.value,
                change_id = state.change_id + 1,
                updated_at = NOW()
            RETURNING change_id
            "#,
        )
        .bind(run_id)
        .bind(key)
        .bind(value)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO state_history (run_id, key, value) VALUES ($1, $2, $3)")
            .bind(run_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO operations (run_id, sequence_id) VALUES ($1, $2)")
            .bind(run_id)
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;

        notify(&mut tx, STATE_CHANNEL, run_id, key, change_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_state(&self, run_id: &str, key: &str) -> Result<Option<String>, EngineError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM state WHERE run_id = $1 AND key = $2")
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
        let run_ids: Vec<String> = keys.iter().map(|(r, _)| r.clone()).collect();
        let state_keys: Vec<String> = keys.iter().map(|(_, k)| k.clone()).collect();

        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT s.run_id, s.key, s.value, s.change_id
            FROM state s
            JOIN UNNEST($1::text[], $2::text[]) AS k(run_id, key)
              ON s.run_id = k.run_id AND s.key = k.key
            "#,
        )
        .bind(&run_ids)
        .bind(&state_keys)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn runs_owned_by(&self, executor_id: &str) -> Result<Vec<RunRecord>, EngineError> {
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE executor_id = $1 AND status = 'pending'",
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
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, i32)> = sqlx::query_as(
            "SELECT status, recovery_attempts FROM runs WHERE id = $1 FOR UPDATE",
        )
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
                    change_id = change_id + 1, updated_at = NOW()
                WHERE id = $1
                RETURNING change_id
                "#,
            )
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;
            notify(
                &mut tx,
                RUNS_CHANNEL,
                run_id,
                RunStatus::MaxRecoveryAttemptsExceeded.as_str(),
                change_id,
            )
            .await?;
            tx.commit().await?;
            return Ok(RecoveryDecision::Exceeded);
        }

        let row = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            UPDATE runs
            SET recovery_attempts = recovery_attempts + 1,
                change_id = change_id + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;
        notify(
            &mut tx,
            RUNS_CHANNEL,
            run_id,
            RunStatus::Pending.as_str(),
            row.change_id,
        )
        .await?;
        tx.commit().await?;

        Ok(RecoveryDecision::Resume(Box::new(row)))
    }

    async fn subscribe_push(
        &self,
    ) -> Result<Option<broadcast::Receiver<PushNotification>>, EngineError> {
        let mut push = self.push.lock().await;
        if let Some(tx) = push.as_ref() {
            return Ok(Some(tx.subscribe()));
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([RUNS_CHANNEL, MESSAGES_CHANNEL, STATE_CHANNEL])
            .await?;

        let (tx, rx) = broadcast::channel(1024);
        let pump = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(channel) = PushChannel::from_name(notification.channel()) else {
                            continue;
                        };
                        match parse_push_payload(channel, notification.payload()) {
                            Some(parsed) => {
                                let _ = pump.send(parsed);
                            }
                            None => {
                                // Tolerated: the poll paths converge anyway.
                                warn!(
                                    channel = notification.channel(),
                                    "malformed push payload dropped"
                                );
                            }
                        }
                    }
                    Err(err) => {
                        // PgListener reconnects internally on the next recv.
                        warn!(error = %err, "push listener error; reconnecting");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        *push = Some(tx);
        Ok(Some(rx))
    }
}
