// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Run state transitions that race with asynchronous result callbacks are
//! serialized with `SELECT ... FOR UPDATE` on the run row. Task runs and log
//! broadcasts are upserted by natural identity with `ON CONFLICT`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, db, is_unique_violation};
use crate::models::{
    BroadcastKey, LogBroadcast, PipelineRun, PipelineSpec, RunState, TaskResult, TaskRun,
};
use crate::recovery::plan_watermark;

use super::{
    BroadcastPersistence, LogBroadcastRow, PipelineRunRow, PipelineSpecRow, RunCursor,
    RunPersistence, TaskResultUpdate, TaskRunRow, association_ids, attach_associations,
    completion_columns, duration_millis, task_result_columns,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const RUN_COLUMNS: &str = r#"
    pipeline_runs.id, pipeline_runs.pipeline_spec_id, pipeline_runs.meta, pipeline_runs.inputs,
    pipeline_runs.outputs, pipeline_runs.fatal_errors, pipeline_runs.all_errors,
    pipeline_runs.state::text AS state, pipeline_runs.created_at, pipeline_runs.finished_at
"#;

// ============================================================================
// Task Run Helpers
// ============================================================================

/// Insert task runs that are known not to exist yet.
async fn insert_task_runs(
    conn: &mut PgConnection,
    task_runs: &[TaskRun],
    operation: &'static str,
) -> Result<(), CoreError> {
    for task_run in task_runs {
        let (output, error) = task_result_columns(&task_run.result);
        sqlx::query(
            r#"
            INSERT INTO pipeline_task_runs
                (id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task_run.id)
        .bind(task_run.pipeline_run_id)
        .bind(&task_run.dot_id)
        .bind(&task_run.task_type)
        .bind(task_run.index)
        .bind(output)
        .bind(error)
        .bind(task_run.created_at)
        .bind(task_run.finished_at)
        .execute(&mut *conn)
        .await
        .map_err(db(operation))?;
    }

    Ok(())
}

/// Upsert task runs by (run id, dot id), returning the stored rows.
///
/// Only output, error and finish time change on conflict.
async fn upsert_task_runs(
    conn: &mut PgConnection,
    task_runs: &[TaskRun],
) -> Result<Vec<TaskRun>, CoreError> {
    let mut stored = Vec::with_capacity(task_runs.len());
    for task_run in task_runs {
        let (output, error) = task_result_columns(&task_run.result);
        let row = sqlx::query_as::<_, TaskRunRow>(
            r#"
            INSERT INTO pipeline_task_runs
                (id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (pipeline_run_id, dot_id) DO UPDATE
            SET output = EXCLUDED.output,
                error = EXCLUDED.error,
                finished_at = EXCLUDED.finished_at
            RETURNING id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at
            "#,
        )
        .bind(task_run.id)
        .bind(task_run.pipeline_run_id)
        .bind(&task_run.dot_id)
        .bind(&task_run.task_type)
        .bind(task_run.index)
        .bind(output)
        .bind(error)
        .bind(task_run.created_at)
        .bind(task_run.finished_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(db("store_run"))?;
        stored.push(TaskRun::from(row));
    }

    Ok(stored)
}

/// Load task runs for a set of runs, oldest first.
async fn load_task_runs(
    conn: &mut PgConnection,
    run_ids: &[i64],
) -> Result<Vec<TaskRun>, CoreError> {
    let rows = sqlx::query_as::<_, TaskRunRow>(
        r#"
        SELECT id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at
        FROM pipeline_task_runs
        WHERE pipeline_run_id = ANY($1)
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(run_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db("load_task_runs"))?;

    Ok(rows.into_iter().map(TaskRun::from).collect())
}

/// Load specs and task runs for a page of runs in exactly two queries.
async fn load_associations(
    conn: &mut PgConnection,
    runs: &mut [PipelineRun],
) -> Result<(), CoreError> {
    if runs.is_empty() {
        return Ok(());
    }

    let (spec_ids, run_ids) = association_ids(runs);

    let specs = sqlx::query_as::<_, PipelineSpecRow>(
        r#"
        SELECT id, dot_dag_source, max_task_duration_ms, created_at
        FROM pipeline_specs
        WHERE id = ANY($1)
        "#,
    )
    .bind(&spec_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db("load_specs"))?
    .into_iter()
    .map(PipelineSpec::from)
    .collect();

    let task_runs = load_task_runs(conn, &run_ids).await?;
    attach_associations(runs, specs, task_runs);

    Ok(())
}

fn decode_runs(rows: Vec<PipelineRunRow>) -> Result<Vec<PipelineRun>, CoreError> {
    rows.into_iter().map(PipelineRun::try_from).collect()
}

// ============================================================================
// Watermark Helpers
// ============================================================================

async fn upsert_pending_min_block(
    conn: &mut PgConnection,
    chain_id: i64,
    block_number: Option<i64>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO log_broadcasts_pending (evm_chain_id, block_number, created_at, updated_at)
        VALUES ($1, $2, NOW(), NOW())
        ON CONFLICT (evm_chain_id) DO UPDATE
        SET block_number = EXCLUDED.block_number, updated_at = NOW()
        "#,
    )
    .bind(chain_id)
    .bind(block_number)
    .execute(&mut *conn)
    .await
    .map_err(db("set_pending_min_block"))?;

    Ok(())
}

async fn select_pending_min_block(
    conn: &mut PgConnection,
    chain_id: i64,
    for_update: bool,
) -> Result<Option<i64>, CoreError> {
    let sql = if for_update {
        "SELECT block_number FROM log_broadcasts_pending WHERE evm_chain_id = $1 FOR UPDATE"
    } else {
        "SELECT block_number FROM log_broadcasts_pending WHERE evm_chain_id = $1"
    };

    let block_number = sqlx::query_scalar::<_, Option<i64>>(sql)
        .bind(chain_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db("get_pending_min_block"))?;

    Ok(block_number.flatten())
}

// ============================================================================
// Run Persistence
// ============================================================================

#[async_trait]
impl RunPersistence for PostgresPersistence {
    async fn create_spec(
        &self,
        dot_dag_source: &str,
        max_task_duration: Duration,
    ) -> Result<i32, CoreError> {
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO pipeline_specs (dot_dag_source, max_task_duration_ms, created_at)
            VALUES ($1, $2, NOW())
            RETURNING id
            "#,
        )
        .bind(dot_dag_source)
        .bind(duration_millis(max_task_duration)?)
        .fetch_one(&self.pool)
        .await
        .map_err(db("create_spec"))?;

        Ok(id)
    }

    async fn create_run(&self, run: &mut PipelineRun) -> Result<(), CoreError> {
        let created_at = run.require_created_at()?;
        let (outputs, fatal_errors, all_errors, finished_at) = completion_columns(&run.state);

        let mut tx = self.pool.begin().await.map_err(db("create_run"))?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_runs
                (pipeline_spec_id, meta, inputs, outputs, fatal_errors, all_errors, state, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7::pipeline_run_state, $8, $9)
            RETURNING id
            "#,
        )
        .bind(run.pipeline_spec_id)
        .bind(sqlx::types::Json(&run.meta))
        .bind(sqlx::types::Json(&run.inputs))
        .bind(outputs)
        .bind(fatal_errors)
        .bind(all_errors)
        .bind(run.state.as_str())
        .bind(created_at)
        .bind(finished_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db("create_run"))?;

        run.assign_run_id(id);
        insert_task_runs(&mut tx, &run.task_runs, "create_run").await?;

        tx.commit().await.map_err(db("create_run"))?;
        Ok(())
    }

    async fn store_run(&self, run: &mut PipelineRun) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db("store_run"))?;

        let finished = run.is_finished();
        if finished {
            let (outputs, fatal_errors, all_errors, finished_at) = completion_columns(&run.state);
            let result = sqlx::query(
                r#"
                UPDATE pipeline_runs
                SET state = 'completed'::pipeline_run_state,
                    finished_at = $2,
                    outputs = $3,
                    fatal_errors = $4,
                    all_errors = $5
                WHERE id = $1
                "#,
            )
            .bind(run.id)
            .bind(finished_at)
            .bind(outputs)
            .bind(fatal_errors)
            .bind(all_errors)
            .execute(&mut *tx)
            .await
            .map_err(db("store_run"))?;

            if result.rows_affected() == 0 {
                return Err(CoreError::RunNotFound { run_id: run.id });
            }
        } else {
            // Lock the run against concurrent result callbacks
            let locked = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM pipeline_runs WHERE id = $1 FOR UPDATE",
            )
            .bind(run.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db("store_run"))?;

            if locked.is_none() {
                return Err(CoreError::RunNotFound { run_id: run.id });
            }

            let persisted = load_task_runs(&mut tx, &[run.id]).await?;
            if run.merge_posted_results(&persisted) {
                tx.commit().await.map_err(db("store_run"))?;
                debug!(run_id = run.id, "Results posted while running, restarting");
                return Ok(true);
            }

            sqlx::query(
                "UPDATE pipeline_runs SET state = 'suspended'::pipeline_run_state WHERE id = $1",
            )
            .bind(run.id)
            .execute(&mut *tx)
            .await
            .map_err(db("store_run"))?;
        }

        let stored = upsert_task_runs(&mut tx, &run.task_runs).await?;
        tx.commit().await.map_err(db("store_run"))?;

        if !finished {
            run.state = RunState::Suspended;
        }
        run.task_runs = stored;

        Ok(false)
    }

    async fn update_task_run_result(
        &self,
        task_run_id: Uuid,
        result: &TaskResult,
        finished_at: DateTime<Utc>,
    ) -> Result<TaskResultUpdate, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db("update_task_run_result"))?;

        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM pipeline_runs
            JOIN pipeline_task_runs ON pipeline_task_runs.pipeline_run_id = pipeline_runs.id
            WHERE pipeline_task_runs.id = $1
              AND pipeline_runs.state IN ('running', 'suspended')
            FOR UPDATE OF pipeline_runs
            "#
        );
        let row = sqlx::query_as::<_, PipelineRunRow>(&sql)
            .bind(task_run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db("update_task_run_result"))?
            .ok_or(CoreError::TaskRunNotFound { task_run_id })?;

        let mut run = PipelineRun::try_from(row)?;

        let (output, error) = task_result_columns(result);
        sqlx::query(
            r#"
            UPDATE pipeline_task_runs
            SET output = $2, error = $3, finished_at = $4
            WHERE id = $1
            "#,
        )
        .bind(task_run_id)
        .bind(output)
        .bind(error)
        .bind(finished_at)
        .execute(&mut *tx)
        .await
        .map_err(db("update_task_run_result"))?;

        let resume = matches!(run.state, RunState::Suspended);
        if resume {
            sqlx::query(
                "UPDATE pipeline_runs SET state = 'running'::pipeline_run_state WHERE id = $1",
            )
            .bind(run.id)
            .execute(&mut *tx)
            .await
            .map_err(db("update_task_run_result"))?;
            run.state = RunState::Running;
        }

        load_associations(&mut tx, std::slice::from_mut(&mut run)).await?;
        tx.commit().await.map_err(db("update_task_run_result"))?;

        Ok(TaskResultUpdate { run, resume })
    }

    async fn insert_finished_run(
        &self,
        run: &mut PipelineRun,
        save_task_runs: bool,
    ) -> Result<(), CoreError> {
        let created_at = run.require_created_at()?;
        let (outputs, fatal_errors, all_errors, finished_at) = completion_columns(&run.state);

        let mut tx = self.pool.begin().await.map_err(db("insert_finished_run"))?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_runs
                (pipeline_spec_id, meta, inputs, outputs, fatal_errors, all_errors, state, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'completed'::pipeline_run_state, $7, $8)
            RETURNING id
            "#,
        )
        .bind(run.pipeline_spec_id)
        .bind(sqlx::types::Json(&run.meta))
        .bind(sqlx::types::Json(&run.inputs))
        .bind(outputs)
        .bind(fatal_errors)
        .bind(all_errors)
        .bind(created_at)
        .bind(finished_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db("insert_finished_run"))?;

        run.assign_run_id(id);
        if save_task_runs {
            insert_task_runs(&mut tx, &run.task_runs, "insert_finished_run").await?;
        }

        tx.commit().await.map_err(db("insert_finished_run"))?;
        Ok(())
    }

    async fn delete_run(&self, run_id: i64) -> Result<bool, CoreError> {
        // Cascades to pipeline_task_runs
        let result = sqlx::query("DELETE FROM pipeline_runs WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(db("delete_run"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM pipeline_runs WHERE finished_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db("delete_runs_older_than"))?;

        Ok(result.rows_affected())
    }

    async fn find_run(&self, run_id: i64) -> Result<Option<PipelineRun>, CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db("find_run"))?;

        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = $1");
        let Some(row) = sqlx::query_as::<_, PipelineRunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db("find_run"))?
        else {
            return Ok(None);
        };

        let mut run = PipelineRun::try_from(row)?;
        load_associations(&mut conn, std::slice::from_mut(&mut run)).await?;
        Ok(Some(run))
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db("list_runs"))?;

        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY pipeline_runs.created_at ASC, pipeline_runs.id ASC"
        );
        let rows = sqlx::query_as::<_, PipelineRunRow>(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(db("list_runs"))?;

        let mut runs = decode_runs(rows)?;
        load_associations(&mut conn, &mut runs).await?;
        Ok(runs)
    }

    async fn list_unfinished_runs(
        &self,
        created_before: DateTime<Utc>,
        cursor: Option<RunCursor>,
        limit: i64,
    ) -> Result<Vec<PipelineRun>, CoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db("get_unfinished_runs"))?;

        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM pipeline_runs
            WHERE state = 'running'
              AND created_at < $1
              AND ($2::TIMESTAMPTZ IS NULL OR (created_at, id) > ($2::TIMESTAMPTZ, $3::BIGINT))
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, PipelineRunRow>(&sql)
            .bind(created_before)
            .bind(cursor.map(|c| c.created_at))
            .bind(cursor.map(|c| c.id))
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
            .map_err(db("get_unfinished_runs"))?;

        let mut runs = decode_runs(rows)?;
        load_associations(&mut conn, &mut runs).await?;
        Ok(runs)
    }
}

// ============================================================================
// Broadcast Persistence
// ============================================================================

#[async_trait]
impl BroadcastPersistence for PostgresPersistence {
    async fn was_broadcast_consumed(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
    ) -> Result<bool, CoreError> {
        let consumed = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT consumed FROM log_broadcasts
            WHERE block_hash = $1
              AND log_index = $2
              AND job_id = $3
              AND evm_chain_id = $4
            "#,
        )
        .bind(key.block_hash.as_bytes())
        .bind(key.log_index)
        .bind(key.job_id)
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("was_broadcast_consumed"))?;

        Ok(consumed.unwrap_or(false))
    }

    async fn find_broadcasts(
        &self,
        chain_id: i64,
        from_block: i64,
        to_block: i64,
    ) -> Result<Vec<LogBroadcast>, CoreError> {
        let rows = sqlx::query_as::<_, LogBroadcastRow>(
            r#"
            SELECT block_hash, block_number, log_index, job_id, consumed
            FROM log_broadcasts
            WHERE block_number >= $1
              AND block_number <= $2
              AND evm_chain_id = $3
            ORDER BY block_number ASC, log_index ASC, job_id ASC
            "#,
        )
        .bind(from_block)
        .bind(to_block)
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("find_broadcasts"))?;

        rows.into_iter().map(LogBroadcast::try_from).collect()
    }

    async fn create_broadcast(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
        block_number: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO log_broadcasts
                (block_hash, block_number, log_index, job_id, created_at, updated_at, consumed, evm_chain_id)
            VALUES ($1, $2, $3, $4, NOW(), NOW(), false, $5)
            "#,
        )
        .bind(key.block_hash.as_bytes())
        .bind(block_number)
        .bind(key.log_index)
        .bind(key.job_id)
        .bind(chain_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::BroadcastAlreadyExists {
                    chain_id,
                    block_hash: key.block_hash.to_string(),
                    log_index: key.log_index,
                    job_id: key.job_id,
                }
            } else {
                CoreError::database("create_broadcast", e)
            }
        })?;

        Ok(())
    }

    async fn mark_broadcast_consumed(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
        block_number: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO log_broadcasts
                (block_hash, block_number, log_index, job_id, created_at, updated_at, consumed, evm_chain_id)
            VALUES ($1, $2, $3, $4, NOW(), NOW(), true, $5)
            ON CONFLICT (job_id, block_hash, log_index, evm_chain_id) DO UPDATE
            SET consumed = true, updated_at = NOW()
            "#,
        )
        .bind(key.block_hash.as_bytes())
        .bind(block_number)
        .bind(key.log_index)
        .bind(key.job_id)
        .bind(chain_id)
        .execute(&self.pool)
        .await
        .map_err(db("mark_broadcast_consumed"))?;

        Ok(())
    }

    async fn set_pending_min_block(
        &self,
        chain_id: i64,
        block_number: Option<i64>,
    ) -> Result<(), CoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db("set_pending_min_block"))?;
        upsert_pending_min_block(&mut conn, chain_id, block_number).await
    }

    async fn get_pending_min_block(&self, chain_id: i64) -> Result<Option<i64>, CoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db("get_pending_min_block"))?;
        select_pending_min_block(&mut conn, chain_id, false).await
    }

    async fn reinitialize(&self, chain_id: i64) -> Result<Option<i64>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db("reinitialize"))?;

        let min_unconsumed = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT MIN(block_number) FROM log_broadcasts
            WHERE evm_chain_id = $1 AND consumed = false
            "#,
        )
        .bind(chain_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db("reinitialize"))?;

        let min_pending = select_pending_min_block(&mut tx, chain_id, true).await?;

        let plan = plan_watermark(min_unconsumed, min_pending);
        if let Some(lowered) = plan.lower_to {
            upsert_pending_min_block(&mut tx, chain_id, Some(lowered)).await?;
        }
        if plan.purge_unconsumed {
            sqlx::query("DELETE FROM log_broadcasts WHERE evm_chain_id = $1 AND consumed = false")
                .bind(chain_id)
                .execute(&mut *tx)
                .await
                .map_err(db("reinitialize"))?;
        }

        tx.commit().await.map_err(db("reinitialize"))?;
        Ok(plan.watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockHash, CompletionRecord};
    use serde_json::json;

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        crate::migrations::run_postgres(&pool).await.ok()?;
        Some(pool)
    }

    fn random_hash() -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        BlockHash(bytes)
    }

    // Chain ids are random so tests sharing a database don't see each other's rows
    fn random_chain_id() -> i64 {
        Uuid::new_v4().as_u128() as i64 & i64::MAX
    }

    async fn create_run_with_tasks(persistence: &PostgresPersistence, dot_ids: &[&str]) -> PipelineRun {
        let spec_id = persistence
            .create_spec("a -> b", Duration::from_secs(10))
            .await
            .expect("Failed to create spec");
        let mut run = PipelineRun::new(spec_id, json!({"n": 1}), json!({}));
        run.task_runs = dot_ids
            .iter()
            .enumerate()
            .map(|(i, dot_id)| TaskRun::new(*dot_id, "bridge", i as i32))
            .collect();
        persistence
            .create_run(&mut run)
            .await
            .expect("Failed to create run");
        run
    }

    #[tokio::test]
    async fn test_store_run_suspend_then_resume() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);

        let mut run = create_run_with_tasks(&persistence, &["ds1", "ds2"]).await;
        let restart = persistence.store_run(&mut run).await.unwrap();
        assert!(!restart);
        assert_eq!(run.state, RunState::Suspended);

        let task_id = run.task_runs[1].id;
        let update = persistence
            .update_task_run_result(task_id, &TaskResult::Succeeded(json!("42")), Utc::now())
            .await
            .unwrap();
        assert!(update.resume);
        assert_eq!(update.run.state, RunState::Running);
        assert_eq!(update.run.task_runs.len(), 2);
        assert!(update.run.pipeline_spec.is_some());

        let mut resumed = update.run;
        resumed.complete(CompletionRecord::new(vec![json!("42")], vec![None]));
        assert!(!persistence.store_run(&mut resumed).await.unwrap());

        let stored = persistence.find_run(run.id).await.unwrap().unwrap();
        assert!(stored.is_finished());
        assert_eq!(stored.task_runs.len(), 2);

        persistence.delete_run(run.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_run_detects_posted_result() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);

        let mut run = create_run_with_tasks(&persistence, &["ds1"]).await;
        let update = persistence
            .update_task_run_result(run.task_runs[0].id, &TaskResult::Succeeded(json!(1)), Utc::now())
            .await
            .unwrap();
        // Still running, so no resume signal from the callback side
        assert!(!update.resume);

        let restart = persistence.store_run(&mut run).await.unwrap();
        assert!(restart);
        assert_eq!(run.task_runs[0].result, TaskResult::Succeeded(json!(1)));
        assert_eq!(run.state, RunState::Running);

        persistence.delete_run(run.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_consumption() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);
        let chain_id = random_chain_id();
        let key = BroadcastKey::new(random_hash(), 2, 7);

        persistence.create_broadcast(chain_id, &key, 100).await.unwrap();
        assert!(!persistence.was_broadcast_consumed(chain_id, &key).await.unwrap());

        let err = persistence
            .create_broadcast(chain_id, &key, 100)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "BROADCAST_ALREADY_EXISTS");

        persistence.mark_broadcast_consumed(chain_id, &key, 100).await.unwrap();
        persistence.mark_broadcast_consumed(chain_id, &key, 100).await.unwrap();
        assert!(persistence.was_broadcast_consumed(chain_id, &key).await.unwrap());

        let broadcasts = persistence.find_broadcasts(chain_id, 0, 1000).await.unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert!(broadcasts[0].consumed);
    }

    #[tokio::test]
    async fn test_reinitialize_lowers_watermark() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);
        let chain_id = random_chain_id();

        persistence
            .create_broadcast(chain_id, &BroadcastKey::new(random_hash(), 0, 1), 50)
            .await
            .unwrap();
        persistence.set_pending_min_block(chain_id, Some(80)).await.unwrap();

        assert_eq!(persistence.reinitialize(chain_id).await.unwrap(), Some(50));
        assert_eq!(persistence.reinitialize(chain_id).await.unwrap(), Some(50));
        assert!(persistence.find_broadcasts(chain_id, 0, 100).await.unwrap().is_empty());
    }
}
