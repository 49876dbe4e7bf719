// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! SQLite has no row-level locks, so `store_run` and `update_task_run_result`
//! for the same run are serialized through [`RunLocks`], acquired before the
//! transaction begins and held until it commits. Write transactions open with
//! `BEGIN IMMEDIATE` so pools with several connections queue on the write
//! lock instead of failing with `SQLITE_BUSY`. All timestamps are bound from
//! `Utc::now()` so text comparisons stay consistent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, db, is_unique_violation};
use crate::models::{
    BroadcastKey, LogBroadcast, PipelineRun, PipelineSpec, RunState, TaskResult, TaskRun,
};
use crate::recovery::plan_watermark;

use super::run_locks::RunLocks;
use super::{
    BroadcastPersistence, LogBroadcastRow, PipelineRunRow, PipelineSpecRow, RunCursor,
    RunPersistence, TaskResultUpdate, TaskRunRow, association_ids, attach_associations,
    completion_columns, duration_millis, task_result_columns,
};

const RUN_COLUMNS: &str = r#"
    pipeline_runs.id, pipeline_runs.pipeline_spec_id, pipeline_runs.meta, pipeline_runs.inputs,
    pipeline_runs.outputs, pipeline_runs.fatal_errors, pipeline_runs.all_errors,
    pipeline_runs.state, pipeline_runs.created_at, pipeline_runs.finished_at
"#;

const TASK_RUN_COLUMNS: &str =
    "id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    locks: Arc<RunLocks>,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(RunLocks::default()),
        }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// with a single connection and runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/oracle.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// Create and initialize a new SQLite persistence from connect options.
    ///
    /// Options parsed from a `sqlite:` URL keep sqlx's URL semantics. Parent
    /// directories of the database file are created if missing.
    pub async fn connect(options: SqliteConnectOptions) -> Result<Self, CoreError> {
        let filename = options.get_filename().to_path_buf();

        if let Some(parent) = filename.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", filename, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self::new(pool))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction that takes the database write lock up front.
    async fn begin_write(
        &self,
        operation: &'static str,
    ) -> Result<Transaction<'static, Sqlite>, CoreError> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db(operation))
    }
}

// ============================================================================
// Task Run Helpers
// ============================================================================

async fn insert_task_runs(
    conn: &mut SqliteConnection,
    task_runs: &[TaskRun],
    operation: &'static str,
) -> Result<(), CoreError> {
    for task_run in task_runs {
        let (output, error) = task_result_columns(&task_run.result);
        sqlx::query(
            r#"
            INSERT INTO pipeline_task_runs
                (id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
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

async fn upsert_task_runs(
    conn: &mut SqliteConnection,
    task_runs: &[TaskRun],
) -> Result<Vec<TaskRun>, CoreError> {
    let sql = format!(
        r#"
        INSERT INTO pipeline_task_runs
            (id, pipeline_run_id, dot_id, task_type, task_index, output, error, created_at, finished_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (pipeline_run_id, dot_id) DO UPDATE
        SET output = excluded.output,
            error = excluded.error,
            finished_at = excluded.finished_at
        RETURNING {TASK_RUN_COLUMNS}
        "#
    );

    let mut stored = Vec::with_capacity(task_runs.len());
    for task_run in task_runs {
        let (output, error) = task_result_columns(&task_run.result);
        let row = sqlx::query_as::<_, TaskRunRow>(&sql)
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

async fn load_task_runs(
    conn: &mut SqliteConnection,
    run_ids: &[i64],
) -> Result<Vec<TaskRun>, CoreError> {
    if run_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {TASK_RUN_COLUMNS} FROM pipeline_task_runs WHERE pipeline_run_id IN ("
    ));
    let mut ids = builder.separated(", ");
    for run_id in run_ids {
        ids.push_bind(*run_id);
    }
    ids.push_unseparated(") ORDER BY created_at ASC, id ASC");

    let rows = builder
        .build_query_as::<TaskRunRow>()
        .fetch_all(&mut *conn)
        .await
        .map_err(db("load_task_runs"))?;

    Ok(rows.into_iter().map(TaskRun::from).collect())
}

/// Load specs and task runs for a page of runs in exactly two queries.
async fn load_associations(
    conn: &mut SqliteConnection,
    runs: &mut [PipelineRun],
) -> Result<(), CoreError> {
    if runs.is_empty() {
        return Ok(());
    }

    let (spec_ids, run_ids) = association_ids(runs);

    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT id, dot_dag_source, max_task_duration_ms, created_at FROM pipeline_specs WHERE id IN (",
    );
    let mut ids = builder.separated(", ");
    for spec_id in &spec_ids {
        ids.push_bind(*spec_id);
    }
    ids.push_unseparated(")");

    let specs = builder
        .build_query_as::<PipelineSpecRow>()
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
    conn: &mut SqliteConnection,
    chain_id: i64,
    block_number: Option<i64>,
) -> Result<(), CoreError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO log_broadcasts_pending (evm_chain_id, block_number, created_at, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (evm_chain_id) DO UPDATE
        SET block_number = excluded.block_number, updated_at = excluded.updated_at
        "#,
    )
    .bind(chain_id)
    .bind(block_number)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db("set_pending_min_block"))?;

    Ok(())
}

async fn select_pending_min_block(
    conn: &mut SqliteConnection,
    chain_id: i64,
) -> Result<Option<i64>, CoreError> {
    let block_number = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT block_number FROM log_broadcasts_pending WHERE evm_chain_id = ?",
    )
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
impl RunPersistence for SqlitePersistence {
    async fn create_spec(
        &self,
        dot_dag_source: &str,
        max_task_duration: Duration,
    ) -> Result<i32, CoreError> {
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO pipeline_specs (dot_dag_source, max_task_duration_ms, created_at)
            VALUES (?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(dot_dag_source)
        .bind(duration_millis(max_task_duration)?)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(db("create_spec"))?;

        Ok(id)
    }

    async fn create_run(&self, run: &mut PipelineRun) -> Result<(), CoreError> {
        let created_at = run.require_created_at()?;
        let (outputs, fatal_errors, all_errors, finished_at) = completion_columns(&run.state);

        let mut tx = self.begin_write("create_run").await?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_runs
                (pipeline_spec_id, meta, inputs, outputs, fatal_errors, all_errors, state, created_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        let finished = run.is_finished();

        // Held until the end of the call, after commit
        let _guard = if finished {
            None
        } else {
            Some(self.locks.lock(run.id).await)
        };

        let mut tx = self.begin_write("store_run").await?;

        if finished {
            let (outputs, fatal_errors, all_errors, finished_at) = completion_columns(&run.state);
            let result = sqlx::query(
                r#"
                UPDATE pipeline_runs
                SET state = 'completed', finished_at = ?, outputs = ?, fatal_errors = ?, all_errors = ?
                WHERE id = ?
                "#,
            )
            .bind(finished_at)
            .bind(outputs)
            .bind(fatal_errors)
            .bind(all_errors)
            .bind(run.id)
            .execute(&mut *tx)
            .await
            .map_err(db("store_run"))?;

            if result.rows_affected() == 0 {
                return Err(CoreError::RunNotFound { run_id: run.id });
            }
        } else {
            let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM pipeline_runs WHERE id = ?")
                .bind(run.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db("store_run"))?;

            if exists.is_none() {
                return Err(CoreError::RunNotFound { run_id: run.id });
            }

            let persisted = load_task_runs(&mut tx, &[run.id]).await?;
            if run.merge_posted_results(&persisted) {
                tx.commit().await.map_err(db("store_run"))?;
                debug!(run_id = run.id, "Results posted while running, restarting");
                return Ok(true);
            }

            sqlx::query("UPDATE pipeline_runs SET state = 'suspended' WHERE id = ?")
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
        // Resolve the owning run first so the lock is taken before any connection is held
        let run_id = sqlx::query_scalar::<_, i64>(
            "SELECT pipeline_run_id FROM pipeline_task_runs WHERE id = ?",
        )
        .bind(task_run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("update_task_run_result"))?
        .ok_or(CoreError::TaskRunNotFound { task_run_id })?;

        let _guard = self.locks.lock(run_id).await;
        let mut tx = self.begin_write("update_task_run_result").await?;

        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM pipeline_runs
            JOIN pipeline_task_runs ON pipeline_task_runs.pipeline_run_id = pipeline_runs.id
            WHERE pipeline_task_runs.id = ?
              AND pipeline_runs.state IN ('running', 'suspended')
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
            "UPDATE pipeline_task_runs SET output = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(output)
        .bind(error)
        .bind(finished_at)
        .bind(task_run_id)
        .execute(&mut *tx)
        .await
        .map_err(db("update_task_run_result"))?;

        let resume = matches!(run.state, RunState::Suspended);
        if resume {
            sqlx::query("UPDATE pipeline_runs SET state = 'running' WHERE id = ?")
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

        let mut tx = self.begin_write("insert_finished_run").await?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_runs
                (pipeline_spec_id, meta, inputs, outputs, fatal_errors, all_errors, state, created_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, 'completed', ?, ?)
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
        let result = sqlx::query("DELETE FROM pipeline_runs WHERE id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(db("delete_run"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM pipeline_runs WHERE finished_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db("delete_runs_older_than"))?;

        Ok(result.rows_affected())
    }

    async fn find_run(&self, run_id: i64) -> Result<Option<PipelineRun>, CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db("find_run"))?;

        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?");
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

        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY created_at ASC, id ASC");
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

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE state = 'running' AND created_at < "
        ));
        builder.push_bind(created_before);
        if let Some(cursor) = cursor {
            builder
                .push(" AND (created_at, id) > (")
                .push_bind(cursor.created_at)
                .push(", ")
                .push_bind(cursor.id)
                .push(")");
        }
        builder
            .push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(limit);

        let rows = builder
            .build_query_as::<PipelineRunRow>()
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
impl BroadcastPersistence for SqlitePersistence {
    async fn was_broadcast_consumed(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
    ) -> Result<bool, CoreError> {
        let consumed = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT consumed FROM log_broadcasts
            WHERE block_hash = ? AND log_index = ? AND job_id = ? AND evm_chain_id = ?
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
            WHERE block_number >= ? AND block_number <= ? AND evm_chain_id = ?
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
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO log_broadcasts
                (block_hash, block_number, log_index, job_id, created_at, updated_at, consumed, evm_chain_id)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(key.block_hash.as_bytes())
        .bind(block_number)
        .bind(key.log_index)
        .bind(key.job_id)
        .bind(now)
        .bind(now)
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
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO log_broadcasts
                (block_hash, block_number, log_index, job_id, created_at, updated_at, consumed, evm_chain_id)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT (job_id, block_hash, log_index, evm_chain_id) DO UPDATE
            SET consumed = 1, updated_at = excluded.updated_at
            "#,
        )
        .bind(key.block_hash.as_bytes())
        .bind(block_number)
        .bind(key.log_index)
        .bind(key.job_id)
        .bind(now)
        .bind(now)
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
        select_pending_min_block(&mut conn, chain_id).await
    }

    async fn reinitialize(&self, chain_id: i64) -> Result<Option<i64>, CoreError> {
        let mut tx = self.begin_write("reinitialize").await?;

        let min_unconsumed = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(block_number) FROM log_broadcasts WHERE evm_chain_id = ? AND consumed = 0",
        )
        .bind(chain_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db("reinitialize"))?;

        let min_pending = select_pending_min_block(&mut tx, chain_id).await?;

        let plan = plan_watermark(min_unconsumed, min_pending);
        if let Some(lowered) = plan.lower_to {
            upsert_pending_min_block(&mut tx, chain_id, Some(lowered)).await?;
        }
        if plan.purge_unconsumed {
            sqlx::query("DELETE FROM log_broadcasts WHERE evm_chain_id = ? AND consumed = 0")
                .bind(chain_id)
                .execute(&mut *tx)
                .await
                .map_err(db("reinitialize"))?;
        }

        tx.commit().await.map_err(db("reinitialize"))?;
        Ok(plan.watermark)
    }
}
