// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for oracle-core.
//!
//! This module defines the two persistence seams ([`RunPersistence`] and
//! [`BroadcastPersistence`]), the row types both backends decode into, and the
//! row/domain conversions they share.

pub mod postgres;
pub mod run_locks;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{
    BlockHash, BroadcastKey, CompletionRecord, LogBroadcast, PipelineRun, PipelineSpec, RunState,
    TaskResult, TaskRun,
};

// ============================================================================
// Row Types
// ============================================================================

/// Pipeline spec row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineSpecRow {
    /// Database primary key.
    pub id: i32,
    /// Graph description source.
    pub dot_dag_source: String,
    /// Maximum task duration in milliseconds.
    pub max_task_duration_ms: i64,
    /// When the spec was created.
    pub created_at: DateTime<Utc>,
}

/// Pipeline run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunRow {
    /// Database primary key.
    pub id: i64,
    /// Spec this run executes.
    pub pipeline_spec_id: i32,
    /// Free-form metadata.
    pub meta: Option<Json<Value>>,
    /// Input values.
    pub inputs: Option<Json<Value>>,
    /// Output values (completed runs only).
    pub outputs: Option<Json<Vec<Value>>>,
    /// Fatal error per output (completed runs only).
    pub fatal_errors: Option<Json<Vec<Option<String>>>>,
    /// All task errors (completed runs only).
    pub all_errors: Option<Json<Vec<Option<String>>>>,
    /// running, suspended or completed.
    pub state: String,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Task run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRunRow {
    /// Database primary key.
    pub id: Uuid,
    /// Owning run.
    pub pipeline_run_id: i64,
    /// Graph node id, unique per run.
    pub dot_id: String,
    /// Task type name.
    pub task_type: String,
    /// Execution index.
    pub task_index: i32,
    /// Output value, if the task succeeded.
    pub output: Option<Json<Value>>,
    /// Error message, if the task failed.
    pub error: Option<String>,
    /// When the task run was created.
    pub created_at: DateTime<Utc>,
    /// When a result was recorded.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Log broadcast row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogBroadcastRow {
    /// Raw block hash.
    pub block_hash: Vec<u8>,
    /// Block the log was included in.
    pub block_number: i64,
    /// Index of the log within the block.
    pub log_index: i64,
    /// Subscribing job.
    pub job_id: i32,
    /// Whether the job consumed the log.
    pub consumed: bool,
}

// ============================================================================
// Row Conversions
// ============================================================================

impl From<PipelineSpecRow> for PipelineSpec {
    fn from(row: PipelineSpecRow) -> Self {
        Self {
            id: row.id,
            dot_dag_source: row.dot_dag_source,
            max_task_duration: Duration::from_millis(row.max_task_duration_ms.max(0) as u64),
            created_at: row.created_at,
        }
    }
}

impl TryFrom<PipelineRunRow> for PipelineRun {
    type Error = CoreError;

    fn try_from(row: PipelineRunRow) -> Result<Self, CoreError> {
        let state = match row.state.as_str() {
            "running" => RunState::Running,
            "suspended" => RunState::Suspended,
            "completed" => {
                let (Some(outputs), Some(fatal_errors), Some(finished_at)) =
                    (row.outputs, row.fatal_errors, row.finished_at)
                else {
                    return Err(CoreError::database(
                        "decode_run",
                        format!("completed run {} is missing outputs, errors or finish time", row.id),
                    ));
                };
                RunState::Completed(CompletionRecord {
                    outputs: outputs.0,
                    fatal_errors: fatal_errors.0,
                    all_errors: row.all_errors.map(|e| e.0).unwrap_or_default(),
                    finished_at,
                })
            }
            other => {
                return Err(CoreError::database(
                    "decode_run",
                    format!("unknown run state '{}' for run {}", other, row.id),
                ));
            }
        };

        Ok(Self {
            id: row.id,
            pipeline_spec_id: row.pipeline_spec_id,
            pipeline_spec: None,
            meta: row.meta.map(|m| m.0).unwrap_or(Value::Null),
            inputs: row.inputs.map(|i| i.0).unwrap_or(Value::Null),
            created_at: Some(row.created_at),
            state,
            task_runs: Vec::new(),
        })
    }
}

impl From<TaskRunRow> for TaskRun {
    fn from(row: TaskRunRow) -> Self {
        let result = match (row.error, row.output) {
            (Some(error), _) => TaskResult::Failed(error),
            (None, Some(output)) => TaskResult::Succeeded(output.0),
            (None, None) if row.finished_at.is_some() => TaskResult::Succeeded(Value::Null),
            (None, None) => TaskResult::Pending,
        };

        Self {
            id: row.id,
            pipeline_run_id: row.pipeline_run_id,
            dot_id: row.dot_id,
            task_type: row.task_type,
            index: row.task_index,
            result,
            created_at: row.created_at,
            finished_at: row.finished_at,
        }
    }
}

impl TryFrom<LogBroadcastRow> for LogBroadcast {
    type Error = CoreError;

    fn try_from(row: LogBroadcastRow) -> Result<Self, CoreError> {
        Ok(Self {
            key: BroadcastKey {
                block_hash: BlockHash::try_from(row.block_hash.as_slice())?,
                log_index: row.log_index,
                job_id: row.job_id,
            },
            block_number: row.block_number,
            consumed: row.consumed,
        })
    }
}

/// Spec column value for a maximum task duration, in milliseconds.
pub(crate) fn duration_millis(duration: Duration) -> Result<i64, CoreError> {
    i64::try_from(duration.as_millis()).map_err(|_| {
        CoreError::validation(
            "max_task_duration",
            format!("{:?} does not fit in a millisecond count", duration),
        )
    })
}

/// Column values for a task result: (output, error).
pub(crate) fn task_result_columns(result: &TaskResult) -> (Option<Json<Value>>, Option<String>) {
    match result {
        TaskResult::Pending => (None, None),
        TaskResult::Succeeded(output) => (Some(Json(output.clone())), None),
        TaskResult::Failed(error) => (None, Some(error.clone())),
    }
}

/// Column values for a completion record: (outputs, fatal_errors, all_errors, finished_at).
pub(crate) type CompletionColumns = (
    Option<Json<Vec<Value>>>,
    Option<Json<Vec<Option<String>>>>,
    Option<Json<Vec<Option<String>>>>,
    Option<DateTime<Utc>>,
);

pub(crate) fn completion_columns(state: &RunState) -> CompletionColumns {
    match state {
        RunState::Completed(record) => (
            Some(Json(record.outputs.clone())),
            Some(Json(record.fatal_errors.clone())),
            Some(Json(record.all_errors.clone())),
            Some(record.finished_at),
        ),
        _ => (None, None, None, None),
    }
}

/// Attach loaded specs and task runs to their runs.
///
/// Task runs keep the order they were loaded in.
pub(crate) fn attach_associations(
    runs: &mut [PipelineRun],
    specs: Vec<PipelineSpec>,
    task_runs: Vec<TaskRun>,
) {
    let specs: HashMap<i32, PipelineSpec> = specs.into_iter().map(|s| (s.id, s)).collect();
    let mut by_run: HashMap<i64, Vec<TaskRun>> = HashMap::with_capacity(runs.len());
    for task_run in task_runs {
        by_run.entry(task_run.pipeline_run_id).or_default().push(task_run);
    }

    for run in runs.iter_mut() {
        run.pipeline_spec = specs.get(&run.pipeline_spec_id).cloned();
        run.task_runs = by_run.remove(&run.id).unwrap_or_default();
    }
}

/// Distinct spec ids and run ids of a page of runs.
pub(crate) fn association_ids(runs: &[PipelineRun]) -> (Vec<i32>, Vec<i64>) {
    let mut spec_ids: Vec<i32> = runs.iter().map(|r| r.pipeline_spec_id).collect();
    spec_ids.sort_unstable();
    spec_ids.dedup();
    let run_ids = runs.iter().map(|r| r.id).collect();
    (spec_ids, run_ids)
}

// ============================================================================
// Persistence Traits
// ============================================================================

/// Result of posting an asynchronous task result.
#[derive(Debug, Clone)]
pub struct TaskResultUpdate {
    /// The run owning the task, with its task list reloaded when resuming.
    pub run: PipelineRun,
    /// True if the run was suspended and has been flipped back to running.
    pub resume: bool,
}

/// Keyset position for paging through runs ordered by `(created_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCursor {
    /// Creation time of the last run seen.
    pub created_at: DateTime<Utc>,
    /// Id of the last run seen.
    pub id: i64,
}

/// Storage for pipeline specs, runs and task runs.
///
/// Implementations assume input has already been validated by
/// [`RunStore`](crate::run_store::RunStore).
#[async_trait]
pub trait RunPersistence: Send + Sync {
    /// Insert an immutable spec and return its id.
    async fn create_spec(
        &self,
        dot_dag_source: &str,
        max_task_duration: Duration,
    ) -> Result<i32, CoreError>;

    /// Insert a run and the task runs it carries in one transaction.
    ///
    /// Sets `run.id` and every task's `pipeline_run_id`.
    async fn create_run(&self, run: &mut PipelineRun) -> Result<(), CoreError>;

    /// Suspend or finish a run. Returns true if results were posted
    /// concurrently and the run should continue instead of suspending.
    async fn store_run(&self, run: &mut PipelineRun) -> Result<bool, CoreError>;

    /// Record a task result posted by an asynchronous callback.
    async fn update_task_run_result(
        &self,
        task_run_id: Uuid,
        result: &TaskResult,
        finished_at: DateTime<Utc>,
    ) -> Result<TaskResultUpdate, CoreError>;

    /// Insert a run that finished without ever suspending.
    async fn insert_finished_run(
        &self,
        run: &mut PipelineRun,
        save_task_runs: bool,
    ) -> Result<(), CoreError>;

    /// Delete a run and its task runs. Returns false if no such run existed.
    async fn delete_run(&self, run_id: i64) -> Result<bool, CoreError>;

    /// Delete runs that finished before `cutoff`. Returns the number removed.
    async fn delete_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;

    /// Load a run with its spec and task runs.
    async fn find_run(&self, run_id: i64) -> Result<Option<PipelineRun>, CoreError>;

    /// Load every run, oldest first.
    async fn list_runs(&self) -> Result<Vec<PipelineRun>, CoreError>;

    /// Load a page of running runs created before `created_before`, after `cursor`.
    async fn list_unfinished_runs(
        &self,
        created_before: DateTime<Utc>,
        cursor: Option<RunCursor>,
        limit: i64,
    ) -> Result<Vec<PipelineRun>, CoreError>;
}

/// Storage for log broadcasts and the per-chain pending block watermark.
#[async_trait]
pub trait BroadcastPersistence: Send + Sync {
    /// True only if the broadcast exists and was consumed.
    async fn was_broadcast_consumed(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
    ) -> Result<bool, CoreError>;

    /// Broadcasts within an inclusive block range.
    async fn find_broadcasts(
        &self,
        chain_id: i64,
        from_block: i64,
        to_block: i64,
    ) -> Result<Vec<LogBroadcast>, CoreError>;

    /// Insert an unconsumed broadcast. Fails if the identity already exists.
    async fn create_broadcast(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
        block_number: i64,
    ) -> Result<(), CoreError>;

    /// Insert or update the broadcast as consumed.
    async fn mark_broadcast_consumed(
        &self,
        chain_id: i64,
        key: &BroadcastKey,
        block_number: i64,
    ) -> Result<(), CoreError>;

    /// Set (or clear) the pending minimum block for a chain.
    async fn set_pending_min_block(
        &self,
        chain_id: i64,
        block_number: Option<i64>,
    ) -> Result<(), CoreError>;

    /// Read the pending minimum block for a chain.
    async fn get_pending_min_block(&self, chain_id: i64) -> Result<Option<i64>, CoreError>;

    /// Reconcile the watermark with unconsumed broadcasts and drop them.
    ///
    /// Returns the resulting watermark.
    async fn reinitialize(&self, chain_id: i64) -> Result<Option<i64>, CoreError>;
}
