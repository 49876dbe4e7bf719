// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types for pipeline runs and log broadcasts.
//!
//! Run and task state are explicit tagged values rather than combinations of
//! nullable columns: a [`TaskRun`] is `Pending`, `Succeeded` or `Failed`, and a
//! [`PipelineRun`] is `Running`, `Suspended` or `Completed` with a
//! [`CompletionRecord`]. The persistence layer maps these to and from rows.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};

// ============================================================================
// Pipeline Specs
// ============================================================================

/// Immutable description of a computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Surrogate id assigned by the store.
    pub id: i32,
    /// Graph description source.
    pub dot_dag_source: String,
    /// Upper bound on a single task's execution time.
    pub max_task_duration: Duration,
    /// When the spec was created.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Task Runs
// ============================================================================

/// Result of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    /// No result has been posted yet.
    #[default]
    Pending,
    /// The task produced an output value.
    Succeeded(Value),
    /// The task failed with an error message.
    Failed(String),
}

impl TaskResult {
    /// True if no result has been posted.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Output value, if the task succeeded.
    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// Error message, if the task failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// One node of a run's computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Task run id; used by asynchronous result callbacks.
    pub id: Uuid,
    /// Owning run. Zero until the run has been persisted.
    pub pipeline_run_id: i64,
    /// Graph node identifier, unique within a run.
    pub dot_id: String,
    /// Task type name.
    pub task_type: String,
    /// Execution index within the graph.
    pub index: i32,
    /// Current result.
    pub result: TaskResult,
    /// When the task run was created.
    pub created_at: DateTime<Utc>,
    /// When a result was recorded.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    /// Create a pending task run with a fresh id.
    pub fn new(dot_id: impl Into<String>, task_type: impl Into<String>, index: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_run_id: 0,
            dot_id: dot_id.into(),
            task_type: task_type.into(),
            index,
            result: TaskResult::Pending,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A task is pending until it has a result and a finish time.
    pub fn is_pending(&self) -> bool {
        self.result.is_pending() && self.finished_at.is_none()
    }

    /// Record a result on this task.
    pub fn complete(&mut self, result: TaskResult, finished_at: DateTime<Utc>) {
        self.result = result;
        self.finished_at = Some(finished_at);
    }
}

// ============================================================================
// Pipeline Runs
// ============================================================================

/// Final outputs and errors of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// One value per graph output.
    pub outputs: Vec<Value>,
    /// Fatal error slot per output; all `None` means success.
    pub fatal_errors: Vec<Option<String>>,
    /// Every task error encountered, fatal or not.
    pub all_errors: Vec<Option<String>>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Create a completion record finished now.
    pub fn new(outputs: Vec<Value>, fatal_errors: Vec<Option<String>>) -> Self {
        Self {
            outputs,
            all_errors: fatal_errors.clone(),
            fatal_errors,
            finished_at: Utc::now(),
        }
    }

    /// True if any fatal or non-fatal error was recorded.
    pub fn has_errors(&self) -> bool {
        self.fatal_errors.iter().any(Option::is_some) || self.all_errors.iter().any(Option::is_some)
    }

    /// Check that outputs and errors are both present and parallel.
    pub fn validate(&self) -> Result<()> {
        if self.fatal_errors.is_empty() {
            return Err(CoreError::validation(
                "fatal_errors",
                format!(
                    "run must have both outputs and errors, got {} outputs and no errors",
                    self.outputs.len()
                ),
            ));
        }
        if self.outputs.len() != self.fatal_errors.len() {
            return Err(CoreError::validation(
                "fatal_errors",
                format!(
                    "expected one error slot per output, got {} outputs and {} errors",
                    self.outputs.len(),
                    self.fatal_errors.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Actively executing.
    #[default]
    Running,
    /// Waiting on an asynchronous task result.
    Suspended,
    /// Finished; terminal.
    Completed(CompletionRecord),
}

impl RunState {
    /// Database representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed(_) => "completed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Surrogate id; zero until the run is persisted.
    pub id: i64,
    /// Spec this run executes.
    pub pipeline_spec_id: i32,
    /// Spec, populated on reads.
    pub pipeline_spec: Option<PipelineSpec>,
    /// Free-form metadata.
    pub meta: Value,
    /// Input values.
    pub inputs: Value,
    /// Creation time. Must be set before the run is persisted.
    pub created_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: RunState,
    /// Owned task runs.
    pub task_runs: Vec<TaskRun>,
}

impl PipelineRun {
    /// Create a running run for a spec, created now.
    pub fn new(pipeline_spec_id: i32, inputs: Value, meta: Value) -> Self {
        Self {
            id: 0,
            pipeline_spec_id,
            pipeline_spec: None,
            meta,
            inputs,
            created_at: Some(Utc::now()),
            state: RunState::Running,
            task_runs: Vec::new(),
        }
    }

    /// True once the run has a completion record.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RunState::Completed(_))
    }

    /// The completion record, if finished.
    pub fn completion(&self) -> Option<&CompletionRecord> {
        match &self.state {
            RunState::Completed(record) => Some(record),
            _ => None,
        }
    }

    /// Finish time, if finished.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completion().map(|record| record.finished_at)
    }

    /// Mark the run completed.
    pub fn complete(&mut self, record: CompletionRecord) {
        self.state = RunState::Completed(record);
    }

    /// True if the run recorded errors or any of its tasks failed.
    pub fn has_errors(&self) -> bool {
        self.completion().is_some_and(CompletionRecord::has_errors)
            || self
                .task_runs
                .iter()
                .any(|task_run| matches!(task_run.result, TaskResult::Failed(_)))
    }

    /// Look up a task run by graph node id.
    pub fn by_dot_id(&self, dot_id: &str) -> Option<&TaskRun> {
        self.task_runs.iter().find(|task_run| task_run.dot_id == dot_id)
    }

    /// Creation time, or a validation error if it was never set.
    pub fn require_created_at(&self) -> Result<DateTime<Utc>> {
        self.created_at
            .ok_or_else(|| CoreError::validation("created_at", "run.created_at must be set"))
    }

    /// Point every task run at this run's id.
    pub(crate) fn assign_run_id(&mut self, id: i64) {
        self.id = id;
        for task_run in &mut self.task_runs {
            task_run.pipeline_run_id = id;
        }
    }

    /// Swap in results that were posted to storage while this copy was executing.
    ///
    /// For every task this copy still considers pending, if the persisted copy
    /// has a result, the persisted copy replaces it. Returns true if anything
    /// was swapped, in which case the run should continue instead of suspending.
    pub fn merge_posted_results(&mut self, persisted: &[TaskRun]) -> bool {
        let mut merged = false;
        for task_run in self.task_runs.iter_mut().filter(|t| t.is_pending()) {
            if let Some(stored) = persisted
                .iter()
                .find(|stored| stored.dot_id == task_run.dot_id && !stored.is_pending())
            {
                *task_run = stored.clone();
                merged = true;
            }
        }
        merged
    }
}

// ============================================================================
// Log Broadcasts
// ============================================================================

/// 32-byte block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for BlockHash {
    type Error = CoreError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            CoreError::validation(
                "block_hash",
                format!("expected 32 bytes, got {}", bytes.len()),
            )
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Identity of a log delivered to a subscriber, within one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastKey {
    /// Hash of the block containing the log.
    pub block_hash: BlockHash,
    /// Index of the log within the block.
    pub log_index: i64,
    /// Subscribing job.
    pub job_id: i32,
}

impl BroadcastKey {
    /// Build a key from its parts.
    pub fn new(block_hash: impl Into<BlockHash>, log_index: i64, job_id: i32) -> Self {
        Self {
            block_hash: block_hash.into(),
            log_index,
            job_id,
        }
    }
}

/// A recorded log broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBroadcast {
    /// Broadcast identity.
    pub key: BroadcastKey,
    /// Block the log was included in.
    pub block_number: i64,
    /// Whether the subscriber has consumed the log.
    pub consumed: bool,
}
