// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run Store
//!
//! Durable storage for pipeline specs, runs and task runs, with the
//! suspend/resume handshake between an executor and asynchronous result
//! callbacks.
//!
//! ## Suspend / resume
//!
//! An executor that reaches a task it cannot finish synchronously calls
//! [`RunStore::store_run`] with the run still `Running`. A callback delivering
//! that task's result calls [`RunStore::update_task_run_result`]. Both take an
//! exclusive per-run lock, so exactly one of them observes the result:
//!
//! - If the callback wins, `store_run` finds the posted result, swaps it into
//!   the in-memory run and returns `restart = true` without writing.
//! - If the executor wins, the run becomes `Suspended` and the callback
//!   returns `resume = true` with the reloaded task list.
//!
//! Validation happens here; the persistence backends assume valid input.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{PipelineRun, TaskResult};
use crate::persistence::{RunCursor, RunPersistence, TaskResultUpdate};

/// Default number of runs fetched per page by [`RunStore::get_unfinished_runs`].
pub const DEFAULT_PAGE_SIZE: i64 = 1000;

/// Run store backed by a [`RunPersistence`] implementation.
#[derive(Clone)]
pub struct RunStore {
    persistence: Arc<dyn RunPersistence>,
    page_size: i64,
}

impl RunStore {
    /// Create a run store with the default page size.
    pub fn new(persistence: Arc<dyn RunPersistence>) -> Self {
        Self {
            persistence,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the page size used when scanning unfinished runs.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Page size used when scanning unfinished runs.
    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    /// Persist an immutable pipeline spec and return its id.
    #[instrument(skip(self, dot_dag_source))]
    pub async fn create_spec(
        &self,
        dot_dag_source: &str,
        max_task_duration: Duration,
    ) -> Result<i32> {
        let id = self
            .persistence
            .create_spec(dot_dag_source, max_task_duration)
            .await?;
        debug!(spec_id = id, "Pipeline spec created");
        Ok(id)
    }

    /// Atomically persist a new run and the task runs it carries.
    ///
    /// Assigns `run.id` and points every task run at it.
    #[instrument(skip(self, run), fields(spec_id = run.pipeline_spec_id))]
    pub async fn create_run(&self, run: &mut PipelineRun) -> Result<()> {
        run.require_created_at()?;
        if let Some(record) = run.completion() {
            record.validate()?;
        }

        self.persistence.create_run(run).await?;
        debug!(run_id = run.id, task_runs = run.task_runs.len(), "Pipeline run created");
        Ok(())
    }

    /// Finish or suspend a run.
    ///
    /// Returns `true` if results were posted while the run was executing; the
    /// in-memory run then carries those results and should continue instead
    /// of suspending. Nothing is written in that case.
    #[instrument(skip(self, run), fields(run_id = run.id, state = %run.state))]
    pub async fn store_run(&self, run: &mut PipelineRun) -> Result<bool> {
        if let Some(record) = run.completion() {
            record.validate()?;
        }

        let restart = self.persistence.store_run(run).await?;
        if restart {
            info!("Task results arrived while running, restarting run");
        } else if run.is_finished() {
            info!(has_errors = run.has_errors(), "Pipeline run finished");
        } else {
            debug!("Pipeline run suspended");
        }
        Ok(restart)
    }

    /// Record a result posted asynchronously for a task run.
    ///
    /// Fails with `TaskRunNotFound` if the task doesn't exist or its run has
    /// already completed. `resume` is true if the run was suspended and has
    /// been flipped back to running; the caller should re-enter execution with
    /// the returned run.
    #[instrument(skip(self, result))]
    pub async fn update_task_run_result(
        &self,
        task_run_id: Uuid,
        result: TaskResult,
    ) -> Result<TaskResultUpdate> {
        if result.is_pending() {
            return Err(CoreError::validation(
                "result",
                "a posted task result must carry an output or an error",
            ));
        }

        let update = self
            .persistence
            .update_task_run_result(task_run_id, &result, Utc::now())
            .await?;

        if update.resume {
            info!(run_id = update.run.id, "Resuming suspended pipeline run");
        } else {
            debug!(run_id = update.run.id, "Task result recorded on running pipeline run");
        }
        Ok(update)
    }

    /// Persist a run that completed without ever suspending.
    ///
    /// Task runs are only written when `save_successful_task_runs` is set or
    /// the run recorded errors.
    #[instrument(skip(self, run), fields(spec_id = run.pipeline_spec_id))]
    pub async fn insert_finished_run(
        &self,
        run: &mut PipelineRun,
        save_successful_task_runs: bool,
    ) -> Result<()> {
        run.require_created_at()?;
        let Some(record) = run.completion() else {
            return Err(CoreError::validation(
                "state",
                format!("run must be completed, got {}", run.state),
            ));
        };
        record.validate()?;

        let save_task_runs = save_successful_task_runs || run.has_errors();
        if save_task_runs && run.task_runs.is_empty() {
            return Err(CoreError::validation(
                "task_runs",
                "must provide task run results",
            ));
        }

        self.persistence
            .insert_finished_run(run, save_task_runs)
            .await?;
        debug!(run_id = run.id, save_task_runs, "Finished pipeline run inserted");
        Ok(())
    }

    /// Delete a run and its task runs. Unknown ids are a no-op.
    #[instrument(skip(self))]
    pub async fn delete_run(&self, run_id: i64) -> Result<()> {
        if !self.persistence.delete_run(run_id).await? {
            debug!("Pipeline run already absent");
        }
        Ok(())
    }

    /// Delete runs that finished more than `max_age` ago.
    ///
    /// Returns the number of runs removed. Unfinished runs are never removed.
    #[instrument(skip(self))]
    pub async fn delete_runs_older_than(&self, max_age: Duration) -> Result<u64> {
        // Ages reaching past the earliest representable time cover no run
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
        else {
            debug!(?max_age, "Retention age exceeds the time range, nothing to delete");
            return Ok(0);
        };

        let deleted = self.persistence.delete_runs_finished_before(cutoff).await?;
        debug!(deleted, cutoff = %cutoff, "Old pipeline runs deleted");
        Ok(deleted)
    }

    /// Load a run with its spec and task runs.
    #[instrument(skip(self))]
    pub async fn find_run(&self, run_id: i64) -> Result<PipelineRun> {
        self.persistence
            .find_run(run_id)
            .await?
            .ok_or(CoreError::RunNotFound { run_id })
    }

    /// Load every run, ordered by creation time then id.
    pub async fn get_all_runs(&self) -> Result<Vec<PipelineRun>> {
        self.persistence.list_runs().await
    }

    /// Cursor over running runs created before `created_before`.
    pub fn unfinished_runs(&self, created_before: DateTime<Utc>) -> UnfinishedRuns {
        UnfinishedRuns {
            persistence: self.persistence.clone(),
            created_before,
            cursor: None,
            page_size: self.page_size,
            exhausted: false,
        }
    }

    /// Invoke `on_run` for every running run created before `created_before`.
    ///
    /// Runs are delivered in `(created_at, id)` order, one page at a time. The
    /// first error returned by `on_run` stops the scan and is returned.
    #[instrument(skip(self, on_run))]
    pub async fn get_unfinished_runs<F, E>(
        &self,
        created_before: DateTime<Utc>,
        mut on_run: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(PipelineRun) -> std::result::Result<(), E>,
        E: From<CoreError>,
    {
        let mut runs = self.unfinished_runs(created_before);
        loop {
            let batch = runs.next_batch().await?;
            if batch.is_empty() {
                return Ok(());
            }
            for run in batch {
                on_run(run)?;
            }
        }
    }
}

/// Keyset-paged cursor over unfinished runs.
///
/// Each call to [`next_batch`](Self::next_batch) resumes after the last run
/// returned, so runs inserted or finished between batches neither shift nor
/// duplicate the remaining pages.
pub struct UnfinishedRuns {
    persistence: Arc<dyn RunPersistence>,
    created_before: DateTime<Utc>,
    cursor: Option<RunCursor>,
    page_size: i64,
    exhausted: bool,
}

impl UnfinishedRuns {
    /// Fetch the next page. An empty page means the scan is complete.
    pub async fn next_batch(&mut self) -> Result<Vec<PipelineRun>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let batch = self
            .persistence
            .list_unfinished_runs(self.created_before, self.cursor, self.page_size)
            .await?;

        match batch.last() {
            Some(last) if (batch.len() as i64) == self.page_size => {
                self.cursor = last.created_at.map(|created_at| RunCursor {
                    created_at,
                    id: last.id,
                });
                self.exhausted = self.cursor.is_none();
            }
            _ => self.exhausted = true,
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompletionRecord, RunState, TaskRun};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-memory persistence that records which writes reached it.
    #[derive(Default)]
    struct MockPersistence {
        runs: Mutex<Vec<PipelineRun>>,
        inserted_with_tasks: Mutex<Vec<bool>>,
        page_requests: Mutex<Vec<Option<RunCursor>>>,
        delete_cutoffs: Mutex<Vec<DateTime<Utc>>>,
    }

    impl MockPersistence {
        fn with_unfinished(count: i64) -> Self {
            let base = Utc::now() - chrono::Duration::hours(1);
            let runs = (1..=count)
                .map(|id| {
                    let mut run = PipelineRun::new(1, json!({}), json!({}));
                    run.id = id;
                    run.created_at = Some(base + chrono::Duration::seconds(id));
                    run
                })
                .collect();
            Self {
                runs: Mutex::new(runs),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RunPersistence for MockPersistence {
        async fn create_spec(&self, _: &str, _: Duration) -> Result<i32> {
            Ok(1)
        }

        async fn create_run(&self, run: &mut PipelineRun) -> Result<()> {
            let mut runs = self.runs.lock().unwrap();
            run.assign_run_id(runs.len() as i64 + 1);
            runs.push(run.clone());
            Ok(())
        }

        async fn store_run(&self, _run: &mut PipelineRun) -> Result<bool> {
            Ok(false)
        }

        async fn update_task_run_result(
            &self,
            task_run_id: Uuid,
            _result: &TaskResult,
            _finished_at: DateTime<Utc>,
        ) -> Result<TaskResultUpdate> {
            Err(CoreError::TaskRunNotFound { task_run_id })
        }

        async fn insert_finished_run(
            &self,
            run: &mut PipelineRun,
            save_task_runs: bool,
        ) -> Result<()> {
            self.inserted_with_tasks.lock().unwrap().push(save_task_runs);
            run.assign_run_id(99);
            Ok(())
        }

        async fn delete_run(&self, _run_id: i64) -> Result<bool> {
            Ok(false)
        }

        async fn delete_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.delete_cutoffs.lock().unwrap().push(cutoff);
            Ok(3)
        }

        async fn find_run(&self, run_id: i64) -> Result<Option<PipelineRun>> {
            Ok(self
                .runs
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == run_id)
                .cloned())
        }

        async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
            Ok(self.runs.lock().unwrap().clone())
        }

        async fn list_unfinished_runs(
            &self,
            created_before: DateTime<Utc>,
            cursor: Option<RunCursor>,
            limit: i64,
        ) -> Result<Vec<PipelineRun>> {
            self.page_requests.lock().unwrap().push(cursor);
            Ok(self
                .runs
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.created_at.is_some_and(|c| c < created_before))
                .filter(|r| cursor.is_none_or(|c| r.id > c.id))
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    fn finished_run(task_runs: Vec<TaskRun>, fatal_errors: Vec<Option<String>>) -> PipelineRun {
        let mut run = PipelineRun::new(1, json!({}), json!({}));
        run.task_runs = task_runs;
        let outputs = vec![json!(null); fatal_errors.len()];
        run.complete(CompletionRecord::new(outputs, fatal_errors));
        run
    }

    #[tokio::test]
    async fn test_create_run_requires_created_at() {
        let mock = Arc::new(MockPersistence::default());
        let store = RunStore::new(mock.clone());

        let mut run = PipelineRun::new(1, json!({}), json!({}));
        run.created_at = None;

        let err = store.create_run(&mut run).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(mock.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_run_validates_completion_record() {
        let store = RunStore::new(Arc::new(MockPersistence::default()));

        let mut run = PipelineRun::new(1, json!({}), json!({}));
        run.complete(CompletionRecord::new(vec![json!(1)], vec![]));
        assert!(matches!(
            store.store_run(&mut run).await,
            Err(CoreError::ValidationError { .. })
        ));

        run.complete(CompletionRecord::new(vec![json!(1), json!(2)], vec![None]));
        assert!(store.store_run(&mut run).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_result_is_rejected() {
        let store = RunStore::new(Arc::new(MockPersistence::default()));
        let err = store
            .update_task_run_result(Uuid::new_v4(), TaskResult::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError { ref field, .. } if field == "result"));
    }

    #[tokio::test]
    async fn test_insert_finished_run_validations() {
        let mock = Arc::new(MockPersistence::default());
        let store = RunStore::new(mock.clone());

        // Not completed
        let mut running = PipelineRun::new(1, json!({}), json!({}));
        assert!(store.insert_finished_run(&mut running, false).await.is_err());

        // Missing creation time
        let mut run = finished_run(vec![], vec![None]);
        run.created_at = None;
        assert!(store.insert_finished_run(&mut run, false).await.is_err());

        // Tasks would be saved but none were provided
        let mut run = finished_run(vec![], vec![None]);
        let err = store.insert_finished_run(&mut run, true).await.unwrap_err();
        assert!(err.to_string().contains("must provide task run results"));

        let mut failed = finished_run(vec![], vec![Some("boom".to_string())]);
        assert!(store.insert_finished_run(&mut failed, false).await.is_err());

        assert!(mock.inserted_with_tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_finished_run_saves_tasks_only_when_needed() {
        let mock = Arc::new(MockPersistence::default());
        let store = RunStore::new(mock.clone());

        let mut clean = finished_run(vec![TaskRun::new("a", "http", 0)], vec![None]);
        store.insert_finished_run(&mut clean, false).await.unwrap();
        assert_eq!(clean.id, 99);

        let mut errored = finished_run(
            vec![TaskRun::new("a", "http", 0)],
            vec![Some("timeout".to_string())],
        );
        store.insert_finished_run(&mut errored, false).await.unwrap();

        let mut saved = finished_run(vec![TaskRun::new("a", "http", 0)], vec![None]);
        store.insert_finished_run(&mut saved, true).await.unwrap();

        // A run with no tasks and nothing to save is fine
        let mut empty = finished_run(vec![], vec![None]);
        store.insert_finished_run(&mut empty, false).await.unwrap();

        assert_eq!(
            *mock.inserted_with_tasks.lock().unwrap(),
            vec![false, true, true, false]
        );
    }

    #[tokio::test]
    async fn test_find_run_not_found() {
        let store = RunStore::new(Arc::new(MockPersistence::default()));
        let err = store.find_run(12).await.unwrap_err();
        assert!(matches!(err, CoreError::RunNotFound { run_id: 12 }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_run_unknown_is_noop() {
        let store = RunStore::new(Arc::new(MockPersistence::default()));
        store.delete_run(404).await.unwrap();
        assert_eq!(
            store
                .delete_runs_older_than(Duration::from_secs(60))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_delete_runs_older_than_out_of_range_age() {
        let mock = Arc::new(MockPersistence::default());
        let store = RunStore::new(mock.clone());

        let before = Utc::now();
        assert_eq!(
            store
                .delete_runs_older_than(Duration::from_secs(3600))
                .await
                .unwrap(),
            3
        );
        let cutoff = mock.delete_cutoffs.lock().unwrap()[0];
        assert!(cutoff <= before - chrono::Duration::hours(1) + chrono::Duration::seconds(5));

        for max_age in [Duration::from_secs(10_000_000_000_000), Duration::MAX] {
            assert_eq!(store.delete_runs_older_than(max_age).await.unwrap(), 0);
        }
        assert_eq!(mock.delete_cutoffs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_unfinished_runs_pages_with_cursor() {
        let mock = Arc::new(MockPersistence::with_unfinished(5));
        let store = RunStore::new(mock.clone()).with_page_size(2);

        let mut seen = Vec::new();
        store
            .get_unfinished_runs(Utc::now(), |run| {
                seen.push(run.id);
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        // Pages of 2, 2 and a short page of 1
        let requests = mock.page_requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0], None);
        assert_eq!(requests[1].map(|c| c.id), Some(2));
        assert_eq!(requests[2].map(|c| c.id), Some(4));
    }

    #[tokio::test]
    async fn test_get_unfinished_runs_stops_on_callback_error() {
        let store = RunStore::new(Arc::new(MockPersistence::with_unfinished(4))).with_page_size(2);

        #[derive(Debug)]
        enum ScanError {
            Stop(i64),
            Store(CoreError),
        }
        impl From<CoreError> for ScanError {
            fn from(err: CoreError) -> Self {
                Self::Store(err)
            }
        }

        let mut seen = Vec::new();
        let result = store
            .get_unfinished_runs(Utc::now(), |run| {
                seen.push(run.id);
                if run.id == 3 {
                    Err(ScanError::Stop(run.id))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(ScanError::Stop(3))));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unfinished_runs_cursor_is_exhausted_after_short_page() {
        let store = RunStore::new(Arc::new(MockPersistence::with_unfinished(3))).with_page_size(2);
        let mut cursor = store.unfinished_runs(Utc::now());

        assert_eq!(cursor.next_batch().await.unwrap().len(), 2);
        assert_eq!(cursor.next_batch().await.unwrap().len(), 1);
        assert!(cursor.next_batch().await.unwrap().is_empty());
        assert!(cursor.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_run_assigns_ids() {
        let store = RunStore::new(Arc::new(MockPersistence::default()));
        let mut run = PipelineRun::new(1, json!({}), json!({}));
        run.task_runs.push(TaskRun::new("a", "http", 0));

        store.create_run(&mut run).await.unwrap();
        assert_eq!(run.id, 1);
        assert_eq!(run.task_runs[0].pipeline_run_id, 1);
        assert_eq!(run.state, RunState::Running);
        assert_eq!(store.find_run(1).await.unwrap().id, 1);
    }

    #[test]
    fn test_page_size_has_a_floor() {
        let store = RunStore::new(Arc::new(MockPersistence::default())).with_page_size(0);
        assert_eq!(store.page_size(), 1);
        assert_eq!(
            RunStore::new(Arc::new(MockPersistence::default())).page_size(),
            DEFAULT_PAGE_SIZE
        );
    }
}
