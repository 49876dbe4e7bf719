// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup recovery.
//!
//! After a crash two kinds of work may be half done: logs that were delivered
//! but never consumed, and runs an executor left `Running`. Recovery resets
//! the log watermark so those logs are redelivered, then hands every orphaned
//! run back to the caller.

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::error::CoreError;
use crate::log_tracker::LogConsumptionTracker;
use crate::models::PipelineRun;
use crate::run_store::RunStore;

/// Watermark changes decided by [`plan_watermark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkPlan {
    /// New (lower) watermark to write before purging, if any.
    pub lower_to: Option<i64>,
    /// Whether unconsumed broadcasts must be deleted.
    pub purge_unconsumed: bool,
    /// Watermark after the plan is applied.
    pub watermark: Option<i64>,
}

/// Decide how to reconcile the pending watermark with unconsumed broadcasts.
///
/// With no unconsumed broadcasts the watermark is left alone. Otherwise it is
/// lowered to the oldest unconsumed block when absent or higher, and the
/// unconsumed broadcasts are purged so they can be redelivered.
pub fn plan_watermark(min_unconsumed: Option<i64>, min_pending: Option<i64>) -> WatermarkPlan {
    let Some(min_unconsumed) = min_unconsumed else {
        return WatermarkPlan {
            lower_to: None,
            purge_unconsumed: false,
            watermark: min_pending,
        };
    };

    let lower_to = match min_pending {
        Some(pending) if pending <= min_unconsumed => None,
        _ => Some(min_unconsumed),
    };

    WatermarkPlan {
        lower_to,
        purge_unconsumed: true,
        watermark: lower_to.or(min_pending),
    }
}

/// Outcome of [`recover_on_startup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Chain whose watermark was reconciled.
    pub chain_id: i64,
    /// Block from which log delivery must resume, if any.
    pub watermark: Option<i64>,
    /// Number of unfinished runs handed to the callback.
    pub unfinished_runs: usize,
}

/// Reinitialize log tracking, then hand every run left `Running` before
/// `created_before` to `on_run`.
///
/// Stops at the first error returned by `on_run`.
#[instrument(skip_all, fields(chain_id = tracker.chain_id()))]
pub async fn recover_on_startup<F, E>(
    tracker: &LogConsumptionTracker,
    run_store: &RunStore,
    created_before: DateTime<Utc>,
    mut on_run: F,
) -> Result<RecoveryReport, E>
where
    F: FnMut(PipelineRun) -> Result<(), E>,
    E: From<CoreError>,
{
    let watermark = tracker.reinitialize().await?;

    let mut unfinished_runs = 0usize;
    run_store
        .get_unfinished_runs(created_before, |run| {
            unfinished_runs += 1;
            on_run(run)
        })
        .await?;

    info!(
        watermark = ?watermark,
        unfinished_runs,
        "Startup recovery completed"
    );

    Ok(RecoveryReport {
        chain_id: tracker.chain_id(),
        watermark,
        unfinished_runs,
    })
}
