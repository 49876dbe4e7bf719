// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log Consumption Tracker
//!
//! Records, per subscribing job, which chain logs have been delivered and
//! which have been consumed, so at-least-once delivery from the chain-log
//! collaborator never causes a job to act on the same log twice.
//!
//! A tracker is scoped to a single chain. The pending minimum block is the
//! low-water mark from which delivery must resume after a restart.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::{CoreError, Result};
use crate::models::{BroadcastKey, LogBroadcast};
use crate::persistence::BroadcastPersistence;

/// Tracks log broadcasts and the pending block watermark for one chain.
#[derive(Clone)]
pub struct LogConsumptionTracker {
    persistence: Arc<dyn BroadcastPersistence>,
    chain_id: i64,
}

impl LogConsumptionTracker {
    /// Create a tracker for `chain_id`.
    pub fn new(persistence: Arc<dyn BroadcastPersistence>, chain_id: i64) -> Self {
        Self {
            persistence,
            chain_id,
        }
    }

    /// Chain this tracker is scoped to.
    pub fn chain_id(&self) -> i64 {
        self.chain_id
    }

    /// True only if the broadcast was recorded and consumed.
    pub async fn was_consumed(&self, key: &BroadcastKey) -> Result<bool> {
        self.persistence
            .was_broadcast_consumed(self.chain_id, key)
            .await
    }

    /// Record a delivered, not yet consumed broadcast.
    ///
    /// Fails with `BroadcastAlreadyExists` if the identity was already recorded.
    #[instrument(skip(self), fields(chain_id = self.chain_id))]
    pub async fn create_broadcast(&self, key: &BroadcastKey, block_number: i64) -> Result<()> {
        self.persistence
            .create_broadcast(self.chain_id, key, block_number)
            .await
    }

    /// Mark a broadcast consumed, recording it first if needed. Idempotent.
    #[instrument(skip(self), fields(chain_id = self.chain_id))]
    pub async fn mark_consumed(&self, key: &BroadcastKey, block_number: i64) -> Result<()> {
        self.persistence
            .mark_broadcast_consumed(self.chain_id, key, block_number)
            .await?;
        debug!(job_id = key.job_id, block_number, "Log broadcast consumed");
        Ok(())
    }

    /// Broadcasts recorded within `from_block..=to_block`.
    pub async fn find_broadcasts(&self, from_block: i64, to_block: i64) -> Result<Vec<LogBroadcast>> {
        if from_block > to_block {
            return Err(CoreError::validation(
                "block_range",
                format!("from block {} is after to block {}", from_block, to_block),
            ));
        }
        self.persistence
            .find_broadcasts(self.chain_id, from_block, to_block)
            .await
    }

    /// Set, or clear with `None`, the pending minimum block.
    pub async fn set_pending_min_block(&self, block_number: Option<i64>) -> Result<()> {
        self.persistence
            .set_pending_min_block(self.chain_id, block_number)
            .await
    }

    /// Current pending minimum block, if any.
    pub async fn get_pending_min_block(&self) -> Result<Option<i64>> {
        self.persistence.get_pending_min_block(self.chain_id).await
    }

    /// Establish a safe restart point after a crash.
    ///
    /// Lowers the watermark to the oldest unconsumed broadcast if needed and
    /// drops every unconsumed broadcast so those logs are redelivered. Returns
    /// the resulting watermark. Calling it twice yields the same watermark.
    #[instrument(skip(self), fields(chain_id = self.chain_id))]
    pub async fn reinitialize(&self) -> Result<Option<i64>> {
        let watermark = self.persistence.reinitialize(self.chain_id).await?;
        info!(watermark = ?watermark, "Log broadcast tracking reinitialized");
        Ok(watermark)
    }
}
