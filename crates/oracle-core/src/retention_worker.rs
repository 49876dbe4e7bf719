// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that deletes old finished pipeline runs.
//!
//! Runs whose finish time is older than the configured max age are deleted
//! together with their task runs. Unfinished runs are never touched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::run_store::RunStore;

/// Configuration for the run retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// Whether run retention is enabled.
    pub enabled: bool,
    /// How often to delete old runs.
    pub poll_interval: Duration,
    /// Finished runs older than this are deleted.
    pub max_age: Duration,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl RetentionWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ORACLE_RUN_RETENTION_ENABLED`: "true" or "1" to enable (default: false)
    /// - `ORACLE_RUN_RETENTION_POLL_INTERVAL_SECS`: seconds between passes (default: 3600)
    /// - `ORACLE_RUN_RETENTION_MAX_AGE_HOURS`: hours before finished runs are deleted (default: 720)
    pub fn from_env() -> Self {
        let enabled = std::env::var("ORACLE_RUN_RETENTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("ORACLE_RUN_RETENTION_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let max_age_hours = std::env::var("ORACLE_RUN_RETENTION_MAX_AGE_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(720);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_hours.saturating_mul(3600)),
        }
    }
}

/// Background worker that periodically deletes old finished runs.
pub struct RetentionWorker {
    run_store: RunStore,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(run_store: RunStore, config: RetentionWorkerConfig) -> Self {
        Self {
            run_store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown handle is notified.
    ///
    /// Returns immediately when disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Run retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            "Run retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Run retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.delete_old_runs().await {
                        error!(error = %e, "Failed to delete old pipeline runs");
                    }
                }
            }
        }

        info!("Run retention worker stopped");
    }

    /// Perform a single retention pass. Returns the number of runs deleted.
    pub async fn delete_old_runs(&self) -> Result<u64> {
        let deleted = self
            .run_store
            .delete_runs_older_than(self.config.max_age)
            .await?;

        if deleted > 0 {
            info!(deleted, "Run retention pass completed");
        } else {
            debug!("Run retention pass completed, no old runs found");
        }

        Ok(deleted)
    }
}
