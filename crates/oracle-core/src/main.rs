// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Oracle Core - Pipeline Run and Log Consumption Persistence
//!
//! The daemon:
//! - Connects to PostgreSQL or SQLite and applies migrations
//! - Reinitializes log consumption tracking for the configured chain
//! - Reports runs left unfinished by a previous process
//! - Deletes old finished runs in the background (when enabled)

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use oracle_core::config::Config;
use oracle_core::persistence::{
    BroadcastPersistence, PostgresPersistence, RunPersistence, SqlitePersistence,
};
use oracle_core::recovery::recover_on_startup;
use oracle_core::retention_worker::{RetentionWorker, RetentionWorkerConfig};
use oracle_core::{LogConsumptionTracker, RunStore};

type Backends = (Arc<dyn RunPersistence>, Arc<dyn BroadcastPersistence>);

fn backends<P>(persistence: Arc<P>) -> Backends
where
    P: RunPersistence + BroadcastPersistence + 'static,
{
    let runs: Arc<dyn RunPersistence> = persistence.clone();
    let broadcasts: Arc<dyn BroadcastPersistence> = persistence;
    (runs, broadcasts)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("oracle_core=info".parse()?),
        )
        .init();

    info!("Starting Oracle Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        evm_chain_id = config.evm_chain_id,
        max_db_connections = config.max_db_connections,
        sqlite = config.is_sqlite(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let (runs, broadcasts) =
        if let Some(options) = config.sqlite_options()? {
            backends(Arc::new(SqlitePersistence::connect(options).await?))
        } else {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_db_connections)
                .connect(&config.database_url)
                .await?;

            let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
            info!(result = row.0, "Database health check passed");

            info!("Running database migrations...");
            oracle_core::migrations::run_postgres(&pool).await?;
            info!("Migrations completed");

            backends(Arc::new(PostgresPersistence::new(pool)))
        };

    let run_store = RunStore::new(runs);
    let tracker = LogConsumptionTracker::new(broadcasts, config.evm_chain_id);

    // Runs created after this point belong to this process
    let started_at = Utc::now();
    let report = recover_on_startup(&tracker, &run_store, started_at, |run| {
        warn!(
            run_id = run.id,
            spec_id = run.pipeline_spec_id,
            task_runs = run.task_runs.len(),
            "Pipeline run left unfinished by a previous process"
        );
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    info!(
        watermark = ?report.watermark,
        unfinished_runs = report.unfinished_runs,
        "Oracle Core initialized successfully"
    );

    let worker = Arc::new(RetentionWorker::new(
        run_store.clone(),
        RetentionWorkerConfig::from_env(),
    ));
    let worker_shutdown = worker.shutdown_handle();
    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    worker_shutdown.notify_one();
    if let Err(e) = worker_handle.await {
        error!("Run retention worker task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
