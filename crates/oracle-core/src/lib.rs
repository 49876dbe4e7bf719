// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Oracle Core - Pipeline Run and Log Consumption Persistence
//!
//! This crate is the persistence core of an oracle node. It stores pipeline
//! runs so that executions which suspend on asynchronous tasks survive
//! restarts, and it tracks which chain logs each job has consumed so that
//! at-least-once delivery never triggers a job twice.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │   Task-graph executor    │        │   Chain-log collaborator │
//! │ (runs, async callbacks)  │        │ (logs, reorg detection)  │
//! └──────────────────────────┘        └──────────────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │        RunStore          │        │  LogConsumptionTracker   │
//! │  specs, runs, task runs  │        │  broadcasts, watermark   │
//! └──────────────────────────┘        └──────────────────────────┘
//!              │      ▲                     ▲      │
//!              │      └──── recovery ───────┘      │
//!              ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │     RunPersistence / BroadcastPersistence (async traits)    │
//! │        PostgresPersistence          SqlitePersistence       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Run lifecycle
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Running` | An executor is working on the run |
//! | `Suspended` | Waiting on an asynchronous task result |
//! | `Completed` | Terminal; carries outputs and errors |
//!
//! `Running → Suspended` happens in [`RunStore::store_run`] unless a result
//! was posted concurrently, in which case the executor is told to restart.
//! `Suspended → Running` happens in [`RunStore::update_task_run_result`],
//! which tells the callback to resume the run.
//!
//! # Startup
//!
//! [`recovery::recover_on_startup`] reinitializes the log watermark for the
//! configured chain and hands every run left `Running` back to the caller.
//!
//! # Configuration
//!
//! The `oracle-core` binary reads `ORACLE_DATABASE_URL`, `ORACLE_EVM_CHAIN_ID`
//! and `ORACLE_DB_MAX_CONNECTIONS` (see [`config::Config`]) plus the
//! `ORACLE_RUN_RETENTION_*` variables (see
//! [`retention_worker::RetentionWorkerConfig`]).

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Log consumption tracking scoped to one chain.
pub mod log_tracker;

/// Embedded database migrations.
pub mod migrations;

/// Domain types for runs, task runs and log broadcasts.
pub mod models;

/// Persistence traits and PostgreSQL/SQLite backends.
pub mod persistence;

/// Startup recovery and watermark reconciliation.
pub mod recovery;

/// Background deletion of old finished runs.
pub mod retention_worker;

/// Pipeline run storage and the suspend/resume handshake.
pub mod run_store;

pub use error::{CoreError, Result};
pub use log_tracker::LogConsumptionTracker;
pub use models::{
    BlockHash, BroadcastKey, CompletionRecord, LogBroadcast, PipelineRun, PipelineSpec, RunState,
    TaskResult, TaskRun,
};
pub use persistence::{
    BroadcastPersistence, PostgresPersistence, RunPersistence, SqlitePersistence,
    TaskResultUpdate,
};
pub use run_store::{RunStore, UnfinishedRuns};
