// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for oracle-core integration tests.
//!
//! Every test runs against an in-memory SQLite database, and additionally
//! against PostgreSQL when `TEST_DATABASE_URL` is set.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use oracle_core::models::{BlockHash, BroadcastKey, PipelineRun, TaskRun};
use oracle_core::persistence::{PostgresPersistence, SqlitePersistence};
use oracle_core::{LogConsumptionTracker, RunStore};

/// Test context bundling a run store and a chain-scoped tracker over one backend.
pub struct TestContext {
    pub backend: &'static str,
    pub run_store: RunStore,
    pub tracker: LogConsumptionTracker,
}

impl TestContext {
    /// In-memory SQLite context.
    pub async fn sqlite() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        oracle_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        Self::from_sqlite(SqlitePersistence::new(pool), random_chain_id())
    }

    /// Context over an already opened SQLite persistence.
    pub fn from_sqlite(persistence: SqlitePersistence, chain_id: i64) -> Self {
        let persistence = Arc::new(persistence);
        Self {
            backend: "sqlite",
            run_store: RunStore::new(persistence.clone()),
            tracker: LogConsumptionTracker::new(persistence, chain_id),
        }
    }

    /// PostgreSQL context, or `None` if `TEST_DATABASE_URL` is not set.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        oracle_core::migrations::run_postgres(&pool).await.ok()?;

        let persistence = Arc::new(PostgresPersistence::new(pool));
        Some(Self {
            backend: "postgres",
            run_store: RunStore::new(persistence.clone()),
            tracker: LogConsumptionTracker::new(persistence, random_chain_id()),
        })
    }

    /// SQLite, plus PostgreSQL when available.
    pub async fn all() -> Vec<Self> {
        let mut contexts = vec![Self::sqlite().await];
        match Self::postgres().await {
            Some(ctx) => contexts.push(ctx),
            None => eprintln!("Skipping PostgreSQL backend: TEST_DATABASE_URL not set"),
        }
        contexts
    }

    /// Create a spec and a running run carrying one pending task per dot id.
    pub async fn create_run(&self, dot_ids: &[&str]) -> PipelineRun {
        let spec_id = self
            .run_store
            .create_spec("ds1 -> ds1_parse -> ds1_multiply", Duration::from_secs(30))
            .await
            .expect("Failed to create spec");

        let mut run = PipelineRun::new(spec_id, json!({"request": "price"}), json!({}));
        run.task_runs = dot_ids
            .iter()
            .enumerate()
            .map(|(i, dot_id)| TaskRun::new(*dot_id, "bridge", i as i32))
            .collect();

        self.run_store
            .create_run(&mut run)
            .await
            .expect("Failed to create run");
        run
    }
}

/// Chain ids are random so contexts sharing a database stay isolated.
pub fn random_chain_id() -> i64 {
    (Uuid::new_v4().as_u128() as i64) & i64::MAX
}

/// Random block hash.
pub fn random_hash() -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    BlockHash(bytes)
}

/// Broadcast key with a random block hash.
pub fn random_key(log_index: i64, job_id: i32) -> BroadcastKey {
    BroadcastKey::new(random_hash(), log_index, job_id)
}
