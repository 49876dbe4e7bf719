// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run mutual exclusion for backends without row-level locks.
//!
//! SQLite has no `SELECT ... FOR UPDATE`, so the SQLite backend serializes
//! `store_run` and `update_task_run_result` for the same run through a fixed
//! table of async mutexes keyed by run id. Two runs may share a shard; that
//! only costs throughput, never correctness.

use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock shards.
pub const DEFAULT_SHARDS: usize = 64;

/// Fixed-size table of async mutexes indexed by run id.
#[derive(Debug)]
pub struct RunLocks {
    shards: Box<[Mutex<()>]>,
}

impl RunLocks {
    /// Create a lock table with `shards` mutexes (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Acquire the lock covering `run_id`. Held until the guard is dropped.
    pub async fn lock(&self, run_id: i64) -> MutexGuard<'_, ()> {
        self.shards[self.shard_for(run_id)].lock().await
    }

    fn shard_for(&self, run_id: i64) -> usize {
        (run_id.unsigned_abs() % self.shards.len() as u64) as usize
    }
}

impl Default for RunLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
