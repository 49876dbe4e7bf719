// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log consumption tracking tests.

mod common;

use common::{TestContext, random_hash, random_key};
use oracle_core::models::BroadcastKey;

#[tokio::test]
async fn test_create_consume_and_check() {
    for ctx in TestContext::all().await {
        let key = BroadcastKey::new(random_hash(), 2, 7);

        ctx.tracker.create_broadcast(&key, 100).await.unwrap();
        assert!(!ctx.tracker.was_consumed(&key).await.unwrap());

        ctx.tracker.mark_consumed(&key, 100).await.unwrap();
        assert!(ctx.tracker.was_consumed(&key).await.unwrap());
    }
}

#[tokio::test]
async fn test_mark_consumed_twice_leaves_one_row() {
    for ctx in TestContext::all().await {
        let key = random_key(0, 1);

        ctx.tracker.mark_consumed(&key, 42).await.unwrap();
        ctx.tracker.mark_consumed(&key, 42).await.unwrap();

        let rows = ctx.tracker.find_broadcasts(42, 42).await.unwrap();
        assert_eq!(rows.len(), 1, "[{}] duplicate broadcast rows", ctx.backend);
        assert_eq!(rows[0].key, key);
        assert!(rows[0].consumed);
    }
}

#[tokio::test]
async fn test_unknown_broadcast_is_not_consumed() {
    for ctx in TestContext::all().await {
        assert!(!ctx.tracker.was_consumed(&random_key(0, 1)).await.unwrap());
    }
}

#[tokio::test]
async fn test_duplicate_create_is_a_conflict() {
    for ctx in TestContext::all().await {
        let key = random_key(3, 9);
        ctx.tracker.create_broadcast(&key, 5).await.unwrap();

        let err = ctx.tracker.create_broadcast(&key, 5).await.unwrap_err();
        assert_eq!(err.error_code(), "BROADCAST_ALREADY_EXISTS");
        assert!(!err.is_not_found());

        // Another job may still receive the same log
        let other_job = BroadcastKey::new(key.block_hash, key.log_index, 10);
        ctx.tracker.create_broadcast(&other_job, 5).await.unwrap();
    }
}

#[tokio::test]
async fn test_pending_min_block_roundtrip() {
    for ctx in TestContext::all().await {
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), None);

        ctx.tracker.set_pending_min_block(Some(1234)).await.unwrap();
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), Some(1234));

        ctx.tracker.set_pending_min_block(Some(1200)).await.unwrap();
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), Some(1200));

        ctx.tracker.set_pending_min_block(None).await.unwrap();
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_reinitialize_lowers_watermark_and_purges() {
    for ctx in TestContext::all().await {
        ctx.tracker
            .create_broadcast(&random_key(0, 1), 50)
            .await
            .unwrap();
        ctx.tracker.set_pending_min_block(Some(80)).await.unwrap();

        assert_eq!(ctx.tracker.reinitialize().await.unwrap(), Some(50));
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), Some(50));
        assert!(ctx.tracker.find_broadcasts(0, 1000).await.unwrap().is_empty());

        assert_eq!(ctx.tracker.reinitialize().await.unwrap(), Some(50));
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), Some(50));
    }
}

#[tokio::test]
async fn test_reinitialize_keeps_consumed_broadcasts() {
    for ctx in TestContext::all().await {
        let consumed = random_key(0, 1);
        ctx.tracker.mark_consumed(&consumed, 10).await.unwrap();
        ctx.tracker
            .create_broadcast(&random_key(1, 1), 15)
            .await
            .unwrap();
        ctx.tracker
            .create_broadcast(&random_key(2, 2), 12)
            .await
            .unwrap();

        // No watermark yet: set to the oldest unconsumed block
        assert_eq!(ctx.tracker.reinitialize().await.unwrap(), Some(12));

        let remaining = ctx.tracker.find_broadcasts(0, 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, consumed);
        assert!(ctx.tracker.was_consumed(&consumed).await.unwrap());
    }
}

#[tokio::test]
async fn test_reinitialize_without_state() {
    for ctx in TestContext::all().await {
        assert_eq!(ctx.tracker.reinitialize().await.unwrap(), None);
        assert_eq!(ctx.tracker.get_pending_min_block().await.unwrap(), None);
    }
}
