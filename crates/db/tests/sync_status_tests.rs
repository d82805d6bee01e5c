//! Git-sync status integration tests.
//!
//! These tests require Docker. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::postgres_or_skip;
use kuberpult_core::config::SyncStatusConfig;
use kuberpult_core::{EnvApp, SyncStatus};

fn pairs(count: usize) -> Vec<EnvApp> {
    (0..count)
        .map(|i| EnvApp::new(format!("env-{}", i % 4), format!("app-{i:04}")))
        .collect()
}

#[tokio::test]
async fn test_bulk_write_batches_and_flushes_tail() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db
        .handler()
        .clone()
        .with_sync_status_config(SyncStatusConfig { batch_size: 500 });
    let env_apps = pairs(1200);

    let mut tx = handler.begin_transaction(false).await.unwrap();
    let batches = handler
        .write_sync_events_bulk(&mut tx, 10, &env_apps, SyncStatus::Unsynced)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(batches, 3);

    let mut tx = handler.begin_transaction(true).await.unwrap();
    assert_eq!(
        handler.count_by_status(&mut tx, SyncStatus::Unsynced).await.unwrap(),
        1200
    );
    let unsynced = handler
        .read_unsynced_for_transformer(&mut tx, 10)
        .await
        .unwrap();
    assert_eq!(unsynced.len(), 1200);
    let rows = handler
        .retrieve_by_status(&mut tx, SyncStatus::Unsynced)
        .await
        .unwrap();
    assert!(rows.iter().all(|row| row.transformer_id == 10));
    let one = handler
        .retrieve_sync_status(&mut tx, "env-1", "app-0001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.status, SyncStatus::Unsynced);
}

#[tokio::test]
async fn test_rewrites_upsert_by_env_and_app() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();
    let pair = EnvApp::new("dev", "billing");

    let mut tx = handler.begin_transaction(false).await.unwrap();
    handler
        .write_sync_event(&mut tx, 1, &pair, SyncStatus::Unsynced)
        .await
        .unwrap();
    handler
        .write_sync_events_bulk(
            &mut tx,
            2,
            &[pair.clone(), pair.clone()],
            SyncStatus::Unsynced,
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = handler.begin_transaction(true).await.unwrap();
    let row = handler
        .retrieve_sync_status(&mut tx, "dev", "billing")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.transformer_id, 2);
    assert!(
        handler
            .read_all_for_transformer(&mut tx, 1)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        handler
            .retrieve_sync_status(&mut tx, "dev", "unknown")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_bulk_status_transitions() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();

    let mut tx = handler.begin_transaction(false).await.unwrap();
    handler
        .write_sync_events_bulk(&mut tx, 5, &pairs(3), SyncStatus::Unsynced)
        .await
        .unwrap();
    handler
        .write_sync_events_bulk(
            &mut tx,
            6,
            &[EnvApp::new("prod", "other")],
            SyncStatus::Unsynced,
        )
        .await
        .unwrap();

    let updated = handler
        .bulk_update_status(&mut tx, 5, SyncStatus::Synced)
        .await
        .unwrap();
    assert_eq!(updated, 3);
    assert_eq!(
        handler.count_by_status(&mut tx, SyncStatus::Synced).await.unwrap(),
        3
    );
    assert_eq!(
        handler.count_by_status(&mut tx, SyncStatus::Unsynced).await.unwrap(),
        1
    );

    let moved = handler
        .bulk_reassign_transformer(&mut tx, 5, 7, SyncStatus::Unsynced)
        .await
        .unwrap();
    assert_eq!(moved, 3);
    assert_eq!(
        handler.read_unsynced_for_transformer(&mut tx, 7).await.unwrap(),
        pairs(3)
    );
    assert!(
        handler
            .read_all_for_transformer(&mut tx, 5)
            .await
            .unwrap()
            .is_empty()
    );
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_update_all_status_ignores_current_status() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();
    let env_apps = pairs(3);

    let mut tx = handler.begin_transaction(false).await.unwrap();
    handler
        .write_sync_events_bulk(&mut tx, 8, &env_apps, SyncStatus::Unsynced)
        .await
        .unwrap();
    handler
        .write_sync_event(&mut tx, 8, &env_apps[0], SyncStatus::SyncFailed)
        .await
        .unwrap();

    // Only UNSYNCED pairs move with the narrower update.
    let unsynced = handler
        .bulk_update_status(&mut tx, 8, SyncStatus::Unsynced)
        .await
        .unwrap();
    assert_eq!(unsynced, 2);

    let updated = handler
        .bulk_update_all_status(&mut tx, 8, SyncStatus::Synced)
        .await
        .unwrap();
    assert_eq!(updated, 3);
    assert_eq!(
        handler.count_by_status(&mut tx, SyncStatus::Synced).await.unwrap(),
        3
    );
    assert_eq!(
        handler
            .count_by_status(&mut tx, SyncStatus::SyncFailed)
            .await
            .unwrap(),
        0
    );
    tx.commit().await.unwrap();
}
