//! Transaction runner integration tests.
//!
//! These tests require Docker. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::{actor, count_rows, lock, postgres_or_skip};
use kuberpult_core::EventType;
use kuberpult_db::models::{AppKey, AppMetadata, Applications, EnvLockKey, EnvironmentLocks};
use kuberpult_db::{DbError, DbTx};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

/// Fail the current statement with the given SQLSTATE.
async fn raise(tx: &mut DbTx, code: &str) -> Result<(), DbError> {
    let statement = format!("DO $$ BEGIN RAISE EXCEPTION 'injected' USING ERRCODE = '{code}'; END $$");
    sqlx::query(&statement).execute(tx.conn()).await?;
    Ok(())
}

#[tokio::test]
async fn test_all_rows_of_one_transaction_share_its_timestamp() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();

    let (version, timestamp_queries) = handler
        .with_transaction_optional(false, |h, tx| {
            Box::pin(async move {
                let version = h
                    .append_event(tx, EventType::CreateEnvironmentLock, &serde_json::json!({}), &actor())
                    .await?;
                h.upsert::<EnvironmentLocks>(tx, &EnvLockKey::new("dev", "l1"), &lock("m"), version)
                    .await?;
                h.upsert::<Applications>(
                    tx,
                    &AppKey::new("billing"),
                    &AppMetadata {
                        team: "payments".to_string(),
                    },
                    version,
                )
                .await?;
                Ok(Some((version, tx.timestamp_queries())))
            })
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(timestamp_queries, 1, "now() must be queried once per transaction");

    let pool = db.pool();
    let mut created: Vec<OffsetDateTime> = Vec::new();
    created.push(
        sqlx::query_scalar("SELECT created FROM event_sourcing_light WHERE esl_version = $1")
            .bind(version)
            .fetch_one(pool)
            .await
            .unwrap(),
    );
    for table in [
        "environment_locks",
        "environment_locks_history",
        "apps",
        "apps_history",
    ] {
        let rows: Vec<OffsetDateTime> =
            sqlx::query_scalar(&format!("SELECT created FROM {table} WHERE esl_version = $1"))
                .bind(version)
                .fetch_all(pool)
                .await
                .unwrap();
        assert_eq!(rows.len(), 1, "{table}");
        created.extend(rows);
    }
    assert!(created.iter().all(|ts| *ts == created[0]), "{created:?}");
}

#[tokio::test]
async fn test_serialization_failure_replays_whole_transaction() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let version = db
        .handler()
        .with_transaction_optional_retry(3, false, move |h, tx| {
            let counter = counter.clone();
            Box::pin(async move {
                let version = h
                    .append_event(tx, EventType::ReleaseTrain, &serde_json::json!({}), &actor())
                    .await?;
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    raise(tx, "40001").await?;
                }
                Ok(Some(version))
            })
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    // The first attempt rolled back, so only one event remains.
    assert_eq!(count_rows(db.pool(), "event_sourcing_light").await, 1);
    let mut tx = db.handler().begin_transaction(true).await.unwrap();
    let last = db.handler().read_last_event(&mut tx).await.unwrap().unwrap();
    assert_eq!(last.esl_version, version);
}

#[tokio::test]
async fn test_non_retryable_error_is_returned_unchanged() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let err = db
        .handler()
        .with_transaction_retry(3, false, move |_, tx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                raise(tx, "23505").await
            })
        })
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(!err.is_retryable());
    assert!(matches!(err, DbError::Database(_)));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let err = db
        .handler()
        .with_transaction_retry(2, false, move |_, tx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                raise(tx, "40P01").await
            })
        })
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_read_only_transaction_rejects_writes() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let err = db
        .handler()
        .with_transaction(true, |h, tx| {
            Box::pin(async move {
                h.append_event(tx, EventType::ReleaseTrain, &serde_json::json!({}), &actor())
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(count_rows(db.pool(), "event_sourcing_light").await, 0);
}

#[tokio::test]
async fn test_cancelled_transaction_rolls_back() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler().clone();

    let work = handler.with_transaction(false, |h, tx| {
        Box::pin(async move {
            h.append_event(tx, EventType::ReleaseTrain, &serde_json::json!({}), &actor())
                .await?;
            sqlx::query("SELECT pg_sleep(30)").execute(tx.conn()).await?;
            Ok(())
        })
    });
    let result = tokio::time::timeout(Duration::from_millis(500), work).await;
    assert!(result.is_err(), "work should have been cancelled");

    // The dropped transaction's connection rolls back before it is reused.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count_rows(db.pool(), "event_sourcing_light").await, 0);
}
