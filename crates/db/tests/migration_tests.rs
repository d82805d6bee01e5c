//! Migration cutover integration tests.
//!
//! These tests require Docker. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::{MemorySource, actor, count_rows, postgres_or_skip};
use kuberpult_core::{MIGRATION_MARKER_VERSION, PersistenceMode};
use kuberpult_db::migrations::{APPS_HISTORY_MIGRATION, apps_history_migration};
use kuberpult_db::models::{AppKey, Applications, ReleaseKey, Releases};
use kuberpult_db::{DbError, MigrationOutcome, MigrationUnit, NewCommitEvent};
use serde_json::json;
use uuid::Uuid;

const TABLES: [&str; 16] = [
    "apps",
    "apps_history",
    "environments",
    "environments_history",
    "releases",
    "releases_history",
    "deployments",
    "deployments_history",
    "environment_locks",
    "environment_locks_history",
    "app_locks",
    "app_locks_history",
    "team_locks",
    "team_locks_history",
    "event_sourcing_light",
    "commit_events",
];

async fn snapshot(pool: &sqlx::PgPool) -> Vec<(&'static str, i64)> {
    let mut counts = Vec::new();
    for table in TABLES {
        counts.push((table, count_rows(pool, table).await));
    }
    counts
}

#[tokio::test]
async fn test_cutover_is_idempotent() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();
    let mut source = MemorySource::sample();
    source.commit_events = vec![NewCommitEvent {
        uuid: Uuid::new_v4(),
        commit_hash: "abc".to_string(),
        event_type: "new-release".to_string(),
        json: json!({}),
        transformer_esl_version: MIGRATION_MARKER_VERSION,
    }];

    let first = handler.run_cutover(&source, &actor()).await.unwrap();
    assert_eq!(first.steps.len(), MigrationUnit::ORDER.len());
    assert!(
        first
            .steps
            .iter()
            .all(|(_, outcome)| *outcome == MigrationOutcome::Done),
        "{first:?}"
    );
    let after_first = snapshot(db.pool()).await;
    assert!(after_first.contains(&("apps", 2)));
    assert!(after_first.contains(&("releases", 6)));
    assert!(after_first.contains(&("event_sourcing_light", 1)));
    assert!(after_first.contains(&("commit_events", 1)));

    let reads = source.reads();
    let second = handler.run_cutover(&source, &actor()).await.unwrap();
    assert!(second.is_noop(), "{second:?}");
    assert_eq!(snapshot(db.pool()).await, after_first);
    // Releases list the applications to probe per application; nothing else is read.
    assert_eq!(source.reads(), reads + 1);

    let mut tx = handler.begin_transaction(true).await.unwrap();
    let app = handler
        .select::<Applications>(&mut tx, &AppKey::new("billing"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(app.metadata.team, "payments");
    assert_eq!(app.esl_version, MIGRATION_MARKER_VERSION);
    assert!(handler.has_migration_marker(&mut tx).await.unwrap());
}

#[tokio::test]
async fn test_failed_release_migration_resumes_per_app() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();
    let mut source = MemorySource::sample();
    source.failing_app = Some("search".to_string());

    let err = handler.run_cutover(&source, &actor()).await.unwrap_err();
    match &err {
        DbError::Migration { name, source } => {
            assert_eq!(name, "releases");
            assert!(matches!(**source, DbError::Source(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    // "billing" committed in its own transaction, nothing after releases ran.
    let mut tx = handler.begin_transaction(true).await.unwrap();
    assert!(
        handler
            .select::<Releases>(&mut tx, &ReleaseKey::new("billing", 1))
            .await
            .unwrap()
            .is_some()
    );
    assert!(!handler.has_migration_marker(&mut tx).await.unwrap());
    tx.commit().await.unwrap();
    assert_eq!(count_rows(db.pool(), "deployments").await, 0);

    source.failing_app = None;
    let report = handler.run_cutover(&source, &actor()).await.unwrap();
    assert_eq!(report.outcome("applications"), Some(MigrationOutcome::Skipped));
    assert_eq!(report.outcome("releases"), Some(MigrationOutcome::Done));
    assert_eq!(report.outcome("deployments"), Some(MigrationOutcome::Done));
    assert_eq!(count_rows(db.pool(), "releases").await, 6);
}

#[tokio::test]
async fn test_commit_events_need_the_marker() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();
    let mut source = MemorySource::sample();
    source.commit_events = vec![NewCommitEvent {
        uuid: Uuid::new_v4(),
        commit_hash: "abc".to_string(),
        event_type: "lock-prevented-deployment".to_string(),
        json: json!({}),
        transformer_esl_version: MIGRATION_MARKER_VERSION,
    }];

    let err = handler
        .run_unit(MigrationUnit::CommitEvents, &source, &actor())
        .await
        .unwrap_err();
    assert!(err.is_failed_precondition());
    assert_eq!(count_rows(db.pool(), "commit_events").await, 0);

    handler
        .run_unit(MigrationUnit::EslBootstrap, &source, &actor())
        .await
        .unwrap();
    let outcome = handler
        .run_unit(MigrationUnit::CommitEvents, &source, &actor())
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::Done);
}

#[tokio::test]
async fn test_apps_history_migration_runs_once() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let handler = db.handler();
    sqlx::query(
        "INSERT INTO apps (app_name, created, metadata, esl_version)
         VALUES ('legacy', now(), '{\"team\":\"old\"}', 0)",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let migrations = [apps_history_migration()];
    let report = handler.run_custom_migrations(&migrations).await.unwrap();
    assert_eq!(
        report.outcome(APPS_HISTORY_MIGRATION),
        Some(MigrationOutcome::Done)
    );
    assert_eq!(count_rows(db.pool(), "apps_history").await, 1);

    let mut tx = handler.begin_transaction(true).await.unwrap();
    let history = handler
        .select_history::<Applications>(&mut tx, &AppKey::new("legacy"), 10)
        .await
        .unwrap();
    assert_eq!(history[0].metadata.team, "old");
    assert!(
        handler
            .has_go_migration_cutoff(&mut tx, APPS_HISTORY_MIGRATION)
            .await
            .unwrap()
    );
    tx.commit().await.unwrap();

    let report = handler.run_custom_migrations(&migrations).await.unwrap();
    assert_eq!(
        report.outcome(APPS_HISTORY_MIGRATION),
        Some(MigrationOutcome::Skipped)
    );
    assert_eq!(count_rows(db.pool(), "apps_history").await, 1);
}

#[tokio::test]
async fn test_migrations_follow_persistence_mode() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let source = MemorySource::sample();

    let disabled = db.persistence(PersistenceMode::Disabled);
    assert!(
        disabled
            .run_migrations(&source, &actor())
            .await
            .unwrap()
            .steps
            .is_empty()
    );
    assert_eq!(source.reads(), 0);

    let ledger_only = db.persistence(PersistenceMode::LedgerOnly);
    let report = ledger_only.run_migrations(&source, &actor()).await.unwrap();
    assert_eq!(report.done(), vec!["esl_bootstrap"]);
    assert_eq!(count_rows(db.pool(), "apps").await, 0);
    assert_eq!(count_rows(db.pool(), "event_sourcing_light").await, 1);

    let full = db.persistence(PersistenceMode::Full);
    let report = full.run_migrations(&source, &actor()).await.unwrap();
    assert_eq!(report.outcome("esl_bootstrap"), Some(MigrationOutcome::Skipped));
    assert_eq!(report.outcome("applications"), Some(MigrationOutcome::Done));
    assert_eq!(
        report.outcome(APPS_HISTORY_MIGRATION),
        Some(MigrationOutcome::Done)
    );
    assert_eq!(count_rows(db.pool(), "apps").await, 2);
}
