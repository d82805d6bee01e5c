//! Event-sourcing transaction and migration-cutover persistence for kuberpult.
//!
//! This crate provides:
//! - Serializable transactions with retry on conflict and a per-transaction timestamp
//! - The append-only event ledger, its failed twin and the cutoff markers
//! - Generic current-state + history tables for every entity family
//! - Transaction-scoped advisory locks
//! - Git-sync status tracking with batched upserts
//! - The one-time cutover from the manifest repository

pub mod advisory;
pub mod commit_events;
pub mod cutoff;
pub mod entity;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod migrations;
pub mod models;
pub mod mutations;
pub mod persistence;
pub mod query;
pub mod retry;
pub mod sync_status;
pub mod transaction;

pub use advisory::{AdvisoryLockGuard, LockId};
pub use commit_events::{CommitEvent, NewCommitEvent};
pub use entity::{CurrentRow, DeletionMetadata, Entity, EntityKey, HistoryRow, KeyValue, replay_history};
pub use error::{DbError, DbResult};
pub use handler::DbHandler;
pub use ledger::{EslEvent, FailedEslEvent};
pub use migrations::{
    ManifestSource, MigrationOutcome, MigrationReport, MigrationUnit, NamedMigration,
};
pub use persistence::{Mutation, Persistence};
pub use query::adapt_query;
pub use retry::is_retryable;
pub use sync_status::GitSyncRow;
pub use transaction::{DbTx, TxFuture};

use kuberpult_core::DbConfig;

/// Create the persistence strategy from configuration.
pub async fn from_config(config: &DbConfig) -> DbResult<Persistence> {
    Persistence::from_config(config).await
}
