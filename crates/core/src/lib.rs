//! Core domain types shared across the kuberpult persistence crates.
//!
//! This crate is database-free and defines:
//! - The persistence configuration model
//! - The closed set of ledger event types and actor metadata
//! - Git-sync status values and `(env, app)` pairs

pub mod config;
pub mod error;
pub mod event;
pub mod sync;

pub use config::{DatabaseConfig, DbConfig, PersistenceMode};
pub use error::{Error, Result};
pub use event::{ActorMetadata, EventType};
pub use sync::{EnvApp, SyncStatus};

/// Ledger version assigned by the store's own sequence.
pub type EslVersion = i64;

/// Identifier of a transformer: the ledger version of the event that produced it.
pub type TransformerId = EslVersion;

/// Ledger version reserved for the migration marker.
pub const MIGRATION_MARKER_VERSION: EslVersion = 0;
