//! One-time backfill of the tables from the manifest repository.
//!
//! Every unit is gated by a cheap probe: if its target table already has
//! data (or its marker exists) the unit is skipped. Otherwise the source is
//! read outside any transaction and written in one transaction that probes
//! again before writing, so concurrent or repeated runs never duplicate
//! rows. A failed unit rolls back completely and is re-driven from scratch
//! on the next run.
//!
//! Units run in dependency order: applications and environments first,
//! then releases (one transaction per application), deployments and locks,
//! then the version-0 ledger marker, and finally commit events, which
//! reference ledger versions.

use crate::commit_events::NewCommitEvent;
use crate::entity::{Entity, KeyValue};
use crate::error::{DbError, DbResult};
use crate::handler::DbHandler;
use crate::models::{
    AppKey, AppLockKey, AppMetadata, ApplicationLocks, Applications, DeploymentKey,
    DeploymentMetadata, Deployments, EnvKey, EnvLockKey, EnvironmentLocks, EnvironmentMetadata,
    Environments, LockMetadata, ReleaseKey, ReleaseMetadata, Releases, TeamLockKey, TeamLocks,
};
use crate::persistence::Persistence;
use crate::transaction::{DbTx, TxFuture};
use async_trait::async_trait;
use kuberpult_core::{ActorMetadata, MIGRATION_MARKER_VERSION};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

/// Read access to the manifest repository, the source of truth before cutover.
///
/// Implementations report their own failures as [`DbError::Source`].
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Application name to owning team.
    async fn applications(&self) -> DbResult<BTreeMap<String, String>>;
    async fn environments(&self) -> DbResult<Vec<(EnvKey, EnvironmentMetadata)>>;
    /// Releases of one application, by release version.
    async fn releases(&self, app_name: &str) -> DbResult<Vec<(i64, ReleaseMetadata)>>;
    async fn deployments(&self) -> DbResult<Vec<(DeploymentKey, DeploymentMetadata)>>;
    async fn environment_locks(&self) -> DbResult<Vec<(EnvLockKey, LockMetadata)>>;
    async fn application_locks(&self) -> DbResult<Vec<(AppLockKey, LockMetadata)>>;
    async fn team_locks(&self) -> DbResult<Vec<(TeamLockKey, LockMetadata)>>;
    async fn commit_events(&self) -> DbResult<Vec<NewCommitEvent>>;
}

/// Cutover units, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationUnit {
    Applications,
    Environments,
    Releases,
    Deployments,
    EnvironmentLocks,
    ApplicationLocks,
    TeamLocks,
    /// The version-0 ledger marker.
    EslBootstrap,
    CommitEvents,
}

impl MigrationUnit {
    pub const ORDER: [MigrationUnit; 9] = [
        MigrationUnit::Applications,
        MigrationUnit::Environments,
        MigrationUnit::Releases,
        MigrationUnit::Deployments,
        MigrationUnit::EnvironmentLocks,
        MigrationUnit::ApplicationLocks,
        MigrationUnit::TeamLocks,
        MigrationUnit::EslBootstrap,
        MigrationUnit::CommitEvents,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Applications => "applications",
            Self::Environments => "environments",
            Self::Releases => "releases",
            Self::Deployments => "deployments",
            Self::EnvironmentLocks => "environment_locks",
            Self::ApplicationLocks => "application_locks",
            Self::TeamLocks => "team_locks",
            Self::EslBootstrap => "esl_bootstrap",
            Self::CommitEvents => "commit_events",
        }
    }
}

impl fmt::Display for MigrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Already migrated; nothing written.
    Skipped,
    Done,
}

/// Outcome of every step that ran, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub steps: Vec<(String, MigrationOutcome)>,
}

impl MigrationReport {
    fn push(&mut self, name: impl Into<String>, outcome: MigrationOutcome) {
        self.steps.push((name.into(), outcome));
    }

    pub fn outcome(&self, name: &str) -> Option<MigrationOutcome> {
        self.steps
            .iter()
            .find(|(step, _)| step == name)
            .map(|(_, outcome)| *outcome)
    }

    /// Names of the steps that wrote data.
    pub fn done(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, outcome)| *outcome == MigrationOutcome::Done)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.done().is_empty()
    }
}

/// A code-driven migration, run at most once per database.
///
/// Completion is recorded in `go_migration_cutoff` in the same transaction
/// as the migration's own writes.
#[derive(Clone, Copy)]
pub struct NamedMigration {
    pub name: &'static str,
    pub run: for<'t> fn(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, ()>,
}

impl fmt::Debug for NamedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMigration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub const APPS_HISTORY_MIGRATION: &str = "AppsHistory";

fn backfill_apps_history<'t>(handler: &'t DbHandler, tx: &'t mut DbTx) -> TxFuture<'t, ()> {
    Box::pin(async move {
        let written = handler.backfill_history::<Applications>(tx).await?;
        tracing::info!(rows = written, "apps history backfilled");
        Ok(())
    })
}

/// Give every application without history an initial history entry.
pub fn apps_history_migration() -> NamedMigration {
    NamedMigration {
        name: APPS_HISTORY_MIGRATION,
        run: backfill_apps_history,
    }
}

/// Named migrations run after the cutover.
pub fn builtin_migrations() -> Vec<NamedMigration> {
    vec![apps_history_migration()]
}

fn in_unit<T>(unit: MigrationUnit, result: DbResult<T>) -> DbResult<T> {
    result.map_err(|source| DbError::Migration {
        name: unit.name().to_string(),
        source: Box::new(source),
    })
}

impl DbHandler {
    /// Run every cutover unit in order, stopping at the first failure.
    pub async fn run_cutover(
        &self,
        source: &dyn ManifestSource,
        actor: &ActorMetadata,
    ) -> DbResult<MigrationReport> {
        let mut report = MigrationReport::default();
        for unit in MigrationUnit::ORDER {
            let outcome = in_unit(unit, self.run_unit(unit, source, actor).await)?;
            match outcome {
                MigrationOutcome::Skipped => {
                    tracing::info!(migration = unit.name(), "already migrated, skipping");
                }
                MigrationOutcome::Done => tracing::info!(migration = unit.name(), "migration done"),
            }
            report.push(unit.name(), outcome);
        }
        Ok(report)
    }

    /// Run a single cutover unit.
    pub async fn run_unit(
        &self,
        unit: MigrationUnit,
        source: &dyn ManifestSource,
        actor: &ActorMetadata,
    ) -> DbResult<MigrationOutcome> {
        match unit {
            MigrationUnit::Applications => {
                self.backfill::<Applications, _, _>(Vec::new(), move || async move {
                    Ok(source
                        .applications()
                        .await?
                        .into_iter()
                        .map(|(app_name, team)| (AppKey::new(app_name), AppMetadata { team }))
                        .collect())
                })
                .await
            }
            MigrationUnit::Environments => {
                self.backfill::<Environments, _, _>(Vec::new(), move || source.environments())
                    .await
            }
            MigrationUnit::Releases => self.migrate_releases(source).await,
            MigrationUnit::Deployments => {
                self.backfill::<Deployments, _, _>(Vec::new(), move || source.deployments())
                    .await
            }
            MigrationUnit::EnvironmentLocks => {
                self.backfill::<EnvironmentLocks, _, _>(Vec::new(), move || source.environment_locks())
                    .await
            }
            MigrationUnit::ApplicationLocks => {
                self.backfill::<ApplicationLocks, _, _>(Vec::new(), move || source.application_locks())
                    .await
            }
            MigrationUnit::TeamLocks => {
                self.backfill::<TeamLocks, _, _>(Vec::new(), move || source.team_locks())
                    .await
            }
            MigrationUnit::EslBootstrap => self.migrate_esl_bootstrap(actor).await,
            MigrationUnit::CommitEvents => self.migrate_commit_events(source).await,
        }
    }

    /// Probe in a read-only transaction.
    async fn probe<E: Entity>(&self, prefix: &[KeyValue]) -> DbResult<bool> {
        let found = self
            .with_transaction_optional(true, |h, tx| {
                let prefix = prefix.to_vec();
                Box::pin(async move { Ok(h.has_rows::<E>(tx, &prefix).await?.then_some(())) })
            })
            .await?;
        Ok(found.is_some())
    }

    /// Write `fetch`'s rows unless rows under `prefix` already exist.
    async fn backfill<E, F, Fut>(&self, prefix: Vec<KeyValue>, fetch: F) -> DbResult<MigrationOutcome>
    where
        E: Entity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<Vec<(E::Key, E::Metadata)>>>,
    {
        if self.probe::<E>(&prefix).await? {
            return Ok(MigrationOutcome::Skipped);
        }
        let rows = fetch().await?;
        let outcome = self
            .with_transaction_optional(false, |h, tx| {
                let prefix = prefix.clone();
                let rows = rows.clone();
                Box::pin(async move {
                    if h.has_rows::<E>(tx, &prefix).await? {
                        return Ok(Some(MigrationOutcome::Skipped));
                    }
                    for (key, metadata) in &rows {
                        h.upsert::<E>(tx, key, metadata, MIGRATION_MARKER_VERSION)
                            .await?;
                    }
                    tracing::debug!(table = E::TABLE.name, rows = rows.len(), "rows backfilled");
                    Ok(Some(MigrationOutcome::Done))
                })
            })
            .await?;
        Ok(outcome.unwrap_or(MigrationOutcome::Skipped))
    }

    /// One transaction per application, each gated on that application
    /// having no releases yet.
    async fn migrate_releases(&self, source: &dyn ManifestSource) -> DbResult<MigrationOutcome> {
        let apps = source.applications().await?;
        let mut outcome = MigrationOutcome::Skipped;
        for app_name in apps.keys() {
            let prefix = vec![KeyValue::from(app_name.as_str())];
            let app_outcome = self
                .backfill::<Releases, _, _>(prefix, move || async move {
                    Ok(source
                        .releases(app_name)
                        .await?
                        .into_iter()
                        .map(|(version, release)| (ReleaseKey::new(app_name, version), release))
                        .collect())
                })
                .await?;
            if app_outcome == MigrationOutcome::Done {
                tracing::info!(app = %app_name, "releases migrated");
                outcome = MigrationOutcome::Done;
            }
        }
        Ok(outcome)
    }

    async fn migrate_esl_bootstrap(&self, actor: &ActorMetadata) -> DbResult<MigrationOutcome> {
        let written = self
            .with_transaction_optional(false, |h, tx| {
                let actor = actor.clone();
                Box::pin(async move { Ok(Some(h.write_migration_marker(tx, &actor).await?)) })
            })
            .await?;
        Ok(match written {
            Some(true) => MigrationOutcome::Done,
            _ => MigrationOutcome::Skipped,
        })
    }

    async fn migrate_commit_events(&self, source: &dyn ManifestSource) -> DbResult<MigrationOutcome> {
        let present = self
            .with_transaction_optional(true, |h, tx| {
                Box::pin(async move { Ok(h.has_commit_events(tx).await?.then_some(())) })
            })
            .await?;
        if present.is_some() {
            return Ok(MigrationOutcome::Skipped);
        }
        let events = source.commit_events().await?;
        let outcome = self
            .with_transaction_optional(false, |h, tx| {
                let events = events.clone();
                Box::pin(async move {
                    if h.has_commit_events(tx).await? {
                        return Ok(Some(MigrationOutcome::Skipped));
                    }
                    for event in &events {
                        h.write_commit_event(tx, event).await?;
                    }
                    Ok(Some(MigrationOutcome::Done))
                })
            })
            .await?;
        Ok(outcome.unwrap_or(MigrationOutcome::Skipped))
    }

    /// Run each named migration not yet recorded in `go_migration_cutoff`.
    pub async fn run_custom_migrations(
        &self,
        migrations: &[NamedMigration],
    ) -> DbResult<MigrationReport> {
        let mut report = MigrationReport::default();
        for migration in migrations {
            let NamedMigration { name, run } = *migration;
            let outcome = self
                .with_transaction_optional(false, |h, tx| {
                    Box::pin(async move {
                        if h.has_go_migration_cutoff(tx, name).await? {
                            return Ok(Some(MigrationOutcome::Skipped));
                        }
                        run(h, tx).await?;
                        h.insert_go_migration_cutoff(tx, name).await?;
                        Ok(Some(MigrationOutcome::Done))
                    })
                })
                .await
                .map_err(|source| DbError::Migration {
                    name: name.to_string(),
                    source: Box::new(source),
                })?
                .unwrap_or(MigrationOutcome::Skipped);
            tracing::info!(migration = name, ?outcome, "named migration finished");
            report.push(name, outcome);
        }
        Ok(report)
    }
}

impl Persistence {
    /// Startup migrations for this mode.
    ///
    /// Disabled runs nothing. Ledger-only writes just the version-0 marker.
    /// Full runs the whole cutover followed by the built-in named migrations.
    pub async fn run_migrations(
        &self,
        source: &dyn ManifestSource,
        actor: &ActorMetadata,
    ) -> DbResult<MigrationReport> {
        match self {
            Self::Disabled => Ok(MigrationReport::default()),
            Self::LedgerOnly(handler) => {
                let unit = MigrationUnit::EslBootstrap;
                let outcome = in_unit(unit, handler.run_unit(unit, source, actor).await)?;
                let mut report = MigrationReport::default();
                report.push(unit.name(), outcome);
                Ok(report)
            }
            Self::Full(handler) => {
                let mut report = handler.run_cutover(source, actor).await?;
                let named = handler.run_custom_migrations(&builtin_migrations()).await?;
                report.steps.extend(named.steps);
                Ok(report)
            }
        }
    }
}
