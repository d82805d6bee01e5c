//! Manifest repository export read from a JSON file.
//!
//! ```json
//! {
//!   "applications": {
//!     "billing": { "team": "payments", "releases": [{ "version": 1, "sourceCommitId": "abc" }] }
//!   },
//!   "environments": { "dev": { "environmentGroup": "development" } },
//!   "deployments": [{ "appName": "billing", "envName": "dev", "releaseVersion": 1 }],
//!   "environmentLocks": [{ "envName": "dev", "lockId": "freeze", "message": "release day" }],
//!   "applicationLocks": [],
//!   "teamLocks": [],
//!   "commitEvents": []
//! }
//! ```

use async_trait::async_trait;
use kuberpult_db::models::{
    AppLockKey, DeploymentKey, DeploymentMetadata, EnvKey, EnvLockKey, EnvironmentMetadata,
    LockMetadata, ReleaseMetadata, TeamLockKey,
};
use kuberpult_db::{DbError, DbResult, ManifestSource, NewCommitEvent};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A natural key and its metadata, flattened into one JSON object.
#[derive(Debug, Clone, Deserialize)]
struct Keyed<K, M> {
    #[serde(flatten)]
    key: K,
    #[serde(flatten)]
    metadata: M,
}

impl<K, M> Keyed<K, M> {
    fn into_pair(self) -> (K, M) {
        (self.key, self.metadata)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseExport {
    version: i64,
    #[serde(flatten)]
    metadata: ReleaseMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ApplicationExport {
    team: String,
    releases: Vec<ReleaseExport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ManifestExport {
    applications: BTreeMap<String, ApplicationExport>,
    environments: BTreeMap<String, EnvironmentMetadata>,
    deployments: Vec<Keyed<DeploymentKey, DeploymentMetadata>>,
    environment_locks: Vec<Keyed<EnvLockKey, LockMetadata>>,
    application_locks: Vec<Keyed<AppLockKey, LockMetadata>>,
    team_locks: Vec<Keyed<TeamLockKey, LockMetadata>>,
    commit_events: Vec<NewCommitEvent>,
}

/// [`ManifestSource`] over a JSON export of the manifest repository.
#[derive(Debug, Clone)]
pub struct FileManifestSource {
    export: ManifestExport,
}

impl FileManifestSource {
    pub fn load(path: &Path) -> DbResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DbError::Source(format!("failed to read manifest {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
            .map_err(|e| DbError::Source(format!("invalid manifest {}: {e}", path.display())))
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            export: serde_json::from_str(raw)?,
        })
    }

    pub fn application_count(&self) -> usize {
        self.export.applications.len()
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn applications(&self) -> DbResult<BTreeMap<String, String>> {
        Ok(self
            .export
            .applications
            .iter()
            .map(|(name, app)| (name.clone(), app.team.clone()))
            .collect())
    }

    async fn environments(&self) -> DbResult<Vec<(EnvKey, EnvironmentMetadata)>> {
        Ok(self
            .export
            .environments
            .iter()
            .map(|(name, config)| (EnvKey::new(name), config.clone()))
            .collect())
    }

    async fn releases(&self, app_name: &str) -> DbResult<Vec<(i64, ReleaseMetadata)>> {
        Ok(self
            .export
            .applications
            .get(app_name)
            .map(|app| {
                app.releases
                    .iter()
                    .map(|release| (release.version, release.metadata.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn deployments(&self) -> DbResult<Vec<(DeploymentKey, DeploymentMetadata)>> {
        Ok(pairs(&self.export.deployments))
    }

    async fn environment_locks(&self) -> DbResult<Vec<(EnvLockKey, LockMetadata)>> {
        Ok(pairs(&self.export.environment_locks))
    }

    async fn application_locks(&self) -> DbResult<Vec<(AppLockKey, LockMetadata)>> {
        Ok(pairs(&self.export.application_locks))
    }

    async fn team_locks(&self) -> DbResult<Vec<(TeamLockKey, LockMetadata)>> {
        Ok(pairs(&self.export.team_locks))
    }

    async fn commit_events(&self) -> DbResult<Vec<NewCommitEvent>> {
        Ok(self.export.commit_events.clone())
    }
}

fn pairs<K: Clone, M: Clone>(entries: &[Keyed<K, M>]) -> Vec<(K, M)> {
    entries.iter().cloned().map(Keyed::into_pair).collect()
}
