//! Test fixtures: actors and an in-memory manifest source.

use async_trait::async_trait;
use kuberpult_core::ActorMetadata;
use kuberpult_db::models::{
    AppLockKey, DeploymentKey, DeploymentMetadata, EnvKey, EnvLockKey, EnvironmentMetadata,
    LockMetadata, ReleaseMetadata, TeamLockKey,
};
use kuberpult_db::{DbError, DbResult, ManifestSource, NewCommitEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[allow(dead_code)]
pub fn actor() -> ActorMetadata {
    ActorMetadata::new("Test Author", "author@example.com")
}

#[allow(dead_code)]
pub fn lock(message: &str) -> LockMetadata {
    LockMetadata {
        created_by_name: "Test Author".to_string(),
        created_by_email: "author@example.com".to_string(),
        message: message.to_string(),
        ..LockMetadata::default()
    }
}

/// Manifest repository contents held in memory.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemorySource {
    pub applications: BTreeMap<String, String>,
    pub environments: Vec<(EnvKey, EnvironmentMetadata)>,
    pub releases: BTreeMap<String, Vec<(i64, ReleaseMetadata)>>,
    pub deployments: Vec<(DeploymentKey, DeploymentMetadata)>,
    pub environment_locks: Vec<(EnvLockKey, LockMetadata)>,
    pub application_locks: Vec<(AppLockKey, LockMetadata)>,
    pub team_locks: Vec<(TeamLockKey, LockMetadata)>,
    pub commit_events: Vec<NewCommitEvent>,
    /// Release reads fail for this application.
    pub failing_app: Option<String>,
    /// Number of calls made to the source.
    pub reads: AtomicUsize,
}

#[allow(dead_code)]
impl MemorySource {
    /// Two applications on two environments with one lock of each kind.
    pub fn sample() -> Self {
        let mut source = Self::default();
        source
            .applications
            .insert("billing".to_string(), "payments".to_string());
        source
            .applications
            .insert("search".to_string(), "discovery".to_string());
        source.environments = vec![
            (EnvKey::new("dev"), EnvironmentMetadata::default()),
            (EnvKey::new("prod"), EnvironmentMetadata::default()),
        ];
        for app in ["billing", "search"] {
            source.releases.insert(
                app.to_string(),
                (1..=3)
                    .map(|version| {
                        (
                            version,
                            ReleaseMetadata {
                                source_commit_id: format!("{app}-{version}"),
                                ..ReleaseMetadata::default()
                            },
                        )
                    })
                    .collect(),
            );
        }
        source.deployments = vec![(
            DeploymentKey::new("billing", "dev"),
            DeploymentMetadata {
                release_version: Some(3),
                ..DeploymentMetadata::default()
            },
        )];
        source.environment_locks = vec![(EnvLockKey::new("prod", "freeze"), lock("code freeze"))];
        source.application_locks = vec![(AppLockKey::new("dev", "search", "l1"), lock("broken"))];
        source.team_locks = vec![(TeamLockKey::new("prod", "payments", "t1"), lock("audit"))];
        source
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ManifestSource for MemorySource {
    async fn applications(&self) -> DbResult<BTreeMap<String, String>> {
        self.read();
        Ok(self.applications.clone())
    }

    async fn environments(&self) -> DbResult<Vec<(EnvKey, EnvironmentMetadata)>> {
        self.read();
        Ok(self.environments.clone())
    }

    async fn releases(&self, app_name: &str) -> DbResult<Vec<(i64, ReleaseMetadata)>> {
        self.read();
        if self.failing_app.as_deref() == Some(app_name) {
            return Err(DbError::Source(format!("cannot read releases of {app_name}")));
        }
        Ok(self.releases.get(app_name).cloned().unwrap_or_default())
    }

    async fn deployments(&self) -> DbResult<Vec<(DeploymentKey, DeploymentMetadata)>> {
        self.read();
        Ok(self.deployments.clone())
    }

    async fn environment_locks(&self) -> DbResult<Vec<(EnvLockKey, LockMetadata)>> {
        self.read();
        Ok(self.environment_locks.clone())
    }

    async fn application_locks(&self) -> DbResult<Vec<(AppLockKey, LockMetadata)>> {
        self.read();
        Ok(self.application_locks.clone())
    }

    async fn team_locks(&self) -> DbResult<Vec<(TeamLockKey, LockMetadata)>> {
        self.read();
        Ok(self.team_locks.clone())
    }

    async fn commit_events(&self) -> DbResult<Vec<NewCommitEvent>> {
        self.read();
        Ok(self.commit_events.clone())
    }
}
