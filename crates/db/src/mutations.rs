//! Concrete mutations recorded through [`Persistence::record`](crate::Persistence::record).

use crate::entity::DeletionMetadata;
use crate::error::{DbError, DbResult};
use crate::handler::DbHandler;
use crate::models::{
    AppKey, AppLockKey, AppMetadata, ApplicationLocks, Applications, DeploymentKey,
    DeploymentMetadata, Deployments, EnvKey, EnvLockKey, EnvironmentLocks, EnvironmentMetadata,
    Environments, LockMetadata, ReleaseKey, ReleaseMetadata, Releases, TeamLockKey, TeamLocks,
};
use crate::persistence::Mutation;
use crate::transaction::DbTx;
use async_trait::async_trait;
use kuberpult_core::{EnvApp, EslVersion, EventType, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn to_payload<T: Serialize>(value: &T, event_type: EventType) -> DbResult<Value> {
    serde_json::to_value(value).map_err(|source| DbError::Marshal {
        what: format!("{event_type} payload"),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironment {
    pub env_name: String,
    pub config: EnvironmentMetadata,
}

#[async_trait]
impl Mutation for CreateEnvironment {
    fn event_type(&self) -> EventType {
        EventType::CreateEnvironment
    }

    fn payload(&self) -> DbResult<Value> {
        to_payload(self, self.event_type())
    }

    async fn apply(&self, handler: &DbHandler, tx: &mut DbTx, esl_version: EslVersion) -> DbResult<()> {
        handler
            .upsert::<Environments>(tx, &EnvKey::new(&self.env_name), &self.config, esl_version)
            .await
    }
}

/// A new release of an application. Creates the application on first use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApplicationVersion {
    pub app_name: String,
    pub team: String,
    pub release_version: i64,
    pub release: ReleaseMetadata,
}

#[async_trait]
impl Mutation for CreateApplicationVersion {
    fn event_type(&self) -> EventType {
        EventType::CreateApplicationVersion
    }

    fn payload(&self) -> DbResult<Value> {
        to_payload(self, self.event_type())
    }

    async fn apply(&self, handler: &DbHandler, tx: &mut DbTx, esl_version: EslVersion) -> DbResult<()> {
        let app = AppKey::new(&self.app_name);
        let metadata = AppMetadata {
            team: self.team.clone(),
        };
        let unchanged = handler
            .select::<Applications>(tx, &app)
            .await?
            .is_some_and(|row| row.metadata == metadata);
        if !unchanged {
            handler
                .upsert::<Applications>(tx, &app, &metadata, esl_version)
                .await?;
        }
        handler
            .upsert::<Releases>(
                tx,
                &ReleaseKey::new(&self.app_name, self.release_version),
                &self.release,
                esl_version,
            )
            .await
    }
}

/// Deploy (or with `release_version: None`, undeploy) an application on an
/// environment. The pair becomes UNSYNCED under this event's version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployApplicationVersion {
    pub app_name: String,
    pub env_name: String,
    pub deployment: DeploymentMetadata,
}

#[async_trait]
impl Mutation for DeployApplicationVersion {
    fn event_type(&self) -> EventType {
        if self.deployment.release_version.is_some() {
            EventType::DeployApplicationVersion
        } else {
            EventType::UndeployApplication
        }
    }

    fn payload(&self) -> DbResult<Value> {
        to_payload(self, self.event_type())
    }

    async fn apply(&self, handler: &DbHandler, tx: &mut DbTx, esl_version: EslVersion) -> DbResult<()> {
        handler
            .upsert::<Deployments>(
                tx,
                &DeploymentKey::new(&self.app_name, &self.env_name),
                &self.deployment,
                esl_version,
            )
            .await?;
        handler
            .write_sync_event(
                tx,
                esl_version,
                &EnvApp::new(&self.env_name, &self.app_name),
                SyncStatus::Unsynced,
            )
            .await
    }
}

/// Create or replace a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "scope")]
pub enum CreateLock {
    Environment {
        env_name: String,
        lock_id: String,
        metadata: LockMetadata,
    },
    Application {
        env_name: String,
        app_name: String,
        lock_id: String,
        metadata: LockMetadata,
    },
    Team {
        env_name: String,
        team_name: String,
        lock_id: String,
        metadata: LockMetadata,
    },
}

#[async_trait]
impl Mutation for CreateLock {
    fn event_type(&self) -> EventType {
        match self {
            Self::Environment { .. } => EventType::CreateEnvironmentLock,
            Self::Application { .. } => EventType::CreateEnvironmentApplicationLock,
            Self::Team { .. } => EventType::CreateEnvironmentTeamLock,
        }
    }

    fn payload(&self) -> DbResult<Value> {
        to_payload(self, self.event_type())
    }

    async fn apply(&self, handler: &DbHandler, tx: &mut DbTx, esl_version: EslVersion) -> DbResult<()> {
        match self {
            Self::Environment {
                env_name,
                lock_id,
                metadata,
            } => {
                let key = EnvLockKey::new(env_name, lock_id);
                handler
                    .upsert::<EnvironmentLocks>(tx, &key, metadata, esl_version)
                    .await
            }
            Self::Application {
                env_name,
                app_name,
                lock_id,
                metadata,
            } => {
                let key = AppLockKey::new(env_name, app_name, lock_id);
                handler
                    .upsert::<ApplicationLocks>(tx, &key, metadata, esl_version)
                    .await
            }
            Self::Team {
                env_name,
                team_name,
                lock_id,
                metadata,
            } => {
                let key = TeamLockKey::new(env_name, team_name, lock_id);
                handler
                    .upsert::<TeamLocks>(tx, &key, metadata, esl_version)
                    .await
            }
        }
    }
}

/// Remove a lock. Removing an absent lock is not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "scope")]
pub enum DeleteLock {
    Environment {
        env_name: String,
        lock_id: String,
        deletion: DeletionMetadata,
    },
    Application {
        env_name: String,
        app_name: String,
        lock_id: String,
        deletion: DeletionMetadata,
    },
    Team {
        env_name: String,
        team_name: String,
        lock_id: String,
        deletion: DeletionMetadata,
    },
}

#[async_trait]
impl Mutation for DeleteLock {
    fn event_type(&self) -> EventType {
        match self {
            Self::Environment { .. } => EventType::DeleteEnvironmentLock,
            Self::Application { .. } => EventType::DeleteEnvironmentApplicationLock,
            Self::Team { .. } => EventType::DeleteEnvironmentTeamLock,
        }
    }

    fn payload(&self) -> DbResult<Value> {
        to_payload(self, self.event_type())
    }

    async fn apply(&self, handler: &DbHandler, tx: &mut DbTx, esl_version: EslVersion) -> DbResult<()> {
        match self {
            Self::Environment {
                env_name,
                lock_id,
                deletion,
            } => {
                let key = EnvLockKey::new(env_name, lock_id);
                handler
                    .delete::<EnvironmentLocks>(tx, &key, deletion, esl_version)
                    .await?;
            }
            Self::Application {
                env_name,
                app_name,
                lock_id,
                deletion,
            } => {
                let key = AppLockKey::new(env_name, app_name, lock_id);
                handler
                    .delete::<ApplicationLocks>(tx, &key, deletion, esl_version)
                    .await?;
            }
            Self::Team {
                env_name,
                team_name,
                lock_id,
                deletion,
            } => {
                let key = TeamLockKey::new(env_name, team_name, lock_id);
                handler
                    .delete::<TeamLocks>(tx, &key, deletion, esl_version)
                    .await?;
            }
        }
        Ok(())
    }
}
