//! Entity families: natural keys, metadata documents and table layouts.

use crate::entity::{Entity, EntityKey, EntityTable, KeyColumn, KeyValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Conversion between a key field and its column value.
trait KeyPart: Sized {
    fn to_value(&self) -> KeyValue;
    fn from_value(value: KeyValue) -> Option<Self>;
}

impl KeyPart for String {
    fn to_value(&self) -> KeyValue {
        KeyValue::Text(self.clone())
    }

    fn from_value(value: KeyValue) -> Option<Self> {
        match value {
            KeyValue::Text(text) => Some(text),
            KeyValue::Int(_) => None,
        }
    }
}

impl KeyPart for i64 {
    fn to_value(&self) -> KeyValue {
        KeyValue::Int(*self)
    }

    fn from_value(value: KeyValue) -> Option<Self> {
        match value {
            KeyValue::Int(int) => Some(int),
            KeyValue::Text(_) => None,
        }
    }
}

macro_rules! entity_key {
    ($(#[$meta:meta])* $name:ident { $($field:ident: $ty:ty),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $(pub $field: $ty,)+
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub fn new($($field: impl Into<$ty>),+) -> Self {
                Self { $($field: $field.into(),)+ }
            }
        }

        impl EntityKey for $name {
            fn to_values(&self) -> Vec<KeyValue> {
                vec![$(KeyPart::to_value(&self.$field)),+]
            }

            fn from_values(values: Vec<KeyValue>) -> Option<Self> {
                let mut values = values.into_iter();
                let key = Self {
                    $($field: <$ty as KeyPart>::from_value(values.next()?)?,)+
                };
                values.next().is_none().then_some(key)
            }
        }
    };
}

// ============================================================================
// Keys
// ============================================================================

entity_key!(AppKey { app_name: String });
entity_key!(EnvKey { env_name: String });
entity_key!(ReleaseKey { app_name: String, release_version: i64 });
entity_key!(DeploymentKey { app_name: String, env_name: String });
entity_key!(EnvLockKey { env_name: String, lock_id: String });
entity_key!(AppLockKey { env_name: String, app_name: String, lock_id: String });
entity_key!(TeamLockKey { env_name: String, team_name: String, lock_id: String });

// ============================================================================
// Metadata documents
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppMetadata {
    pub team: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Upstream {
    pub environment: Option<String>,
    pub latest: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentMetadata {
    pub upstream: Option<Upstream>,
    pub environment_group: Option<String>,
    /// Applications deployed to this environment.
    pub applications: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseMetadata {
    pub source_commit_id: String,
    pub source_author: String,
    pub source_message: String,
    pub display_version: String,
    pub is_minor: bool,
    pub is_prepublish: bool,
    /// Rendered manifest per environment.
    pub manifests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentMetadata {
    /// `None` means undeployed.
    pub release_version: Option<i64>,
    pub deployed_by_name: String,
    pub deployed_by_email: String,
    pub ci_link: String,
}

/// Shared by environment, application and team locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockMetadata {
    pub created_by_name: String,
    pub created_by_email: String,
    pub message: String,
    pub ci_link: String,
    pub suggested_lifetime: String,
}

// ============================================================================
// Entity families
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Applications;

impl Entity for Applications {
    type Key = AppKey;
    type Metadata = AppMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "apps",
        history: "apps_history",
        key: &[KeyColumn::text("app_name")],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct Environments;

impl Entity for Environments {
    type Key = EnvKey;
    type Metadata = EnvironmentMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "environments",
        history: "environments_history",
        key: &[KeyColumn::text("env_name")],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct Releases;

impl Entity for Releases {
    type Key = ReleaseKey;
    type Metadata = ReleaseMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "releases",
        history: "releases_history",
        key: &[KeyColumn::text("app_name"), KeyColumn::int("release_version")],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deployments;

impl Entity for Deployments {
    type Key = DeploymentKey;
    type Metadata = DeploymentMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "deployments",
        history: "deployments_history",
        key: &[KeyColumn::text("app_name"), KeyColumn::text("env_name")],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentLocks;

impl Entity for EnvironmentLocks {
    type Key = EnvLockKey;
    type Metadata = LockMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "environment_locks",
        history: "environment_locks_history",
        key: &[KeyColumn::text("env_name"), KeyColumn::text("lock_id")],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationLocks;

impl Entity for ApplicationLocks {
    type Key = AppLockKey;
    type Metadata = LockMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "app_locks",
        history: "app_locks_history",
        key: &[
            KeyColumn::text("env_name"),
            KeyColumn::text("app_name"),
            KeyColumn::text("lock_id"),
        ],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeamLocks;

impl Entity for TeamLocks {
    type Key = TeamLockKey;
    type Metadata = LockMetadata;
    const TABLE: EntityTable = EntityTable {
        name: "team_locks",
        history: "team_locks_history",
        key: &[
            KeyColumn::text("env_name"),
            KeyColumn::text("team_name"),
            KeyColumn::text("lock_id"),
        ],
    };
}
