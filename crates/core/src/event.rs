//! Ledger event types and the actor metadata merged into every ledger entry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Closed set of event-type tags stored in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    CreateApplicationVersion,
    DeployApplicationVersion,
    CreateUndeployApplicationVersion,
    UndeployApplication,
    DeleteEnvFromApp,
    CreateEnvironmentLock,
    DeleteEnvironmentLock,
    CreateEnvironmentTeamLock,
    DeleteEnvironmentTeamLock,
    CreateEnvironmentGroupLock,
    DeleteEnvironmentGroupLock,
    CreateEnvironment,
    CreateEnvironmentApplicationLock,
    DeleteEnvironmentApplicationLock,
    ReleaseTrain,
    /// Reserved for the version-0 migration marker.
    Migration,
}

impl EventType {
    pub const ALL: [EventType; 16] = [
        EventType::CreateApplicationVersion,
        EventType::DeployApplicationVersion,
        EventType::CreateUndeployApplicationVersion,
        EventType::UndeployApplication,
        EventType::DeleteEnvFromApp,
        EventType::CreateEnvironmentLock,
        EventType::DeleteEnvironmentLock,
        EventType::CreateEnvironmentTeamLock,
        EventType::DeleteEnvironmentTeamLock,
        EventType::CreateEnvironmentGroupLock,
        EventType::DeleteEnvironmentGroupLock,
        EventType::CreateEnvironment,
        EventType::CreateEnvironmentApplicationLock,
        EventType::DeleteEnvironmentApplicationLock,
        EventType::ReleaseTrain,
        EventType::Migration,
    ];

    /// Tag stored in the `event_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateApplicationVersion => "CreateApplicationVersion",
            Self::DeployApplicationVersion => "DeployApplicationVersion",
            Self::CreateUndeployApplicationVersion => "CreateUndeployApplicationVersion",
            Self::UndeployApplication => "UndeployApplication",
            Self::DeleteEnvFromApp => "DeleteEnvFromApp",
            Self::CreateEnvironmentLock => "CreateEnvironmentLock",
            Self::DeleteEnvironmentLock => "DeleteEnvironmentLock",
            Self::CreateEnvironmentTeamLock => "CreateEnvironmentTeamLock",
            Self::DeleteEnvironmentTeamLock => "DeleteEnvironmentTeamLock",
            Self::CreateEnvironmentGroupLock => "CreateEnvironmentGroupLock",
            Self::DeleteEnvironmentGroupLock => "DeleteEnvironmentGroupLock",
            Self::CreateEnvironment => "CreateEnvironment",
            Self::CreateEnvironmentApplicationLock => "CreateEnvironmentApplicationLock",
            Self::DeleteEnvironmentApplicationLock => "DeleteEnvironmentApplicationLock",
            Self::ReleaseTrain => "ReleaseTrain",
            Self::Migration => "Migration",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownEventType(s.to_string()))
    }
}

/// Who caused a mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorMetadata {
    pub author_name: String,
    pub author_email: String,
}

impl ActorMetadata {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }
}

/// Key under which actor metadata is stored in a ledger document.
pub const ACTOR_METADATA_KEY: &str = "metadata";

/// Merge a mutation payload and its actor into one ledger document.
///
/// Object payloads gain a `metadata` member; any other payload is nested
/// under `data`. An existing `metadata` member of the payload is replaced.
pub fn merge_actor(payload: Value, actor: &ActorMetadata) -> Value {
    let actor = Value::Object(Map::from_iter([
        (
            "authorName".to_string(),
            Value::String(actor.author_name.clone()),
        ),
        (
            "authorEmail".to_string(),
            Value::String(actor.author_email.clone()),
        ),
    ]));
    let mut document = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("data".to_string(), other)]),
    };
    document.insert(ACTOR_METADATA_KEY.to_string(), actor);
    Value::Object(document)
}
