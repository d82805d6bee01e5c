//! Git-sync status values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a change has propagated to the manifest repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Synced,
    Unsynced,
    SyncFailed,
}

impl SyncStatus {
    /// Integer stored in the `status` column.
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Synced => 0,
            Self::Unsynced => 1,
            Self::SyncFailed => 2,
        }
    }

    pub fn from_i16(value: i16) -> crate::Result<Self> {
        match value {
            0 => Ok(Self::Synced),
            1 => Ok(Self::Unsynced),
            2 => Ok(Self::SyncFailed),
            other => Err(crate::Error::InvalidSyncStatus(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::Unsynced => "UNSYNCED",
            Self::SyncFailed => "SYNC_FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "SYNCED" => Ok(Self::Synced),
            "UNSYNCED" => Ok(Self::Unsynced),
            "SYNC_FAILED" => Ok(Self::SyncFailed),
            _ => Err(crate::Error::InvalidSyncStatus(s.to_string())),
        }
    }
}

/// An `(environment, application)` pair touched by a transformer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvApp {
    pub env_name: String,
    pub app_name: String,
}

impl EnvApp {
    pub fn new(env_name: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            env_name: env_name.into(),
            app_name: app_name.into(),
        }
    }
}

impl fmt::Display for EnvApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.env_name, self.app_name)
    }
}
