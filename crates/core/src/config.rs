//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};

/// Top-level persistence configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DbConfig {
    /// Which writes reach the database.
    #[serde(default)]
    pub persistence: PersistenceMode,
    /// Connection settings. Required unless persistence is disabled.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Transaction retry behaviour.
    #[serde(default)]
    pub transactions: TransactionConfig,
    /// Git-sync bulk write settings.
    #[serde(default)]
    pub sync_status: SyncStatusConfig,
}

impl DbConfig {
    /// Validate the configuration as a whole.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.persistence, &self.database) {
            (PersistenceMode::Disabled, _) => {}
            (mode, None) => {
                return Err(format!(
                    "persistence mode '{}' requires a [database] section",
                    mode.as_str()
                ));
            }
            (_, Some(database)) => database.validate()?,
        }
        self.transactions.validate()?;
        self.sync_status.validate()
    }
}

/// Runtime persistence mode, selected once at startup.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// No database access at all.
    Disabled,
    /// Only the event ledger is written.
    LedgerOnly,
    /// Ledger plus current-state and history tables (default).
    #[default]
    Full,
}

impl PersistenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::LedgerOnly => "ledger_only",
            Self::Full => "full",
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Database connection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Driver name. Only "postgres" is supported: advisory locks and
    /// serializable isolation are Postgres features.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Connection URL (optional if using individual fields).
    /// Takes precedence over individual fields if both are provided.
    pub url: Option<String>,
    /// Database host (e.g., "localhost" or "db.example.com").
    pub host: Option<String>,
    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: Option<u16>,
    /// Database username.
    pub username: Option<String>,
    /// Database password.
    /// WARNING: Prefer KUBERPULT_DATABASE__PASSWORD env var over storing in config.
    pub password: Option<String>,
    /// Database name.
    pub database: Option<String>,
    /// SSL mode for connections.
    pub ssl_mode: Option<PgSslMode>,
    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Statement timeout in milliseconds. PostgreSQL cancels statements
    /// that exceed it, which rolls back the enclosing transaction.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: Option<u64>,
}

fn default_driver() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

impl DatabaseConfig {
    /// Connection config from a URL with every other field defaulted.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            driver: default_driver(),
            url: Some(url.into()),
            host: None,
            port: default_pg_port(),
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: default_max_connections(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.driver.as_str(), "postgres" | "postgresql") {
            return Err(format!(
                "unsupported database driver '{}', only 'postgres' is supported",
                self.driver
            ));
        }
        if self.max_connections == 0 {
            return Err("database.max_connections must be at least 1".to_string());
        }
        // Must have either url OR (host + database)
        match (self.url.as_ref(), self.host.as_ref(), self.database.as_ref()) {
            (Some(_), _, _) => Ok(()),
            (None, Some(_), Some(_)) => Ok(()),
            (None, None, _) => {
                Err("database config requires either 'url' or 'host' + 'database'".to_string())
            }
            (None, Some(_), None) => Err(
                "database config requires 'database' when using individual fields".to_string(),
            ),
        }
    }
}

/// Transaction retry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Extra attempts after a retryable failure (serialization conflict,
    /// deadlock, lock not available).
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Pause before each retry, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_retries() -> u8 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_delay_ms > 60_000 {
            return Err(format!(
                "transactions.retry_delay_ms {} exceeds 60000",
                self.retry_delay_ms
            ));
        }
        Ok(())
    }
}

/// Git-sync status configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncStatusConfig {
    /// Rows per multi-row insert statement. Tuning this never changes results.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    500
}

impl Default for SyncStatusConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl SyncStatusConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Postgres caps bind parameters at 65535; each row binds 5.
        if self.batch_size == 0 || self.batch_size > 13_000 {
            return Err(format!(
                "sync_status.batch_size must be between 1 and 13000, got {}",
                self.batch_size
            ));
        }
        Ok(())
    }
}
