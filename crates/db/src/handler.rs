//! PostgreSQL connection handling and schema bootstrap.

use crate::error::{DbError, DbResult};
use crate::query::schema_statements;
use kuberpult_core::config::{DatabaseConfig, PgSslMode, SyncStatusConfig, TransactionConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Advisory lock id serializing concurrent schema bootstraps.
const SCHEMA_LOCK_ID: i64 = 665;

/// Handle to the persistence database.
///
/// Cheap to clone: clones share one connection pool. No rows are cached
/// here; every read happens inside a transaction.
#[derive(Clone, Debug)]
pub struct DbHandler {
    pool: Pool<Postgres>,
    transactions: TransactionConfig,
    sync_status: SyncStatusConfig,
}

/// Build connection options from `config`.
///
/// A URL wins over the individual fields; `ssl_mode` and the statement
/// timeout apply to both.
pub fn connect_options(config: &DatabaseConfig) -> DbResult<PgConnectOptions> {
    let mut opts = match (&config.url, &config.host, &config.database) {
        (Some(url), _, _) => PgConnectOptions::from_str(url)?,
        (None, Some(host), Some(database)) => {
            let mut opts = PgConnectOptions::new()
                .host(host)
                .port(config.port.unwrap_or(5432))
                .database(database);
            if let Some(user) = &config.username {
                opts = opts.username(user);
            }
            if let Some(password) = &config.password {
                opts = opts.password(password);
            }
            opts
        }
        _ => {
            return Err(DbError::Config(
                "database config requires either 'url' or 'host' + 'database'".to_string(),
            ));
        }
    };

    if let Some(mode) = config.ssl_mode {
        opts = opts.ssl_mode(match mode {
            PgSslMode::Disable => SqlxPgSslMode::Disable,
            PgSslMode::Prefer => SqlxPgSslMode::Prefer,
            PgSslMode::Require => SqlxPgSslMode::Require,
        });
    }
    if let Some(timeout_ms) = config.statement_timeout_ms {
        opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
    }
    Ok(opts)
}

impl DbHandler {
    /// Connect using a [`DatabaseConfig`] and apply the embedded schema.
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        config.validate().map_err(DbError::Config)?;
        let opts = connect_options(config)?;
        tracing::info!(
            host = opts.get_host(),
            port = opts.get_port(),
            database = opts.get_database().unwrap_or("<default>"),
            max_connections = config.max_connections,
            statement_timeout_ms = ?config.statement_timeout_ms,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await?;
        let handler = Self {
            pool,
            transactions: TransactionConfig::default(),
            sync_status: SyncStatusConfig::default(),
        };
        handler.migrate_schema().await?;
        Ok(handler)
    }

    /// Override retry behaviour.
    pub fn with_transaction_config(mut self, transactions: TransactionConfig) -> Self {
        self.transactions = transactions;
        self
    }

    /// Override git-sync bulk write settings.
    pub fn with_sync_status_config(mut self, sync_status: SyncStatusConfig) -> Self {
        self.sync_status = sync_status;
        self
    }

    /// Get a reference to the connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub fn transaction_config(&self) -> &TransactionConfig {
        &self.transactions
    }

    pub fn sync_batch_size(&self) -> usize {
        self.sync_status.batch_size
    }

    /// Apply the embedded schema. Safe to run concurrently from several
    /// processes: statements run in one transaction behind an advisory lock.
    pub async fn migrate_schema(&self) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_ID)
            .execute(&mut *tx)
            .await?;
        let statements = schema_statements(POSTGRES_SCHEMA);
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!(statements = statements.len(), "schema applied");
        Ok(())
    }

    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
