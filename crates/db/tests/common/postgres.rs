//! PostgreSQL test database backed by a testcontainer.

use kuberpult_core::PersistenceMode;
use kuberpult_core::config::DatabaseConfig;
use kuberpult_db::{DbError, DbHandler, DbResult, Persistence};
use sqlx::{Pool, Postgres as SqlxPostgres};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A migrated database in its own container, removed on drop.
#[allow(dead_code)]
pub struct PostgresTestDb {
    pub handler: DbHandler,
    pub url: String,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl PostgresTestDb {
    pub async fn new() -> DbResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                DbError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
        let handler = DbHandler::from_config(&database_config(&url)).await?;

        Ok(Self {
            handler,
            url,
            _container: container,
        })
    }

    pub fn handler(&self) -> &DbHandler {
        &self.handler
    }

    /// Raw pool for assertions that bypass the handler.
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.handler.pool()
    }

    pub fn persistence(&self, mode: PersistenceMode) -> Persistence {
        Persistence::with_handler(mode, self.handler.clone())
    }

    /// A second handler with its own pool on the same database.
    pub async fn second_handler(&self) -> DbHandler {
        DbHandler::from_config(&database_config(&self.url))
            .await
            .expect("Failed to connect second handler")
    }
}

fn database_config(url: &str) -> DatabaseConfig {
    let mut config = DatabaseConfig::from_url(url);
    config.max_connections = 5;
    config.statement_timeout_ms = None;
    config
}

/// Try to create a PostgreSQL test database, skipping if Docker is
/// unavailable or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
/// Schema or connection errors still panic so real regressions are not
/// silently swallowed.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestDb> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestDb::new().await {
        Ok(db) => Some(db),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Count rows of a table. Table names are test constants.
#[allow(dead_code)]
pub async fn count_rows(pool: &Pool<SqlxPostgres>, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("Failed to count rows")
}
