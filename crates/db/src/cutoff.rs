//! Cutoff markers: how far an external consumer has processed the ledger,
//! and which named code migrations have completed.

use crate::error::{DbResult, QueryContext};
use crate::handler::DbHandler;
use crate::transaction::DbTx;
use kuberpult_core::EslVersion;

impl DbHandler {
    /// Highest processed ledger version, if any was recorded.
    pub async fn read_cutoff(&self, tx: &mut DbTx) -> DbResult<Option<EslVersion>> {
        sqlx::query_scalar::<_, i64>("SELECT esl_version FROM cutoff ORDER BY esl_version DESC LIMIT 1")
            .fetch_optional(tx.conn())
            .await
            .context(|| "read cutoff".to_string())
    }

    /// Record that the ledger was processed up to `version`. Append-only.
    pub async fn write_cutoff(&self, tx: &mut DbTx, version: EslVersion) -> DbResult<()> {
        let processed = tx.now().await?;
        sqlx::query("INSERT INTO cutoff (esl_version, processed_time) VALUES ($1, $2)")
            .bind(version)
            .bind(processed)
            .execute(tx.conn())
            .await
            .context(|| format!("write cutoff {version}"))?;
        Ok(())
    }

    pub async fn has_go_migration_cutoff(&self, tx: &mut DbTx, name: &str) -> DbResult<bool> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT migration_name FROM go_migration_cutoff WHERE migration_name = $1",
        )
        .bind(name)
        .fetch_optional(tx.conn())
        .await
        .context(|| format!("read migration cutoff '{name}'"))?;
        Ok(found.is_some())
    }

    /// Mark the named migration as done.
    pub async fn insert_go_migration_cutoff(&self, tx: &mut DbTx, name: &str) -> DbResult<()> {
        let done_at = tx.now().await?;
        sqlx::query(
            "INSERT INTO go_migration_cutoff (migration_name, migration_done_at) VALUES ($1, $2)",
        )
        .bind(name)
        .bind(done_at)
        .execute(tx.conn())
        .await
        .context(|| format!("write migration cutoff '{name}'"))?;
        Ok(())
    }
}
