//! Git-sync status tracking per `(environment, application)`.
//!
//! Every write path upserts by `(env_name, app_name)`, so the row for a key
//! is always its current status.

use crate::error::{DbResult, QueryContext};
use crate::handler::DbHandler;
use crate::transaction::DbTx;
use kuberpult_core::{EnvApp, SyncStatus, TransformerId};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::HashSet;
use time::OffsetDateTime;

const UPSERT_CONFLICT: &str = " ON CONFLICT (env_name, app_name) DO UPDATE SET \
     transformer_id = excluded.transformer_id, status = excluded.status, created = excluded.created";

/// Current sync state of one `(environment, application)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSyncRow {
    pub transformer_id: TransformerId,
    pub env_app: EnvApp,
    pub status: SyncStatus,
    pub created: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct SyncRow {
    env_name: String,
    app_name: String,
    transformer_id: i64,
    status: i16,
    created: OffsetDateTime,
}

impl TryFrom<SyncRow> for GitSyncRow {
    type Error = crate::error::DbError;

    fn try_from(row: SyncRow) -> DbResult<Self> {
        Ok(Self {
            transformer_id: row.transformer_id,
            env_app: EnvApp::new(row.env_name, row.app_name),
            status: SyncStatus::from_i16(row.status)?,
            created: row.created,
        })
    }
}

#[derive(Debug, FromRow)]
struct EnvAppRow {
    env_name: String,
    app_name: String,
}

impl From<EnvAppRow> for EnvApp {
    fn from(row: EnvAppRow) -> Self {
        EnvApp::new(row.env_name, row.app_name)
    }
}

/// Drop repeated pairs, keeping first-seen order. One multi-row upsert may
/// not touch the same key twice.
pub(crate) fn dedup_env_apps(env_apps: &[EnvApp]) -> Vec<&EnvApp> {
    let mut seen = HashSet::with_capacity(env_apps.len());
    env_apps
        .iter()
        .filter(|env_app| seen.insert((&env_app.env_name, &env_app.app_name)))
        .collect()
}

/// Number of statements needed for `rows` rows: full batches plus the tail.
pub fn batch_count(rows: usize, batch_size: usize) -> usize {
    rows.div_ceil(batch_size.max(1))
}

impl DbHandler {
    /// Record the status of one pair.
    pub async fn write_sync_event(
        &self,
        tx: &mut DbTx,
        transformer_id: TransformerId,
        env_app: &EnvApp,
        status: SyncStatus,
    ) -> DbResult<()> {
        self.write_sync_events_bulk(tx, transformer_id, std::slice::from_ref(env_app), status)
            .await?;
        Ok(())
    }

    /// Record the same status for many pairs, one multi-row upsert per batch.
    ///
    /// Returns the number of statements issued.
    pub async fn write_sync_events_bulk(
        &self,
        tx: &mut DbTx,
        transformer_id: TransformerId,
        env_apps: &[EnvApp],
        status: SyncStatus,
    ) -> DbResult<usize> {
        let rows = dedup_env_apps(env_apps);
        if rows.is_empty() {
            return Ok(0);
        }
        let created = tx.now().await?;
        let batch_size = self.sync_batch_size().max(1);
        let mut batches = 0;
        for batch in rows.chunks(batch_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO git_sync_status (env_name, app_name, transformer_id, status, created) ",
            );
            builder.push_values(batch, |mut row, env_app| {
                row.push_bind(env_app.env_name.clone())
                    .push_bind(env_app.app_name.clone())
                    .push_bind(transformer_id)
                    .push_bind(status.as_i16())
                    .push_bind(created);
            });
            builder.push(UPSERT_CONFLICT);
            builder
                .build()
                .execute(tx.conn())
                .await
                .context(|| {
                    format!(
                        "write sync status batch {} for transformer {transformer_id}",
                        batches + 1
                    )
                })?;
            batches += 1;
        }
        tracing::debug!(
            transformer_id,
            rows = rows.len(),
            batches,
            status = %status,
            "sync status written"
        );
        Ok(batches)
    }

    /// Pairs of a transformer that are still UNSYNCED.
    pub async fn read_unsynced_for_transformer(
        &self,
        tx: &mut DbTx,
        transformer_id: TransformerId,
    ) -> DbResult<Vec<EnvApp>> {
        let rows = sqlx::query_as::<_, EnvAppRow>(
            "SELECT env_name, app_name FROM git_sync_status
             WHERE transformer_id = $1 AND status = $2
             ORDER BY env_name, app_name",
        )
        .bind(transformer_id)
        .bind(SyncStatus::Unsynced.as_i16())
        .fetch_all(tx.conn())
        .await
        .context(|| format!("read unsynced apps of transformer {transformer_id}"))?;
        Ok(rows.into_iter().map(EnvApp::from).collect())
    }

    /// Every pair currently owned by a transformer.
    pub async fn read_all_for_transformer(
        &self,
        tx: &mut DbTx,
        transformer_id: TransformerId,
    ) -> DbResult<Vec<EnvApp>> {
        let rows = sqlx::query_as::<_, EnvAppRow>(
            "SELECT env_name, app_name FROM git_sync_status
             WHERE transformer_id = $1
             ORDER BY env_name, app_name",
        )
        .bind(transformer_id)
        .fetch_all(tx.conn())
        .await
        .context(|| format!("read apps of transformer {transformer_id}"))?;
        Ok(rows.into_iter().map(EnvApp::from).collect())
    }

    /// Move the UNSYNCED pairs of a transformer to `status`.
    pub async fn bulk_update_status(
        &self,
        tx: &mut DbTx,
        transformer_id: TransformerId,
        status: SyncStatus,
    ) -> DbResult<u64> {
        let created = tx.now().await?;
        let result = sqlx::query(
            "UPDATE git_sync_status SET status = $1, created = $2
             WHERE transformer_id = $3 AND status = $4",
        )
        .bind(status.as_i16())
        .bind(created)
        .bind(transformer_id)
        .bind(SyncStatus::Unsynced.as_i16())
        .execute(tx.conn())
        .await
        .context(|| format!("update unsynced apps of transformer {transformer_id}"))?;
        Ok(result.rows_affected())
    }

    /// Move every pair of a transformer to `status`, whatever its current status.
    pub async fn bulk_update_all_status(
        &self,
        tx: &mut DbTx,
        transformer_id: TransformerId,
        status: SyncStatus,
    ) -> DbResult<u64> {
        let created = tx.now().await?;
        let result = sqlx::query(
            "UPDATE git_sync_status SET status = $1, created = $2
             WHERE transformer_id = $3",
        )
        .bind(status.as_i16())
        .bind(created)
        .bind(transformer_id)
        .execute(tx.conn())
        .await
        .context(|| format!("update all apps of transformer {transformer_id}"))?;
        Ok(result.rows_affected())
    }

    /// Hand every pair of `old_id` over to `new_id` with `status`.
    pub async fn bulk_reassign_transformer(
        &self,
        tx: &mut DbTx,
        old_id: TransformerId,
        new_id: TransformerId,
        status: SyncStatus,
    ) -> DbResult<u64> {
        let created = tx.now().await?;
        let result = sqlx::query(
            "UPDATE git_sync_status SET transformer_id = $1, status = $2, created = $3
             WHERE transformer_id = $4",
        )
        .bind(new_id)
        .bind(status.as_i16())
        .bind(created)
        .bind(old_id)
        .execute(tx.conn())
        .await
        .context(|| format!("reassign apps of transformer {old_id} to {new_id}"))?;
        Ok(result.rows_affected())
    }

    pub async fn retrieve_by_status(
        &self,
        tx: &mut DbTx,
        status: SyncStatus,
    ) -> DbResult<Vec<GitSyncRow>> {
        let rows = sqlx::query_as::<_, SyncRow>(
            "SELECT env_name, app_name, transformer_id, status, created FROM git_sync_status
             WHERE status = $1
             ORDER BY env_name, app_name",
        )
        .bind(status.as_i16())
        .fetch_all(tx.conn())
        .await
        .context(|| format!("retrieve apps with status {status}"))?;
        rows.into_iter().map(GitSyncRow::try_from).collect()
    }

    pub async fn count_by_status(&self, tx: &mut DbTx, status: SyncStatus) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM git_sync_status WHERE status = $1")
            .bind(status.as_i16())
            .fetch_one(tx.conn())
            .await
            .context(|| format!("count apps with status {status}"))
    }

    /// Current status of one pair, if it was ever recorded.
    pub async fn retrieve_sync_status(
        &self,
        tx: &mut DbTx,
        env_name: &str,
        app_name: &str,
    ) -> DbResult<Option<GitSyncRow>> {
        let row = sqlx::query_as::<_, SyncRow>(
            "SELECT env_name, app_name, transformer_id, status, created FROM git_sync_status
             WHERE env_name = $1 AND app_name = $2",
        )
        .bind(env_name)
        .bind(app_name)
        .fetch_optional(tx.conn())
        .await
        .context(|| format!("retrieve sync status of {env_name}/{app_name}"))?;
        row.map(GitSyncRow::try_from).transpose()
    }
}
