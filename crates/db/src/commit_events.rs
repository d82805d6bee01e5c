//! Events attached to source commits.

use crate::error::{DbError, DbResult, QueryContext};
use crate::handler::DbHandler;
use crate::transaction::DbTx;
use kuberpult_core::EslVersion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// A commit event as written by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommitEvent {
    pub uuid: Uuid,
    pub commit_hash: String,
    pub event_type: String,
    pub json: Value,
    /// Ledger version of the transformer that produced this event.
    pub transformer_esl_version: EslVersion,
}

/// A stored commit event.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub uuid: Uuid,
    pub timestamp: OffsetDateTime,
    pub commit_hash: String,
    pub event_type: String,
    pub json: Value,
    pub transformer_esl_version: EslVersion,
}

#[derive(Debug, FromRow)]
struct CommitEventRow {
    uuid: Uuid,
    timestamp: OffsetDateTime,
    commit_hash: String,
    event_type: String,
    json: String,
    transformer_esl_version: i64,
}

impl DbHandler {
    /// Write a commit event. Its transformer must already be in the ledger.
    pub async fn write_commit_event(&self, tx: &mut DbTx, event: &NewCommitEvent) -> DbResult<()> {
        if self
            .read_event(tx, event.transformer_esl_version)
            .await?
            .is_none()
        {
            return Err(DbError::FailedPrecondition(format!(
                "commit event {} references unknown transformer {}",
                event.uuid, event.transformer_esl_version
            )));
        }
        let timestamp = tx.now().await?;
        sqlx::query(
            "INSERT INTO commit_events
                (uuid, timestamp, commit_hash, event_type, json, transformer_esl_version)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.uuid)
        .bind(timestamp)
        .bind(&event.commit_hash)
        .bind(&event.event_type)
        .bind(event.json.to_string())
        .bind(event.transformer_esl_version)
        .execute(tx.conn())
        .await
        .context(|| format!("write commit event {}", event.uuid))?;
        Ok(())
    }

    /// Newest events for one commit.
    pub async fn select_commit_events(
        &self,
        tx: &mut DbTx,
        commit_hash: &str,
        limit: u32,
    ) -> DbResult<Vec<CommitEvent>> {
        let rows = sqlx::query_as::<_, CommitEventRow>(
            "SELECT uuid, timestamp, commit_hash, event_type, json, transformer_esl_version
             FROM commit_events
             WHERE commit_hash = $1
             ORDER BY timestamp DESC, uuid
             LIMIT $2",
        )
        .bind(commit_hash)
        .bind(i64::from(limit))
        .fetch_all(tx.conn())
        .await
        .context(|| format!("select commit events of {commit_hash}"))?;

        rows.into_iter()
            .map(|row| {
                let json = serde_json::from_str(&row.json).map_err(|source| DbError::Unmarshal {
                    what: "commit event".to_string(),
                    raw: row.json.clone(),
                    source,
                })?;
                Ok(CommitEvent {
                    uuid: row.uuid,
                    timestamp: row.timestamp,
                    commit_hash: row.commit_hash,
                    event_type: row.event_type,
                    json,
                    transformer_esl_version: row.transformer_esl_version,
                })
            })
            .collect()
    }

    /// Whether any commit event exists.
    pub async fn has_commit_events(&self, tx: &mut DbTx) -> DbResult<bool> {
        let found: Option<Uuid> = sqlx::query_scalar("SELECT uuid FROM commit_events LIMIT 1")
            .fetch_optional(tx.conn())
            .await
            .context(|| "probe commit events".to_string())?;
        Ok(found.is_some())
    }
}
