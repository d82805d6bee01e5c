//! Event ledger (event-sourcing light) and its failed-event twin.

use crate::error::{DbError, DbResult, QueryContext};
use crate::handler::DbHandler;
use crate::transaction::DbTx;
use kuberpult_core::event::merge_actor;
use kuberpult_core::{ActorMetadata, EslVersion, EventType, MIGRATION_MARKER_VERSION, SyncStatus};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;

/// One ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EslEvent {
    pub esl_version: EslVersion,
    pub created: OffsetDateTime,
    pub event_type: EventType,
    pub json: Value,
}

/// A ledger entry that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEslEvent {
    pub esl_version: EslVersion,
    pub created: OffsetDateTime,
    pub event_type: EventType,
    pub json: Value,
    pub reason: String,
    /// Ledger version of the event that failed.
    pub transformer_esl_version: EslVersion,
}

#[derive(Debug, FromRow)]
struct EslRow {
    esl_version: i64,
    created: OffsetDateTime,
    event_type: String,
    json: String,
}

impl TryFrom<EslRow> for EslEvent {
    type Error = DbError;

    fn try_from(row: EslRow) -> DbResult<Self> {
        Ok(Self {
            esl_version: row.esl_version,
            created: row.created,
            event_type: row.event_type.parse()?,
            json: parse_document(&row.json, "ledger event")?,
        })
    }
}

#[derive(Debug, FromRow)]
struct FailedEslRow {
    esl_version: i64,
    created: OffsetDateTime,
    event_type: String,
    json: String,
    reason: String,
    transformer_esl_version: i64,
}

impl TryFrom<FailedEslRow> for FailedEslEvent {
    type Error = DbError;

    fn try_from(row: FailedEslRow) -> DbResult<Self> {
        Ok(Self {
            esl_version: row.esl_version,
            created: row.created,
            event_type: row.event_type.parse()?,
            json: parse_document(&row.json, "failed ledger event")?,
            reason: row.reason,
            transformer_esl_version: row.transformer_esl_version,
        })
    }
}

fn parse_document(raw: &str, what: &str) -> DbResult<Value> {
    serde_json::from_str(raw).map_err(|source| DbError::Unmarshal {
        what: what.to_string(),
        raw: raw.to_string(),
        source,
    })
}

const ESL_COLUMNS: &str = "esl_version, created, event_type, json";
const FAILED_COLUMNS: &str =
    "esl_version, created, event_type, json, reason, transformer_esl_version";

impl DbHandler {
    /// Append one event, merging `payload` and `actor` into one document.
    /// The version comes from the table's sequence.
    pub async fn append_event<P: Serialize + ?Sized>(
        &self,
        tx: &mut DbTx,
        event_type: EventType,
        payload: &P,
        actor: &ActorMetadata,
    ) -> DbResult<EslVersion> {
        let payload = serde_json::to_value(payload).map_err(|source| DbError::Marshal {
            what: format!("{event_type} payload"),
            source,
        })?;
        self.append_event_document(tx, event_type, &merge_actor(payload, actor))
            .await
    }

    /// Append an already merged document, as stored by a previous append.
    pub async fn append_event_document(
        &self,
        tx: &mut DbTx,
        event_type: EventType,
        document: &Value,
    ) -> DbResult<EslVersion> {
        let created = tx.now().await?;
        let json = document.to_string();
        let version: i64 = sqlx::query_scalar(
            "INSERT INTO event_sourcing_light (created, event_type, json)
             VALUES ($1, $2, $3)
             RETURNING esl_version",
        )
        .bind(created)
        .bind(event_type.as_str())
        .bind(&json)
        .fetch_one(tx.conn())
        .await
        .context(|| format!("write {event_type} event into ledger"))?;
        tracing::debug!(esl_version = version, %event_type, "ledger event written");
        Ok(version)
    }

    /// Write the version-0 migration marker. Returns false if it already existed.
    pub async fn write_migration_marker(
        &self,
        tx: &mut DbTx,
        actor: &ActorMetadata,
    ) -> DbResult<bool> {
        let created = tx.now().await?;
        let document = merge_actor(Value::Object(Default::default()), actor);
        let result = sqlx::query(
            "INSERT INTO event_sourcing_light (esl_version, created, event_type, json)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (esl_version) DO NOTHING",
        )
        .bind(MIGRATION_MARKER_VERSION)
        .bind(created)
        .bind(EventType::Migration.as_str())
        .bind(document.to_string())
        .execute(tx.conn())
        .await
        .context(|| "write migration marker".to_string())?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn has_migration_marker(&self, tx: &mut DbTx) -> DbResult<bool> {
        Ok(self.read_event(tx, MIGRATION_MARKER_VERSION).await?.is_some())
    }

    /// First entry ordered by version.
    pub async fn read_first_event(&self, tx: &mut DbTx) -> DbResult<Option<EslEvent>> {
        self.read_boundary_event(tx, "ASC").await
    }

    /// Last entry ordered by version.
    pub async fn read_last_event(&self, tx: &mut DbTx) -> DbResult<Option<EslEvent>> {
        self.read_boundary_event(tx, "DESC").await
    }

    async fn read_boundary_event(
        &self,
        tx: &mut DbTx,
        order: &'static str,
    ) -> DbResult<Option<EslEvent>> {
        let query = format!(
            "SELECT {ESL_COLUMNS} FROM event_sourcing_light ORDER BY esl_version {order} LIMIT 1"
        );
        let row = sqlx::query_as::<_, EslRow>(&query)
            .fetch_optional(tx.conn())
            .await
            .context(|| "read boundary ledger event".to_string())?;
        row.map(EslEvent::try_from).transpose()
    }

    /// The entry immediately following `version`, for cursor-style consumers.
    pub async fn read_event_later_than(
        &self,
        tx: &mut DbTx,
        version: EslVersion,
    ) -> DbResult<Option<EslEvent>> {
        let row = sqlx::query_as::<_, EslRow>(&format!(
            "SELECT {ESL_COLUMNS} FROM event_sourcing_light
             WHERE esl_version > $1
             ORDER BY esl_version ASC
             LIMIT 1"
        ))
        .bind(version)
        .fetch_optional(tx.conn())
        .await
        .context(|| format!("read ledger event after {version}"))?;
        row.map(EslEvent::try_from).transpose()
    }

    /// Up to `limit` entries after `version`, oldest first.
    pub async fn read_events_later_than(
        &self,
        tx: &mut DbTx,
        version: EslVersion,
        limit: u32,
    ) -> DbResult<Vec<EslEvent>> {
        let rows = sqlx::query_as::<_, EslRow>(&format!(
            "SELECT {ESL_COLUMNS} FROM event_sourcing_light
             WHERE esl_version > $1
             ORDER BY esl_version ASC
             LIMIT $2"
        ))
        .bind(version)
        .bind(i64::from(limit))
        .fetch_all(tx.conn())
        .await
        .context(|| format!("read ledger events after {version}"))?;
        rows.into_iter().map(EslEvent::try_from).collect()
    }

    /// Exactly the entry with `version`.
    pub async fn read_event(
        &self,
        tx: &mut DbTx,
        version: EslVersion,
    ) -> DbResult<Option<EslEvent>> {
        let row = sqlx::query_as::<_, EslRow>(&format!(
            "SELECT {ESL_COLUMNS} FROM event_sourcing_light WHERE esl_version = $1"
        ))
        .bind(version)
        .fetch_optional(tx.conn())
        .await
        .context(|| format!("read ledger event {version}"))?;
        row.map(EslEvent::try_from).transpose()
    }

    // =========================================================================
    // Failed events
    // =========================================================================

    /// Record that the event at `transformer_esl_version` could not be applied.
    pub async fn write_failed_event(
        &self,
        tx: &mut DbTx,
        event_type: EventType,
        document: &Value,
        reason: &str,
        transformer_esl_version: EslVersion,
    ) -> DbResult<EslVersion> {
        let created = tx.now().await?;
        let json = document.to_string();
        let version: i64 = sqlx::query_scalar(
            "INSERT INTO event_sourcing_light_failed
                (created, event_type, json, reason, transformer_esl_version)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING esl_version",
        )
        .bind(created)
        .bind(event_type.as_str())
        .bind(&json)
        .bind(reason)
        .bind(transformer_esl_version)
        .fetch_one(tx.conn())
        .await
        .context(|| format!("write failed event for transformer {transformer_esl_version}"))?;

        sqlx::query(
            "INSERT INTO event_sourcing_light_failed_history
                (esl_version, created, event_type, json, reason, transformer_esl_version)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(version)
        .bind(created)
        .bind(event_type.as_str())
        .bind(&json)
        .bind(reason)
        .bind(transformer_esl_version)
        .execute(tx.conn())
        .await
        .context(|| format!("write failed event history for transformer {transformer_esl_version}"))?;

        Ok(version)
    }

    /// Park a ledger event that failed to apply: record it as failed, mark
    /// its unsynced apps as SYNC_FAILED and advance the cutoff past it.
    pub async fn mark_event_failed(
        &self,
        tx: &mut DbTx,
        event: &EslEvent,
        reason: &str,
    ) -> DbResult<EslVersion> {
        let failed = self
            .write_failed_event(tx, event.event_type, &event.json, reason, event.esl_version)
            .await?;
        self.bulk_update_status(tx, event.esl_version, SyncStatus::SyncFailed)
            .await?;
        self.write_cutoff(tx, event.esl_version).await?;
        tracing::error!(
            esl_version = event.esl_version,
            reason,
            "ledger event failed and was parked"
        );
        Ok(failed)
    }

    /// Most recent failed events, newest first.
    pub async fn read_failed_events(
        &self,
        tx: &mut DbTx,
        limit: u32,
    ) -> DbResult<Vec<FailedEslEvent>> {
        let rows = sqlx::query_as::<_, FailedEslRow>(&format!(
            "SELECT {FAILED_COLUMNS} FROM event_sourcing_light_failed
             ORDER BY esl_version DESC
             LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(tx.conn())
        .await
        .context(|| "read failed events".to_string())?;
        rows.into_iter().map(FailedEslEvent::try_from).collect()
    }

    /// The pending failed event for the ledger version `transformer_esl_version`.
    pub async fn read_failed_event(
        &self,
        tx: &mut DbTx,
        transformer_esl_version: EslVersion,
    ) -> DbResult<Option<FailedEslEvent>> {
        let row = sqlx::query_as::<_, FailedEslRow>(&format!(
            "SELECT {FAILED_COLUMNS} FROM event_sourcing_light_failed
             WHERE transformer_esl_version = $1
             ORDER BY esl_version DESC
             LIMIT 1"
        ))
        .bind(transformer_esl_version)
        .fetch_optional(tx.conn())
        .await
        .context(|| format!("read failed event for transformer {transformer_esl_version}"))?;
        row.map(FailedEslEvent::try_from).transpose()
    }

    /// Drop a failed event once it was resolved by hand.
    ///
    /// Skipping an event that is not pending is a failed precondition.
    pub async fn skip_failed_event(
        &self,
        tx: &mut DbTx,
        transformer_esl_version: EslVersion,
    ) -> DbResult<()> {
        if self
            .read_failed_event(tx, transformer_esl_version)
            .await?
            .is_none()
        {
            return Err(DbError::FailedPrecondition(format!(
                "no failed event with esl version {transformer_esl_version}"
            )));
        }
        self.delete_failed_events(tx, transformer_esl_version).await?;
        tracing::info!(esl_version = transformer_esl_version, "failed event skipped");
        Ok(())
    }

    /// Re-append a failed event to the ledger so it is processed again.
    ///
    /// The git-sync rows of the failed transformer move to the new version as
    /// UNSYNCED. Returns the new ledger version.
    pub async fn retry_failed_event(
        &self,
        tx: &mut DbTx,
        transformer_esl_version: EslVersion,
    ) -> DbResult<EslVersion> {
        let failed = self
            .read_failed_event(tx, transformer_esl_version)
            .await?
            .ok_or_else(|| {
                DbError::FailedPrecondition(format!(
                    "no failed event with esl version {transformer_esl_version}"
                ))
            })?;
        let new_version = self
            .append_event_document(tx, failed.event_type, &failed.json)
            .await?;
        self.delete_failed_events(tx, transformer_esl_version).await?;
        let moved = self
            .bulk_reassign_transformer(
                tx,
                transformer_esl_version,
                new_version,
                SyncStatus::Unsynced,
            )
            .await?;
        tracing::info!(
            esl_version = transformer_esl_version,
            new_esl_version = new_version,
            moved,
            "failed event re-queued"
        );
        Ok(new_version)
    }

    async fn delete_failed_events(
        &self,
        tx: &mut DbTx,
        transformer_esl_version: EslVersion,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM event_sourcing_light_failed WHERE transformer_esl_version = $1",
        )
        .bind(transformer_esl_version)
        .execute(tx.conn())
        .await
        .context(|| format!("delete failed event for transformer {transformer_esl_version}"))?;
        Ok(result.rows_affected())
    }
}
