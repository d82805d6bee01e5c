//! Generic current-state + history table pair.
//!
//! Each entity family (apps, environments, releases, deployments and the
//! three lock flavours) is described as data by an [`EntityTable`]. One
//! implementation of upsert, delete and the read paths serves all of them.
//! Every write lands in both tables inside the caller's transaction, using
//! the transaction's single timestamp.

use crate::error::{DbError, DbResult, QueryContext};
use crate::handler::DbHandler;
use crate::query::adapt_query;
use crate::transaction::DbTx;
use kuberpult_core::EslVersion;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, QueryBuilder, Row};
use std::fmt;
use time::OffsetDateTime;

/// SQL type of a natural-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Text,
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: &'static str,
    pub kind: KeyKind,
}

impl KeyColumn {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: KeyKind::Text,
        }
    }

    pub const fn int(name: &'static str) -> Self {
        Self {
            name,
            kind: KeyKind::Int,
        }
    }
}

/// One natural-key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Text(String),
    Int(i64),
}

impl KeyValue {
    fn kind(&self) -> KeyKind {
        match self {
            Self::Text(_) => KeyKind::Text,
            Self::Int(_) => KeyKind::Int,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(value) => f.write_str(value),
            Self::Int(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Table names and natural key of one entity family.
///
/// Names are static identifiers; no caller data is ever spliced into SQL.
#[derive(Debug, Clone, Copy)]
pub struct EntityTable {
    pub name: &'static str,
    pub history: &'static str,
    pub key: &'static [KeyColumn],
}

const VALUE_COLUMNS: &str = "created, metadata, esl_version";
const HISTORY_COLUMNS: &str = "version, created, metadata, esl_version, deleted, deletion_metadata";

impl EntityTable {
    fn key_list(&self) -> String {
        self.key
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_filter(&self, columns: usize) -> String {
        self.key[..columns]
            .iter()
            .map(|column| format!("{} = ?", column.name))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }

    pub(crate) fn upsert_sql(&self) -> String {
        let keys = self.key_list();
        adapt_query(&format!(
            "INSERT INTO {table} ({keys}, {VALUE_COLUMNS}) VALUES ({values}) \
             ON CONFLICT ({keys}) DO UPDATE SET \
             created = excluded.created, metadata = excluded.metadata, esl_version = excluded.esl_version",
            table = self.name,
            values = Self::placeholders(self.key.len() + 3),
        ))
    }

    pub(crate) fn insert_history_sql(&self) -> String {
        adapt_query(&format!(
            "INSERT INTO {history} ({keys}, {VALUE_COLUMNS}, deleted, deletion_metadata) VALUES ({values})",
            history = self.history,
            keys = self.key_list(),
            values = Self::placeholders(self.key.len() + 5),
        ))
    }

    pub(crate) fn select_sql(&self) -> String {
        adapt_query(&format!(
            "SELECT {keys}, {VALUE_COLUMNS} FROM {table} WHERE {filter}",
            keys = self.key_list(),
            table = self.name,
            filter = self.key_filter(self.key.len()),
        ))
    }

    pub(crate) fn delete_sql(&self) -> String {
        adapt_query(&format!(
            "DELETE FROM {table} WHERE {filter}",
            table = self.name,
            filter = self.key_filter(self.key.len()),
        ))
    }

    pub(crate) fn select_prefix_sql(&self, prefix: usize) -> String {
        let keys = self.key_list();
        let filter = if prefix == 0 {
            String::new()
        } else {
            format!(" WHERE {}", self.key_filter(prefix))
        };
        adapt_query(&format!(
            "SELECT {keys}, {VALUE_COLUMNS} FROM {table}{filter} ORDER BY {keys}",
            table = self.name,
        ))
    }

    pub(crate) fn select_any_sql(&self) -> String {
        format!(
            "SELECT {keys}, {VALUE_COLUMNS} FROM {table} LIMIT 1",
            keys = self.key_list(),
            table = self.name,
        )
    }

    pub(crate) fn history_sql(&self) -> String {
        adapt_query(&format!(
            "SELECT {keys}, {HISTORY_COLUMNS} FROM {history} WHERE {filter} ORDER BY version DESC LIMIT ?",
            keys = self.key_list(),
            history = self.history,
            filter = self.key_filter(self.key.len()),
        ))
    }

    pub(crate) fn at_timestamp_sql(&self) -> String {
        adapt_query(&format!(
            "SELECT {keys}, {HISTORY_COLUMNS} FROM {history} WHERE {filter} AND created <= ? \
             ORDER BY version DESC LIMIT 1",
            keys = self.key_list(),
            history = self.history,
            filter = self.key_filter(self.key.len()),
        ))
    }

    /// Copy current rows that have no history entry into the history table.
    pub(crate) fn backfill_history_sql(&self) -> String {
        let keys = self.key_list();
        let join = self
            .key
            .iter()
            .map(|column| format!("h.{0} = c.{0}", column.name))
            .collect::<Vec<_>>()
            .join(" AND ");
        let selected = self
            .key
            .iter()
            .map(|column| format!("c.{}", column.name))
            .collect::<Vec<_>>()
            .join(", ");
        adapt_query(&format!(
            "INSERT INTO {history} ({keys}, {VALUE_COLUMNS}, deleted) \
             SELECT {selected}, ?, c.metadata, c.esl_version, FALSE FROM {table} c \
             WHERE NOT EXISTS (SELECT 1 FROM {history} h WHERE {join})",
            history = self.history,
            table = self.name,
        ))
    }

    /// Check that `values` is a valid key prefix for this table.
    fn check_prefix(&self, values: &[KeyValue], full: bool) -> DbResult<()> {
        let fits = if full {
            values.len() == self.key.len()
        } else {
            values.len() <= self.key.len()
        };
        let kinds_match = values
            .iter()
            .zip(self.key)
            .all(|(value, column)| value.kind() == column.kind);
        if fits && kinds_match {
            Ok(())
        } else {
            Err(DbError::Config(format!(
                "key {values:?} does not match the key of {}",
                self.name
            )))
        }
    }
}

/// A typed natural key.
pub trait EntityKey: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    fn to_values(&self) -> Vec<KeyValue>;
    fn from_values(values: Vec<KeyValue>) -> Option<Self>;
}

/// An entity family stored as a current-state table plus its history.
pub trait Entity: Send + Sync + 'static {
    type Key: EntityKey;
    type Metadata: Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static;

    const TABLE: EntityTable;
}

/// Who deleted a row, stored on the history entry of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionMetadata {
    pub deleted_by_name: String,
    pub deleted_by_email: String,
}

/// The current state of one natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentRow<E: Entity> {
    pub key: E::Key,
    pub created: OffsetDateTime,
    pub metadata: E::Metadata,
    pub esl_version: EslVersion,
}

/// One append-only history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow<E: Entity> {
    pub version: i64,
    pub key: E::Key,
    pub created: OffsetDateTime,
    pub metadata: E::Metadata,
    pub esl_version: EslVersion,
    pub deleted: bool,
    pub deletion_metadata: Option<DeletionMetadata>,
}

/// Rebuild the current state of one key from its history.
///
/// Rows may come in any order. Applying them by ascending version with
/// last-write-wins and delete-removes leaves exactly the newest entry.
/// Returns `None` when the latest entry is a delete.
pub fn replay_history<E: Entity>(rows: &[HistoryRow<E>]) -> Option<(E::Key, E::Metadata)> {
    rows.iter()
        .max_by_key(|row| row.version)
        .filter(|row| !row.deleted)
        .map(|row| (row.key.clone(), row.metadata.clone()))
}

fn bind_key<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: &[KeyValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            KeyValue::Text(text) => query.bind(text.clone()),
            KeyValue::Int(int) => query.bind(*int),
        };
    }
    query
}

fn decode_key<E: Entity>(row: &PgRow) -> DbResult<E::Key> {
    let values = E::TABLE
        .key
        .iter()
        .map(|column| match column.kind {
            KeyKind::Text => row.try_get::<String, _>(column.name).map(KeyValue::Text),
            KeyKind::Int => row.try_get::<i64, _>(column.name).map(KeyValue::Int),
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .context(|| format!("decode key of {}", E::TABLE.name))?;
    E::Key::from_values(values.clone()).ok_or_else(|| {
        DbError::malformed(E::TABLE.name, format!("key {values:?} does not fit"))
    })
}

fn decode_json<T: DeserializeOwned>(raw: &str, what: &str) -> DbResult<T> {
    serde_json::from_str(raw).map_err(|source| DbError::Unmarshal {
        what: what.to_string(),
        raw: raw.to_string(),
        source,
    })
}

fn encode_json<T: Serialize + ?Sized>(value: &T, what: &str) -> DbResult<String> {
    serde_json::to_string(value).map_err(|source| DbError::Marshal {
        what: what.to_string(),
        source,
    })
}

fn decode_current<E: Entity>(row: &PgRow) -> DbResult<CurrentRow<E>> {
    let context = || format!("decode row of {}", E::TABLE.name);
    let raw: String = row.try_get("metadata").context(context)?;
    Ok(CurrentRow {
        key: decode_key::<E>(row)?,
        created: row.try_get("created").context(context)?,
        metadata: decode_json(&raw, E::TABLE.name)?,
        esl_version: row.try_get("esl_version").context(context)?,
    })
}

fn decode_history<E: Entity>(row: &PgRow) -> DbResult<HistoryRow<E>> {
    let context = || format!("decode row of {}", E::TABLE.history);
    let raw: String = row.try_get("metadata").context(context)?;
    let raw_deletion: Option<String> = row.try_get("deletion_metadata").context(context)?;
    Ok(HistoryRow {
        version: row.try_get("version").context(context)?,
        key: decode_key::<E>(row)?,
        created: row.try_get("created").context(context)?,
        metadata: decode_json(&raw, E::TABLE.history)?,
        esl_version: row.try_get("esl_version").context(context)?,
        deleted: row.try_get("deleted").context(context)?,
        deletion_metadata: raw_deletion
            .map(|raw| decode_json(&raw, "deletion metadata"))
            .transpose()?,
    })
}

fn describe(values: &[KeyValue]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

impl DbHandler {
    /// Replace the current row of `key` and append a history entry.
    pub async fn upsert<E: Entity>(
        &self,
        tx: &mut DbTx,
        key: &E::Key,
        metadata: &E::Metadata,
        esl_version: EslVersion,
    ) -> DbResult<()> {
        let values = key.to_values();
        E::TABLE.check_prefix(&values, true)?;
        let created = tx.now().await?;
        let json = encode_json(metadata, E::TABLE.name)?;

        let upsert = E::TABLE.upsert_sql();
        bind_key(sqlx::query(&upsert), &values)
            .bind(created)
            .bind(&json)
            .bind(esl_version)
            .execute(tx.conn())
            .await
            .context(|| format!("upsert {} {}", E::TABLE.name, describe(&values)))?;

        let history = E::TABLE.insert_history_sql();
        bind_key(sqlx::query(&history), &values)
            .bind(created)
            .bind(&json)
            .bind(esl_version)
            .bind(false)
            .bind(None::<String>)
            .execute(tx.conn())
            .await
            .context(|| format!("insert {} {}", E::TABLE.history, describe(&values)))?;
        Ok(())
    }

    /// Remove the current row of `key`, recording the delete in history.
    ///
    /// Deleting an absent key is tolerated: it logs a warning and returns false.
    pub async fn delete<E: Entity>(
        &self,
        tx: &mut DbTx,
        key: &E::Key,
        deletion: &DeletionMetadata,
        esl_version: EslVersion,
    ) -> DbResult<bool> {
        let Some(existing) = self.select::<E>(tx, key).await? else {
            tracing::warn!(
                table = E::TABLE.name,
                key = %describe(&key.to_values()),
                "delete of absent row ignored"
            );
            return Ok(false);
        };
        let values = key.to_values();
        let created = tx.now().await?;
        let json = encode_json(&existing.metadata, E::TABLE.name)?;
        let deletion_json = encode_json(deletion, "deletion metadata")?;

        let delete = E::TABLE.delete_sql();
        bind_key(sqlx::query(&delete), &values)
            .execute(tx.conn())
            .await
            .context(|| format!("delete {} {}", E::TABLE.name, describe(&values)))?;

        let history = E::TABLE.insert_history_sql();
        bind_key(sqlx::query(&history), &values)
            .bind(created)
            .bind(&json)
            .bind(esl_version)
            .bind(true)
            .bind(Some(deletion_json))
            .execute(tx.conn())
            .await
            .context(|| format!("insert {} {}", E::TABLE.history, describe(&values)))?;
        Ok(true)
    }

    pub async fn select<E: Entity>(
        &self,
        tx: &mut DbTx,
        key: &E::Key,
    ) -> DbResult<Option<CurrentRow<E>>> {
        let values = key.to_values();
        let sql = E::TABLE.select_sql();
        let row = bind_key(sqlx::query(&sql), &values)
            .fetch_optional(tx.conn())
            .await
            .context(|| format!("select {} {}", E::TABLE.name, describe(&values)))?;
        row.as_ref().map(decode_current::<E>).transpose()
    }

    /// Current rows for several keys; absent keys are simply missing.
    pub async fn select_set<E: Entity>(
        &self,
        tx: &mut DbTx,
        keys: &[E::Key],
    ) -> DbResult<Vec<CurrentRow<E>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let key_list = E::TABLE.key_list();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {key_list}, {VALUE_COLUMNS} FROM {} WHERE ({key_list}) IN ",
            E::TABLE.name
        ));
        let mut bound = Vec::with_capacity(keys.len());
        for key in keys {
            let values = key.to_values();
            E::TABLE.check_prefix(&values, true)?;
            bound.push(values);
        }
        builder.push_tuples(&bound, |mut tuple, values| {
            for value in values {
                match value {
                    KeyValue::Text(text) => tuple.push_bind(text.clone()),
                    KeyValue::Int(int) => tuple.push_bind(*int),
                };
            }
        });
        builder.push(format!(" ORDER BY {key_list}"));
        let rows = builder
            .build()
            .fetch_all(tx.conn())
            .await
            .context(|| format!("select set of {}", E::TABLE.name))?;
        rows.iter().map(decode_current::<E>).collect()
    }

    /// Current rows whose leading key columns equal `prefix`.
    pub async fn select_by_prefix<E: Entity>(
        &self,
        tx: &mut DbTx,
        prefix: &[KeyValue],
    ) -> DbResult<Vec<CurrentRow<E>>> {
        E::TABLE.check_prefix(prefix, false)?;
        let sql = E::TABLE.select_prefix_sql(prefix.len());
        let rows = bind_key(sqlx::query(&sql), prefix)
            .fetch_all(tx.conn())
            .await
            .context(|| format!("select {} by {}", E::TABLE.name, describe(prefix)))?;
        rows.iter().map(decode_current::<E>).collect()
    }

    pub async fn select_all<E: Entity>(&self, tx: &mut DbTx) -> DbResult<Vec<CurrentRow<E>>> {
        self.select_by_prefix::<E>(tx, &[]).await
    }

    /// Any one current row: the cheap "has this table been populated" probe.
    pub async fn select_any<E: Entity>(&self, tx: &mut DbTx) -> DbResult<Option<CurrentRow<E>>> {
        let sql = E::TABLE.select_any_sql();
        let row = sqlx::query(&sql)
            .fetch_optional(tx.conn())
            .await
            .context(|| format!("probe {}", E::TABLE.name))?;
        row.as_ref().map(decode_current::<E>).transpose()
    }

    /// Whether any current row starts with `prefix`; an empty prefix probes
    /// the whole table.
    pub async fn has_rows<E: Entity>(&self, tx: &mut DbTx, prefix: &[KeyValue]) -> DbResult<bool> {
        if prefix.is_empty() {
            return Ok(self.select_any::<E>(tx).await?.is_some());
        }
        Ok(!self.select_by_prefix::<E>(tx, prefix).await?.is_empty())
    }

    /// Give every current row without history an initial history entry.
    /// Returns the number of entries written.
    pub async fn backfill_history<E: Entity>(&self, tx: &mut DbTx) -> DbResult<u64> {
        let created = tx.now().await?;
        let sql = E::TABLE.backfill_history_sql();
        let result = sqlx::query(&sql)
            .bind(created)
            .execute(tx.conn())
            .await
            .context(|| format!("backfill {}", E::TABLE.history))?;
        Ok(result.rows_affected())
    }

    /// Up to `limit` history entries of `key`, newest first.
    pub async fn select_history<E: Entity>(
        &self,
        tx: &mut DbTx,
        key: &E::Key,
        limit: u32,
    ) -> DbResult<Vec<HistoryRow<E>>> {
        let values = key.to_values();
        let sql = E::TABLE.history_sql();
        let rows = bind_key(sqlx::query(&sql), &values)
            .bind(i64::from(limit))
            .fetch_all(tx.conn())
            .await
            .context(|| format!("select {} {}", E::TABLE.history, describe(&values)))?;
        rows.iter().map(decode_history::<E>).collect()
    }

    /// State of `key` as of `at`: the latest history entry written at or
    /// before that time, or `None` if there is none or it is a delete.
    pub async fn select_at_timestamp<E: Entity>(
        &self,
        tx: &mut DbTx,
        key: &E::Key,
        at: OffsetDateTime,
    ) -> DbResult<Option<HistoryRow<E>>> {
        let values = key.to_values();
        let sql = E::TABLE.at_timestamp_sql();
        let row = bind_key(sqlx::query(&sql), &values)
            .bind(at)
            .fetch_optional(tx.conn())
            .await
            .context(|| format!("select {} {} at {at}", E::TABLE.history, describe(&values)))?;
        Ok(row
            .as_ref()
            .map(decode_history::<E>)
            .transpose()?
            .filter(|row| !row.deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnvLockKey, EnvironmentLocks, LockMetadata, ReleaseKey, Releases};
    use time::macros::datetime;

    #[test]
    fn test_upsert_sql_replaces_every_column() {
        let sql = EnvironmentLocks::TABLE.upsert_sql();
        assert_eq!(
            sql,
            "INSERT INTO environment_locks (env_name, lock_id, created, metadata, esl_version) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (env_name, lock_id) DO UPDATE SET \
             created = excluded.created, metadata = excluded.metadata, esl_version = excluded.esl_version"
        );
    }

    #[test]
    fn test_history_sql_positions() {
        let sql = Releases::TABLE.insert_history_sql();
        assert!(sql.starts_with("INSERT INTO releases_history (app_name, release_version,"));
        assert!(sql.ends_with("VALUES ($1, $2, $3, $4, $5, $6, $7)"));
        let sql = Releases::TABLE.history_sql();
        assert!(sql.contains("app_name = $1 AND release_version = $2"));
        assert!(sql.ends_with("LIMIT $3"));
        let sql = Releases::TABLE.at_timestamp_sql();
        assert!(sql.contains("created <= $3"));
    }

    #[test]
    fn test_prefix_sql() {
        assert_eq!(
            EnvironmentLocks::TABLE.select_prefix_sql(0),
            "SELECT env_name, lock_id, created, metadata, esl_version FROM environment_locks \
             ORDER BY env_name, lock_id"
        );
        assert!(
            EnvironmentLocks::TABLE
                .select_prefix_sql(1)
                .contains("WHERE env_name = $1 ORDER BY")
        );
    }

    #[test]
    fn test_backfill_history_sql_joins_on_full_key() {
        let sql = EnvironmentLocks::TABLE.backfill_history_sql();
        assert_eq!(
            sql,
            "INSERT INTO environment_locks_history (env_name, lock_id, created, metadata, esl_version, deleted) \
             SELECT c.env_name, c.lock_id, $1, c.metadata, c.esl_version, FALSE FROM environment_locks c \
             WHERE NOT EXISTS (SELECT 1 FROM environment_locks_history h \
             WHERE h.env_name = c.env_name AND h.lock_id = c.lock_id)"
        );
    }

    #[test]
    fn test_key_shape_is_checked() {
        let table = Releases::TABLE;
        assert!(table.check_prefix(&["app".into()], false).is_ok());
        assert!(table.check_prefix(&["app".into(), 3i64.into()], true).is_ok());
        assert!(table.check_prefix(&["app".into(), "3".into()], true).is_err());
        assert!(table.check_prefix(&["app".into()], true).is_err());
        let key = ReleaseKey::new("app", 3);
        assert_eq!(ReleaseKey::from_values(key.to_values()), Some(key));
    }

    fn history(version: i64, message: &str, deleted: bool) -> HistoryRow<EnvironmentLocks> {
        HistoryRow {
            version,
            key: EnvLockKey::new("dev", "l1"),
            created: datetime!(2024-01-01 0:00 UTC),
            metadata: LockMetadata {
                message: message.to_string(),
                ..LockMetadata::default()
            },
            esl_version: version,
            deleted,
            deletion_metadata: None,
        }
    }

    #[test]
    fn test_replay_last_write_wins() {
        let rows = vec![history(3, "third", false), history(1, "first", false)];
        let (_, metadata) = replay_history(&rows).unwrap();
        assert_eq!(metadata.message, "third");
    }

    #[test]
    fn test_replay_delete_removes_and_recreate_restores() {
        let deleted = vec![history(1, "a", false), history(2, "a", true)];
        assert!(replay_history(&deleted).is_none());
        let recreated = vec![history(1, "a", false), history(2, "a", true), history(3, "b", false)];
        assert_eq!(replay_history(&recreated).unwrap().1.message, "b");
        assert!(replay_history::<EnvironmentLocks>(&[]).is_none());
    }
}
