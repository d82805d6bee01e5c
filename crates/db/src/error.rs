//! Persistence error types.

use thiserror::Error;

/// Join several error messages, keeping each one visible.
fn format_joined(errors: &[DbError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Persistence operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{context}: {source}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("could not marshal {what}: {source}")]
    Marshal {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not unmarshal {what}: {source}. Data: {raw}")]
    Unmarshal {
        what: String,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed row in {table}: {message}")]
    MalformedRow { table: String, message: String },

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("migration '{name}' failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("manifest source error: {0}")]
    Source(String),

    #[error("advisory lock {lock_id}: {}", format_joined(.errors))]
    AdvisoryLock { lock_id: i64, errors: Vec<DbError> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        crate::retry::is_retryable(self)
    }

    /// Caller misuse that an API layer should report as a 4xx.
    pub fn is_failed_precondition(&self) -> bool {
        match self {
            Self::FailedPrecondition(_) => true,
            Self::Migration { source, .. } => source.is_failed_precondition(),
            _ => false,
        }
    }

    pub(crate) fn malformed(table: &str, message: impl Into<String>) -> Self {
        Self::MalformedRow {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

impl From<kuberpult_core::Error> for DbError {
    fn from(err: kuberpult_core::Error) -> Self {
        match err {
            kuberpult_core::Error::Config(msg) => Self::Config(msg),
            kuberpult_core::Error::UnknownEventType(_) => {
                Self::malformed("event_sourcing_light", err.to_string())
            }
            kuberpult_core::Error::InvalidSyncStatus(_) => {
                Self::malformed("git_sync_status", err.to_string())
            }
        }
    }
}

/// Result type for persistence operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Attach operation context to a raw sqlx result without hiding its cause.
pub(crate) trait QueryContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> DbResult<T>;
}

impl<T> QueryContext<T> for std::result::Result<T, sqlx::Error> {
    fn context(self, context: impl FnOnce() -> String) -> DbResult<T> {
        self.map_err(|source| DbError::Query {
            context: context(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_query_context_keeps_source() {
        let result: Result<(), sqlx::Error> = Err(sqlx::Error::RowNotFound);
        let err = result
            .context(|| "select environment lock dev/l1".to_string())
            .unwrap_err();
        assert!(err.to_string().starts_with("select environment lock dev/l1: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_unmarshal_includes_raw_payload() {
        let source = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = DbError::Unmarshal {
            what: "lock metadata".to_string(),
            raw: "{oops".to_string(),
            source,
        };
        assert!(err.to_string().contains("Data: {oops"));
    }

    #[test]
    fn test_advisory_lock_joins_messages() {
        let err = DbError::AdvisoryLock {
            lock_id: 666,
            errors: vec![
                DbError::Internal("work failed".to_string()),
                DbError::Internal("release failed".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("advisory lock 666"));
        assert!(msg.contains("work failed"));
        assert!(msg.contains("release failed"));
    }

    #[test]
    fn test_failed_precondition_survives_migration_wrapping() {
        let err = DbError::Migration {
            name: "commit_events".to_string(),
            source: Box::new(DbError::FailedPrecondition("no transformer".to_string())),
        };
        assert!(err.is_failed_precondition());
        assert!(!DbError::Internal("x".to_string()).is_failed_precondition());
    }
}
