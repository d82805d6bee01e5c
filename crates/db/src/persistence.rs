//! Runtime persistence strategy, selected once at startup.

use crate::error::{DbError, DbResult};
use crate::handler::DbHandler;
use crate::transaction::DbTx;
use async_trait::async_trait;
use kuberpult_core::{ActorMetadata, DbConfig, EslVersion, EventType, PersistenceMode};
use serde_json::Value;

/// A state change that is recorded in the ledger and, with full
/// persistence, applied to the current-state and history tables.
#[async_trait]
pub trait Mutation: Send + Sync {
    /// Tag of the ledger entry.
    fn event_type(&self) -> EventType;

    /// Document stored in the ledger, before actor metadata is merged in.
    fn payload(&self) -> DbResult<Value>;

    /// Table writes for this mutation; `esl_version` is its ledger entry.
    async fn apply(&self, handler: &DbHandler, tx: &mut DbTx, esl_version: EslVersion)
    -> DbResult<()>;
}

/// Which writes reach the database.
#[derive(Clone, Debug)]
pub enum Persistence {
    Disabled,
    LedgerOnly(DbHandler),
    Full(DbHandler),
}

impl Persistence {
    /// Connect according to `config`. Disabled persistence opens no connection.
    pub async fn from_config(config: &DbConfig) -> DbResult<Self> {
        config.validate().map_err(DbError::Config)?;
        if config.persistence == PersistenceMode::Disabled {
            tracing::info!("Persistence disabled, no database connection opened");
            return Ok(Self::Disabled);
        }
        let database = config.database.as_ref().ok_or_else(|| {
            DbError::Config("persistence requires a [database] section".to_string())
        })?;
        let handler = DbHandler::from_config(database)
            .await?
            .with_transaction_config(config.transactions.clone())
            .with_sync_status_config(config.sync_status.clone());
        tracing::info!(mode = config.persistence.as_str(), "Persistence ready");
        Ok(Self::with_handler(config.persistence, handler))
    }

    /// Wrap an existing handler in the given mode.
    pub fn with_handler(mode: PersistenceMode, handler: DbHandler) -> Self {
        match mode {
            PersistenceMode::Disabled => Self::Disabled,
            PersistenceMode::LedgerOnly => Self::LedgerOnly(handler),
            PersistenceMode::Full => Self::Full(handler),
        }
    }

    pub fn mode(&self) -> PersistenceMode {
        match self {
            Self::Disabled => PersistenceMode::Disabled,
            Self::LedgerOnly(_) => PersistenceMode::LedgerOnly,
            Self::Full(_) => PersistenceMode::Full,
        }
    }

    pub fn handler(&self) -> Option<&DbHandler> {
        match self {
            Self::Disabled => None,
            Self::LedgerOnly(handler) | Self::Full(handler) => Some(handler),
        }
    }

    /// Record `mutation` in one retried transaction.
    ///
    /// Returns the ledger version, or `None` when persistence is disabled.
    pub async fn record<M>(&self, mutation: &M, actor: &ActorMetadata) -> DbResult<Option<EslVersion>>
    where
        M: Mutation + Clone + 'static,
    {
        let (handler, apply) = match self {
            Self::Disabled => return Ok(None),
            Self::LedgerOnly(handler) => (handler, false),
            Self::Full(handler) => (handler, true),
        };
        let payload = mutation.payload()?;
        let event_type = mutation.event_type();
        handler
            .with_transaction_optional(false, |h, tx| {
                let mutation = mutation.clone();
                let payload = payload.clone();
                let actor = actor.clone();
                Box::pin(async move {
                    let version = h.append_event(tx, event_type, &payload, &actor).await?;
                    if apply {
                        mutation.apply(h, tx, version).await?;
                    }
                    Ok(Some(version))
                })
            })
            .await
    }
}
