//! Serializable transaction runner and the per-transaction timestamp oracle.
//!
//! Every entry point runs its work through [`DbHandler::with_transaction_multiple`]
//! (or one of the thin variants built on it). The work closure receives the
//! handler and a [`DbTx`]; it is called again from scratch when the attempt
//! fails with a retryable error, so it must clone whatever it moves into its
//! future:
//!
//! ```ignore
//! handler
//!     .with_transaction(false, |h, tx| {
//!         let actor = actor.clone();
//!         Box::pin(async move {
//!             h.append_event(tx, EventType::CreateEnvironment, &payload(), &actor).await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```
//!
//! Dropping the returned future drops the open transaction, which rolls back.

use crate::error::{DbResult, QueryContext};
use crate::handler::DbHandler;
use futures::future::BoxFuture;
use sqlx::{PgConnection, Pool, Postgres, Transaction};
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};

/// Future returned by transaction work closures.
pub type TxFuture<'t, T> = BoxFuture<'t, DbResult<T>>;

/// An open serializable transaction.
pub struct DbTx {
    inner: Transaction<'static, Postgres>,
    read_only: bool,
    now: Option<OffsetDateTime>,
    now_queries: u32,
}

impl DbTx {
    pub(crate) async fn begin(pool: &Pool<Postgres>, read_only: bool) -> DbResult<Self> {
        let mut inner = pool.begin().await?;
        let mode = if read_only {
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY"
        } else {
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ WRITE"
        };
        sqlx::query(mode).execute(&mut *inner).await?;
        Ok(Self {
            inner,
            read_only,
            now: None,
            now_queries: 0,
        })
    }

    /// Connection to run statements on.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.inner
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The transaction's single "now", read from the database clock in UTC.
    ///
    /// Queried on first use and reused afterwards, so every row written in
    /// this transaction carries the same timestamp.
    pub async fn now(&mut self) -> DbResult<OffsetDateTime> {
        if let Some(now) = self.now {
            return Ok(now);
        }
        let now: OffsetDateTime = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *self.inner)
            .await
            .context(|| "read transaction timestamp".to_string())?;
        let now = now.to_offset(UtcOffset::UTC);
        self.now_queries += 1;
        self.now = Some(now);
        Ok(now)
    }

    /// How many times the database clock was queried. Never more than one.
    pub fn timestamp_queries(&self) -> u32 {
        self.now_queries
    }

    pub async fn commit(self) -> DbResult<()> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> DbResult<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}

impl DbHandler {
    /// Open a transaction without the runner. The caller commits it;
    /// dropping it rolls back.
    pub async fn begin_transaction(&self, read_only: bool) -> DbResult<DbTx> {
        DbTx::begin(self.pool(), read_only).await
    }

    /// Run work returning nothing, with the configured retry count.
    pub async fn with_transaction<F>(&self, read_only: bool, work: F) -> DbResult<()>
    where
        F: for<'t> FnMut(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, ()> + Send,
    {
        let retries = self.transaction_config().max_retries;
        self.with_transaction_retry(retries, read_only, work).await
    }

    /// Run work returning nothing, retrying at most `max_retries` times.
    pub async fn with_transaction_retry<F>(
        &self,
        max_retries: u8,
        read_only: bool,
        mut work: F,
    ) -> DbResult<()>
    where
        F: for<'t> FnMut(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, ()> + Send,
    {
        self.with_transaction_multiple(max_retries, read_only, move |handler, tx| {
            let fut = work(handler, tx);
            Box::pin(async move {
                fut.await?;
                Ok(Vec::<()>::new())
            })
        })
        .await?;
        Ok(())
    }

    /// Run work returning at most one value, with the configured retry count.
    pub async fn with_transaction_optional<T, F>(&self, read_only: bool, work: F) -> DbResult<Option<T>>
    where
        T: Send + 'static,
        F: for<'t> FnMut(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, Option<T>> + Send,
    {
        let retries = self.transaction_config().max_retries;
        self.with_transaction_optional_retry(retries, read_only, work)
            .await
    }

    /// Run work returning at most one value, retrying at most `max_retries` times.
    pub async fn with_transaction_optional_retry<T, F>(
        &self,
        max_retries: u8,
        read_only: bool,
        mut work: F,
    ) -> DbResult<Option<T>>
    where
        T: Send + 'static,
        F: for<'t> FnMut(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, Option<T>> + Send,
    {
        let rows = self
            .with_transaction_multiple(max_retries, read_only, move |handler, tx| {
                let fut = work(handler, tx);
                Box::pin(async move { Ok(fut.await?.into_iter().collect::<Vec<T>>()) })
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Run work returning many values. All other variants delegate here.
    ///
    /// Begins a serializable transaction, runs `work`, and commits. If the
    /// work fails the transaction is rolled back and the error returned
    /// unchanged; if the commit fails that error is returned instead. A
    /// retryable failure of begin, work or commit replays the whole
    /// transaction after the configured delay, up to `max_retries` times.
    pub async fn with_transaction_multiple<T, F>(
        &self,
        max_retries: u8,
        read_only: bool,
        mut work: F,
    ) -> DbResult<Vec<T>>
    where
        T: Send + 'static,
        F: for<'t> FnMut(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, Vec<T>> + Send,
    {
        let delay = Duration::from_millis(self.transaction_config().retry_delay_ms);
        let mut attempt: u8 = 0;
        loop {
            match self.run_once(read_only, &mut work).await {
                Ok(rows) => return Ok(rows),
                Err(err) if attempt < max_retries && err.is_retryable() => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries,
                        error = %err,
                        "transaction conflicted, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once<T, F>(&self, read_only: bool, work: &mut F) -> DbResult<Vec<T>>
    where
        T: Send + 'static,
        F: for<'t> FnMut(&'t DbHandler, &'t mut DbTx) -> TxFuture<'t, Vec<T>> + Send,
    {
        let mut tx = DbTx::begin(self.pool(), read_only).await?;
        let result = work(self, &mut tx).await;
        match result {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
