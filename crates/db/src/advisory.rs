//! Cross-process mutual exclusion with transaction-scoped advisory locks.
//!
//! A lock is held by a dedicated transaction for exactly as long as the
//! guarded work runs; ending that transaction releases it. Release is
//! therefore synchronous: when [`DbHandler::with_advisory_lock`] returns,
//! another process can acquire the lock.

use crate::error::{DbError, DbResult, QueryContext};
use crate::handler::DbHandler;
use sqlx::{Postgres, Transaction};
use std::fmt;
use std::future::Future;

/// Named advisory locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Only one transformer may run at a time.
    IsolateTransformers,
    Custom(i64),
}

impl LockId {
    pub fn id(&self) -> i64 {
        match self {
            Self::IsolateTransformers => 666,
            Self::Custom(id) => *id,
        }
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsolateTransformers => write!(f, "isolate-transformers({})", self.id()),
            Self::Custom(id) => write!(f, "custom({id})"),
        }
    }
}

/// An acquired advisory lock. Dropping it without [`release`](Self::release)
/// rolls the holding transaction back, which also releases the lock.
pub struct AdvisoryLockGuard {
    tx: Transaction<'static, Postgres>,
    lock: LockId,
    shared: bool,
}

impl AdvisoryLockGuard {
    pub fn lock(&self) -> LockId {
        self.lock
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// End the holding transaction and with it the lock.
    pub async fn release(self) -> DbResult<()> {
        let lock = self.lock;
        self.tx
            .rollback()
            .await
            .context(|| format!("release advisory lock {lock}"))?;
        tracing::debug!(lock_id = lock.id(), "advisory lock released");
        Ok(())
    }
}

impl DbHandler {
    /// Block until the lock is granted, shared or exclusive.
    pub async fn acquire_advisory_lock(
        &self,
        shared: bool,
        lock: LockId,
    ) -> DbResult<AdvisoryLockGuard> {
        let mut tx = self.pool().begin().await?;
        let statement = if shared {
            "SELECT pg_advisory_xact_lock_shared($1)"
        } else {
            "SELECT pg_advisory_xact_lock($1)"
        };
        sqlx::query(statement)
            .bind(lock.id())
            .execute(&mut *tx)
            .await
            .context(|| format!("acquire advisory lock {lock}"))?;
        tracing::debug!(lock_id = lock.id(), shared, "advisory lock acquired");
        Ok(AdvisoryLockGuard { tx, lock, shared })
    }

    /// Run `work` while holding the lock, then release it.
    ///
    /// `work` runs in the ambient context, not in the locking transaction.
    /// If both the work and the release fail, both errors are returned
    /// joined in [`DbError::AdvisoryLock`].
    pub async fn with_advisory_lock<T, F, Fut>(
        &self,
        shared: bool,
        lock: LockId,
        work: F,
    ) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let guard = self.acquire_advisory_lock(shared, lock).await?;
        let result = work().await;
        let released = guard.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Err(release_err)) => Err(DbError::AdvisoryLock {
                lock_id: lock.id(),
                errors: vec![err, release_err],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ids() {
        assert_eq!(LockId::IsolateTransformers.id(), 666);
        assert_eq!(LockId::Custom(42).id(), 42);
        assert_eq!(LockId::IsolateTransformers.to_string(), "isolate-transformers(666)");
    }
}
