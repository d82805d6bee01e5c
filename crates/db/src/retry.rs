//! Classification of errors that disappear when the whole transaction is retried.

use crate::error::DbError;
use sqlx::postgres::PgDatabaseError;
use std::collections::HashSet;
use std::error::Error;

/// SQLSTATE class 40: transaction rollback (serialization_failure, deadlock_detected, ...).
const TRANSACTION_ROLLBACK_CLASS: &str = "40";

/// SQLSTATE lock_not_available, raised by NOWAIT and lock_timeout.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Upper bound on how many causes are inspected.
const MAX_CHAIN_DEPTH: usize = 1024;

/// Whether a SQLSTATE code denotes a transient cross-transaction conflict.
pub fn is_retryable_code(code: &str) -> bool {
    code.starts_with(TRANSACTION_ROLLBACK_CLASS) || code == LOCK_NOT_AVAILABLE
}

/// Walk the cause chain of `err` looking for a retryable database error code.
///
/// Stops on cycles and after [`MAX_CHAIN_DEPTH`] causes.
pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
    let mut seen: HashSet<*const ()> = HashSet::new();
    let mut current = Some(err);
    let mut depth = 0;

    while let Some(cause) = current {
        if depth >= MAX_CHAIN_DEPTH {
            tracing::warn!(depth, "error chain too deep, treating as not retryable");
            return false;
        }
        if !seen.insert(cause as *const dyn Error as *const ()) {
            return false;
        }
        if database_code(cause).is_some_and(|code| is_retryable_code(&code)) {
            return true;
        }
        if joined_is_retryable(cause) {
            return true;
        }
        current = cause.source();
        depth += 1;
    }
    false
}

/// A joined advisory-lock error is retryable when any of its parts is.
fn joined_is_retryable(err: &(dyn Error + 'static)) -> bool {
    match err.downcast_ref::<DbError>() {
        Some(DbError::AdvisoryLock { errors, .. }) => errors.iter().any(|e| is_retryable(e)),
        _ => false,
    }
}

fn database_code(err: &(dyn Error + 'static)) -> Option<String> {
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        return sqlx_err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned());
    }
    err.downcast_ref::<PgDatabaseError>()
        .map(|pg_err| pg_err.code().to_string())
}
