//! SQLSTATE classification.

use pglock_error::{BackendErrorKind, PgLockError};

pub const LOCK_NOT_AVAILABLE: &str = "55P03";
pub const ADMIN_SHUTDOWN: &str = "57P01";
pub const QUERY_CANCELED: &str = "57014";
pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
pub const UNIQUE_VIOLATION: &str = "23505";

/// Map a SQLSTATE (and whether the client saw the connection close) to a
/// pglock error.
pub fn classify(code: Option<&str>, closed: bool, message: impl Into<String>) -> PgLockError {
    let message = message.into();
    let kind = match code {
        Some(LOCK_NOT_AVAILABLE) => return PgLockError::lock_timeout(message),
        Some(ADMIN_SHUTDOWN) => BackendErrorKind::Terminated,
        Some(QUERY_CANCELED) => BackendErrorKind::Cancelled,
        Some(IN_FAILED_SQL_TRANSACTION) => BackendErrorKind::InFailedTransaction,
        Some(UNIQUE_VIOLATION) => BackendErrorKind::UniqueViolation,
        _ if closed => BackendErrorKind::Connection,
        _ => BackendErrorKind::Other,
    };
    match code {
        Some(code) => PgLockError::backend_with_code(kind, code, message),
        None => PgLockError::backend(kind, message),
    }
}

pub fn map_error(err: &postgres::Error) -> PgLockError {
    let message = err
        .as_db_error()
        .map_or_else(|| err.to_string(), |db| db.message().to_owned());
    classify(err.code().map(postgres::error::SqlState::code), err.is_closed(), message)
}
