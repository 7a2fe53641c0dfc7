//! Error taxonomy shared by every pglock crate.
//!
//! Usage and type errors are raised before anything reaches the backend.
//! Lock timeouts are kept apart from every other backend failure so that
//! side-effect policies can turn them into a status. Failures captured by the
//! prioritization watcher are re-raised on the owning thread wrapped in
//! [`PgLockError::WatcherFailure`].

use std::fmt;

/// Classification of backend failures other than lock timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    /// The session was force-disconnected (`57P01 admin_shutdown`).
    Terminated,
    /// The in-flight statement was cancelled (`57014 query_canceled`).
    Cancelled,
    /// A statement was issued inside an aborted transaction (`25P02`).
    InFailedTransaction,
    /// Unique constraint violation (`23505`).
    UniqueViolation,
    /// The connection to the backend is gone.
    Connection,
    /// Anything else.
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
            Self::InFailedTransaction => "in failed transaction",
            Self::UniqueViolation => "unique violation",
            Self::Connection => "connection",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Primary error type for pglock.
#[derive(Debug, thiserror::Error)]
pub enum PgLockError {
    /// Illegal argument or mode combination. Never reaches the backend.
    #[error("usage error: {0}")]
    Usage(String),

    /// A dynamically supplied value has the wrong type (e.g. a lock id that is
    /// neither an integer nor a string).
    #[error("type error: {0}")]
    InvalidType(String),

    /// The backend gave up waiting for a lock (`55P03 lock_not_available`),
    /// or a non-blocking attempt failed under a raising policy.
    #[error("lock timeout: {message}")]
    LockTimeout { message: String },

    /// Any other backend failure. Always propagated regardless of policy.
    #[error("backend error ({kind}){}: {message}", sqlstate_suffix(.code))]
    Backend {
        kind: BackendErrorKind,
        code: Option<String>,
        message: String,
    },

    /// A corrective action raised inside the prioritization watcher.
    #[error("exception raised in prioritization side effect: {source}")]
    WatcherFailure {
        #[source]
        source: Box<Self>,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PgLockError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self::InvalidType(message.into())
    }

    pub fn lock_timeout(message: impl Into<String>) -> Self {
        Self::LockTimeout {
            message: message.into(),
        }
    }

    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self::Backend {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Backend error carrying the five-character SQLSTATE it was mapped from.
    pub fn backend_with_code(
        kind: BackendErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Backend {
            kind,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn watcher_failure(source: Self) -> Self {
        Self::WatcherFailure {
            source: Box::new(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    #[must_use]
    pub const fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    #[must_use]
    pub const fn is_watcher_failure(&self) -> bool {
        matches!(self, Self::WatcherFailure { .. })
    }

    /// Backend classification, if this is a backend error.
    #[must_use]
    pub const fn backend_kind(&self) -> Option<BackendErrorKind> {
        match self {
            Self::Backend { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// SQLSTATE of a backend error, when the backend reported one.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Backend { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.backend_kind() == Some(BackendErrorKind::Terminated)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.backend_kind() == Some(BackendErrorKind::Cancelled)
    }
}

#[allow(clippy::ref_option)]
fn sqlstate_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

pub type Result<T, E = PgLockError> = std::result::Result<T, E>;
