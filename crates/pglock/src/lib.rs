//! Postgres locking helpers.
//!
//! Advisory locks (session and transaction level, scoped or wrapping a unit
//! of work), `LOCK TABLE` inside the current transaction, `lock_timeout`
//! scopes that restore the previous value, and a watcher that terminates or
//! cancels whatever blocks a protected session.
//!
//! ```ignore
//! use pglock::prelude::*;
//!
//! let mut conn = pglock::postgres::connect(&config)?;
//! let lock = AdvisoryLock::new("nightly-report").timeout(TimeoutValue::Immediate);
//! lock.scoped(&mut conn, |conn, acquired| {
//!     if acquired {
//!         build_report(conn)?;
//!     }
//!     Ok(())
//! })?;
//! ```

mod ext;

pub use ext::LockStatusExt;
pub use pglock_core::{
    AcquireOutcome, AdvisoryLock, Backend, BlockingAction, BlockingSnapshot, Connection,
    FilterSpec, LockCatalog, LockFilter, LockTimeoutGuard, LockedFn, PgLockConfig, Prioritize,
    PrioritizeAction, PrioritizeReport, SessionControl, TableLock, TransactionController,
    TxnState, Watcher, cancel_activity, cancel_blocking_activity, config, function_lock_name,
    lock_tables, run_with_prioritization, run_with_timeout, terminate_activity,
    terminate_blocking_activity,
};
pub use pglock_error::{BackendErrorKind, PgLockError, Result};
pub use pglock_types::{
    BlockedLock, LockKey, Pid, RelationKind, Row, Rows, SideEffect, Statement, TableLockMode,
    TimeoutValue, Value, advisory_id,
};

/// The Postgres backend and lock catalog.
#[cfg(feature = "postgres")]
pub mod postgres {
    pub use pglock_postgres::{
        PgBackend, PgCatalog, classify, connect, connect_catalog, connect_client, map_error,
    };
}

pub mod prelude {
    pub use crate::LockStatusExt;
    pub use pglock_core::{
        AdvisoryLock, Connection, LockedFn, Prioritize, PrioritizeAction, TableLock,
        run_with_prioritization, run_with_timeout,
    };
    pub use pglock_error::{PgLockError, Result};
    pub use pglock_types::{SideEffect, TableLockMode, TimeoutValue};
}
