//! Whole-relation locks.

use pglock_error::{PgLockError, Result};
use pglock_types::{SideEffect, Statement, TableLockMode, TimeoutValue};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::connection::Connection;
use crate::timeout::run_with_timeout;

/// A `LOCK TABLE` request over one or more relations.
#[derive(Debug, Clone)]
pub struct TableLock {
    tables: Vec<String>,
    mode: TableLockMode,
    timeout: Option<TimeoutValue>,
    side_effect: SideEffect,
}

impl TableLock {
    /// Lock `tables` in `ACCESS EXCLUSIVE` mode, reporting the status.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            mode: TableLockMode::default(),
            timeout: None,
            side_effect: SideEffect::ReturnStatus,
        }
    }

    #[must_use]
    pub const fn mode(mut self, mode: TableLockMode) -> Self {
        self.mode = mode;
        self
    }

    /// [`TimeoutValue::Immediate`] renders `NOWAIT` instead of installing a
    /// session timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutValue) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only [`SideEffect::ReturnStatus`] and [`SideEffect::RaiseOnFailure`]
    /// are accepted.
    #[must_use]
    pub const fn side_effect(mut self, side_effect: SideEffect) -> Self {
        self.side_effect = side_effect;
        self
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    fn nowait(&self) -> bool {
        self.timeout.is_some_and(|t| t.is_immediate())
    }

    pub fn statement(&self) -> Statement {
        Statement::LockTables {
            tables: self.tables.clone(),
            mode: self.mode,
            nowait: self.nowait(),
        }
    }

    pub fn lock<B: Backend>(&self, conn: &mut Connection<B>) -> Result<bool> {
        lock_tables(conn, self)
    }
}

/// Lock the relations named by `request` in the current transaction.
///
/// Returns `Ok(false)` when the wait timed out under
/// [`SideEffect::ReturnStatus`]; the lock statement then runs in a savepoint
/// so the caller's transaction stays usable. Every other failure propagates.
pub fn lock_tables<B: Backend>(conn: &mut Connection<B>, request: &TableLock) -> Result<bool> {
    let policy = request.side_effect;
    if policy == SideEffect::SkipOnFailure {
        return Err(PgLockError::usage(
            "table locks accept only ReturnStatus or RaiseOnFailure",
        ));
    }
    if request.tables.is_empty() {
        return Err(PgLockError::usage("must supply at least one table to lock"));
    }
    if !conn.in_transaction() {
        return Err(PgLockError::usage(
            "must be in a transaction to lock tables",
        ));
    }
    if let Some(timeout) = request.timeout {
        timeout.validate()?;
    }

    let statement = request.statement();
    let timeout = request.timeout.filter(|_| !request.nowait());
    debug!(
        tables = ?request.tables,
        mode = %request.mode,
        nowait = request.nowait(),
        timeout = ?timeout,
        policy = %policy,
        "locking tables"
    );

    let run = |conn: &mut Connection<B>| -> Result<()> {
        match timeout {
            Some(timeout) => run_with_timeout(conn, timeout, |conn| conn.execute(&statement).map(drop)),
            None => conn.execute(&statement).map(drop),
        }
    };
    let result = if policy == SideEffect::ReturnStatus {
        conn.atomic(run)
    } else {
        run(conn)
    };

    match result {
        Ok(()) => {
            info!(tables = ?request.tables, mode = %request.mode, "tables locked");
            Ok(true)
        }
        Err(err) if err.is_lock_timeout() && policy == SideEffect::ReturnStatus => {
            debug!(tables = ?request.tables, error = %err, "table lock not acquired");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}
