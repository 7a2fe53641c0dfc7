//! A backend session plus the client-side transaction bookkeeping the lock
//! engine needs.

use pglock_error::{BackendErrorKind, PgLockError, Result};
use pglock_types::{Pid, Rows, Statement};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::transaction::{TransactionController, TxnState};

/// Session wrapper that routes every statement through a
/// [`TransactionController`].
///
/// Transaction-control statements update the controller after the backend
/// accepts them; any other failure inside a transaction marks it aborted.
#[derive(Debug)]
pub struct Connection<B> {
    backend: B,
    txn: TransactionController,
    savepoint_seq: u64,
}

impl<B: Backend> Connection<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            txn: TransactionController::new(),
            savepoint_seq: 0,
        }
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_inner(self) -> B {
        self.backend
    }

    pub const fn transaction(&self) -> &TransactionController {
        &self.txn
    }

    /// True inside BEGIN ... COMMIT/ROLLBACK, aborted or not.
    pub const fn in_transaction(&self) -> bool {
        self.txn.in_transaction()
    }

    /// True when the current transaction is aborted. Never fails.
    pub const fn is_transaction_errored(&self) -> bool {
        self.txn.is_errored()
    }

    /// `lock_timeout` as last installed through this connection.
    pub const fn lock_timeout_setting(&self) -> Option<u64> {
        self.txn.settings().lock_timeout
    }

    // -----------------------------------------------------------------------
    // Statement execution
    // -----------------------------------------------------------------------

    /// Execute a statement, keeping transaction bookkeeping in sync.
    pub fn execute(&mut self, statement: &Statement) -> Result<Rows> {
        match statement {
            Statement::Begin => self.begin().map(|()| Rows::empty()),
            Statement::Commit => self.commit().map(|()| Rows::empty()),
            Statement::Rollback => self.rollback().map(|()| Rows::empty()),
            Statement::Savepoint(name) => self.savepoint_named(name).map(|()| Rows::empty()),
            Statement::ReleaseSavepoint(name) => {
                self.release_savepoint(name).map(|()| Rows::empty())
            }
            Statement::RollbackToSavepoint(name) => {
                self.rollback_to_savepoint(name).map(|()| Rows::empty())
            }
            Statement::SetLockTimeout(ms) => {
                self.set_lock_timeout(Some(*ms)).map(|()| Rows::empty())
            }
            Statement::ResetLockTimeout => self.set_lock_timeout(None).map(|()| Rows::empty()),
            other => self.send(other),
        }
    }

    fn send(&mut self, statement: &Statement) -> Result<Rows> {
        debug!(%statement, txn = ?self.txn.state(), "execute");
        match self.backend.execute(statement) {
            Ok(rows) => Ok(rows),
            Err(err) => {
                if matches!(
                    err.backend_kind(),
                    Some(BackendErrorKind::Terminated | BackendErrorKind::Connection)
                ) {
                    self.txn.abandon();
                } else {
                    self.txn.set_error();
                }
                debug!(%statement, error = %err, "statement failed");
                Err(err)
            }
        }
    }

    pub fn backend_pid(&mut self) -> Result<Pid> {
        let rows = self.send(&Statement::BackendPid)?;
        rows.first_int()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid)
            .ok_or_else(|| PgLockError::internal("pg_backend_pid() returned no integer"))
    }

    /// Install `lock_timeout` (milliseconds), or reset it with `None`.
    pub fn set_lock_timeout(&mut self, lock_timeout: Option<u64>) -> Result<()> {
        let statement = lock_timeout.map_or(Statement::ResetLockTimeout, Statement::SetLockTimeout);
        self.send(&statement)?;
        self.txn.set_lock_timeout(lock_timeout);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transaction control
    // -----------------------------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        self.txn.check_begin()?;
        self.send(&Statement::Begin)?;
        self.txn.begin()
    }

    /// Commit. An aborted transaction is rolled back and reported as an error.
    pub fn commit(&mut self) -> Result<()> {
        if self.txn.is_errored() {
            self.rollback()?;
            return Err(PgLockError::backend_with_code(
                BackendErrorKind::InFailedTransaction,
                "25P02",
                "transaction was aborted and has been rolled back",
            ));
        }
        self.txn.check_commit()?;
        self.send(&Statement::Commit)?;
        self.txn.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.txn.check_rollback()?;
        self.send(&Statement::Rollback)?;
        self.txn.rollback()
    }

    /// Create a savepoint with a generated name and return the name.
    pub fn savepoint(&mut self) -> Result<String> {
        self.savepoint_seq += 1;
        let name = format!("pglock_sp_{}", self.savepoint_seq);
        self.savepoint_named(&name)?;
        Ok(name)
    }

    fn savepoint_named(&mut self, name: &str) -> Result<()> {
        self.txn.check_savepoint()?;
        self.send(&Statement::Savepoint(name.to_owned()))?;
        self.txn.savepoint(name)
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.send(&Statement::ReleaseSavepoint(name.to_owned()))?;
        self.txn.release(name)
    }

    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.send(&Statement::RollbackToSavepoint(name.to_owned()))?;
        self.txn.rollback_to(name)
    }

    // -----------------------------------------------------------------------
    // Atomic blocks
    // -----------------------------------------------------------------------

    /// Run `f` in a transaction, or in a savepoint when one is already open.
    ///
    /// On error the block is rolled back (a savepoint is rolled back to and
    /// released), leaving any enclosing transaction usable.
    pub fn atomic<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.in_transaction() {
            self.atomic_savepoint(f)
        } else {
            self.atomic_outer(f)
        }
    }

    /// Like [`Connection::atomic`], but refuses to nest inside another
    /// transaction.
    pub fn atomic_durable<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.in_transaction() {
            return Err(PgLockError::usage(
                "a durable atomic block cannot be nested in another transaction",
            ));
        }
        self.atomic_outer(f)
    }

    fn atomic_outer<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                if self.in_transaction() {
                    self.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if self.in_transaction() {
                    if let Err(rollback_err) = self.rollback() {
                        warn!(error = %rollback_err, "rollback failed after error in atomic block");
                    }
                }
                Err(err)
            }
        }
    }

    fn atomic_savepoint<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let name = self.savepoint()?;
        let result = f(self);
        if self.txn.state() == TxnState::Idle {
            // The session went away underneath us.
            return result;
        }
        let result = match result {
            Ok(value) if !self.is_transaction_errored() => {
                return match self.release_savepoint(&name) {
                    Ok(()) => Ok(value),
                    Err(err) => {
                        self.discard_savepoint(&name);
                        Err(err)
                    }
                };
            }
            Ok(_) => Err(PgLockError::backend_with_code(
                BackendErrorKind::InFailedTransaction,
                "25P02",
                "atomic block finished with its transaction aborted",
            )),
            Err(err) => Err(err),
        };
        self.discard_savepoint(&name);
        result
    }

    fn discard_savepoint(&mut self, name: &str) {
        let rolled_back = self
            .rollback_to_savepoint(name)
            .and_then(|()| self.release_savepoint(name));
        if let Err(err) = rolled_back {
            warn!(savepoint = %name, error = %err, "could not roll back savepoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedBackend, statements};

    fn sql(text: &str) -> Statement {
        Statement::Sql(text.to_owned())
    }

    #[test]
    fn atomic_outside_transaction_begins_and_commits() {
        let mut conn = ScriptedBackend::new().connect();
        conn.atomic(|conn| conn.execute(&sql("SELECT 1")).map(drop))
            .unwrap();
        assert_eq!(statements(&conn), ["BEGIN", "SELECT 1", "COMMIT"]);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn nested_atomic_failure_rolls_back_to_savepoint_only() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                |s| matches!(s, Statement::Sql(text) if text == "SELECT broken"),
                PgLockError::backend(BackendErrorKind::Other, "syntax error"),
            )
            .connect();
        conn.begin().unwrap();
        let err = conn
            .atomic(|conn| conn.execute(&sql("SELECT broken")))
            .unwrap_err();
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::Other));
        assert!(conn.in_transaction());
        assert!(!conn.is_transaction_errored());
        assert_eq!(
            statements(&conn),
            [
                "BEGIN",
                "SAVEPOINT pglock_sp_1",
                "SELECT broken",
                "ROLLBACK TO SAVEPOINT pglock_sp_1",
                "RELEASE SAVEPOINT pglock_sp_1",
            ]
        );
    }

    #[test]
    fn savepoint_rollback_restores_lock_timeout() {
        let mut conn = ScriptedBackend::new().connect();
        conn.begin().unwrap();
        conn.set_lock_timeout(Some(100)).unwrap();
        let name = conn.savepoint().unwrap();
        conn.set_lock_timeout(Some(5)).unwrap();
        conn.rollback_to_savepoint(&name).unwrap();
        assert_eq!(conn.lock_timeout_setting(), Some(100));
        conn.rollback().unwrap();
        assert_eq!(conn.lock_timeout_setting(), None);
    }

    #[test]
    fn commit_of_aborted_transaction_rolls_back() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                |s| matches!(s, Statement::Sql(_)),
                PgLockError::backend(BackendErrorKind::UniqueViolation, "duplicate key"),
            )
            .connect();
        conn.begin().unwrap();
        assert!(conn.execute(&sql("INSERT INTO t VALUES (1)")).is_err());
        assert!(conn.is_transaction_errored());
        let err = conn.commit().unwrap_err();
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::InFailedTransaction));
        assert!(!conn.in_transaction());
        assert_eq!(
            statements(&conn),
            ["BEGIN", "INSERT INTO t VALUES (1)", "ROLLBACK"]
        );
    }

    #[test]
    fn durable_atomic_refuses_nesting() {
        let mut conn = ScriptedBackend::new().connect();
        conn.begin().unwrap();
        let err = conn.atomic_durable(|_| Ok(())).unwrap_err();
        assert!(err.is_usage());
        assert_eq!(statements(&conn), ["BEGIN"]);
    }

    #[test]
    fn termination_abandons_transaction() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                |s| matches!(s, Statement::Sql(_)),
                PgLockError::backend(BackendErrorKind::Terminated, "terminating connection"),
            )
            .connect();
        let err = conn
            .atomic(|conn| conn.execute(&sql("SELECT pg_sleep(10)")))
            .unwrap_err();
        assert!(err.is_terminated());
        assert!(!conn.in_transaction());
        assert_eq!(statements(&conn), ["BEGIN", "SELECT pg_sleep(10)"]);
    }

    #[test]
    fn backend_pid_reads_first_column() {
        let mut conn = ScriptedBackend::new().connect();
        assert_eq!(conn.backend_pid().unwrap(), Pid(4242));
        let rows = conn.execute(&Statement::BackendPid).unwrap();
        assert_eq!(rows.first_int(), Some(4242));
        assert_eq!(rows.len(), 1);
    }
}
