//! Client-side transaction state machine.
//!
//! Mirrors what the backend does with BEGIN/COMMIT/ROLLBACK and a LIFO
//! savepoint stack, so the lock engine can answer "are we in a transaction?"
//! and "is it aborted?" without a round-trip. Session settings installed by
//! this client are snapshotted per savepoint: the backend rolls `SET` back
//! together with the work it belongs to, and so do we.

use pglock_error::{PgLockError, Result};
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// Transaction state
// ---------------------------------------------------------------------------

/// Current state of a session's transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxnState {
    /// No active transaction (autocommit mode).
    #[default]
    Idle,
    /// Transaction is active.
    Active,
    /// Transaction is aborted; only ROLLBACK or ROLLBACK TO is accepted.
    Error,
}

// ---------------------------------------------------------------------------
// Session settings
// ---------------------------------------------------------------------------

/// Session-local settings this client has installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// `lock_timeout` in milliseconds, `None` when left at the server default.
    pub lock_timeout: Option<u64>,
}

// ---------------------------------------------------------------------------
// Savepoint
// ---------------------------------------------------------------------------

/// A savepoint on the LIFO stack.
///
/// RELEASE X keeps work since SAVEPOINT X and removes X and all later
/// savepoints. ROLLBACK TO X undoes work since X but leaves X on the stack.
#[derive(Debug, Clone)]
pub struct SavepointEntry {
    pub name: String,
    settings_snapshot: SessionSettings,
}

// ---------------------------------------------------------------------------
// TransactionController
// ---------------------------------------------------------------------------

/// Tracks the transaction lifecycle of a single session.
#[derive(Debug, Default)]
pub struct TransactionController {
    state: TxnState,
    savepoints: Vec<SavepointEntry>,
    settings: SessionSettings,
    /// Settings as they were at BEGIN, restored by ROLLBACK.
    begin_snapshot: SessionSettings,
}

impl TransactionController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        !matches!(self.state, TxnState::Idle)
    }

    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self.state, TxnState::Error)
    }

    #[must_use]
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    #[must_use]
    pub const fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Record a setting change the backend accepted.
    pub fn set_lock_timeout(&mut self, lock_timeout: Option<u64>) {
        self.settings.lock_timeout = lock_timeout;
    }

    // -----------------------------------------------------------------------
    // BEGIN
    // -----------------------------------------------------------------------

    /// Validate that a BEGIN may be issued.
    pub fn check_begin(&self) -> Result<()> {
        if self.state != TxnState::Idle {
            error!("BEGIN refused: transaction already active");
            return Err(PgLockError::usage("a transaction is already active"));
        }
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.check_begin()?;
        self.state = TxnState::Active;
        self.begin_snapshot = self.settings;
        debug!(lock_timeout = ?self.settings.lock_timeout, "transaction started");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // COMMIT / ROLLBACK
    // -----------------------------------------------------------------------

    pub fn check_commit(&self) -> Result<()> {
        match self.state {
            TxnState::Idle => Err(PgLockError::usage("no transaction is active")),
            TxnState::Error => {
                error!("COMMIT refused: transaction is aborted, must ROLLBACK");
                Err(PgLockError::usage(
                    "current transaction is aborted, commands ignored until end of transaction block",
                ))
            }
            TxnState::Active => Ok(()),
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.check_commit()?;
        debug!(savepoint_depth = self.savepoints.len(), "commit");
        self.reset();
        Ok(())
    }

    pub fn check_rollback(&self) -> Result<()> {
        if self.state == TxnState::Idle {
            return Err(PgLockError::usage("no transaction is active"));
        }
        Ok(())
    }

    /// Roll back the whole transaction, settings included.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_rollback()?;
        debug!(savepoint_depth = self.savepoints.len(), "rollback");
        self.settings = self.begin_snapshot;
        self.reset();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // SAVEPOINT
    // -----------------------------------------------------------------------

    pub fn check_savepoint(&self) -> Result<()> {
        match self.state {
            TxnState::Idle => Err(PgLockError::usage(
                "SAVEPOINT can only be used in transaction blocks",
            )),
            TxnState::Error => Err(PgLockError::usage(
                "current transaction is aborted, cannot create a savepoint",
            )),
            TxnState::Active => Ok(()),
        }
    }

    /// Push a named savepoint.
    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.check_savepoint()?;
        self.savepoints.push(SavepointEntry {
            name: name.to_owned(),
            settings_snapshot: self.settings,
        });
        debug!(savepoint = %name, depth = self.savepoints.len(), "savepoint created");
        Ok(())
    }

    /// RELEASE savepoint: removes X and all more recent savepoints.
    pub fn release(&mut self, name: &str) -> Result<()> {
        if self.state == TxnState::Error {
            return Err(PgLockError::usage(
                "current transaction is aborted, cannot release a savepoint",
            ));
        }
        let pos = self.find_savepoint(name)?;
        let removed = self.savepoints.len() - pos;
        self.savepoints.truncate(pos);
        debug!(
            savepoint = %name,
            removed,
            remaining = self.savepoints.len(),
            "savepoint released"
        );
        Ok(())
    }

    /// ROLLBACK TO savepoint: undoes everything since X, keeps X on the
    /// stack, and clears the aborted state.
    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        let pos = self.find_savepoint(name)?;
        self.savepoints.truncate(pos + 1);
        self.settings = self.savepoints[pos].settings_snapshot;
        if self.state == TxnState::Error {
            self.state = TxnState::Active;
        }
        info!(
            savepoint = %name,
            depth = self.savepoints.len(),
            lock_timeout = ?self.settings.lock_timeout,
            "rollback to savepoint"
        );
        Ok(())
    }

    /// Mark the transaction as aborted after a failed statement.
    pub fn set_error(&mut self) {
        if self.state == TxnState::Active {
            self.state = TxnState::Error;
            debug!("transaction entered error state");
        }
    }

    /// Forget everything, e.g. after the session was lost.
    pub fn abandon(&mut self) {
        if self.state != TxnState::Idle {
            error!(
                savepoint_depth = self.savepoints.len(),
                "transaction abandoned with the session"
            );
        }
        self.reset();
        self.settings = SessionSettings::default();
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Find a savepoint by name (case-insensitive, searches from top of stack).
    fn find_savepoint(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| PgLockError::usage(format!("savepoint \"{name}\" does not exist")))
    }

    fn reset(&mut self) {
        self.state = TxnState::Idle;
        self.savepoints.clear();
        self.begin_snapshot = SessionSettings::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
