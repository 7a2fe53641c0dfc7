//! Lock engine for pglock.
//!
//! Everything here drives a [`Backend`] through a [`Connection`], which keeps
//! the client-side view of the transaction (state, savepoints, session
//! `lock_timeout`) in step with what the backend has accepted:
//!
//! - [`timeout`]: scoped `lock_timeout` with restore-on-exit.
//! - [`advisory`]: session and transaction advisory locks, scoped
//!   acquisition, and unit-of-work wrapping.
//! - [`table`]: `LOCK TABLE` inside the current transaction.
//! - [`prioritize`]: a background watcher that terminates or cancels the
//!   sessions blocking a protected one.
//! - [`snapshot`]: the blocking read model and session control the watcher
//!   relies on.

pub mod advisory;
pub mod backend;
pub mod config;
pub mod connection;
pub mod prioritize;
pub mod snapshot;
pub mod table;
pub mod timeout;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use advisory::{AcquireOutcome, AdvisoryLock, LockedFn, function_lock_name};
pub use backend::Backend;
pub use config::PgLockConfig;
pub use connection::Connection;
pub use prioritize::{
    BlockingAction, Prioritize, PrioritizeAction, PrioritizeReport, Watcher,
    run_with_prioritization,
};
pub use snapshot::{
    BlockingSnapshot, FilterSpec, LockCatalog, LockFilter, SessionControl,
    cancel_activity, cancel_blocking_activity, terminate_activity, terminate_blocking_activity,
};
pub use table::{TableLock, lock_tables};
pub use timeout::{LockTimeoutGuard, run_with_timeout};
pub use transaction::{TransactionController, TxnState};
