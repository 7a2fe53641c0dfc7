//! Core type definitions for pglock.
//!
//! Everything here is backend-agnostic: lock identifiers, timeout values,
//! lock modes, the typed statement vocabulary the core issues to a backend,
//! and the rows a blocking snapshot yields.

pub mod activity;
pub mod key;
pub mod mode;
pub mod statement;
pub mod timeout;

pub use activity::{BlockedLock, Pid, RelationKind};
pub use key::{LockKey, advisory_id};
pub use mode::{SideEffect, TableLockMode};
pub use statement::{Row, Rows, Statement, Value};
pub use timeout::{MAX_LOCK_TIMEOUT_MS, TimeoutValue};
