//! Test support for pglock.
//!
//! [`SimServer`] stands in for a Postgres server: sessions really block on
//! each other, time out under `lock_timeout`, and can be cancelled or
//! terminated from another thread. [`SimBackend`] and [`SimCatalog`] plug it
//! into the lock engine the same way the Postgres backend does.

pub mod log;
pub mod server;
pub mod session;

pub use log::{init_test_logging, init_test_logging_with_level};
pub use server::{EVENT_LOG_CAPACITY, LockTarget, SimEvent, SimServer};
pub use session::{SimBackend, SimCatalog};
