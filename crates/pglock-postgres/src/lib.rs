//! PostgreSQL plumbing for pglock.
//!
//! [`PgBackend`] runs the lock engine's statements on one session.
//! [`PgCatalog`] reads the blocking graph and signals other sessions from a
//! second one, as the prioritization watcher requires.

pub mod backend;
pub mod catalog;
pub mod error;

pub use backend::{PgBackend, ResultShape, SqlPlan, render};
pub use catalog::{PgCatalog, blocked_locks_sql};
pub use error::{classify, map_error};

use pglock_core::{Connection, PgLockConfig};
use pglock_error::{PgLockError, Result};
use postgres::{Client, NoTls};
use tracing::info;

/// Open a raw client from `config`.
pub fn connect_client(config: &PgLockConfig) -> Result<Client> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| PgLockError::config("database_url is not set"))?;
    let mut pg_config: postgres::Config = url
        .parse()
        .map_err(|err| PgLockError::config(format!("invalid database_url: {err}")))?;
    if let Some(name) = &config.application_name {
        pg_config.application_name(name);
    }
    let client = pg_config.connect(NoTls).map_err(|e| map_error(&e))?;
    info!(
        application_name = config.application_name.as_deref().unwrap_or(""),
        "connected to postgres"
    );
    Ok(client)
}

/// A lock-engine connection on a fresh session.
pub fn connect(config: &PgLockConfig) -> Result<Connection<PgBackend>> {
    Ok(Connection::new(PgBackend::new(connect_client(config)?)))
}

/// A lock catalog on a fresh session, for the prioritization watcher.
pub fn connect_catalog(config: &PgLockConfig) -> Result<PgCatalog> {
    PgCatalog::new(connect_client(config)?)
}
