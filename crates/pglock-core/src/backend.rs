//! The session capability the lock engine drives.

use pglock_error::Result;
use pglock_types::{Rows, Statement};

/// One backend session.
///
/// Implementations execute a typed [`Statement`] and report failures through
/// [`pglock_error::PgLockError`], keeping lock timeouts
/// ([`PgLockError::LockTimeout`](pglock_error::PgLockError::LockTimeout))
/// distinct from every other backend failure. A session is owned by one
/// thread at a time.
pub trait Backend: Send {
    fn execute(&mut self, statement: &Statement) -> Result<Rows>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn execute(&mut self, statement: &Statement) -> Result<Rows> {
        (**self).execute(statement)
    }
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn execute(&mut self, statement: &Statement) -> Result<Rows> {
        (**self).execute(statement)
    }
}
