//! Result adapters.

use pglock_error::{PgLockError, Result};

/// Turn a lock timeout into `Ok(None)`.
///
/// Useful with [`SideEffect::RaiseOnFailure`](pglock_types::SideEffect) when
/// one call site wants to treat contention as "not this time" while every
/// other failure still propagates.
///
/// ```ignore
/// use pglock::LockStatusExt;
///
/// let ran = LockedFn::new("sync").call(&mut conn, sync).lock_status()?;
/// if ran.is_none() {
///     tracing::info!("sync already running elsewhere");
/// }
/// ```
pub trait LockStatusExt<T> {
    fn lock_status(self) -> Result<Option<T>>;
}

impl<T> LockStatusExt<T> for Result<T> {
    fn lock_status(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(PgLockError::LockTimeout { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
