//! Scoped `lock_timeout` management.
//!
//! A [`LockTimeoutGuard`] installs a timeout on a connection and puts the
//! previous value back when it goes away. Guards borrow the connection
//! mutably, so scopes on one session nest strictly.

use std::ops::{Deref, DerefMut};

use pglock_error::Result;
use pglock_types::TimeoutValue;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::connection::Connection;

/// A pushed `lock_timeout` scope.
///
/// Call [`LockTimeoutGuard::finish`] to observe restore failures; dropping the
/// guard restores too, logging any failure.
#[must_use = "dropping the guard immediately restores the previous lock_timeout"]
pub struct LockTimeoutGuard<'c, B: Backend> {
    conn: &'c mut Connection<B>,
    previous: Option<u64>,
    value: TimeoutValue,
    restored: bool,
}

impl<'c, B: Backend> LockTimeoutGuard<'c, B> {
    /// Install `value` as the session `lock_timeout`.
    pub fn push(conn: &'c mut Connection<B>, value: TimeoutValue) -> Result<Self> {
        value.validate()?;
        let previous = conn.lock_timeout_setting();
        let millis = value.setting_millis();
        conn.set_lock_timeout(Some(millis))?;
        debug!(timeout = %value, timeout_ms = millis, previous_ms = ?previous, "lock_timeout pushed");
        Ok(Self {
            conn,
            previous,
            value,
            restored: false,
        })
    }

    pub const fn value(&self) -> TimeoutValue {
        self.value
    }

    /// Restore the previous value and report the outcome.
    pub fn finish(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        if self.conn.is_transaction_errored() {
            warn!(
                timeout = %self.value,
                previous_ms = ?self.previous,
                "skipping lock_timeout restore: transaction is aborted"
            );
            return Ok(());
        }
        self.conn.set_lock_timeout(self.previous)?;
        debug!(previous_ms = ?self.previous, "lock_timeout restored");
        Ok(())
    }
}

impl<B: Backend> Deref for LockTimeoutGuard<'_, B> {
    type Target = Connection<B>;

    fn deref(&self) -> &Connection<B> {
        self.conn
    }
}

impl<B: Backend> DerefMut for LockTimeoutGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Connection<B> {
        self.conn
    }
}

impl<B: Backend> Drop for LockTimeoutGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            warn!(error = %err, "failed to restore lock_timeout");
        }
    }
}

/// Run `body` with `value` installed as the session `lock_timeout`.
///
/// The previous value is restored afterwards unless the transaction was left
/// aborted. A body error wins over a restore error.
pub fn run_with_timeout<B, T>(
    conn: &mut Connection<B>,
    value: TimeoutValue,
    body: impl FnOnce(&mut Connection<B>) -> Result<T>,
) -> Result<T>
where
    B: Backend,
{
    let mut guard = LockTimeoutGuard::push(conn, value)?;
    let result = body(&mut *guard);
    let restored = guard.finish();
    match (result, restored) {
        (Ok(value), restored) => restored.map(|()| value),
        (Err(err), Err(restore_err)) => {
            warn!(error = %restore_err, "lock_timeout restore failed while an error is propagating");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pglock_error::{BackendErrorKind, PgLockError};
    use pglock_types::Statement;
    use proptest::prelude::*;

    use super::*;
    use crate::testing::{ScriptedBackend, statements};

    #[test]
    fn push_and_restore_to_default() {
        let mut conn = ScriptedBackend::new().connect();
        run_with_timeout(&mut conn, TimeoutValue::from_millis(250), |conn| {
            assert_eq!(conn.lock_timeout_setting(), Some(250));
            Ok(())
        })
        .unwrap();
        assert_eq!(conn.lock_timeout_setting(), None);
        assert_eq!(
            statements(&conn),
            ["SET lock_timeout = 250", "RESET lock_timeout"]
        );
    }

    #[test]
    fn nested_scopes_restore_in_order() {
        let mut conn = ScriptedBackend::new().connect();
        run_with_timeout(&mut conn, TimeoutValue::from_millis(1_000), |conn| {
            run_with_timeout(conn, TimeoutValue::Infinite, |conn| {
                run_with_timeout(conn, TimeoutValue::Immediate, |conn| {
                    assert_eq!(conn.lock_timeout_setting(), Some(1));
                    Ok(())
                })?;
                assert_eq!(conn.lock_timeout_setting(), Some(0));
                Ok(())
            })?;
            assert_eq!(conn.lock_timeout_setting(), Some(1_000));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            statements(&conn),
            [
                "SET lock_timeout = 1000",
                "SET lock_timeout = 0",
                "SET lock_timeout = 1",
                "SET lock_timeout = 0",
                "SET lock_timeout = 1000",
                "RESET lock_timeout",
            ]
        );
    }

    #[test]
    fn sub_millisecond_is_rejected_before_any_statement() {
        let mut conn = ScriptedBackend::new().connect();
        let err = run_with_timeout(
            &mut conn,
            TimeoutValue::After(Duration::from_micros(1)),
            |_| Ok(()),
        )
        .unwrap_err();
        assert!(err.is_usage(), "{err}");
        assert!(conn.backend().statements.is_empty());
    }

    #[test]
    fn restore_is_skipped_in_aborted_transaction() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                |s| matches!(s, Statement::Sql(_)),
                PgLockError::backend(BackendErrorKind::Other, "boom"),
            )
            .connect();
        conn.begin().unwrap();
        let err = run_with_timeout(&mut conn, TimeoutValue::from_millis(5), |conn| {
            conn.execute(&Statement::Sql("SELECT broken".to_owned()))
        })
        .unwrap_err();
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::Other));
        assert!(conn.is_transaction_errored());
        assert_eq!(
            statements(&conn),
            ["BEGIN", "SET lock_timeout = 5", "SELECT broken"]
        );

        // The rollback discards the setting along with the transaction.
        conn.rollback().unwrap();
        assert_eq!(conn.lock_timeout_setting(), None);
    }

    #[test]
    fn guard_restores_on_drop() {
        let mut conn = ScriptedBackend::new().connect();
        {
            let mut guard = LockTimeoutGuard::push(&mut conn, TimeoutValue::from_millis(10)).unwrap();
            assert_eq!(guard.value(), TimeoutValue::from_millis(10));
            guard.execute(&Statement::Sql("SELECT 1".to_owned())).unwrap();
        }
        assert_eq!(conn.lock_timeout_setting(), None);
        assert_eq!(
            statements(&conn).last().map(String::as_str),
            Some("RESET lock_timeout")
        );
    }

    #[test]
    fn body_error_wins_over_restore_error() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                |s| matches!(s, Statement::ResetLockTimeout),
                PgLockError::backend(BackendErrorKind::Connection, "gone"),
            )
            .connect();
        let err = run_with_timeout(&mut conn, TimeoutValue::from_millis(10), |_| {
            Err::<(), _>(PgLockError::lock_timeout("canceling statement due to lock timeout"))
        })
        .unwrap_err();
        assert!(err.is_lock_timeout());
    }

    fn timeout_strategy() -> impl Strategy<Value = TimeoutValue> {
        prop_oneof![
            Just(TimeoutValue::Infinite),
            Just(TimeoutValue::Immediate),
            (1_u64..100_000).prop_map(TimeoutValue::from_millis),
        ]
    }

    fn nest(
        conn: &mut Connection<ScriptedBackend>,
        values: &[TimeoutValue],
    ) -> Result<()> {
        match values.split_first() {
            None => Ok(()),
            Some((first, rest)) => run_with_timeout(conn, *first, |conn| {
                assert_eq!(conn.lock_timeout_setting(), Some(first.setting_millis()));
                let before = conn.lock_timeout_setting();
                nest(conn, rest)?;
                assert_eq!(conn.lock_timeout_setting(), before);
                Ok(())
            }),
        }
    }

    proptest! {
        #[test]
        fn nested_round_trip(initial in proptest::option::of(0_u64..10_000),
                             values in proptest::collection::vec(timeout_strategy(), 0..8)) {
            let mut conn = ScriptedBackend::new().connect();
            conn.set_lock_timeout(initial).unwrap();
            nest(&mut conn, &values).unwrap();
            prop_assert_eq!(conn.lock_timeout_setting(), initial);
        }
    }
}
