//! Advisory lock acquisition and release.
//!
//! [`AdvisoryLock`] is the block-scoped form: acquire, run a body, release.
//! [`LockedFn`] guards a unit of work and may infer its lock id from the
//! function's type name. Both share the same acquire/release protocol.

use std::fmt;

use pglock_error::{PgLockError, Result};
use pglock_types::{LockKey, SideEffect, Statement, TimeoutValue};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::connection::Connection;
use crate::timeout::run_with_timeout;

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// A non-blocking attempt found the lock held elsewhere.
    Busy,
    /// The backend gave up waiting.
    TimedOut,
}

impl AcquireOutcome {
    #[must_use]
    pub const fn is_acquired(self) -> bool {
        matches!(self, Self::Acquired)
    }
}

impl From<AcquireOutcome> for bool {
    fn from(outcome: AcquireOutcome) -> Self {
        outcome.is_acquired()
    }
}

/// Request parameters shared by both lock forms.
#[derive(Debug, Clone, Default)]
struct LockRequest {
    key: Option<LockKey>,
    shared: bool,
    xact: bool,
    /// `None` keeps the ambient session timeout.
    timeout: Option<TimeoutValue>,
    side_effect: Option<SideEffect>,
}

impl LockRequest {
    fn nowait(&self) -> bool {
        self.timeout.is_some_and(|t| t.is_immediate())
    }
}

/// How the lock is being used; decides the default side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Scoped,
    Wrapping,
}

// ---------------------------------------------------------------------------
// AdvisoryLock
// ---------------------------------------------------------------------------

/// An advisory lock request.
///
/// ```ignore
/// let lock = AdvisoryLock::new("jobs.refresh").timeout(TimeoutValue::Immediate);
/// lock.scoped(&mut conn, |conn, acquired| {
///     if acquired { refresh(conn)?; }
///     Ok(())
/// })?;
/// ```
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    request: LockRequest,
    key: LockKey,
}

impl AdvisoryLock {
    pub fn new(key: impl Into<LockKey>) -> Self {
        let key = key.into();
        Self {
            request: LockRequest {
                key: Some(key.clone()),
                ..LockRequest::default()
            },
            key,
        }
    }

    #[must_use]
    pub const fn shared(mut self, shared: bool) -> Self {
        self.request.shared = shared;
        self
    }

    /// Transaction-level lock, released when the transaction ends.
    #[must_use]
    pub const fn xact(mut self, xact: bool) -> Self {
        self.request.xact = xact;
        self
    }

    /// Bound the acquisition statement only. [`TimeoutValue::Immediate`]
    /// uses the non-blocking `pg_try_*` variant.
    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutValue) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn side_effect(mut self, side_effect: SideEffect) -> Self {
        self.request.side_effect = Some(side_effect);
        self
    }

    pub const fn key(&self) -> &LockKey {
        &self.key
    }

    /// The 64-bit id passed to `pg_advisory_*`.
    pub fn lock_id(&self) -> i64 {
        self.key.id()
    }

    /// Turn this request into a unit-of-work guard with the same key.
    #[must_use]
    pub fn wrap(self) -> LockedFn {
        LockedFn {
            request: self.request,
        }
    }

    /// Attempt the lock once. Defaults to [`SideEffect::ReturnStatus`].
    pub fn acquire<B: Backend>(&self, conn: &mut Connection<B>) -> Result<AcquireOutcome> {
        let policy = self.resolve(Usage::Scoped)?;
        self.attempt(conn, policy)
    }

    /// Release a session-level lock.
    pub fn release<B: Backend>(&self, conn: &mut Connection<B>) -> Result<()> {
        if self.key.is_missing() {
            return Err(PgLockError::usage("must supply a lock id"));
        }
        if self.request.xact {
            return Err(PgLockError::usage(
                "advisory locks with xact=true cannot be manually released",
            ));
        }
        let rows = conn.execute(&Statement::AdvisoryUnlock {
            id: self.lock_id(),
            shared: self.request.shared,
        })?;
        if rows.first_bool() == Some(false) {
            warn!(lock_id = %self.key, "advisory lock was not held at release");
        } else {
            info!(lock_id = %self.key, shared = self.request.shared, "advisory lock released");
        }
        Ok(())
    }

    /// Acquire, run `body` with the acquisition status, then release.
    ///
    /// A transaction-level lock opens its own durable transaction and is
    /// refused inside an existing one. A session-level lock taken inside a
    /// transaction runs `body` in a savepoint so the release still goes
    /// through when `body` fails.
    pub fn scoped<B, T>(
        &self,
        conn: &mut Connection<B>,
        body: impl FnOnce(&mut Connection<B>, bool) -> Result<T>,
    ) -> Result<T>
    where
        B: Backend,
    {
        let policy = self.resolve(Usage::Scoped)?;
        self.scoped_with(conn, policy, body)
    }

    fn scoped_with<B, T>(
        &self,
        conn: &mut Connection<B>,
        policy: SideEffect,
        body: impl FnOnce(&mut Connection<B>, bool) -> Result<T>,
    ) -> Result<T>
    where
        B: Backend,
    {
        if self.request.xact {
            if conn.in_transaction() {
                return Err(PgLockError::usage(
                    "advisory locks with xact=true cannot run inside a transaction; \
                     use AdvisoryLock::acquire instead",
                ));
            }
            return conn.atomic_durable(|conn| self.hold(conn, policy, body));
        }
        self.hold(conn, policy, body)
    }

    fn hold<B, T>(
        &self,
        conn: &mut Connection<B>,
        policy: SideEffect,
        body: impl FnOnce(&mut Connection<B>, bool) -> Result<T>,
    ) -> Result<T>
    where
        B: Backend,
    {
        let acquired = self.attempt(conn, policy)?.is_acquired();
        let session_lock = acquired && !self.request.xact;
        let result = if session_lock && conn.in_transaction() {
            conn.atomic(|conn| body(conn, acquired))
        } else {
            body(conn, acquired)
        };
        if session_lock {
            if let Err(release_err) = self.release(conn) {
                if result.is_ok() {
                    return Err(release_err);
                }
                warn!(
                    lock_id = %self.key,
                    error = %release_err,
                    "advisory lock release failed while an error is propagating"
                );
            }
        }
        result
    }

    fn resolve(&self, usage: Usage) -> Result<SideEffect> {
        if self.key.is_missing() {
            return Err(PgLockError::usage("must supply a lock id"));
        }
        if let Some(timeout) = self.request.timeout {
            timeout.validate()?;
        }
        match (usage, self.request.side_effect) {
            (Usage::Scoped, None) => Ok(SideEffect::ReturnStatus),
            (Usage::Wrapping, None) => Ok(SideEffect::RaiseOnFailure),
            (Usage::Scoped, Some(SideEffect::SkipOnFailure)) => Err(PgLockError::usage(
                "SkipOnFailure needs a wrapped unit of work; use LockedFn",
            )),
            (Usage::Wrapping, Some(SideEffect::ReturnStatus)) => Err(PgLockError::usage(
                "ReturnStatus cannot be used when wrapping a unit of work; use AdvisoryLock::scoped",
            )),
            (_, Some(policy)) => Ok(policy),
        }
    }

    fn attempt<B: Backend>(
        &self,
        conn: &mut Connection<B>,
        policy: SideEffect,
    ) -> Result<AcquireOutcome> {
        if self.request.xact && !conn.in_transaction() {
            return Err(PgLockError::usage("must be in a transaction to use xact=true"));
        }
        let nowait = self.request.nowait();
        let statement = Statement::AdvisoryLock {
            id: self.lock_id(),
            shared: self.request.shared,
            xact: self.request.xact,
            nowait,
        };
        // A failed wait aborts the transaction; keep the caller's usable when
        // the failure is going to be reported as a status.
        let wrap = !nowait && policy != SideEffect::RaiseOnFailure && conn.in_transaction();
        debug!(
            lock_id = %self.key,
            id = self.lock_id(),
            nowait,
            wrap,
            timeout = ?self.request.timeout,
            policy = %policy,
            "acquiring advisory lock"
        );

        let issued = match self.request.timeout.filter(|_| !nowait) {
            Some(timeout) => run_with_timeout(conn, timeout, |conn| issue(conn, &statement, nowait, wrap)),
            None => issue(conn, &statement, nowait, wrap),
        };

        let outcome = match issued {
            Ok(true) => AcquireOutcome::Acquired,
            Ok(false) => AcquireOutcome::Busy,
            Err(err) if err.is_lock_timeout() && policy != SideEffect::RaiseOnFailure => {
                debug!(lock_id = %self.key, error = %err, "advisory lock wait timed out");
                AcquireOutcome::TimedOut
            }
            Err(err) => return Err(err),
        };
        if outcome == AcquireOutcome::Busy && policy == SideEffect::RaiseOnFailure {
            return Err(PgLockError::lock_timeout(format!(
                "could not acquire lock \"{}\"",
                self.key
            )));
        }
        if outcome.is_acquired() {
            info!(lock_id = %self.key, shared = self.request.shared, xact = self.request.xact, "advisory lock acquired");
        }
        Ok(outcome)
    }
}

fn issue<B: Backend>(
    conn: &mut Connection<B>,
    statement: &Statement,
    nowait: bool,
    wrap: bool,
) -> Result<bool> {
    let run = |conn: &mut Connection<B>| -> Result<bool> {
        let rows = conn.execute(statement)?;
        if nowait {
            rows.first_bool().ok_or_else(|| {
                PgLockError::internal(format!("{statement} returned no boolean"))
            })
        } else {
            Ok(true)
        }
    };
    if wrap { conn.atomic(run) } else { run(conn) }
}

// ---------------------------------------------------------------------------
// LockedFn
// ---------------------------------------------------------------------------

/// Runs a unit of work under an advisory lock.
///
/// Defaults to [`SideEffect::RaiseOnFailure`]. With
/// [`SideEffect::SkipOnFailure`] the work is skipped and `Ok(None)` returned
/// when the lock cannot be had.
#[derive(Debug, Clone, Default)]
pub struct LockedFn {
    request: LockRequest,
}

impl LockedFn {
    /// Lock id inferred from the wrapped function's type name.
    pub fn inferred() -> Self {
        Self::default()
    }

    pub fn new(key: impl Into<LockKey>) -> Self {
        Self {
            request: LockRequest {
                key: Some(key.into()),
                ..LockRequest::default()
            },
        }
    }

    #[must_use]
    pub const fn shared(mut self, shared: bool) -> Self {
        self.request.shared = shared;
        self
    }

    #[must_use]
    pub const fn xact(mut self, xact: bool) -> Self {
        self.request.xact = xact;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutValue) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn side_effect(mut self, side_effect: SideEffect) -> Self {
        self.request.side_effect = Some(side_effect);
        self
    }

    /// Run `work` under the lock; `Ok(None)` means it was skipped.
    pub fn call<B, T, F>(&self, conn: &mut Connection<B>, work: F) -> Result<Option<T>>
    where
        B: Backend,
        F: FnOnce(&mut Connection<B>) -> Result<T>,
    {
        let key = self
            .request
            .key
            .clone()
            .unwrap_or_else(|| LockKey::Name(function_lock_name::<F>()));
        let lock = AdvisoryLock {
            request: self.request.clone(),
            key,
        };
        let policy = lock.resolve(Usage::Wrapping)?;
        lock.scoped_with(conn, policy, |conn, acquired| {
            if acquired || policy != SideEffect::SkipOnFailure {
                work(conn).map(Some)
            } else {
                debug!(lock_id = %lock.key, "lock busy, skipping wrapped work");
                Ok(None)
            }
        })
    }
}

impl fmt::Display for LockedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request.key {
            Some(key) => write!(f, "LockedFn({key})"),
            None => f.write_str("LockedFn(<inferred>)"),
        }
    }
}

/// Fully qualified name of `F`, without closure suffixes.
pub fn function_lock_name<F>() -> String {
    let mut name = std::any::type_name::<F>();
    while let Some(stripped) = name.strip_suffix("::{{closure}}") {
        name = stripped;
    }
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use pglock_error::BackendErrorKind;

    use super::*;
    use crate::testing::{ScriptedBackend, is_advisory_lock, statements};

    fn timeout_error() -> PgLockError {
        PgLockError::lock_timeout("canceling statement due to lock timeout")
    }

    fn refresh_job<B: Backend>(_conn: &mut Connection<B>) -> Result<u32> {
        Ok(7)
    }

    #[test]
    fn missing_id_is_a_usage_error() {
        let mut conn = ScriptedBackend::new().connect();
        let err = AdvisoryLock::new("").acquire(&mut conn).unwrap_err();
        assert!(err.is_usage(), "{err}");
        assert!(conn.backend().statements.is_empty());
    }

    #[test]
    fn release_without_id_is_a_usage_error() {
        let mut conn = ScriptedBackend::new().connect();
        let err = AdvisoryLock::new(String::new()).release(&mut conn).unwrap_err();
        assert!(err.is_usage(), "{err}");
        assert!(conn.backend().statements.is_empty());
    }

    #[test]
    fn skip_without_wrapped_work_is_a_usage_error() {
        let mut conn = ScriptedBackend::new().connect();
        let err = AdvisoryLock::new("jobs")
            .side_effect(SideEffect::SkipOnFailure)
            .scoped(&mut conn, |_, _| Ok(()))
            .unwrap_err();
        assert!(err.is_usage(), "{err}");
        assert!(conn.backend().statements.is_empty());
    }

    #[test]
    fn return_status_while_wrapping_is_a_usage_error() {
        let mut conn = ScriptedBackend::new().connect();
        let err = LockedFn::new("jobs")
            .side_effect(SideEffect::ReturnStatus)
            .call(&mut conn, |_| Ok(()))
            .unwrap_err();
        assert!(err.is_usage(), "{err}");
        assert!(conn.backend().statements.is_empty());
    }

    #[test]
    fn xact_requires_a_transaction_for_functional_acquire() {
        let mut conn = ScriptedBackend::new().connect();
        let err = AdvisoryLock::new(1_i64).xact(true).acquire(&mut conn).unwrap_err();
        assert!(err.is_usage());
        assert!(conn.backend().statements.is_empty());
    }

    #[test]
    fn xact_scoped_inside_transaction_is_refused() {
        let mut conn = ScriptedBackend::new().connect();
        conn.begin().unwrap();
        let err = AdvisoryLock::new(1_i64)
            .xact(true)
            .scoped(&mut conn, |_, _| Ok(()))
            .unwrap_err();
        assert!(err.is_usage());
        assert_eq!(statements(&conn), ["BEGIN"]);
    }

    #[test]
    fn xact_release_is_refused() {
        let mut conn = ScriptedBackend::new().connect();
        let err = AdvisoryLock::new(1_i64).xact(true).release(&mut conn).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn scoped_lock_releases_after_body() {
        let mut conn = ScriptedBackend::new().connect();
        let seen = AdvisoryLock::new(9_i64)
            .shared(true)
            .scoped(&mut conn, |_, acquired| Ok(acquired))
            .unwrap();
        assert!(seen);
        assert_eq!(
            statements(&conn),
            [
                "SELECT pg_advisory_lock_shared(9)",
                "SELECT pg_advisory_unlock_shared(9)"
            ]
        );
    }

    #[test]
    fn xact_scoped_uses_durable_transaction_and_no_release() {
        let mut conn = ScriptedBackend::new().connect();
        AdvisoryLock::new(3_i64)
            .xact(true)
            .scoped(&mut conn, |conn, acquired| {
                assert!(acquired);
                assert!(conn.in_transaction());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            statements(&conn),
            [
                "BEGIN",
                "SAVEPOINT pglock_sp_1",
                "SELECT pg_advisory_xact_lock(3)",
                "RELEASE SAVEPOINT pglock_sp_1",
                "COMMIT"
            ]
        );
    }

    #[test]
    fn immediate_timeout_uses_try_variant_without_setting_timeout() {
        let mut conn = ScriptedBackend::new().busy().connect();
        let outcome = AdvisoryLock::new(5_i64)
            .timeout(TimeoutValue::Immediate)
            .acquire(&mut conn)
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Busy);
        assert_eq!(statements(&conn), ["SELECT pg_try_advisory_lock(5)"]);
    }

    #[test]
    fn busy_under_raise_is_a_lock_timeout() {
        let mut conn = ScriptedBackend::new().busy().connect();
        let err = AdvisoryLock::new("jobs")
            .timeout(TimeoutValue::Immediate)
            .side_effect(SideEffect::RaiseOnFailure)
            .acquire(&mut conn)
            .unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(err.to_string().contains("could not acquire lock \"jobs\""));
    }

    #[test]
    fn timeout_in_transaction_is_wrapped_in_savepoint() {
        let mut conn = ScriptedBackend::new()
            .fail_when(is_advisory_lock, timeout_error())
            .connect();
        conn.begin().unwrap();
        let outcome = AdvisoryLock::new(11_i64)
            .timeout(TimeoutValue::from_millis(50))
            .acquire(&mut conn)
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::TimedOut);
        assert!(!conn.is_transaction_errored());
        assert_eq!(
            statements(&conn),
            [
                "BEGIN",
                "SET lock_timeout = 50",
                "SAVEPOINT pglock_sp_1",
                "SELECT pg_advisory_lock(11)",
                "ROLLBACK TO SAVEPOINT pglock_sp_1",
                "RELEASE SAVEPOINT pglock_sp_1",
                "RESET lock_timeout",
            ]
        );
    }

    #[test]
    fn timeout_under_raise_propagates_and_skips_restore() {
        let mut conn = ScriptedBackend::new()
            .fail_when(is_advisory_lock, timeout_error())
            .connect();
        conn.begin().unwrap();
        let err = AdvisoryLock::new(11_i64)
            .timeout(TimeoutValue::from_millis(50))
            .side_effect(SideEffect::RaiseOnFailure)
            .acquire(&mut conn)
            .unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(conn.is_transaction_errored());
        assert_eq!(
            statements(&conn),
            ["BEGIN", "SET lock_timeout = 50", "SELECT pg_advisory_lock(11)"]
        );
    }

    #[test]
    fn other_backend_errors_always_propagate() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                is_advisory_lock,
                PgLockError::backend(BackendErrorKind::Cancelled, "canceling statement"),
            )
            .connect();
        let err = AdvisoryLock::new(1_i64)
            .timeout(TimeoutValue::from_millis(10))
            .acquire(&mut conn)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn body_failure_in_transaction_still_releases() {
        let mut conn = ScriptedBackend::new()
            .fail_when(
                |s| matches!(s, Statement::Sql(_)),
                PgLockError::backend(BackendErrorKind::UniqueViolation, "duplicate key"),
            )
            .connect();
        conn.begin().unwrap();
        let err = AdvisoryLock::new(2_i64)
            .scoped(&mut conn, |conn, _| {
                conn.execute(&Statement::Sql("INSERT INTO t VALUES (1)".to_owned()))
            })
            .unwrap_err();
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::UniqueViolation));
        assert!(!conn.is_transaction_errored());
        assert_eq!(
            statements(&conn),
            [
                "BEGIN",
                "SAVEPOINT pglock_sp_1",
                "SELECT pg_advisory_lock(2)",
                "RELEASE SAVEPOINT pglock_sp_1",
                "SAVEPOINT pglock_sp_2",
                "INSERT INTO t VALUES (1)",
                "ROLLBACK TO SAVEPOINT pglock_sp_2",
                "RELEASE SAVEPOINT pglock_sp_2",
                "SELECT pg_advisory_unlock(2)",
            ]
        );
    }

    #[test]
    fn skip_policy_skips_work() {
        let mut conn = ScriptedBackend::new().busy().connect();
        let ran = LockedFn::new("jobs")
            .timeout(TimeoutValue::Immediate)
            .side_effect(SideEffect::SkipOnFailure)
            .call(&mut conn, |_| Ok(1))
            .unwrap();
        assert_eq!(ran, None);
        let id = LockKey::from("jobs").id();
        assert_eq!(
            statements(&conn),
            [format!("SELECT pg_try_advisory_lock({id})")]
        );
    }

    #[test]
    fn wrapped_work_infers_lock_id_from_function_name() {
        let mut conn = ScriptedBackend::new().connect();
        let value = LockedFn::inferred().call(&mut conn, refresh_job).unwrap();
        assert_eq!(value, Some(7));

        let expected = LockKey::from(std::any::type_name_of_val(&refresh_job::<ScriptedBackend>));
        assert_eq!(
            conn.backend().statements[0],
            Statement::AdvisoryLock {
                id: expected.id(),
                shared: false,
                xact: false,
                nowait: false,
            }
        );
    }

    #[test]
    fn closure_suffix_is_stripped() {
        fn name_of<F>(_: &F) -> String {
            function_lock_name::<F>()
        }
        let name = name_of(&|| ());
        assert!(name.ends_with("closure_suffix_is_stripped"), "{name}");
    }
}
