//! Prioritization watcher.
//!
//! While a protected section runs on its own connection, a background thread
//! wakes every interval, asks a [`LockCatalog`] (on a second connection) for
//! the sessions blocking the protected one, and applies a corrective action.
//! The first failure raised by an action is kept and handed back to the
//! owning thread when the watcher is stopped.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pglock_error::{PgLockError, Result};
use pglock_types::{BlockedLock, Pid, TimeoutValue};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::connection::Connection;
use crate::snapshot::{
    FilterSpec, LockCatalog, cancel_blocking_activity, terminate_blocking_activity,
};
use crate::timeout::run_with_timeout;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Custom corrective action.
pub trait BlockingAction: Send + Sync {
    /// Handle `blocked` (rows blocking the protected session) and return the
    /// pids acted upon.
    fn apply(&self, catalog: &mut dyn LockCatalog, blocked: &[BlockedLock]) -> Result<Vec<Pid>>;
}

/// What the watcher does with the sessions it finds.
#[derive(Clone)]
pub enum PrioritizeAction {
    /// Force-disconnect blocking sessions that pass every filter.
    Terminate(Vec<FilterSpec>),
    /// Cancel the in-flight statement of blocking sessions that pass every
    /// filter.
    Cancel(Vec<FilterSpec>),
    Custom(Arc<dyn BlockingAction>),
}

impl PrioritizeAction {
    pub fn terminate() -> Self {
        Self::Terminate(Vec::new())
    }

    pub fn cancel() -> Self {
        Self::Cancel(Vec::new())
    }

    pub fn custom(action: impl BlockingAction + 'static) -> Self {
        Self::Custom(Arc::new(action))
    }

    /// Run the action against `blocked`.
    pub fn apply(
        &self,
        catalog: &mut dyn LockCatalog,
        blocked: &[BlockedLock],
    ) -> Result<Vec<Pid>> {
        match self {
            Self::Terminate(specs) => {
                let selected = select(specs, blocked)?;
                terminate_blocking_activity(catalog, &selected)
            }
            Self::Cancel(specs) => {
                let selected = select(specs, blocked)?;
                cancel_blocking_activity(catalog, &selected)
            }
            Self::Custom(action) => action.apply(catalog, blocked),
        }
    }
}

fn select(specs: &[FilterSpec], blocked: &[BlockedLock]) -> Result<Vec<BlockedLock>> {
    let filters = FilterSpec::resolve_all(specs)?;
    Ok(blocked
        .iter()
        .filter(|lock| filters.iter().all(|f| f.matches(lock)))
        .cloned()
        .collect())
}

impl Default for PrioritizeAction {
    fn default() -> Self {
        Self::terminate()
    }
}

impl fmt::Debug for PrioritizeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate(specs) => f.debug_tuple("Terminate").field(specs).finish(),
            Self::Cancel(specs) => f.debug_tuple("Cancel").field(specs).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct Prioritize {
    interval: Duration,
    periodic: bool,
    action: PrioritizeAction,
    timeout: Option<TimeoutValue>,
}

impl Default for Prioritize {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            periodic: true,
            action: PrioritizeAction::default(),
            timeout: None,
        }
    }
}

impl Prioritize {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// When false, the action fires once, one interval after start.
    #[must_use]
    pub const fn periodic(mut self, periodic: bool) -> Self {
        self.periodic = periodic;
        self
    }

    #[must_use]
    pub fn action(mut self, action: PrioritizeAction) -> Self {
        self.action = action;
        self
    }

    /// Backstop `lock_timeout` for the protected section. Should exceed the
    /// interval.
    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutValue) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub const fn get_interval(&self) -> Duration {
        self.interval
    }

    pub const fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub const fn get_action(&self) -> &PrioritizeAction {
        &self.action
    }

    pub const fn get_timeout(&self) -> Option<TimeoutValue> {
        self.timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(PgLockError::usage("prioritize interval must be positive"));
        }
        if let Some(timeout) = self.timeout {
            timeout.validate()?;
            if timeout.as_duration().is_some_and(|t| t <= self.interval) {
                warn!(
                    timeout = %timeout,
                    interval_ms = self.interval.as_millis() as u64,
                    "prioritize timeout does not exceed the scan interval"
                );
            }
        }
        Ok(())
    }
}

/// What a stopped watcher did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrioritizeReport {
    pub firings: usize,
    /// Every pid acted upon, in order, possibly repeated across firings.
    pub handled: Vec<Pid>,
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    stopped: Mutex<bool>,
    wake: Condvar,
    failure: Mutex<Option<PgLockError>>,
    report: Mutex<PrioritizeReport>,
}

/// A running watcher thread.
pub struct Watcher {
    pid: Pid,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start watching on behalf of `pid`, using `catalog` from the watcher
    /// thread.
    pub fn start(pid: Pid, config: &Prioritize, catalog: Box<dyn LockCatalog>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let interval = config.interval;
        let periodic = config.periodic;
        let action = config.action.clone();
        let handle = thread::Builder::new()
            .name("pglock-prioritize".to_owned())
            .spawn(move || run(pid, interval, periodic, &action, catalog, &thread_shared))
            .map_err(|err| PgLockError::internal(format!("failed to spawn prioritize thread: {err}")))?;
        info!(
            pid = %pid,
            interval_ms = interval.as_millis() as u64,
            periodic,
            action = ?config.action,
            "prioritization watcher started"
        );
        Ok(Self {
            pid,
            shared,
            handle: Some(handle),
        })
    }

    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Stop the timer, wait for an in-flight action, and surface the first
    /// failure any action raised.
    pub fn stop(mut self) -> Result<PrioritizeReport> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<PrioritizeReport> {
        {
            let mut stopped = self.shared.stopped.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }
        let panicked = self
            .handle
            .take()
            .is_some_and(|handle| handle.join().is_err());
        let report = self.shared.report.lock().clone();
        info!(
            pid = %self.pid,
            firings = report.firings,
            handled = report.handled.len(),
            "prioritization watcher stopped"
        );
        if panicked {
            return Err(PgLockError::watcher_failure(PgLockError::internal(
                "prioritization watcher thread panicked",
            )));
        }
        if let Some(err) = self.shared.failure.lock().take() {
            return Err(PgLockError::watcher_failure(err));
        }
        Ok(report)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.shutdown() {
                error!(pid = %self.pid, error = %err, "prioritization watcher dropped with a failure");
            }
        }
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("pid", &self.pid)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

fn run(
    pid: Pid,
    interval: Duration,
    periodic: bool,
    action: &PrioritizeAction,
    mut catalog: Box<dyn LockCatalog>,
    shared: &Shared,
) {
    loop {
        if !sleep_unless_stopped(shared, interval) {
            return;
        }
        match fire(pid, action, catalog.as_mut()) {
            Ok(handled) => {
                let mut report = shared.report.lock();
                report.firings += 1;
                if !handled.is_empty() {
                    info!(pid = %pid, handled = ?handled, "blocking sessions handled");
                }
                report.handled.extend(handled);
            }
            Err(err) => {
                error!(pid = %pid, error = %err, "prioritization side effect failed");
                shared.report.lock().firings += 1;
                let mut failure = shared.failure.lock();
                if failure.is_none() {
                    *failure = Some(err);
                }
                return;
            }
        }
        if !periodic {
            return;
        }
    }
}

/// Wait one interval; false when stopped first.
fn sleep_unless_stopped(shared: &Shared, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    let mut stopped = shared.stopped.lock();
    while !*stopped {
        if shared.wake.wait_until(&mut stopped, deadline).timed_out() {
            break;
        }
    }
    !*stopped
}

fn fire(pid: Pid, action: &PrioritizeAction, catalog: &mut dyn LockCatalog) -> Result<Vec<Pid>> {
    let blocked: Vec<BlockedLock> = catalog
        .blocked_locks(pid)?
        .into_iter()
        .filter(|lock| lock.blocking_pid != pid)
        .collect();
    debug!(pid = %pid, rows = blocked.len(), "prioritize scan");
    action.apply(catalog, &blocked)
}

/// Run `body` with a watcher clearing whatever blocks this connection.
///
/// `catalog` must sit on a different session than `conn`. A failure raised by
/// the watcher supersedes the body's own result.
pub fn run_with_prioritization<B, T>(
    conn: &mut Connection<B>,
    config: &Prioritize,
    catalog: Box<dyn LockCatalog>,
    body: impl FnOnce(&mut Connection<B>) -> Result<T>,
) -> Result<(T, PrioritizeReport)>
where
    B: Backend,
{
    config.validate()?;
    let pid = conn.backend_pid()?;
    let watcher = Watcher::start(pid, config, catalog)?;
    let result = match config.timeout {
        Some(timeout) => run_with_timeout(conn, timeout, body),
        None => body(conn),
    };
    match (result, watcher.stop()) {
        (Ok(value), Ok(report)) => Ok((value, report)),
        (Err(err), Ok(_)) => Err(err),
        (result, Err(watcher_err)) => {
            if let Err(body_err) = result {
                warn!(error = %body_err, "error superseded by prioritization watcher failure");
            }
            Err(watcher_err)
        }
    }
}
