//! In-process simulation of the parts of a Postgres server the lock engine
//! touches.
//!
//! Sessions, transactions and savepoints, `lock_timeout`, advisory and
//! relation locks with the server's conflict matrix, and the two interrupts
//! (`pg_cancel_backend`, `pg_terminate_backend`). Blocked statements really
//! block: they park on a condition variable until the lock is granted, the
//! session's `lock_timeout` elapses, or the session is interrupted.
//!
//! Lock rules follow the server:
//! - a session never conflicts with itself;
//! - session-level advisory locks are reentrant and survive transaction end;
//! - transaction-level locks are released at COMMIT/ROLLBACK, and by
//!   ROLLBACK TO for locks taken after the savepoint;
//! - RELEASE SAVEPOINT hands locks to the enclosing level;
//! - `SET` inside a transaction is undone by ROLLBACK and ROLLBACK TO.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use pglock_error::{BackendErrorKind, PgLockError, Result};
use pglock_types::{BlockedLock, Pid, RelationKind, Rows, Statement, TableLockMode, Value};
use serde::Serialize;
use tracing::{debug, info};

const FIRST_PID: i32 = 10_001;

/// Oldest events are dropped once the log holds this many.
pub const EVENT_LOG_CAPACITY: usize = 16_384;

// ---------------------------------------------------------------------------
// Lock table
// ---------------------------------------------------------------------------

/// Object a lock is taken on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum LockTarget {
    Advisory(i64),
    Relation(String),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advisory(id) => write!(f, "advisory {id}"),
            Self::Relation(name) => write!(f, "relation {name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Session,
    /// Savepoint depth at acquisition.
    Xact(usize),
}

#[derive(Debug, Clone)]
struct HeldLock {
    pid: Pid,
    target: LockTarget,
    mode: TableLockMode,
    scope: Scope,
}

#[derive(Debug, Clone)]
struct Wait {
    target: LockTarget,
    mode: TableLockMode,
    since: Instant,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Session {
    in_tx: bool,
    aborted: bool,
    /// Savepoint names with the `lock_timeout` each one saw.
    savepoints: Vec<(String, Option<u64>)>,
    lock_timeout: Option<u64>,
    tx_lock_timeout: Option<u64>,
    terminated: bool,
    busy: bool,
    cancel_pending: bool,
    query: Option<String>,
    query_start: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            in_tx: false,
            aborted: false,
            savepoints: Vec::new(),
            lock_timeout: None,
            tx_lock_timeout: None,
            terminated: false,
            busy: false,
            cancel_pending: false,
            query: None,
            query_start: Instant::now(),
        }
    }

    fn depth(&self) -> usize {
        self.savepoints.len()
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                PgLockError::backend_with_code(
                    BackendErrorKind::Other,
                    "3B001",
                    format!("savepoint \"{name}\" does not exist"),
                )
            })
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Something that happened on the server, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimEvent {
    Connected { pid: Pid },
    Granted { pid: Pid, target: LockTarget, mode: String },
    Waiting { pid: Pid, target: LockTarget, blockers: Vec<Pid> },
    TimedOut { pid: Pid, target: LockTarget },
    Released { pid: Pid, target: LockTarget },
    Cancelled { pid: Pid },
    Terminated { pid: Pid },
    Disconnected { pid: Pid },
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ServerState {
    next_pid: i32,
    sessions: HashMap<Pid, Session>,
    locks: Vec<HeldLock>,
    waits: HashMap<Pid, Wait>,
    events: VecDeque<SimEvent>,
}

impl ServerState {
    fn record(&mut self, event: SimEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn session(&self, pid: Pid) -> Result<&Session> {
        self.sessions.get(&pid).ok_or_else(closed)
    }

    fn session_mut(&mut self, pid: Pid) -> Result<&mut Session> {
        self.sessions.get_mut(&pid).ok_or_else(closed)
    }

    /// Other sessions holding a conflicting lock on `target`, in grant order.
    fn conflicting_holders(&self, pid: Pid, target: &LockTarget, mode: TableLockMode) -> Vec<Pid> {
        let mut pids = Vec::new();
        for lock in &self.locks {
            if lock.pid != pid
                && &lock.target == target
                && lock.mode.conflicts_with(mode)
                && !pids.contains(&lock.pid)
            {
                pids.push(lock.pid);
            }
        }
        pids
    }

    /// `pg_blocking_pids(pid)`.
    fn blocking_pids(&self, pid: Pid) -> Vec<Pid> {
        self.waits
            .get(&pid)
            .map(|wait| self.conflicting_holders(pid, &wait.target, wait.mode))
            .unwrap_or_default()
    }

    fn release_where(&mut self, keep: impl Fn(&HeldLock) -> bool) {
        let mut released = Vec::new();
        self.locks.retain(|lock| {
            let kept = keep(lock);
            if !kept {
                released.push((lock.pid, lock.target.clone()));
            }
            kept
        });
        for (pid, target) in released {
            self.record(SimEvent::Released { pid, target });
        }
    }

    fn end_transaction(&mut self, pid: Pid, commit: bool) -> Result<()> {
        let session = self.session_mut(pid)?;
        session.in_tx = false;
        session.aborted = false;
        session.savepoints.clear();
        if !commit {
            session.lock_timeout = session.tx_lock_timeout;
        }
        self.release_where(|lock| lock.pid != pid || lock.scope == Scope::Session);
        Ok(())
    }

    fn drop_session_locks(&mut self, pid: Pid) {
        self.release_where(|lock| lock.pid != pid);
        self.waits.remove(&pid);
    }
}

// ---------------------------------------------------------------------------
// SimServer
// ---------------------------------------------------------------------------

struct Shared {
    state: Mutex<ServerState>,
    changed: Condvar,
}

/// A simulated server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimServer {
    shared: Arc<Shared>,
}

impl Default for SimServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SimServer")
            .field("sessions", &state.sessions.len())
            .field("locks", &state.locks.len())
            .field("waits", &state.waits.len())
            .finish()
    }
}

struct LockRequest {
    target: LockTarget,
    mode: TableLockMode,
    xact: bool,
    nowait: bool,
}

/// A held or awaited lock as the read model reports it.
struct LockView {
    target: LockTarget,
    mode: TableLockMode,
    granted: bool,
    wait_duration: Option<Duration>,
}

impl SimServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState {
                    next_pid: FIRST_PID,
                    sessions: HashMap::new(),
                    locks: Vec::new(),
                    waits: HashMap::new(),
                    events: VecDeque::new(),
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Open a new session and return its pid.
    pub fn open_session(&self) -> Pid {
        let mut state = self.shared.state.lock();
        let pid = Pid(state.next_pid);
        state.next_pid += 1;
        state.sessions.insert(pid, Session::new());
        state.record(SimEvent::Connected { pid });
        debug!(pid = %pid, "sim session opened");
        pid
    }

    /// Close a session, releasing everything it holds.
    pub fn close_session(&self, pid: Pid) {
        let mut state = self.shared.state.lock();
        if state.sessions.remove(&pid).is_some() {
            state.drop_session_locks(pid);
            state.record(SimEvent::Disconnected { pid });
            debug!(pid = %pid, "sim session closed");
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.shared
            .state
            .lock()
            .sessions
            .get(&pid)
            .is_some_and(|session| !session.terminated)
    }

    /// True while `pid` is running a statement.
    pub fn is_busy(&self, pid: Pid) -> bool {
        self.shared
            .state
            .lock()
            .sessions
            .get(&pid)
            .is_some_and(|session| session.busy)
    }

    pub fn is_waiting(&self, pid: Pid) -> bool {
        self.shared.state.lock().waits.contains_key(&pid)
    }

    /// `pg_blocking_pids(pid)`.
    pub fn blocking_pids(&self, pid: Pid) -> Vec<Pid> {
        self.shared.state.lock().blocking_pids(pid)
    }

    /// Number of holds `pid` has on `target`, reentrant holds counted.
    pub fn hold_count(&self, pid: Pid, target: &LockTarget) -> usize {
        self.shared
            .state
            .lock()
            .locks
            .iter()
            .filter(|lock| lock.pid == pid && &lock.target == target)
            .count()
    }

    pub fn lock_timeout_of(&self, pid: Pid) -> Option<u64> {
        self.shared
            .state
            .lock()
            .sessions
            .get(&pid)
            .and_then(|session| session.lock_timeout)
    }

    /// True when `pid` has an open (possibly aborted) transaction.
    pub fn in_transaction(&self, pid: Pid) -> bool {
        self.shared
            .state
            .lock()
            .sessions
            .get(&pid)
            .is_some_and(|session| session.in_tx)
    }

    /// The event log, oldest first. Holds at most [`EVENT_LOG_CAPACITY`]
    /// entries.
    pub fn events(&self) -> Vec<SimEvent> {
        self.shared.state.lock().events.iter().cloned().collect()
    }

    /// Empty the event log and return what it held.
    pub fn take_events(&self) -> Vec<SimEvent> {
        self.shared.state.lock().events.drain(..).collect()
    }

    /// Block until `pid` is waiting on a lock, or `timeout` passes.
    pub fn wait_until_blocked(&self, pid: Pid, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state.waits.contains_key(&pid))
    }

    /// Block until `pid` is gone or terminated, or `timeout` passes.
    pub fn wait_until_gone(&self, pid: Pid, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| {
            state.sessions.get(&pid).is_none_or(|session| session.terminated)
        })
    }

    fn wait_for_state(&self, timeout: Duration, done: impl Fn(&ServerState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !done(&state) {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state);
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    /// Locks held or awaited by `pid` and by each session blocking it, one
    /// row per (lock, blocker) pair.
    pub fn blocked_locks(&self, pid: Pid) -> Vec<BlockedLock> {
        let state = self.shared.state.lock();
        let now = Instant::now();
        let mut subjects = vec![pid];
        for blocker in state.blocking_pids(pid) {
            if !subjects.contains(&blocker) {
                subjects.push(blocker);
            }
        }

        let mut rows = Vec::new();
        for subject in subjects {
            let blockers = state.blocking_pids(subject);
            if blockers.is_empty() {
                continue;
            }
            let mut locks: Vec<LockView> = state
                .locks
                .iter()
                .filter(|lock| lock.pid == subject)
                .map(|lock| LockView {
                    target: lock.target.clone(),
                    mode: lock.mode,
                    granted: true,
                    wait_duration: None,
                })
                .collect();
            if let Some(wait) = state.waits.get(&subject) {
                locks.push(LockView {
                    target: wait.target.clone(),
                    mode: wait.mode,
                    granted: false,
                    wait_duration: Some(now.saturating_duration_since(wait.since)),
                });
            }
            for lock in &locks {
                for blocker in &blockers {
                    rows.push(row(&state, now, subject, *blocker, lock));
                }
            }
        }
        rows
    }

    // -----------------------------------------------------------------------
    // Interrupts
    // -----------------------------------------------------------------------

    /// `pg_terminate_backend(pid)`.
    pub fn terminate(&self, pid: Pid) -> bool {
        let mut state = self.shared.state.lock();
        let Some(session) = state.sessions.get_mut(&pid) else {
            return false;
        };
        if session.terminated {
            return false;
        }
        session.terminated = true;
        session.in_tx = false;
        state.drop_session_locks(pid);
        state.record(SimEvent::Terminated { pid });
        drop(state);
        info!(pid = %pid, "sim session terminated");
        self.shared.changed.notify_all();
        true
    }

    /// `pg_cancel_backend(pid)`. Only a running statement is affected.
    pub fn cancel(&self, pid: Pid) -> bool {
        let mut state = self.shared.state.lock();
        let Some(session) = state.sessions.get_mut(&pid) else {
            return false;
        };
        if session.terminated {
            return false;
        }
        if session.busy {
            session.cancel_pending = true;
        }
        state.record(SimEvent::Cancelled { pid });
        drop(state);
        info!(pid = %pid, "sim session cancel requested");
        self.shared.changed.notify_all();
        true
    }

    // -----------------------------------------------------------------------
    // Statement execution
    // -----------------------------------------------------------------------

    /// Run `statement` on session `pid`.
    pub fn execute(&self, pid: Pid, statement: &Statement) -> Result<Rows> {
        let mut state = self.shared.state.lock();
        if state.session(pid)?.terminated {
            // The session learns about its termination once; after that the
            // connection is simply gone.
            state.sessions.remove(&pid);
            return Err(terminated());
        }
        {
            let session = state.session_mut(pid)?;
            let ends_block = matches!(
                statement,
                Statement::Rollback | Statement::RollbackToSavepoint(_) | Statement::Commit
            );
            if session.aborted && !ends_block {
                return Err(in_failed_transaction());
            }
            session.query = Some(statement.to_string());
            session.query_start = Instant::now();
            session.busy = true;
            session.cancel_pending = false;
        }

        let result = self.dispatch(&mut state, pid, statement);

        if let Some(session) = state.sessions.get_mut(&pid) {
            session.busy = false;
            session.cancel_pending = false;
            if result.is_err() && session.in_tx {
                session.aborted = true;
            }
        }
        drop(state);
        self.shared.changed.notify_all();
        result
    }

    fn dispatch(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        pid: Pid,
        statement: &Statement,
    ) -> Result<Rows> {
        match statement {
            Statement::Begin => {
                let session = state.session_mut(pid)?;
                if !session.in_tx {
                    session.in_tx = true;
                    session.tx_lock_timeout = session.lock_timeout;
                }
                Ok(Rows::empty())
            }
            Statement::Commit => {
                let aborted = state.session(pid)?.aborted;
                state.end_transaction(pid, !aborted)?;
                Ok(Rows::empty())
            }
            Statement::Rollback => {
                state.end_transaction(pid, false)?;
                Ok(Rows::empty())
            }
            Statement::Savepoint(name) => {
                let session = state.session_mut(pid)?;
                if !session.in_tx {
                    return Err(no_active_transaction("SAVEPOINT"));
                }
                let timeout = session.lock_timeout;
                session.savepoints.push((name.clone(), timeout));
                Ok(Rows::empty())
            }
            Statement::ReleaseSavepoint(name) => {
                let session = state.session_mut(pid)?;
                if !session.in_tx {
                    return Err(no_active_transaction("RELEASE SAVEPOINT"));
                }
                let index = session.find_savepoint(name)?;
                session.savepoints.truncate(index);
                for lock in &mut state.locks {
                    if lock.pid == pid {
                        if let Scope::Xact(level) = lock.scope {
                            if level > index {
                                lock.scope = Scope::Xact(index);
                            }
                        }
                    }
                }
                Ok(Rows::empty())
            }
            Statement::RollbackToSavepoint(name) => {
                let session = state.session_mut(pid)?;
                if !session.in_tx {
                    return Err(no_active_transaction("ROLLBACK TO SAVEPOINT"));
                }
                let index = session.find_savepoint(name)?;
                session.lock_timeout = session.savepoints[index].1;
                session.savepoints.truncate(index + 1);
                session.aborted = false;
                state.release_where(|lock| {
                    lock.pid != pid || !matches!(lock.scope, Scope::Xact(level) if level > index)
                });
                Ok(Rows::empty())
            }
            Statement::SetLockTimeout(ms) => {
                state.session_mut(pid)?.lock_timeout = Some(*ms);
                Ok(Rows::empty())
            }
            Statement::ResetLockTimeout => {
                state.session_mut(pid)?.lock_timeout = None;
                Ok(Rows::empty())
            }
            Statement::ShowLockTimeout => {
                let text = match state.session(pid)?.lock_timeout {
                    None | Some(0) => "0".to_owned(),
                    Some(ms) => format!("{ms}ms"),
                };
                Ok(Rows::single(Value::Text(text)))
            }
            Statement::AdvisoryLock {
                id,
                shared,
                xact,
                nowait,
            } => {
                let granted = self.acquire(
                    state,
                    pid,
                    LockRequest {
                        target: LockTarget::Advisory(*id),
                        mode: advisory_mode(*shared),
                        xact: *xact,
                        nowait: *nowait,
                    },
                )?;
                if *nowait {
                    Ok(Rows::single(Value::Bool(granted)))
                } else {
                    Ok(Rows::single(Value::Null))
                }
            }
            Statement::AdvisoryUnlock { id, shared } => {
                let target = LockTarget::Advisory(*id);
                let mode = advisory_mode(*shared);
                let position = state.locks.iter().rposition(|lock| {
                    lock.pid == pid
                        && lock.target == target
                        && lock.mode == mode
                        && lock.scope == Scope::Session
                });
                let released = position.is_some_and(|index| {
                    state.locks.remove(index);
                    state.record(SimEvent::Released {
                        pid,
                        target: target.clone(),
                    });
                    true
                });
                Ok(Rows::single(Value::Bool(released)))
            }
            Statement::LockTables {
                tables,
                mode,
                nowait,
            } => {
                if !state.session(pid)?.in_tx {
                    return Err(no_active_transaction("LOCK TABLE"));
                }
                for table in tables {
                    let granted = self.acquire(
                        state,
                        pid,
                        LockRequest {
                            target: LockTarget::Relation(table.clone()),
                            mode: *mode,
                            xact: true,
                            nowait: *nowait,
                        },
                    )?;
                    if !granted {
                        return Err(PgLockError::lock_timeout(format!(
                            "could not obtain lock on relation \"{table}\""
                        )));
                    }
                }
                Ok(Rows::empty())
            }
            Statement::BackendPid => Ok(Rows::single(Value::Int(i64::from(pid.get())))),
            Statement::Sql(text) => self.run_sql(state, pid, text),
        }
    }

    /// Free-form SQL understands `pg_sleep(seconds)` and a division by zero;
    /// everything else succeeds with no rows.
    fn run_sql(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        pid: Pid,
        text: &str,
    ) -> Result<Rows> {
        if text.contains("1/0") {
            return Err(PgLockError::backend_with_code(
                BackendErrorKind::Other,
                "22012",
                "division by zero",
            ));
        }
        if let Some(seconds) = parse_sleep(text) {
            let deadline = Instant::now() + seconds;
            loop {
                self.check_interrupts(state, pid)?;
                if Instant::now() >= deadline {
                    return Ok(Rows::single(Value::Null));
                }
                let _ = self.shared.changed.wait_until(state, deadline);
            }
        }
        Ok(Rows::empty())
    }

    fn check_interrupts(&self, state: &mut MutexGuard<'_, ServerState>, pid: Pid) -> Result<()> {
        let session = state.session_mut(pid)?;
        if session.terminated {
            return Err(terminated());
        }
        if session.cancel_pending {
            session.cancel_pending = false;
            return Err(cancelled());
        }
        Ok(())
    }

    /// Grant `request`, waiting as the session's `lock_timeout` allows.
    /// `Ok(false)` only for a non-blocking request that found a conflict.
    fn acquire(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        pid: Pid,
        request: LockRequest,
    ) -> Result<bool> {
        let LockRequest {
            target,
            mode,
            xact,
            nowait,
        } = request;
        let session = state.session(pid)?;
        let in_tx = session.in_tx;
        let scope = if xact {
            Scope::Xact(session.depth())
        } else {
            Scope::Session
        };
        let deadline = match session.lock_timeout {
            Some(ms) if ms > 0 => Some(Instant::now() + Duration::from_millis(ms)),
            _ => None,
        };

        let outcome = loop {
            if let Err(err) = self.check_interrupts(state, pid) {
                break Err(err);
            }
            let blockers = state.conflicting_holders(pid, &target, mode);
            if blockers.is_empty() {
                break Ok(true);
            }
            if nowait {
                break Ok(false);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                state.record(SimEvent::TimedOut {
                    pid,
                    target: target.clone(),
                });
                break Err(PgLockError::lock_timeout(
                    "canceling statement due to lock timeout",
                ));
            }
            if !state.waits.contains_key(&pid) {
                state.waits.insert(
                    pid,
                    Wait {
                        target: target.clone(),
                        mode,
                        since: Instant::now(),
                    },
                );
                state.record(SimEvent::Waiting {
                    pid,
                    target: target.clone(),
                    blockers: blockers.clone(),
                });
                debug!(pid = %pid, target = %target, blockers = ?blockers, "sim lock wait");
                self.shared.changed.notify_all();
            }
            match deadline {
                Some(deadline) => {
                    let _ = self.shared.changed.wait_until(state, deadline);
                }
                None => self.shared.changed.wait(state),
            }
        };
        state.waits.remove(&pid);

        if matches!(outcome, Ok(true)) {
            state.record(SimEvent::Granted {
                pid,
                target: target.clone(),
                mode: mode.as_str().to_owned(),
            });
            // Outside a transaction block a transaction-level lock lives for
            // the implicit single-statement transaction only.
            if !(xact && !in_tx) {
                state.locks.push(HeldLock {
                    pid,
                    target,
                    mode,
                    scope,
                });
            }
        }
        outcome
    }
}

fn row(state: &ServerState, now: Instant, subject: Pid, blocker: Pid, lock: &LockView) -> BlockedLock {
    let activity = state.sessions.get(&subject);
    let blocking = state.sessions.get(&blocker);
    let (lock_type, relation, relation_kind) = match &lock.target {
        LockTarget::Advisory(_) => ("ADVISORY", None, None),
        LockTarget::Relation(name) => ("RELATION", Some(name.clone()), Some(RelationKind::Table)),
    };
    BlockedLock {
        activity_pid: subject,
        blocking_pid: blocker,
        lock_type: lock_type.to_owned(),
        mode: lock.mode.as_str().to_owned(),
        granted: lock.granted,
        relation,
        relation_kind,
        wait_duration: lock.wait_duration,
        activity_duration: activity.map(|s| now.saturating_duration_since(s.query_start)),
        activity_query: activity.and_then(|s| s.query.clone()),
        blocking_duration: blocking.map(|s| now.saturating_duration_since(s.query_start)),
        blocking_query: blocking.and_then(|s| s.query.clone()),
    }
}

const fn advisory_mode(shared: bool) -> TableLockMode {
    if shared {
        TableLockMode::Share
    } else {
        TableLockMode::Exclusive
    }
}

fn parse_sleep(text: &str) -> Option<Duration> {
    let start = text.find("pg_sleep(")? + "pg_sleep(".len();
    let end = start + text[start..].find(')')?;
    let seconds: f64 = text[start..end].trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds.max(0.0)).ok()
}

fn closed() -> PgLockError {
    PgLockError::backend(BackendErrorKind::Connection, "server closed the connection")
}

fn terminated() -> PgLockError {
    PgLockError::backend_with_code(
        BackendErrorKind::Terminated,
        "57P01",
        "terminating connection due to administrator command",
    )
}

fn cancelled() -> PgLockError {
    PgLockError::backend_with_code(
        BackendErrorKind::Cancelled,
        "57014",
        "canceling statement due to user request",
    )
}

fn in_failed_transaction() -> PgLockError {
    PgLockError::backend_with_code(
        BackendErrorKind::InFailedTransaction,
        "25P02",
        "current transaction is aborted, commands ignored until end of transaction block",
    )
}

fn no_active_transaction(what: &str) -> PgLockError {
    PgLockError::backend_with_code(
        BackendErrorKind::Other,
        "25P01",
        format!("{what} can only be used in transaction blocks"),
    )
}
