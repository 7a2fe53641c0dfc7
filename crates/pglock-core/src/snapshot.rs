//! Blocking-session read model and session control.
//!
//! The prioritization watcher only sees these traits; the Postgres catalog
//! and the simulated server both implement them.

use std::fmt;
use std::time::Duration;

use pglock_error::{PgLockError, Result};
use pglock_types::{BlockedLock, Pid, TableLockMode};

/// Read-only view of the locks involved in blocking a session.
pub trait BlockingSnapshot {
    /// Locks held or awaited by `pid` and by every session blocking it, one
    /// row per (lock, blocker) pair.
    fn blocked_locks(&mut self, pid: Pid) -> Result<Vec<BlockedLock>>;

    /// Distinct sessions blocking `pid` that pass every filter.
    fn blockers_of(&mut self, pid: Pid, filters: &[LockFilter]) -> Result<Vec<Pid>> {
        let locks = self.blocked_locks(pid)?;
        let matching: Vec<BlockedLock> = locks
            .into_iter()
            .filter(|lock| filters.iter().all(|f| f.matches(lock)))
            .collect();
        Ok(BlockedLock::blocking_pids(&matching))
    }
}

/// Forcible session control. Both calls return the pids actually handled.
pub trait SessionControl {
    /// Force-disconnect each session.
    fn terminate(&mut self, pids: &[Pid]) -> Result<Vec<Pid>>;

    /// Cancel each session's in-flight statement, leaving it connected.
    fn cancel(&mut self, pids: &[Pid]) -> Result<Vec<Pid>>;
}

/// Everything the prioritization watcher needs from its own connection.
pub trait LockCatalog: BlockingSnapshot + SessionControl + Send {}

impl<T: BlockingSnapshot + SessionControl + Send> LockCatalog for T {}

pub fn terminate_blocking_activity<C: SessionControl + ?Sized>(
    control: &mut C,
    locks: &[BlockedLock],
) -> Result<Vec<Pid>> {
    act(control, &BlockedLock::blocking_pids(locks), Action::Terminate)
}

pub fn cancel_blocking_activity<C: SessionControl + ?Sized>(
    control: &mut C,
    locks: &[BlockedLock],
) -> Result<Vec<Pid>> {
    act(control, &BlockedLock::blocking_pids(locks), Action::Cancel)
}

pub fn terminate_activity<C: SessionControl + ?Sized>(
    control: &mut C,
    locks: &[BlockedLock],
) -> Result<Vec<Pid>> {
    act(control, &BlockedLock::activity_pids(locks), Action::Terminate)
}

pub fn cancel_activity<C: SessionControl + ?Sized>(
    control: &mut C,
    locks: &[BlockedLock],
) -> Result<Vec<Pid>> {
    act(control, &BlockedLock::activity_pids(locks), Action::Cancel)
}

#[derive(Clone, Copy)]
enum Action {
    Terminate,
    Cancel,
}

fn act<C: SessionControl + ?Sized>(
    control: &mut C,
    pids: &[Pid],
    action: Action,
) -> Result<Vec<Pid>> {
    if pids.is_empty() {
        return Ok(Vec::new());
    }
    match action {
        Action::Terminate => control.terminate(pids),
        Action::Cancel => control.cancel(pids),
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Predicate narrowing which blocked-lock rows a corrective action touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFilter {
    /// The blocking session's current statement has run at least this long.
    BlockingDurationAtLeast(Duration),
    /// The lock has been waited on at least this long.
    WaitDurationAtLeast(Duration),
    Mode(TableLockMode),
    /// Relation name, exact match.
    Relation(String),
    BlockingQueryContains(String),
    Granted(bool),
}

impl LockFilter {
    #[must_use]
    pub fn matches(&self, lock: &BlockedLock) -> bool {
        match self {
            Self::BlockingDurationAtLeast(min) => lock.blocking_duration.is_some_and(|d| d >= *min),
            Self::WaitDurationAtLeast(min) => lock.wait_duration.is_some_and(|d| d >= *min),
            Self::Mode(mode) => lock
                .mode
                .parse::<TableLockMode>()
                .is_ok_and(|m| m == *mode),
            Self::Relation(name) => lock.relation.as_deref() == Some(name.as_str()),
            Self::BlockingQueryContains(needle) => lock
                .blocking_query
                .as_deref()
                .is_some_and(|q| q.contains(needle.as_str())),
            Self::Granted(granted) => lock.granted == *granted,
        }
    }

    /// Parse a `field__lookup=value` expression.
    ///
    /// Supported: `blocking_activity__duration__gte`, `wait_duration__gte`,
    /// `mode`, `rel_name`, `blocking_activity__query__contains`, `granted`.
    pub fn parse(expr: &str) -> Result<Self> {
        let (field, value) = expr
            .split_once('=')
            .ok_or_else(|| PgLockError::usage(format!("filter {expr:?} is not of the form field=value")))?;
        let value = value.trim();
        match field.trim() {
            "blocking_activity__duration__gte" => {
                parse_duration(value).map(Self::BlockingDurationAtLeast)
            }
            "wait_duration__gte" => parse_duration(value).map(Self::WaitDurationAtLeast),
            "mode" => value.parse().map(Self::Mode),
            "rel_name" => Ok(Self::Relation(value.to_owned())),
            "blocking_activity__query__contains" => {
                Ok(Self::BlockingQueryContains(value.to_owned()))
            }
            "granted" => match value.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Self::Granted(true)),
                "false" | "f" | "0" => Ok(Self::Granted(false)),
                _ => Err(PgLockError::usage(format!("invalid boolean {value:?} in filter {expr:?}"))),
            },
            other => Err(PgLockError::usage(format!(
                "unsupported filter field {other:?} in {expr:?}"
            ))),
        }
    }
}

impl fmt::Display for LockFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockingDurationAtLeast(d) => {
                write!(f, "blocking_activity__duration__gte={}ms", d.as_millis())
            }
            Self::WaitDurationAtLeast(d) => write!(f, "wait_duration__gte={}ms", d.as_millis()),
            Self::Mode(mode) => write!(f, "mode={}", mode.as_str()),
            Self::Relation(name) => write!(f, "rel_name={name}"),
            Self::BlockingQueryContains(needle) => {
                write!(f, "blocking_activity__query__contains={needle}")
            }
            Self::Granted(granted) => write!(f, "granted={granted}"),
        }
    }
}

/// A filter given either typed or as an expression parsed when it is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    Typed(LockFilter),
    Expr(String),
}

impl FilterSpec {
    pub fn resolve(&self) -> Result<LockFilter> {
        match self {
            Self::Typed(filter) => Ok(filter.clone()),
            Self::Expr(expr) => LockFilter::parse(expr),
        }
    }

    pub fn resolve_all(specs: &[Self]) -> Result<Vec<LockFilter>> {
        specs.iter().map(Self::resolve).collect()
    }
}

impl From<LockFilter> for FilterSpec {
    fn from(filter: LockFilter) -> Self {
        Self::Typed(filter)
    }
}

impl From<&str> for FilterSpec {
    fn from(expr: &str) -> Self {
        Self::Expr(expr.to_owned())
    }
}

impl From<String> for FilterSpec {
    fn from(expr: String) -> Self {
        Self::Expr(expr)
    }
}

/// Parse `250ms`, `5s`, `5 minutes`, `1 hour`, `00:05:00` or a bare number
/// of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let text = raw.trim().to_ascii_lowercase();
    let invalid = || PgLockError::usage(format!("invalid duration {raw:?}"));
    if text.contains(':') {
        let mut secs = 0_u64;
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }
        for part in parts {
            let n: u64 = part.trim().parse().map_err(|_| invalid())?;
            secs = secs
                .checked_mul(60)
                .and_then(|s| s.checked_add(n))
                .ok_or_else(invalid)?;
        }
        return Ok(Duration::from_secs(secs));
    }
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;
    let nanos_per_unit = match unit.trim() {
        "ms" | "msec" | "millisecond" | "milliseconds" => 1e6,
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1e9,
        "m" | "min" | "mins" | "minute" | "minutes" => 6e10,
        "h" | "hr" | "hour" | "hours" => 3.6e12,
        "d" | "day" | "days" => 8.64e13,
        _ => return Err(invalid()),
    };
    let nanos = (number * nanos_per_unit).round();
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use pglock_types::RelationKind;

    use super::*;

    fn blocked(blocking: i32, blocking_secs: u64, mode: &str) -> BlockedLock {
        BlockedLock {
            activity_pid: Pid(1),
            blocking_pid: Pid(blocking),
            lock_type: "RELATION".to_owned(),
            mode: mode.to_owned(),
            granted: false,
            relation: Some("users".to_owned()),
            relation_kind: Some(RelationKind::Table),
            wait_duration: Some(Duration::from_millis(200)),
            activity_duration: Some(Duration::from_millis(200)),
            activity_query: Some("LOCK TABLE users".to_owned()),
            blocking_duration: Some(Duration::from_secs(blocking_secs)),
            blocking_query: Some("UPDATE users SET name = 'x'".to_owned()),
        }
    }

    struct Fixed(Vec<BlockedLock>, Vec<Pid>);

    impl BlockingSnapshot for Fixed {
        fn blocked_locks(&mut self, _pid: Pid) -> Result<Vec<BlockedLock>> {
            Ok(self.0.clone())
        }
    }

    impl SessionControl for Fixed {
        fn terminate(&mut self, pids: &[Pid]) -> Result<Vec<Pid>> {
            self.1.extend_from_slice(pids);
            Ok(pids.to_vec())
        }

        fn cancel(&mut self, pids: &[Pid]) -> Result<Vec<Pid>> {
            Ok(pids.to_vec())
        }
    }

    #[test]
    fn parses_expressions() {
        assert_eq!(
            LockFilter::parse("blocking_activity__duration__gte=5 minutes").unwrap(),
            LockFilter::BlockingDurationAtLeast(Duration::from_secs(300))
        );
        assert_eq!(
            LockFilter::parse("wait_duration__gte=250ms").unwrap(),
            LockFilter::WaitDurationAtLeast(Duration::from_millis(250))
        );
        assert_eq!(
            LockFilter::parse("mode=ACCESS_EXCLUSIVE").unwrap(),
            LockFilter::Mode(TableLockMode::AccessExclusive)
        );
        assert_eq!(
            LockFilter::parse("rel_name=users").unwrap(),
            LockFilter::Relation("users".to_owned())
        );
        assert_eq!(
            LockFilter::parse("granted=false").unwrap(),
            LockFilter::Granted(false)
        );
    }

    #[test]
    fn malformed_expressions_are_usage_errors() {
        for expr in [
            "duration",
            "blocking_activity__duration__lte=5s",
            "wait_duration__gte=soon",
            "mode=SHARED",
            "granted=maybe",
        ] {
            let err = LockFilter::parse(expr).unwrap_err();
            assert!(err.is_usage(), "expr={expr} err={err}");
        }
    }

    #[test]
    fn display_round_trips() {
        for filter in [
            LockFilter::BlockingDurationAtLeast(Duration::from_secs(2)),
            LockFilter::Mode(TableLockMode::RowExclusive),
            LockFilter::Relation("orders".to_owned()),
            LockFilter::Granted(true),
        ] {
            assert_eq!(LockFilter::parse(&filter.to_string()).unwrap(), filter);
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("00:01:30").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5 s").unwrap(), Duration::from_millis(1_500));
        assert_eq!(parse_duration("1 hour").unwrap(), Duration::from_secs(3_600));
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn oversized_durations_are_usage_errors() {
        let overflowing_float = format!("{} seconds", "9".repeat(400));
        for raw in [
            "18446744073709551615:59",
            "307445734561825861:00:00",
            overflowing_float.as_str(),
            "99999999999999999999 days",
        ] {
            let err = parse_duration(raw).unwrap_err();
            assert!(err.is_usage(), "{raw}: {err}");
        }
        let err = LockFilter::parse("blocking_activity__duration__gte=18446744073709551615:59")
            .unwrap_err();
        assert!(err.is_usage(), "{err}");
    }

    #[test]
    fn blockers_are_filtered_and_distinct() {
        let mut snapshot = Fixed(
            vec![
                blocked(10, 1, "ACCESS_EXCLUSIVE"),
                blocked(10, 1, "ACCESS_EXCLUSIVE"),
                blocked(20, 600, "ACCESS_EXCLUSIVE"),
                blocked(30, 900, "ROW_EXCLUSIVE"),
            ],
            Vec::new(),
        );
        assert_eq!(
            snapshot.blockers_of(Pid(1), &[]).unwrap(),
            vec![Pid(10), Pid(20), Pid(30)]
        );
        let filters = [
            LockFilter::BlockingDurationAtLeast(Duration::from_secs(300)),
            LockFilter::Mode(TableLockMode::AccessExclusive),
        ];
        assert_eq!(snapshot.blockers_of(Pid(1), &filters).unwrap(), vec![Pid(20)]);
    }

    #[test]
    fn activity_helpers_skip_empty_sets() {
        let mut control = Fixed(Vec::new(), Vec::new());
        assert!(terminate_blocking_activity(&mut control, &[]).unwrap().is_empty());
        assert!(control.1.is_empty());

        let locks = [blocked(10, 1, "SHARE"), blocked(11, 1, "SHARE")];
        assert_eq!(
            terminate_blocking_activity(&mut control, &locks).unwrap(),
            vec![Pid(10), Pid(11)]
        );
        assert_eq!(terminate_activity(&mut control, &locks).unwrap(), vec![Pid(1)]);
        assert_eq!(cancel_activity(&mut control, &locks).unwrap(), vec![Pid(1)]);
        assert_eq!(
            cancel_blocking_activity(&mut control, &locks).unwrap(),
            vec![Pid(10), Pid(11)]
        );
    }
}
