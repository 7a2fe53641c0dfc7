//! Lock wait-timeout values.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use pglock_error::{PgLockError, Result};

const ONE_MS: Duration = Duration::from_millis(1);

/// Largest value the server accepts for `lock_timeout` (`INT_MAX` ms).
pub const MAX_LOCK_TIMEOUT_MS: u64 = 2_147_483_647;

/// How long the backend may wait for a lock.
///
/// `After` carries millisecond granularity; durations under one millisecond
/// are only legal when they come from a unit conversion, in which case they
/// collapse to [`TimeoutValue::Immediate`] (see [`TimeoutValue::from`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutValue {
    /// Wait forever.
    Infinite,
    /// Do not wait at all.
    Immediate,
    /// Wait at most this long (whole milliseconds).
    After(Duration),
}

impl TimeoutValue {
    /// Explicit duration. Zero means [`TimeoutValue::Immediate`]; anything
    /// between zero and one millisecond is rejected.
    pub fn after(duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Ok(Self::Immediate);
        }
        let value = Self::After(duration);
        value.validate()?;
        Ok(value)
    }

    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            Self::Immediate
        } else {
            Self::After(Duration::from_millis(millis))
        }
    }

    /// Seconds as a float, the unit-conversion path: sub-millisecond values
    /// collapse to `Immediate`.
    pub fn from_secs_f64(secs: f64) -> Result<Self> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(PgLockError::usage(format!(
                "timeout must be a finite, non-negative number of seconds (got {secs})"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map(Self::from)
            .map_err(|err| PgLockError::usage(format!("timeout of {secs}s is out of range: {err}")))
    }

    /// Rejects an explicit `After` shorter than one millisecond, or longer
    /// than the server's `lock_timeout` can express.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::After(duration) if *duration < ONE_MS => Err(PgLockError::usage(format!(
                "timeout of {duration:?} is below one millisecond; use TimeoutValue::Immediate \
                 for a non-blocking attempt"
            ))),
            Self::After(duration) if duration.as_millis() > u128::from(MAX_LOCK_TIMEOUT_MS) => {
                Err(PgLockError::usage(format!(
                    "timeout of {}ms exceeds the lock_timeout limit of {MAX_LOCK_TIMEOUT_MS}ms; \
                     use TimeoutValue::Infinite to wait forever",
                    duration.as_millis()
                )))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub const fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }

    /// Value for the `lock_timeout` setting, in milliseconds.
    ///
    /// Postgres reads `0` as "disabled", so `Infinite` maps to `0` and
    /// `Immediate` to the smallest wait the setting can express.
    #[must_use]
    pub fn setting_millis(&self) -> u64 {
        match self {
            Self::Infinite => 0,
            Self::Immediate => 1,
            Self::After(duration) => u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Wait bound as a duration, `None` when infinite.
    #[must_use]
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::Immediate => Some(Duration::ZERO),
            Self::After(duration) => Some(*duration),
        }
    }
}

impl From<Duration> for TimeoutValue {
    fn from(duration: Duration) -> Self {
        if duration < ONE_MS {
            Self::Immediate
        } else {
            Self::After(duration)
        }
    }
}

impl fmt::Display for TimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinite => f.write_str("infinite"),
            Self::Immediate => f.write_str("immediate"),
            Self::After(duration) => write!(f, "{}ms", duration.as_millis()),
        }
    }
}

impl FromStr for TimeoutValue {
    type Err = PgLockError;

    /// Accepts `infinite`, `immediate`, or a number with an optional `ms`,
    /// `s`, or `min` suffix (bare numbers are milliseconds).
    fn from_str(raw: &str) -> Result<Self> {
        let text = raw.trim().to_ascii_lowercase();
        match text.as_str() {
            "infinite" | "none" => return Ok(Self::Infinite),
            "immediate" | "nowait" => return Ok(Self::Immediate),
            _ => {}
        }
        let (number, nanos_per_unit) = if let Some(n) = text.strip_suffix("ms") {
            (n, 1e6)
        } else if let Some(n) = text.strip_suffix("min") {
            (n, 6e10)
        } else if let Some(n) = text.strip_suffix('s') {
            (n, 1e9)
        } else {
            (text.as_str(), 1e6)
        };
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| PgLockError::invalid_type(format!("unrecognized timeout {raw:?}")))?;
        if !value.is_finite() || value < 0.0 {
            return Err(PgLockError::usage(format!(
                "timeout must be a finite, non-negative duration (got {raw:?})"
            )));
        }
        let nanos = (value * nanos_per_unit).round();
        if nanos >= u64::MAX as f64 {
            return Err(PgLockError::usage(format!("timeout {raw:?} is out of range")));
        }
        Ok(Self::from(Duration::from_nanos(nanos as u64)))
    }
}
