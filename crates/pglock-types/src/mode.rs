//! Table lock modes and side-effect policies.

use std::fmt;
use std::str::FromStr;

use pglock_error::{PgLockError, Result};
use serde::{Deserialize, Serialize};

/// The eight table-level lock modes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableLockMode {
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
}

impl Default for TableLockMode {
    fn default() -> Self {
        Self::AccessExclusive
    }
}

impl TableLockMode {
    pub const ALL: [Self; 8] = [
        Self::AccessShare,
        Self::RowShare,
        Self::RowExclusive,
        Self::ShareUpdateExclusive,
        Self::Share,
        Self::ShareRowExclusive,
        Self::Exclusive,
        Self::AccessExclusive,
    ];

    /// Keyword sequence used in `LOCK TABLE ... IN <mode> MODE`.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::AccessShare => "ACCESS SHARE",
            Self::RowShare => "ROW SHARE",
            Self::RowExclusive => "ROW EXCLUSIVE",
            Self::ShareUpdateExclusive => "SHARE UPDATE EXCLUSIVE",
            Self::Share => "SHARE",
            Self::ShareRowExclusive => "SHARE ROW EXCLUSIVE",
            Self::Exclusive => "EXCLUSIVE",
            Self::AccessExclusive => "ACCESS EXCLUSIVE",
        }
    }

    /// Normalized name as reported in lock listings (`ACCESS_EXCLUSIVE`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccessShare => "ACCESS_SHARE",
            Self::RowShare => "ROW_SHARE",
            Self::RowExclusive => "ROW_EXCLUSIVE",
            Self::ShareUpdateExclusive => "SHARE_UPDATE_EXCLUSIVE",
            Self::Share => "SHARE",
            Self::ShareRowExclusive => "SHARE_ROW_EXCLUSIVE",
            Self::Exclusive => "EXCLUSIVE",
            Self::AccessExclusive => "ACCESS_EXCLUSIVE",
        }
    }

    /// Name used by the `pg_locks.mode` column (`AccessExclusiveLock`).
    #[must_use]
    pub const fn pg_locks_name(self) -> &'static str {
        match self {
            Self::AccessShare => "AccessShareLock",
            Self::RowShare => "RowShareLock",
            Self::RowExclusive => "RowExclusiveLock",
            Self::ShareUpdateExclusive => "ShareUpdateExclusiveLock",
            Self::Share => "ShareLock",
            Self::ShareRowExclusive => "ShareRowExclusiveLock",
            Self::Exclusive => "ExclusiveLock",
            Self::AccessExclusive => "AccessExclusiveLock",
        }
    }

    /// Standard table-level conflict matrix.
    #[must_use]
    pub const fn conflicts_with(self, other: Self) -> bool {
        use TableLockMode::{
            AccessExclusive, AccessShare, Exclusive, RowExclusive, RowShare, Share,
            ShareRowExclusive, ShareUpdateExclusive,
        };
        match self {
            AccessShare => matches!(other, AccessExclusive),
            RowShare => matches!(other, Exclusive | AccessExclusive),
            RowExclusive => matches!(
                other,
                Share | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            ShareUpdateExclusive => matches!(
                other,
                ShareUpdateExclusive | Share | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            Share => matches!(
                other,
                RowExclusive | ShareUpdateExclusive | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            ShareRowExclusive => matches!(
                other,
                RowExclusive
                    | ShareUpdateExclusive
                    | Share
                    | ShareRowExclusive
                    | Exclusive
                    | AccessExclusive
            ),
            Exclusive => !matches!(other, AccessShare),
            AccessExclusive => true,
        }
    }
}

impl fmt::Display for TableLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for TableLockMode {
    type Err = PgLockError;

    /// Accepts `ACCESS EXCLUSIVE`, `access_exclusive` and `AccessExclusiveLock`.
    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix("Lock").unwrap_or(trimmed);
        let squashed: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::ALL
            .into_iter()
            .find(|mode| {
                mode.as_str()
                    .chars()
                    .filter(|c| *c != '_')
                    .map(|c| c.to_ascii_lowercase())
                    .eq(squashed.chars())
            })
            .ok_or_else(|| PgLockError::usage(format!("unknown table lock mode {raw:?}")))
    }
}

/// What a lock operation does when the lock cannot be had.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Report the acquisition status to the caller.
    ReturnStatus,
    /// Surface a lock timeout error.
    RaiseOnFailure,
    /// Skip the wrapped unit of work.
    SkipOnFailure,
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReturnStatus => "return",
            Self::RaiseOnFailure => "raise",
            Self::SkipOnFailure => "skip",
        })
    }
}
