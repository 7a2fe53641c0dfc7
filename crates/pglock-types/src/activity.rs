//! Read model for blocked locks.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backend process id of a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Pid(pub i32);

impl Pid {
    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Self(pid)
    }
}

/// `pg_class.relkind`, spelled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    Table,
    Index,
    Sequence,
    Toast,
    View,
    MaterializedView,
    CompositeType,
    ForeignTable,
    PartitionedTable,
    PartitionedIndex,
}

impl RelationKind {
    #[must_use]
    pub const fn from_relkind(relkind: char) -> Option<Self> {
        Some(match relkind {
            'r' => Self::Table,
            'i' => Self::Index,
            'S' => Self::Sequence,
            't' => Self::Toast,
            'v' => Self::View,
            'm' => Self::MaterializedView,
            'c' => Self::CompositeType,
            'f' => Self::ForeignTable,
            'p' => Self::PartitionedTable,
            'I' => Self::PartitionedIndex,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Table => "TABLE",
            Self::Index => "INDEX",
            Self::Sequence => "SEQUENCE",
            Self::Toast => "TOAST",
            Self::View => "VIEW",
            Self::MaterializedView => "MATERIALIZED_VIEW",
            Self::CompositeType => "COMPOSITE_TYPE",
            Self::ForeignTable => "FOREIGN_TABLE",
            Self::PartitionedTable => "PARTITIONED_TABLE",
            Self::PartitionedIndex => "PARTITIONED_INDEX",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lock held or awaited by `activity_pid`, paired with a session that
/// blocks it.
///
/// A lock blocked by several sessions appears once per blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedLock {
    pub activity_pid: Pid,
    pub blocking_pid: Pid,
    /// `pg_locks.locktype`, upper-cased (`RELATION`, `ADVISORY`, ...).
    pub lock_type: String,
    /// Normalized mode name (`ACCESS_EXCLUSIVE`, `SHARE`, ...).
    pub mode: String,
    pub granted: bool,
    pub relation: Option<String>,
    pub relation_kind: Option<RelationKind>,
    /// Only reported by servers that track wait start times.
    pub wait_duration: Option<Duration>,
    pub activity_duration: Option<Duration>,
    pub activity_query: Option<String>,
    pub blocking_duration: Option<Duration>,
    pub blocking_query: Option<String>,
}

impl BlockedLock {
    /// Distinct blocking pids, in first-seen order.
    #[must_use]
    pub fn blocking_pids(locks: &[Self]) -> Vec<Pid> {
        distinct(locks.iter().map(|lock| lock.blocking_pid))
    }

    /// Distinct activity pids, in first-seen order.
    #[must_use]
    pub fn activity_pids(locks: &[Self]) -> Vec<Pid> {
        distinct(locks.iter().map(|lock| lock.activity_pid))
    }
}

fn distinct(pids: impl Iterator<Item = Pid>) -> Vec<Pid> {
    let mut seen = Vec::new();
    for pid in pids {
        if !seen.contains(&pid) {
            seen.push(pid);
        }
    }
    seen
}
