//! Blocking read model and session control over `pg_locks` and
//! `pg_stat_activity`.

use std::time::Duration;

use pglock_core::{BlockingSnapshot, SessionControl};
use pglock_error::{PgLockError, Result};
use pglock_types::{BlockedLock, Pid, RelationKind};
use postgres::Client;
use tracing::{debug, info};

use crate::backend::server_version_num;
use crate::error::map_error;

/// First server version whose `pg_locks` carries `waitstart`.
const WAITSTART_VERSION: i32 = 140_000;

/// Locks held or awaited by `$1` and by every session blocking it, one row per
/// (lock, blocker) pair, joined with both sides' activity.
pub fn blocked_locks_sql(server_version_num: i32) -> String {
    let wait_clause = if server_version_num >= WAITSTART_VERSION {
        "EXTRACT(EPOCH FROM NOW() - pg_locks.waitstart)::float8"
    } else {
        "NULL::float8"
    };
    format!(
        r"WITH _pglock_lock_cte AS (
    SELECT
        pg_locks.pid AS activity_id,
        TRIM(BOTH '_' FROM UPPER(
            REGEXP_REPLACE(REPLACE(pg_locks.mode, 'Lock', ''), '([A-Z])', '_\1', 'g')
        )) AS mode,
        UPPER(pg_locks.locktype) AS type,
        pg_locks.granted,
        pg_class.relname::text AS rel_name,
        pg_class.relkind::text AS rel_kind,
        {wait_clause} AS wait_secs
    FROM pg_locks
    JOIN pg_database ON pg_database.oid = pg_locks.database
    LEFT JOIN pg_class ON pg_class.oid = pg_locks.relation
    WHERE pg_database.datname = current_database()
        AND pg_locks.pid = ANY(ARRAY[$1::int4] || pg_blocking_pids($1::int4))
),
_pglock_blocked_lock_cte AS (
    SELECT *, UNNEST(pg_blocking_pids(activity_id)) AS blocking_id
    FROM _pglock_lock_cte
)
SELECT
    blocked.activity_id,
    blocked.blocking_id,
    blocked.type,
    blocked.mode,
    blocked.granted,
    blocked.rel_name,
    blocked.rel_kind,
    blocked.wait_secs,
    EXTRACT(EPOCH FROM NOW() - activity.query_start)::float8 AS activity_secs,
    activity.query AS activity_query,
    EXTRACT(EPOCH FROM NOW() - blocking.query_start)::float8 AS blocking_secs,
    blocking.query AS blocking_query
FROM _pglock_blocked_lock_cte AS blocked
LEFT JOIN pg_stat_activity AS activity ON activity.pid = blocked.activity_id
LEFT JOIN pg_stat_activity AS blocking ON blocking.pid = blocked.blocking_id
ORDER BY blocked.activity_id, blocked.blocking_id"
    )
}

const TERMINATE_SQL: &str =
    "SELECT pid FROM UNNEST($1::int4[]) AS pid WHERE pg_terminate_backend(pid)";
const CANCEL_SQL: &str = "SELECT pid FROM UNNEST($1::int4[]) AS pid WHERE pg_cancel_backend(pid)";

/// Lock catalog on its own session. Never share it with the session being
/// protected.
pub struct PgCatalog {
    client: Client,
    server_version_num: i32,
    sql: String,
}

impl PgCatalog {
    pub fn new(mut client: Client) -> Result<Self> {
        let server_version_num = server_version_num(&mut client)?;
        debug!(server_version_num, "postgres lock catalog ready");
        Ok(Self {
            client,
            server_version_num,
            sql: blocked_locks_sql(server_version_num),
        })
    }

    pub const fn server_version_num(&self) -> i32 {
        self.server_version_num
    }

    fn signal(&mut self, sql: &str, pids: &[Pid], what: &str) -> Result<Vec<Pid>> {
        if pids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i32> = pids.iter().map(|pid| pid.get()).collect();
        let rows = self.client.query(sql, &[&raw]).map_err(|e| map_error(&e))?;
        let handled = rows
            .iter()
            .map(|row| row.try_get::<_, i32>(0).map(Pid))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| map_error(&e))?;
        info!(requested = ?pids, handled = ?handled, "{what} sent");
        Ok(handled)
    }
}

impl BlockingSnapshot for PgCatalog {
    fn blocked_locks(&mut self, pid: Pid) -> Result<Vec<BlockedLock>> {
        let rows = self
            .client
            .query(self.sql.as_str(), &[&pid.get()])
            .map_err(|e| map_error(&e))?;
        rows.iter().map(blocked_lock_from_row).collect()
    }
}

impl SessionControl for PgCatalog {
    fn terminate(&mut self, pids: &[Pid]) -> Result<Vec<Pid>> {
        self.signal(TERMINATE_SQL, pids, "terminate")
    }

    fn cancel(&mut self, pids: &[Pid]) -> Result<Vec<Pid>> {
        self.signal(CANCEL_SQL, pids, "cancel")
    }
}

impl std::fmt::Debug for PgCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCatalog")
            .field("server_version_num", &self.server_version_num)
            .finish_non_exhaustive()
    }
}

fn blocked_lock_from_row(row: &postgres::Row) -> Result<BlockedLock> {
    let get_err = |e: postgres::Error| PgLockError::internal(format!("unexpected pg_locks row: {e}"));
    let rel_kind: Option<String> = row.try_get("rel_kind").map_err(get_err)?;
    Ok(BlockedLock {
        activity_pid: Pid(row.try_get("activity_id").map_err(get_err)?),
        blocking_pid: Pid(row.try_get("blocking_id").map_err(get_err)?),
        lock_type: row.try_get("type").map_err(get_err)?,
        mode: row.try_get("mode").map_err(get_err)?,
        granted: row.try_get("granted").map_err(get_err)?,
        relation: row.try_get("rel_name").map_err(get_err)?,
        relation_kind: rel_kind
            .and_then(|kind| kind.chars().next())
            .and_then(RelationKind::from_relkind),
        wait_duration: seconds(row.try_get("wait_secs").map_err(get_err)?),
        activity_duration: seconds(row.try_get("activity_secs").map_err(get_err)?),
        activity_query: row.try_get("activity_query").map_err(get_err)?,
        blocking_duration: seconds(row.try_get("blocking_secs").map_err(get_err)?),
        blocking_query: row.try_get("blocking_query").map_err(get_err)?,
    })
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
}
