//! Statements the lock engine sends to a session, and the rows it reads back.
//!
//! Backends render these however they like: the Postgres backend turns them
//! into SQL text, the simulated backend interprets them directly.

use std::fmt;

use crate::mode::TableLockMode;

/// A single request issued through a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    /// Set the session `lock_timeout` in milliseconds (`0` disables it).
    SetLockTimeout(u64),
    /// Return `lock_timeout` to the server default.
    ResetLockTimeout,
    ShowLockTimeout,
    /// `pg[_try]_advisory[_xact]_lock[_shared](id)`.
    ///
    /// The non-blocking form returns one boolean row; the blocking form
    /// returns nothing useful.
    AdvisoryLock {
        id: i64,
        shared: bool,
        xact: bool,
        nowait: bool,
    },
    /// `pg_advisory_unlock[_shared](id)`, returns one boolean row.
    AdvisoryUnlock { id: i64, shared: bool },
    /// `LOCK TABLE a, b IN <mode> MODE [NOWAIT]`.
    LockTables {
        tables: Vec<String>,
        mode: TableLockMode,
        nowait: bool,
    },
    /// `pg_backend_pid()`, returns one integer row.
    BackendPid,
    /// Free-form statement, passed through untouched.
    Sql(String),
}

impl Statement {
    /// Name of the advisory lock function this statement calls.
    #[must_use]
    pub fn advisory_function(&self) -> Option<String> {
        match self {
            Self::AdvisoryLock {
                shared,
                xact,
                nowait,
                ..
            } => Some(format!(
                "pg{}_advisory{}_lock{}",
                if *nowait { "_try" } else { "" },
                if *xact { "_xact" } else { "" },
                if *shared { "_shared" } else { "" },
            )),
            Self::AdvisoryUnlock { shared, .. } => Some(format!(
                "pg_advisory_unlock{}",
                if *shared { "_shared" } else { "" }
            )),
            _ => None,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => f.write_str("BEGIN"),
            Self::Commit => f.write_str("COMMIT"),
            Self::Rollback => f.write_str("ROLLBACK"),
            Self::Savepoint(name) => write!(f, "SAVEPOINT {name}"),
            Self::ReleaseSavepoint(name) => write!(f, "RELEASE SAVEPOINT {name}"),
            Self::RollbackToSavepoint(name) => write!(f, "ROLLBACK TO SAVEPOINT {name}"),
            Self::SetLockTimeout(ms) => write!(f, "SET lock_timeout = {ms}"),
            Self::ResetLockTimeout => f.write_str("RESET lock_timeout"),
            Self::ShowLockTimeout => f.write_str("SHOW lock_timeout"),
            Self::AdvisoryLock { id, .. } | Self::AdvisoryUnlock { id, .. } => {
                let function = self.advisory_function().unwrap_or_default();
                write!(f, "SELECT {function}({id})")
            }
            Self::LockTables {
                tables,
                mode,
                nowait,
            } => {
                f.write_str("LOCK TABLE ")?;
                for (i, table) in tables.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_qualified(f, table)?;
                }
                write!(f, " IN {} MODE", mode.as_sql())?;
                if *nowait {
                    f.write_str(" NOWAIT")?;
                }
                Ok(())
            }
            Self::BackendPid => f.write_str("SELECT pg_backend_pid()"),
            Self::Sql(text) => f.write_str(text),
        }
    }
}

/// `schema.table` becomes `"schema"."table"`; embedded quotes are doubled.
fn write_qualified(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    for (i, part) in name.split('.').enumerate() {
        if i > 0 {
            f.write_str(".")?;
        }
        write!(f, "\"{}\"", part.replace('"', "\"\""))?;
    }
    Ok(())
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(pub Vec<Value>);

impl Row {
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }
}

/// Result set of one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows(pub Vec<Row>);

impl Rows {
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn single(value: Value) -> Self {
        Self(vec![Row(vec![value])])
    }

    fn first(&self) -> Option<&Value> {
        self.0.first().and_then(|row| row.get(0))
    }

    /// First column of the first row, as a boolean.
    #[must_use]
    pub fn first_bool(&self) -> Option<bool> {
        self.first().and_then(Value::as_bool)
    }

    #[must_use]
    pub fn first_int(&self) -> Option<i64> {
        self.first().and_then(Value::as_int)
    }

    #[must_use]
    pub fn first_text(&self) -> Option<&str> {
        self.first().and_then(Value::as_text)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_function_names() {
        let stmt = Statement::AdvisoryLock {
            id: 7,
            shared: true,
            xact: true,
            nowait: true,
        };
        assert_eq!(stmt.to_string(), "SELECT pg_try_advisory_xact_lock_shared(7)");

        let stmt = Statement::AdvisoryLock {
            id: -3,
            shared: false,
            xact: false,
            nowait: false,
        };
        assert_eq!(stmt.to_string(), "SELECT pg_advisory_lock(-3)");

        let stmt = Statement::AdvisoryUnlock {
            id: 1,
            shared: true,
        };
        assert_eq!(stmt.to_string(), "SELECT pg_advisory_unlock_shared(1)");
    }

    #[test]
    fn lock_tables_quotes_every_relation() {
        let stmt = Statement::LockTables {
            tables: vec!["public.users".to_owned(), "odd\"name".to_owned()],
            mode: TableLockMode::ShareRowExclusive,
            nowait: true,
        };
        assert_eq!(
            stmt.to_string(),
            "LOCK TABLE \"public\".\"users\", \"odd\"\"name\" IN SHARE ROW EXCLUSIVE MODE NOWAIT"
        );
    }

    #[test]
    fn rows_accessors() {
        assert_eq!(Rows::single(Value::Bool(true)).first_bool(), Some(true));
        assert_eq!(Rows::single(Value::Int(42)).first_int(), Some(42));
        assert_eq!(Rows::single(Value::Int(42)).first_bool(), None);
        assert_eq!(Rows::empty().first_text(), None);
    }
}
