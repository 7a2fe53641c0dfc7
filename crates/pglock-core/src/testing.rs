//! Scripted backend for unit tests.

use pglock_error::{PgLockError, Result};
use pglock_types::{Rows, Statement, Value};

use crate::backend::Backend;
use crate::connection::Connection;

type Matcher = Box<dyn Fn(&Statement) -> bool + Send>;

/// Records every statement and answers from a script.
pub struct ScriptedBackend {
    pub statements: Vec<Statement>,
    failures: Vec<(Matcher, PgLockError)>,
    pub try_lock_result: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            statements: Vec::new(),
            failures: Vec::new(),
            try_lock_result: true,
        }
    }

    /// Fail the first statement matching `matcher` with `error`.
    pub fn fail_when(
        mut self,
        matcher: impl Fn(&Statement) -> bool + Send + 'static,
        error: PgLockError,
    ) -> Self {
        self.failures.push((Box::new(matcher), error));
        self
    }

    pub fn busy(mut self) -> Self {
        self.try_lock_result = false;
        self
    }

    pub fn connect(self) -> Connection<Self> {
        Connection::new(self)
    }
}

impl Backend for ScriptedBackend {
    fn execute(&mut self, statement: &Statement) -> Result<Rows> {
        self.statements.push(statement.clone());
        if let Some(pos) = self.failures.iter().position(|(m, _)| m(statement)) {
            return Err(self.failures.remove(pos).1);
        }
        Ok(match statement {
            Statement::BackendPid => Rows::single(Value::Int(4242)),
            Statement::AdvisoryLock { nowait: true, .. } => {
                Rows::single(Value::Bool(self.try_lock_result))
            }
            Statement::AdvisoryUnlock { .. } => Rows::single(Value::Bool(true)),
            _ => Rows::empty(),
        })
    }
}

pub fn statements(conn: &Connection<ScriptedBackend>) -> Vec<String> {
    conn.backend()
        .statements
        .iter()
        .map(ToString::to_string)
        .collect()
}

pub fn is_advisory_lock(statement: &Statement) -> bool {
    matches!(statement, Statement::AdvisoryLock { .. })
}

pub fn is_lock_tables(statement: &Statement) -> bool {
    matches!(statement, Statement::LockTables { .. })
}
