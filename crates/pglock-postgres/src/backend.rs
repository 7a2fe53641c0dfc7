//! A [`Backend`] over a synchronous `postgres::Client`.

use pglock_core::Backend;
use pglock_error::{PgLockError, Result};
use pglock_types::{Row, Rows, Statement, Value};
use postgres::types::ToSql;
use postgres::{Client, SimpleQueryMessage};
use tracing::debug;

use crate::error::map_error;

/// What a rendered statement hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Nothing worth reading.
    Unit,
    /// One boolean column, one row.
    Bool,
    /// One int4 column, one row.
    Int,
    /// Whatever text the server sends (simple protocol).
    Text,
}

/// SQL text plus the single bind parameter some statements take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlPlan {
    pub sql: String,
    pub lock_id: Option<i64>,
    pub shape: ResultShape,
}

impl SqlPlan {
    fn unit(sql: String) -> Self {
        Self {
            sql,
            lock_id: None,
            shape: ResultShape::Unit,
        }
    }
}

/// Render `statement` for the Postgres wire.
pub fn render(statement: &Statement) -> SqlPlan {
    match statement {
        Statement::AdvisoryLock { id, .. } | Statement::AdvisoryUnlock { id, .. } => {
            let function = statement.advisory_function().unwrap_or_default();
            let returns_bool = matches!(
                statement,
                Statement::AdvisoryLock { nowait: true, .. } | Statement::AdvisoryUnlock { .. }
            );
            SqlPlan {
                sql: format!("SELECT {function}($1)"),
                lock_id: Some(*id),
                shape: if returns_bool {
                    ResultShape::Bool
                } else {
                    ResultShape::Unit
                },
            }
        }
        Statement::BackendPid => SqlPlan {
            sql: statement.to_string(),
            lock_id: None,
            shape: ResultShape::Int,
        },
        Statement::ShowLockTimeout | Statement::Sql(_) => SqlPlan {
            sql: statement.to_string(),
            lock_id: None,
            shape: ResultShape::Text,
        },
        other => SqlPlan::unit(other.to_string()),
    }
}

/// One Postgres session.
pub struct PgBackend {
    client: Client,
}

impl PgBackend {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn into_client(self) -> Client {
        self.client
    }

    /// `server_version_num`, e.g. `160002`.
    pub fn server_version_num(&mut self) -> Result<i32> {
        server_version_num(&mut self.client)
    }

    fn run(&mut self, plan: &SqlPlan) -> Result<Rows> {
        let params: Vec<&(dyn ToSql + Sync)> = plan
            .lock_id
            .as_ref()
            .map(|id| vec![id as &(dyn ToSql + Sync)])
            .unwrap_or_default();
        match plan.shape {
            ResultShape::Unit if params.is_empty() => {
                self.client.batch_execute(&plan.sql).map_err(|e| map_error(&e))?;
                Ok(Rows::empty())
            }
            ResultShape::Unit => {
                self.client
                    .execute(plan.sql.as_str(), &params)
                    .map_err(|e| map_error(&e))?;
                Ok(Rows::empty())
            }
            ResultShape::Bool => {
                let row = self
                    .client
                    .query_one(plan.sql.as_str(), &params)
                    .map_err(|e| map_error(&e))?;
                let value: bool = row.try_get(0).map_err(|e| map_error(&e))?;
                Ok(Rows::single(Value::Bool(value)))
            }
            ResultShape::Int => {
                let row = self
                    .client
                    .query_one(plan.sql.as_str(), &params)
                    .map_err(|e| map_error(&e))?;
                let value: i32 = row.try_get(0).map_err(|e| map_error(&e))?;
                Ok(Rows::single(Value::Int(i64::from(value))))
            }
            ResultShape::Text => {
                let messages = self
                    .client
                    .simple_query(&plan.sql)
                    .map_err(|e| map_error(&e))?;
                Ok(text_rows(&messages))
            }
        }
    }
}

impl Backend for PgBackend {
    fn execute(&mut self, statement: &Statement) -> Result<Rows> {
        let plan = render(statement);
        debug!(sql = %plan.sql, lock_id = ?plan.lock_id, "postgres execute");
        self.run(&plan)
    }
}

impl std::fmt::Debug for PgBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBackend")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

fn text_rows(messages: &[SimpleQueryMessage]) -> Rows {
    let rows = messages
        .iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(Row(
                (0..row.len())
                    .map(|i| match row.try_get(i) {
                        Ok(Some(text)) => Value::Text(text.to_owned()),
                        _ => Value::Null,
                    })
                    .collect(),
            )),
            _ => None,
        })
        .collect();
    Rows(rows)
}

pub(crate) fn server_version_num(client: &mut Client) -> Result<i32> {
    let row = client
        .query_one("SELECT current_setting('server_version_num')::int4", &[])
        .map_err(|e| map_error(&e))?;
    row.try_get(0).map_err(|e| {
        PgLockError::internal(format!("server_version_num is not an integer: {e}"))
    })
}
