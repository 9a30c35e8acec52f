// src/store/sqlite.rs

//! rusqlite-backed reference implementation of the store adapter.
//!
//! Entity types map to tables, the canonical id is the `id` column
//! (INTEGER PRIMARY KEY in the usual schema), and the transaction scope is
//! the connection's own BEGIN/COMMIT/ROLLBACK. Hosting processes that use a
//! different persistence technology implement [`Store`] themselves.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use crate::error::{Error, Result};

use super::filter::{Clause, Filter};
use super::value::Value;
use super::{FieldValues, Record, Store};

/// SQLite store adapter over a single connection.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Self::new(conn))
    }

    /// Direct access to the underlying connection, for schema setup and
    /// host-side queries outside the engine's contract.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Table and column names come from configuration, not from user data, but
/// they are still interpolated into SQL; restrict them to identifier
/// characters.
fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Store(format!("invalid identifier: {name:?}")))
    }
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Value::Integer(i) => rusqlite::types::Value::Integer(*i),
        Value::Real(r) => rusqlite::types::Value::Real(*r),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(t) => Value::Text(
            std::str::from_utf8(t)
                .map_err(|e| Error::Store(format!("non-utf8 text column: {e}")))?
                .to_string(),
        ),
        ValueRef::Blob(_) => {
            return Err(Error::Store("blob columns are not supported".to_string()));
        }
    })
}

/// Render a filter to a WHERE fragment plus positional parameters.
fn render_filter(filter: &Filter) -> Result<(String, Vec<rusqlite::types::Value>)> {
    let mut fragments = Vec::new();
    let mut params = Vec::new();

    for clause in filter.clauses() {
        check_identifier(clause.field())?;
        match clause {
            Clause::Eq { field, value } => {
                if value.is_null() {
                    fragments.push(format!("{field} IS NULL"));
                } else {
                    fragments.push(format!("{field} = ?"));
                    params.push(to_sql_value(value));
                }
            }
            Clause::In { field, values } => {
                if values.is_empty() {
                    // IN () is a syntax error in SQLite; an empty id set
                    // matches nothing.
                    fragments.push("0 = 1".to_string());
                } else {
                    let marks = vec!["?"; values.len()].join(", ");
                    fragments.push(format!("{field} IN ({marks})"));
                    params.extend(values.iter().map(to_sql_value));
                }
            }
            Clause::NotIn { field, values } => {
                if !values.is_empty() {
                    let marks = vec!["?"; values.len()].join(", ");
                    fragments.push(format!("{field} NOT IN ({marks})"));
                    params.extend(values.iter().map(to_sql_value));
                }
            }
            Clause::IsNull { field } => {
                fragments.push(format!("{field} IS NULL"));
            }
        }
    }

    let where_sql = if fragments.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", fragments.join(" AND "))
    };
    Ok((where_sql, params))
}

impl Store for SqliteStore {
    fn find(&self, entity: &str, filter: &Filter) -> Result<Vec<Record>> {
        check_identifier(entity)?;
        let (where_sql, params) = render_filter(filter)?;
        // Stable ordering keeps resolution deterministic across runs.
        let sql = format!("SELECT * FROM {entity}{where_sql} ORDER BY id");
        debug!(entity, sql = %sql, "store find");

        let mut stmt = self.conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut fields = FieldValues::new();
            for (idx, name) in column_names.iter().enumerate() {
                fields.insert(name.clone(), from_sql_value(row.get_ref(idx)?)?);
            }
            let id = fields
                .get("id")
                .and_then(Value::as_id_string)
                .ok_or_else(|| {
                    Error::Store(format!("entity {entity} has no usable id column"))
                })?;
            records.push(Record {
                entity: entity.to_string(),
                id,
                fields,
            });
        }
        Ok(records)
    }

    fn create(&self, entity: &str, values: &FieldValues) -> Result<String> {
        check_identifier(entity)?;
        for field in values.keys() {
            check_identifier(field)?;
        }

        let columns: Vec<&str> = values.keys().map(String::as_str).collect();
        let marks = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {entity} ({}) VALUES ({marks})",
            columns.join(", ")
        );
        let params: Vec<rusqlite::types::Value> = values.values().map(to_sql_value).collect();

        self.conn.execute(&sql, params_from_iter(params))?;
        Ok(self.conn.last_insert_rowid().to_string())
    }

    fn delete_by_filter(&self, entity: &str, filter: &Filter) -> Result<usize> {
        check_identifier(entity)?;
        let (where_sql, params) = render_filter(filter)?;
        let sql = format!("DELETE FROM {entity}{where_sql}");
        debug!(entity, sql = %sql, "store delete");
        let count = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(count)
    }

    fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
