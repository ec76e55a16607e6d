//! rusqlite-backed adapter.

use crate::adapter::{DatabaseAdapter, Executor, Statement};
use crate::error::{AdapterError, AdapterResult, SatelliteResult};
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use satellite_protocol::{Row, SqlValue};
use std::path::Path;

/// A [`DatabaseAdapter`] over a single SQLite connection.
///
/// Foreign key enforcement is switched on when the connection opens.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> AdapterResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> AdapterResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Connection) -> AdapterResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Executor for SqliteAdapter {
    fn run(&self, statement: &Statement) -> AdapterResult<usize> {
        run_on(&self.conn.lock(), statement)
    }

    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>> {
        query_on(&self.conn.lock(), statement)
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Executor) -> SatelliteResult<()>,
    ) -> SatelliteResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AdapterError::from)?;
        // dropping `tx` on the error path rolls back
        f(&ConnectionExecutor(&tx))?;
        tx.commit().map_err(AdapterError::from)?;
        Ok(())
    }
}

struct ConnectionExecutor<'a>(&'a Connection);

impl Executor for ConnectionExecutor<'_> {
    fn run(&self, statement: &Statement) -> AdapterResult<usize> {
        run_on(self.0, statement)
    }

    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>> {
        query_on(self.0, statement)
    }
}

fn to_sql(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn run_on(conn: &Connection, statement: &Statement) -> AdapterResult<usize> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let args = statement.args.iter().map(to_sql);

    if stmt.column_count() > 0 {
        // statements returning rows (some pragmas) still count as runs
        let mut rows = stmt.query(params_from_iter(args))?;
        while rows.next()?.is_some() {}
        return Ok(0);
    }

    Ok(stmt.execute(params_from_iter(args))?)
}

fn query_on(conn: &Connection, statement: &Statement) -> AdapterResult<Vec<Row>> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params_from_iter(statement.args.iter().map(to_sql)))?;
    let mut result = Vec::new();
    while let Some(r) = rows.next()? {
        let mut row = Row::new();
        for (index, name) in columns.iter().enumerate() {
            row.insert(name.clone(), from_sql(r.get_ref(index)?));
        }
        result.push(row);
    }
    Ok(result)
}
