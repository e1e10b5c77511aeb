//! Storage backend contract
//!
//! The engine only ever talks to storage through [`Backend`]: a SQL-capable
//! handle offering `execute(sql, params)` plus explicit transaction
//! boundaries. [`SqliteBackend`] is the bundled implementation over rusqlite
//! (WAL mode when backed by a file).

use crate::error::{EngineError, Result};
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A single SQL value, used both for parameters and result columns
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One result row
pub type Row = Vec<Value>;

/// Rows returned by a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Rows changed by a non-query statement
    pub rows_affected: usize,
}

impl QueryResult {
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// SQL storage the engine runs on
///
/// Implementations must give serializable isolation between `begin` and
/// `commit`; the engine never opens concurrent write transactions on one
/// handle.
pub trait Backend: Send + Sync {
    /// Execute one statement with positional (`?1`, `?2`, ...) parameters
    fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}

/// rusqlite-backed [`Backend`]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::StorageTransaction("connection mutex poisoned".to_string()))
    }
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(i) => rusqlite::types::Value::Integer(*i),
        Value::Real(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

impl Backend for SqliteBackend {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let bound = rusqlite::params_from_iter(params.iter().map(to_sql_value));

        let column_count = stmt.column_count();
        if column_count == 0 {
            let rows_affected = stmt.execute(bound)?;
            return Ok(QueryResult {
                rows: Vec::new(),
                rows_affected,
            });
        }

        let mut rows = stmt.query(bound)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(from_sql_ref(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(QueryResult {
            rows: out,
            rows_affected: 0,
        })
    }

    fn begin(&self) -> Result<()> {
        self.conn()?.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn()?.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn()?.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────
// Column accessors
// ─────────────────────────────────────────────────────

fn column<'r>(row: &'r [Value], idx: usize, name: &str) -> Result<&'r Value> {
    row.get(idx).ok_or_else(|| {
        EngineError::StorageTransaction(format!("result row is missing column {idx} ({name})"))
    })
}

pub(crate) fn text_at(row: &[Value], idx: usize, name: &str) -> Result<String> {
    match column(row, idx, name)? {
        Value::Text(s) => Ok(s.clone()),
        other => Err(EngineError::StorageTransaction(format!(
            "column {name}: expected text, got {other:?}"
        ))),
    }
}

pub(crate) fn opt_text_at(row: &[Value], idx: usize, name: &str) -> Result<Option<String>> {
    match column(row, idx, name)? {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s.clone())),
        other => Err(EngineError::StorageTransaction(format!(
            "column {name}: expected nullable text, got {other:?}"
        ))),
    }
}

pub(crate) fn int_at(row: &[Value], idx: usize, name: &str) -> Result<i64> {
    match column(row, idx, name)? {
        Value::Integer(i) => Ok(*i),
        other => Err(EngineError::StorageTransaction(format!(
            "column {name}: expected integer, got {other:?}"
        ))),
    }
}

pub(crate) fn opt_blob_at(row: &[Value], idx: usize, name: &str) -> Result<Option<Vec<u8>>> {
    match column(row, idx, name)? {
        Value::Null => Ok(None),
        Value::Blob(b) => Ok(Some(b.clone())),
        Value::Text(s) => Ok(Some(s.as_bytes().to_vec())),
        other => Err(EngineError::StorageTransaction(format!(
            "column {name}: expected blob, got {other:?}"
        ))),
    }
}
