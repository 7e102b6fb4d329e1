//! Relational store abstraction and its SQLite implementation
//!
//! Every maintenance operation in this crate goes through [`RelationalStore`]
//! so it can be exercised against an in-memory database in tests and a file
//! on disk in the CLI.

use std::path::Path;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use sigbak_core::{SigbakError, SigbakResult};
use sigbak_frames::SqlParam;

pub(crate) fn store_err(e: rusqlite::Error) -> SigbakError {
    SigbakError::Store(e.to_string())
}

// ── Values ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<&SqlParam> for SqlValue {
    fn from(p: &SqlParam) -> Self {
        match p {
            SqlParam::Text(s) => SqlValue::Text(s.clone()),
            SqlParam::Integer(i) => SqlValue::Integer(*i),
            SqlParam::Double(d) => SqlValue::Real(*d),
            SqlParam::Blob(b) => SqlValue::Blob(b.clone()),
            SqlParam::Null => SqlValue::Null,
        }
    }
}

impl From<SqlValue> for SqlParam {
    fn from(v: SqlValue) -> Self {
        match v {
            SqlValue::Null => SqlParam::Null,
            SqlValue::Integer(i) => SqlParam::Integer(i),
            SqlValue::Real(d) => SqlParam::Double(d),
            SqlValue::Text(s) => SqlParam::Text(s),
            SqlValue::Blob(b) => SqlParam::Blob(b),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(d) => SqlValue::Real(d),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(i) => ValueRef::Integer(*i),
            SqlValue::Real(d) => ValueRef::Real(*d),
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

// ── Query results ───────────────────────────────────────────────────────

/// Rows returned by [`RelationalStore::query`], addressable by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResults {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl QueryResults {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> Option<&[SqlValue]> {
        self.rows.get(idx).map(Vec::as_slice)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[SqlValue]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    pub fn get_i64(&self, row: usize, column: &str) -> Option<i64> {
        self.value(row, column).and_then(SqlValue::as_i64)
    }

    pub fn get_str(&self, row: usize, column: &str) -> Option<&str> {
        self.value(row, column).and_then(SqlValue::as_str)
    }

    /// First column of the first row as an integer.
    pub fn scalar_i64(&self) -> Option<i64> {
        self.rows.first()?.first()?.as_i64()
    }
}

// ── Trait ───────────────────────────────────────────────────────────────

/// One row of `sqlite_master`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    pub kind: String,
    pub name: String,
    pub sql: Option<String>,
}

pub trait RelationalStore {
    /// Run a statement, returning the number of changed rows.
    fn exec(&self, sql: &str, params: &[SqlValue]) -> SigbakResult<usize>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> SigbakResult<QueryResults>;

    fn last_insert_rowid(&self) -> i64;

    /// Schema objects in creation order.
    fn schema(&self) -> SigbakResult<Vec<SchemaObject>> {
        let results = self.query(
            "SELECT type, name, sql FROM sqlite_master ORDER BY rowid",
            &[],
        )?;
        Ok(results
            .rows()
            .map(|row| SchemaObject {
                kind: row[0].as_str().unwrap_or_default().to_string(),
                name: row[1].as_str().unwrap_or_default().to_string(),
                sql: row[2].as_str().map(str::to_string),
            })
            .collect())
    }

    fn tables(&self) -> SigbakResult<Vec<String>> {
        Ok(self
            .schema()?
            .into_iter()
            .filter(|o| o.kind == "table")
            .map(|o| o.name)
            .collect())
    }

    fn contains_table(&self, table: &str) -> SigbakResult<bool> {
        let results = self.query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[table.into()],
        )?;
        Ok(!results.is_empty())
    }

    fn table_contains_column(&self, table: &str, column: &str) -> SigbakResult<bool> {
        let results = self.query(
            "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
            &[table.into(), column.into()],
        )?;
        Ok(!results.is_empty())
    }

    fn row_count(&self, table: &str) -> SigbakResult<i64> {
        let results = self.query(&format!("SELECT COUNT(*) FROM {table}"), &[])?;
        Ok(results.scalar_i64().unwrap_or(0))
    }
}

// ── SQLite ──────────────────────────────────────────────────────────────

pub struct SqliteStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteStore {
    pub fn in_memory() -> SigbakResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn open(path: impl AsRef<Path>) -> SigbakResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Write a compacted copy of the database to `path`, replacing any
    /// existing file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> SigbakResult<()> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let target = path.to_string_lossy().into_owned();
        self.conn
            .execute("VACUUM INTO ?1", [target])
            .map_err(store_err)?;
        tracing::debug!(path = %path.display(), "saved database");
        Ok(())
    }
}

impl RelationalStore for SqliteStore {
    fn exec(&self, sql: &str, params: &[SqlValue]) -> SigbakResult<usize> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(store_err)?;
        stmt.execute(params_from_iter(params.iter()))
            .map_err(store_err)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> SigbakResult<QueryResults> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(store_err)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query(params_from_iter(params.iter())).map_err(store_err)?;
        while let Some(row) = cursor.next().map_err(store_err)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from(row.get_ref(i).map_err(store_err)?));
            }
            rows.push(values);
        }
        Ok(QueryResults::new(columns, rows))
    }

    fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}
