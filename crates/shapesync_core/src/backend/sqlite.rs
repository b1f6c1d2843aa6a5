//! SQLite backend built on `rusqlite`.

use super::DatabaseBackend;
use crate::error::{DbError, DbResult};
use crate::statement::{Row, RunResult, Statement};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use std::path::Path;

/// A [`DatabaseBackend`] over one SQLite connection.
///
/// JSON arguments bind as follows: booleans as integers, numbers as integer
/// or real, strings as text, and arrays and objects as their JSON text.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Opens a private in-memory database.
    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        Ok(Self { conn })
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Returns true while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

impl DatabaseBackend for SqliteBackend {
    fn execute(&mut self, stmt: &Statement) -> DbResult<RunResult> {
        let fail = |e: rusqlite::Error| DbError::statement(&stmt.sql, e.to_string());
        let mut prepared = self.conn.prepare(&stmt.sql).map_err(fail)?;
        let changed = prepared
            .execute(params_from_iter(stmt.args.iter().map(to_sql)))
            .map_err(fail)?;
        Ok(RunResult::new(changed as u64))
    }

    fn query(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        let fail = |e: rusqlite::Error| DbError::statement(&stmt.sql, e.to_string());
        let mut prepared = self.conn.prepare(&stmt.sql).map_err(fail)?;
        let names: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        let mut rows = prepared
            .query(params_from_iter(stmt.args.iter().map(to_sql)))
            .map_err(fail)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(fail)? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(fail)?;
                record.insert(name.clone(), from_sql(value));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn begin(&mut self) -> DbResult<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> SqliteBackend {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.execute(&Statement::new(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, meta TEXT)",
        ))
        .unwrap();
        db
    }

    #[test]
    fn execute_and_query() {
        let mut db = backend();
        let result = db
            .execute(&Statement::with_args(
                "INSERT INTO items (id, name, meta) VALUES (?, ?, ?)",
                [json!(1), json!("a"), json!({"tags": ["x"]})],
            ))
            .unwrap();
        assert_eq!(result.rows_affected, 1);

        let rows = db
            .query(&Statement::new("SELECT id, name, meta FROM items"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("a"));
        assert_eq!(rows[0]["meta"], json!("{\"tags\":[\"x\"]}"));
    }

    #[test]
    fn value_mapping() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        let rows = db
            .query(&Statement::with_args(
                "SELECT ? AS b, ? AS f, ? AS n, x'0102' AS blob",
                [json!(true), json!(1.5), Value::Null],
            ))
            .unwrap();
        assert_eq!(rows[0]["b"], json!(1));
        assert_eq!(rows[0]["f"], json!(1.5));
        assert_eq!(rows[0]["n"], Value::Null);
        assert_eq!(rows[0]["blob"], json!([1, 2]));
    }

    #[test]
    fn statement_failure_carries_sql() {
        let mut db = backend();
        let err = db
            .execute(&Statement::new("INSERT INTO missing VALUES (1)"))
            .unwrap_err();
        match err {
            DbError::Statement { sql, .. } => assert!(sql.contains("missing")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn batch_rolls_back_on_failure() {
        let mut db = backend();
        let err = db
            .execute_batch(&[
                Statement::new("INSERT INTO items (id, name) VALUES (1, 'a')"),
                Statement::new("INSERT INTO items (id, name) VALUES (2, NULL)"),
            ])
            .unwrap_err();
        assert!(err.is_statement_failure());
        assert!(!db.in_transaction());

        let rows = db.query(&Statement::new("SELECT * FROM items")).unwrap();
        assert!(rows.is_empty());

        let total = db
            .execute_batch(&[
                Statement::new("INSERT INTO items (id, name) VALUES (1, 'a')"),
                Statement::new("INSERT INTO items (id, name) VALUES (2, 'b')"),
            ])
            .unwrap();
        assert_eq!(total.rows_affected, 2);
    }

    #[test]
    fn file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let mut db = SqliteBackend::open(&path).unwrap();
            db.execute(&Statement::new("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)"))
                .unwrap();
            db.execute(&Statement::new("INSERT INTO kv VALUES ('a', '1')"))
                .unwrap();
        }
        let mut db = SqliteBackend::open(&path).unwrap();
        let rows = db.query(&Statement::new("SELECT v FROM kv")).unwrap();
        assert_eq!(rows[0]["v"], json!("1"));
    }
}
