//! Embedded database backends.
//!
//! A backend owns one connection and executes statements synchronously. The
//! coordinator is responsible for serializing access; backends do no locking
//! of their own.

mod sqlite;

pub use sqlite::SqliteBackend;

use crate::error::DbResult;
use crate::statement::{Row, RunResult, Statement};

/// A single embedded database connection.
pub trait DatabaseBackend: Send {
    /// Executes a write and returns the number of changed rows.
    fn execute(&mut self, stmt: &Statement) -> DbResult<RunResult>;

    /// Executes a statement and returns every result row.
    fn query(&mut self, stmt: &Statement) -> DbResult<Vec<Row>>;

    /// Opens a transaction.
    fn begin(&mut self) -> DbResult<()>;

    /// Commits the open transaction.
    fn commit(&mut self) -> DbResult<()>;

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> DbResult<()>;

    /// Executes `stmts` atomically.
    ///
    /// Any failure rolls the whole batch back and is returned unchanged.
    fn execute_batch(&mut self, stmts: &[Statement]) -> DbResult<RunResult> {
        self.begin()?;
        let mut total = RunResult::default();
        for stmt in stmts {
            match self.execute(stmt) {
                Ok(result) => total = total + result,
                Err(err) => {
                    if let Err(rollback_err) = self.rollback() {
                        tracing::warn!(error = %rollback_err, "rollback after failed batch failed");
                    }
                    return Err(err);
                }
            }
        }
        self.commit()?;
        Ok(total)
    }
}
