//! Error types for ShapeSync core.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors raised by the priority queue and mutex.
///
/// Releasing a lock you do not own is deliberately not an error: it is a
/// silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The priority was not declared when the queue was built.
    #[error("unknown priority: {0}")]
    UnknownPriority(String),

    /// A queue needs at least one priority level.
    #[error("a priority queue needs at least one priority")]
    NoPriorities,

    /// The mutex went away while a waiter was still queued.
    #[error("mutex dropped while waiting for ownership")]
    Abandoned,
}

/// Errors raised by the transaction coordinator and database backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The embedded database rejected a statement.
    #[error("statement failed: {message} ({sql})")]
    Statement {
        /// SQL text of the failing statement.
        sql: String,
        /// Engine diagnostic.
        message: String,
    },

    /// The embedded database failed outside any single statement.
    #[error("database error: {0}")]
    Backend(String),

    /// A transaction was rolled back.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the abort.
        reason: String,
    },

    /// An interactive transaction finished without calling `set_result`.
    #[error("transaction finished without a result")]
    MissingResult,

    /// `set_result` was called more than once.
    #[error("transaction result already set")]
    ResultAlreadySet,

    /// An uncoordinated adapter was used after its exclusive section ended.
    #[error("exclusive section has already ended")]
    CapabilityExpired,

    /// Lock acquisition failed.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

impl DbError {
    /// Creates a statement failure.
    pub fn statement(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            sql: sql.into(),
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Returns true if the embedded database rejected a statement.
    pub fn is_statement_failure(&self) -> bool {
        matches!(self, DbError::Statement { .. })
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = DbError::statement("INSERT INTO t VALUES (1)", "UNIQUE constraint failed");
        assert!(err.to_string().contains("UNIQUE constraint failed"));
        assert!(err.to_string().contains("INSERT INTO t"));
        assert!(err.is_statement_failure());

        let err: DbError = LockError::UnknownPriority("Urgent".into()).into();
        assert_eq!(err.to_string(), "lock error: unknown priority: Urgent");
        assert!(!err.is_statement_failure());
    }
}
