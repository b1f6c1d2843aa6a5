//! SQL statements and result rows.

use serde_json::{Map, Value};

/// A result row: column name to value.
pub type Row = Map<String, Value>;

/// One SQL statement with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text using `?` placeholders.
    pub sql: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

impl Statement {
    /// Creates a statement without arguments.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Creates a statement with arguments.
    pub fn with_args(sql: impl Into<String>, args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            sql: sql.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn bind(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Rows changed by the statement (or statements).
    pub rows_affected: u64,
}

impl RunResult {
    /// Creates a result.
    pub fn new(rows_affected: u64) -> Self {
        Self { rows_affected }
    }
}

impl std::ops::Add for RunResult {
    type Output = RunResult;

    fn add(self, rhs: RunResult) -> RunResult {
        RunResult::new(self.rows_affected + rhs.rows_affected)
    }
}
