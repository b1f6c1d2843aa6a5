//! # ShapeSync Core
//!
//! Single-writer coordination for an embedded database.
//!
//! This crate provides:
//! - `PriorityQueue`, a static-priority FIFO dispatcher
//! - `PriorityMutex`, an async lock that hands ownership to the
//!   highest-priority waiter
//! - `DatabaseAdapter`, the transaction coordinator that serializes every
//!   statement, batch and interactive transaction against one connection
//! - `DatabaseBackend` and a SQLite implementation
//! - `SyncTracer`, the injected telemetry hook
//!
//! ## Example
//!
//! ```rust,ignore
//! use shapesync_core::{DatabaseAdapter, Priority, Statement};
//!
//! let db = DatabaseAdapter::open_in_memory()?;
//! db.run("CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT)").await?;
//! db.run_with_priority(
//!     Priority::High,
//!     Statement::new("INSERT INTO notes VALUES (?, ?)").bind("n1").bind("hello"),
//! )
//! .await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod backend;
mod config;
mod error;
mod mutex;
mod queue;
mod statement;
mod tracer;

pub use adapter::{DatabaseAdapter, DatabaseOps, Transaction, UncoordinatedAdapter};
pub use backend::{DatabaseBackend, SqliteBackend};
pub use config::CoordinatorConfig;
pub use error::{DbError, DbResult, LockError, LockResult};
pub use mutex::{OwnerId, PriorityMutex, PriorityMutexGuard};
pub use queue::{Priority, PriorityQueue};
pub use statement::{Row, RunResult, Statement};
pub use tracer::{LogTracer, NoopTracer, SyncTracer};
