//! Checkpoint persistence.
//!
//! A checkpoint is the `(handle, offset)` pair a stream needs to resume.
//! Offsets are only meaningful under the handle they were issued with, so
//! the two are always stored and loaded together.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use shapesync_core::{DatabaseAdapter, DbResult, Priority, Statement};
use shapesync_protocol::{Handle, Offset};
use std::collections::HashMap;

/// Default table used for persisted checkpoints.
pub const DEFAULT_OFFSET_TABLE: &str = "_shape_offsets";

/// A resumable stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Log incarnation, unknown before the first response.
    pub handle: Option<Handle>,
    /// Position within that incarnation.
    pub offset: Offset,
}

impl Checkpoint {
    /// Creates a checkpoint.
    pub fn new(handle: Option<Handle>, offset: Offset) -> Self {
        Self { handle, offset }
    }

    /// The position before any message.
    pub fn initial() -> Self {
        Self::new(None, Offset::before_all())
    }

    /// Returns true if this is the position before any message.
    pub fn is_initial(&self) -> bool {
        self.handle.is_none() && self.offset.is_before_all()
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::initial()
    }
}

/// Stores checkpoints by shape key.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Loads the checkpoint stored for `shape_key`.
    async fn load(&self, shape_key: &str) -> SyncResult<Option<Checkpoint>>;

    /// Stores a checkpoint, replacing any previous one.
    async fn save(&self, shape_key: &str, handle: &Handle, offset: &Offset) -> SyncResult<()>;

    /// Removes the checkpoint for `shape_key`.
    async fn clear(&self, shape_key: &str) -> SyncResult<()>;
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    entries: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryOffsetStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, shape_key: &str) -> SyncResult<Option<Checkpoint>> {
        Ok(self.entries.read().get(shape_key).cloned())
    }

    async fn save(&self, shape_key: &str, handle: &Handle, offset: &Offset) -> SyncResult<()> {
        self.entries.write().insert(
            shape_key.to_string(),
            Checkpoint::new(Some(handle.clone()), offset.clone()),
        );
        Ok(())
    }

    async fn clear(&self, shape_key: &str) -> SyncResult<()> {
        self.entries.write().remove(shape_key);
        Ok(())
    }
}

/// Checkpoint store kept in a table of the coordinated database.
///
/// The table has one row per shape key:
/// `(shape_key TEXT PRIMARY KEY, handle TEXT NOT NULL, "offset" TEXT NOT NULL)`.
#[derive(Debug, Clone)]
pub struct CoordinatorOffsetStore {
    db: DatabaseAdapter,
    table: String,
    priority: Priority,
}

impl CoordinatorOffsetStore {
    /// Creates a store over [`DEFAULT_OFFSET_TABLE`].
    pub fn new(db: DatabaseAdapter) -> Self {
        Self::with_table(db, DEFAULT_OFFSET_TABLE)
    }

    /// Creates a store over `table`.
    pub fn with_table(db: DatabaseAdapter, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
            priority: Priority::High,
        }
    }

    /// Creates the table if it does not exist.
    pub async fn ensure_table(&self) -> DbResult<()> {
        self.db
            .run_with_priority(self.priority, create_table_statement(&self.table))
            .await?;
        Ok(())
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl OffsetStore for CoordinatorOffsetStore {
    async fn load(&self, shape_key: &str) -> SyncResult<Option<Checkpoint>> {
        let stmt = Statement::new(format!(
            "SELECT handle, \"offset\" FROM {} WHERE shape_key = ?",
            quote_ident(&self.table)
        ))
        .bind(shape_key);
        let rows = self.db.query_with_priority(self.priority, stmt).await?;

        Ok(rows.first().and_then(|row| {
            let handle = row.get("handle").and_then(Value::as_str)?;
            let offset = row.get("offset").and_then(Value::as_str)?;
            Some(Checkpoint::new(Some(Handle::new(handle)), Offset::new(offset)))
        }))
    }

    async fn save(&self, shape_key: &str, handle: &Handle, offset: &Offset) -> SyncResult<()> {
        self.db
            .run_with_priority(
                self.priority,
                save_statement(&self.table, shape_key, handle, offset),
            )
            .await?;
        Ok(())
    }

    async fn clear(&self, shape_key: &str) -> SyncResult<()> {
        self.db
            .run_with_priority(self.priority, clear_statement(&self.table, shape_key))
            .await?;
        Ok(())
    }
}

/// Quotes an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn create_table_statement(table: &str) -> Statement {
    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} (shape_key TEXT PRIMARY KEY, handle TEXT NOT NULL, \"offset\" TEXT NOT NULL)",
        quote_ident(table)
    ))
}

pub(crate) fn save_statement(table: &str, shape_key: &str, handle: &Handle, offset: &Offset) -> Statement {
    Statement::new(format!(
        "INSERT INTO {} (shape_key, handle, \"offset\") VALUES (?, ?, ?) \
         ON CONFLICT (shape_key) DO UPDATE SET handle = excluded.handle, \"offset\" = excluded.\"offset\"",
        quote_ident(table)
    ))
    .bind(shape_key)
    .bind(handle.as_str())
    .bind(offset.as_str())
}

pub(crate) fn clear_statement(table: &str, shape_key: &str) -> Statement {
    Statement::new(format!("DELETE FROM {} WHERE shape_key = ?", quote_ident(table))).bind(shape_key)
}
