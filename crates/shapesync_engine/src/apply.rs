//! Applies stream batches to a local table through the coordinator.
//!
//! Every batch becomes one interactive transaction at the configured
//! priority (high by default):
//!
//! - insert and update become upserts of the full row keyed by the
//!   primary key
//! - delete removes the row by primary key
//! - must-refetch empties the table
//! - with an offset table configured, the batch checkpoint is written last
//!
//! If any statement fails the whole batch rolls back, the checkpoint does
//! not move and the stream stops with the error.

use crate::config::ApplyConfig;
use crate::error::{SyncError, SyncResult};
use crate::offset_store::{clear_statement, create_table_statement, quote_ident, save_statement};
use crate::stream::{MessageBatch, StreamSubscriber};
use async_trait::async_trait;
use shapesync_core::{DatabaseAdapter, RunResult, Statement};
use shapesync_protocol::{ChangeMessage, Message, Operation};

/// Writes batches into a local table.
#[derive(Debug, Clone)]
pub struct ApplyPipeline {
    db: DatabaseAdapter,
    config: ApplyConfig,
}

impl ApplyPipeline {
    /// Creates a pipeline writing through `db`.
    pub fn new(db: DatabaseAdapter, config: ApplyConfig) -> Self {
        Self { db, config }
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    /// Creates the offset table if one is configured.
    pub async fn ensure_offset_table(&self) -> SyncResult<()> {
        if let Some(table) = &self.config.offset_table {
            self.db
                .run_with_priority(self.config.priority, create_table_statement(table))
                .await?;
        }
        Ok(())
    }

    /// Translates a batch into the statements of its transaction.
    pub fn plan(&self, batch: &MessageBatch) -> SyncResult<Vec<Statement>> {
        let mut statements = Vec::with_capacity(batch.len() + 1);

        for message in &batch.messages {
            match message {
                Message::Change(change) => statements.push(self.change_statement(change)?),
                message if message.is_must_refetch() => {
                    // Everything before the reset is discarded with the table.
                    statements.clear();
                    statements.push(Statement::new(format!(
                        "DELETE FROM {}",
                        quote_ident(&self.config.table)
                    )));
                }
                Message::Control(_) => {}
            }
        }

        if let Some(table) = &self.config.offset_table {
            let key = &self.config.shape_key;
            statements.push(match &batch.handle {
                Some(handle) => save_statement(table, key, handle, &batch.offset),
                None => clear_statement(table, key),
            });
        }

        Ok(statements)
    }

    /// Applies a batch in one transaction.
    pub async fn apply(&self, batch: &MessageBatch) -> SyncResult<RunResult> {
        let statements = self.plan(batch)?;
        if statements.is_empty() {
            return Ok(RunResult::default());
        }

        let count = statements.len();
        let result = self
            .db
            .transaction_with_priority(self.config.priority, move |tx| {
                let mut total = RunResult::default();
                for stmt in statements {
                    total = total + tx.run(stmt)?;
                }
                tx.set_result(total)
            })
            .await?;

        tracing::debug!(
            table = %self.config.table,
            statements = count,
            rows = result.rows_affected,
            "applied batch"
        );
        Ok(result)
    }

    fn change_statement(&self, change: &ChangeMessage) -> SyncResult<Statement> {
        self.require_key(change)?;
        match change.operation() {
            Operation::Insert | Operation::Update => Ok(self.upsert(change)),
            Operation::Delete => Ok(self.delete(change)),
        }
    }

    fn is_key(&self, column: &str) -> bool {
        self.config.primary_key.iter().any(|pk| pk == column)
    }

    fn key_predicate(&self) -> String {
        self.config
            .primary_key
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn key_args<'a>(&'a self, change: &'a ChangeMessage) -> impl Iterator<Item = serde_json::Value> + 'a {
        self.config
            .primary_key
            .iter()
            .filter_map(move |c| change.value.get(c).cloned())
    }

    fn upsert(&self, change: &ChangeMessage) -> Statement {
        let table = quote_ident(&self.config.table);
        let columns: Vec<String> = change.value.keys().map(|c| quote_ident(c)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let conflict: Vec<String> = self.config.primary_key.iter().map(|c| quote_ident(c)).collect();

        let assignments: Vec<String> = change
            .value
            .keys()
            .filter(|c| !self.is_key(c))
            .map(|c| {
                let c = quote_ident(c);
                format!("{c} = excluded.{c}")
            })
            .collect();

        let action = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT ({}) {action}",
            columns.join(", "),
            conflict.join(", ")
        );
        Statement::with_args(sql, change.value.values().cloned())
    }

    fn delete(&self, change: &ChangeMessage) -> Statement {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(&self.config.table),
            self.key_predicate()
        );
        Statement::with_args(sql, self.key_args(change))
    }

    fn require_key(&self, change: &ChangeMessage) -> SyncResult<()> {
        if self.config.primary_key.is_empty() {
            return Err(SyncError::invalid_change(&change.key, "no primary key configured"));
        }
        for column in &self.config.primary_key {
            match change.value.get(column) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(SyncError::invalid_change(
                        &change.key,
                        format!("missing primary key column {column}"),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StreamSubscriber for ApplyPipeline {
    async fn on_messages(&self, batch: &MessageBatch) -> SyncResult<()> {
        self.apply(batch).await.map(|_| ())
    }

    async fn on_error(&self, error: &SyncError) {
        tracing::warn!(table = %self.config.table, %error, "apply pipeline detached after stream error");
    }
}
