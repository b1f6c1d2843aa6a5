//! Test fixtures and database helpers.
//!
//! Provides a local SQLite database with a `todos` table, a matching
//! [`LogServer`], row builders and polling helpers for async tests.

use crate::server::LogServer;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shapesync_core::{DatabaseAdapter, SqliteBackend};
use shapesync_engine::{
    ApplyConfig, ApplyPipeline, MessageBatch, RetryConfig, ShapeStream, ShapeStreamConfig,
    DEFAULT_OFFSET_TABLE,
};
use shapesync_protocol::{ColumnInfo, Row, Schema, ShapeDefinition};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Name of the fixture table.
pub const TODOS: &str = "todos";

/// DDL of the local fixture table.
pub const TODOS_DDL: &str =
    "CREATE TABLE IF NOT EXISTS todos (id INTEGER PRIMARY KEY, title TEXT NOT NULL, done INTEGER)";

/// Installs a `tracing` subscriber for tests.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Builds a fixture row.
pub fn todo(id: i64, title: &str) -> Row {
    row(json!({"id": id, "title": title, "done": false}))
}

/// Converts a JSON object literal into a row.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn row(value: Value) -> Row {
    value
        .as_object()
        .cloned()
        .expect("row literal must be a JSON object")
}

/// Schema the fixture server announces for `todos`.
pub fn todos_schema() -> Schema {
    Schema::new()
        .with_column("id", ColumnInfo::new("int4").primary_key(0))
        .with_column("title", ColumnInfo::new("text"))
        .with_column("done", ColumnInfo::new("bool"))
}

/// A log server for the `todos` table.
pub fn todos_server() -> Arc<LogServer> {
    Arc::new(LogServer::new(TODOS, "id", todos_schema()).with_live_timeout(Duration::from_millis(50)))
}

/// Stream configuration for `todos` with fast retries.
pub fn todos_stream_config() -> ShapeStreamConfig {
    ShapeStreamConfig::new("http://shapes.test/v1", ShapeDefinition::new(TODOS)).with_retry(
        RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(2))
            .with_max_delay(Duration::from_millis(20)),
    )
}

/// A stream over `server`.
pub fn todos_stream(server: &Arc<LogServer>) -> ShapeStream {
    ShapeStream::new(todos_stream_config(), Arc::clone(server) as _)
}

/// A local database with automatic cleanup.
pub struct TestDatabase {
    /// The coordinator over the database.
    pub db: DatabaseAdapter,
    _temp_dir: TempDir,
}

impl TestDatabase {
    /// Creates a file-backed database holding an empty `todos` table.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend = SqliteBackend::open(temp_dir.path().join("local.db"))
            .expect("Failed to open SQLite database");
        let db = DatabaseAdapter::new(backend);
        db.run(TODOS_DDL).await.expect("Failed to create todos table");

        Self {
            db,
            _temp_dir: temp_dir,
        }
    }

    /// An apply pipeline into `todos` that also stores checkpoints.
    pub async fn pipeline(&self) -> ApplyPipeline {
        let pipeline = ApplyPipeline::new(
            self.db.clone(),
            ApplyConfig::new(TODOS, ["id"]).with_offset_table(DEFAULT_OFFSET_TABLE, TODOS),
        );
        pipeline
            .ensure_offset_table()
            .await
            .expect("Failed to create offset table");
        pipeline
    }

    /// Titles in `todos`, ordered by id.
    pub async fn titles(&self) -> Vec<String> {
        self.db
            .query("SELECT title FROM todos ORDER BY id")
            .await
            .expect("Failed to query todos")
            .into_iter()
            .filter_map(|r| r.get("title").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Number of rows in `todos`.
    pub async fn count(&self) -> usize {
        self.titles().await.len()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = DatabaseAdapter;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Records every batch delivered to a stream.
pub fn record_batches(stream: &ShapeStream) -> Arc<Mutex<Vec<MessageBatch>>> {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    stream.subscribe_fn(move |batch| {
        sink.lock().push(batch.clone());
        Ok(())
    });
    batches
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within five seconds.
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    eventually_async(|| {
        let holds = condition();
        async move { holds }
    })
    .await
}

/// Async form of [`eventually`].
pub async fn eventually_async<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached within 5s");
}
