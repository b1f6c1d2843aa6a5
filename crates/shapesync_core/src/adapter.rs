//! Transaction coordinator.
//!
//! [`DatabaseAdapter`] owns the single embedded connection and serializes
//! every unit of work through one [`PriorityMutex`]. Work that must run as a
//! group borrows an [`UncoordinatedAdapter`] from
//! [`DatabaseAdapter::run_exclusively`]; that adapter bypasses the mutex and
//! stops working once the exclusive section ends.
//!
//! ## Example
//!
//! ```ignore
//! let db = DatabaseAdapter::open_in_memory()?;
//! db.run("CREATE TABLE todos (id TEXT PRIMARY KEY, title TEXT)").await?;
//!
//! let count = db
//!     .transaction(|tx| {
//!         tx.run(Statement::new("INSERT INTO todos VALUES ('a', 'write docs')"))?;
//!         let rows = tx.query("SELECT count(*) AS n FROM todos")?;
//!         tx.set_result(rows[0]["n"].clone())
//!     })
//!     .await?;
//! ```

use crate::backend::{DatabaseBackend, SqliteBackend};
use crate::config::CoordinatorConfig;
use crate::error::{DbError, DbResult};
use crate::mutex::{PriorityMutex, PriorityMutexGuard};
use crate::queue::Priority;
use crate::statement::{Row, RunResult, Statement};
use crate::tracer::{NoopTracer, SyncTracer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

type SharedBackend = Arc<Mutex<Box<dyn DatabaseBackend>>>;

/// Operations shared by the coordinated and uncoordinated adapters.
#[async_trait]
pub trait DatabaseOps: Send + Sync {
    /// Executes one write.
    async fn run(&self, stmt: Statement) -> DbResult<RunResult>;

    /// Executes one statement and returns its rows.
    async fn query(&self, stmt: Statement) -> DbResult<Vec<Row>>;

    /// Executes `stmts` atomically and returns the summed row counts.
    async fn run_in_transaction(&self, stmts: Vec<Statement>) -> DbResult<RunResult>;
}

/// Coordinated access to one embedded database connection.
///
/// Cloning yields another handle to the same connection and lock.
#[derive(Clone)]
pub struct DatabaseAdapter {
    backend: SharedBackend,
    mutex: PriorityMutex,
    config: CoordinatorConfig,
    tracer: Arc<dyn SyncTracer>,
}

impl DatabaseAdapter {
    /// Creates a coordinator over `backend` with default configuration.
    pub fn new(backend: impl DatabaseBackend + 'static) -> Self {
        Self::with_config(backend, CoordinatorConfig::default())
    }

    /// Creates a coordinator with explicit configuration.
    pub fn with_config(backend: impl DatabaseBackend + 'static, config: CoordinatorConfig) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Box::new(backend))),
            mutex: PriorityMutex::standard(),
            config,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Creates a coordinator over a fresh in-memory SQLite database.
    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::new(SqliteBackend::open_in_memory()?))
    }

    /// Replaces the tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn SyncTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the lock every operation goes through.
    pub fn mutex(&self) -> &PriorityMutex {
        &self.mutex
    }

    /// Executes one write at the default priority.
    pub async fn run(&self, stmt: impl Into<Statement>) -> DbResult<RunResult> {
        self.run_with_priority(self.config.default_priority, stmt).await
    }

    /// Executes one write at `priority`.
    pub async fn run_with_priority(
        &self,
        priority: Priority,
        stmt: impl Into<Statement>,
    ) -> DbResult<RunResult> {
        let stmt = stmt.into();
        let _guard = self.lock(priority).await?;
        let result = self.backend.lock().execute(&stmt);
        result
    }

    /// Executes one statement at the default priority and returns its rows.
    ///
    /// Nothing stops the statement from writing.
    pub async fn query(&self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        self.query_with_priority(self.config.default_priority, stmt).await
    }

    /// Executes one statement at `priority` and returns its rows.
    pub async fn query_with_priority(
        &self,
        priority: Priority,
        stmt: impl Into<Statement>,
    ) -> DbResult<Vec<Row>> {
        let stmt = stmt.into();
        let _guard = self.lock(priority).await?;
        let rows = self.backend.lock().query(&stmt);
        rows
    }

    /// Executes `stmts` atomically at the default priority.
    pub async fn run_in_transaction(&self, stmts: Vec<Statement>) -> DbResult<RunResult> {
        self.run_in_transaction_with_priority(self.config.default_priority, stmts)
            .await
    }

    /// Executes `stmts` atomically at `priority`.
    pub async fn run_in_transaction_with_priority(
        &self,
        priority: Priority,
        stmts: Vec<Statement>,
    ) -> DbResult<RunResult> {
        let _guard = self.lock(priority).await?;
        execute_batch(&self.backend, self.tracer.as_ref(), &stmts)
    }

    /// Runs an interactive transaction at the default priority.
    ///
    /// `f` must call [`Transaction::set_result`] exactly once. The
    /// transaction commits only if `f` returns `Ok`, every statement it
    /// issued succeeded (even ones whose errors `f` ignored) and a result
    /// was set.
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> DbResult<()> + Send,
        T: Send,
    {
        self.transaction_with_priority(self.config.default_priority, f)
            .await
    }

    /// Runs an interactive transaction at `priority`.
    pub async fn transaction_with_priority<T, F>(&self, priority: Priority, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> DbResult<()> + Send,
        T: Send,
    {
        let _guard = self.lock(priority).await?;
        run_transaction(&self.backend, self.tracer.as_ref(), f)
    }

    /// Holds the lock for the whole of `f`, at the default priority.
    ///
    /// `f` receives an [`UncoordinatedAdapter`] that talks to the connection
    /// directly. The adapter expires when this call returns; later use fails
    /// with [`DbError::CapabilityExpired`].
    pub async fn run_exclusively<F, Fut, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(UncoordinatedAdapter) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        self.run_exclusively_with_priority(self.config.default_priority, f)
            .await
    }

    /// Holds the lock for the whole of `f`, at `priority`.
    pub async fn run_exclusively_with_priority<F, Fut, T>(
        &self,
        priority: Priority,
        f: F,
    ) -> DbResult<T>
    where
        F: FnOnce(UncoordinatedAdapter) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let _guard = self.lock(priority).await?;
        let active = Arc::new(AtomicBool::new(true));
        let _expiry = Expiry(Arc::clone(&active));

        let adapter = UncoordinatedAdapter {
            backend: Arc::clone(&self.backend),
            tracer: Arc::clone(&self.tracer),
            active,
        };
        f(adapter).await
    }

    async fn lock(&self, priority: Priority) -> DbResult<PriorityMutexGuard> {
        let started = Instant::now();
        let guard = self.mutex.acquire(&priority).await?;
        let waited = started.elapsed();

        if waited >= self.config.slow_lock_warning {
            tracing::warn!(
                priority = priority.as_str(),
                waited_ms = waited.as_millis() as u64,
                "slow coordinator lock acquisition"
            );
        }
        self.tracer.lock_acquired(priority.as_str(), waited);
        Ok(guard)
    }
}

impl std::fmt::Debug for DatabaseAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseAdapter")
            .field("mutex", &self.mutex)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DatabaseOps for DatabaseAdapter {
    async fn run(&self, stmt: Statement) -> DbResult<RunResult> {
        DatabaseAdapter::run(self, stmt).await
    }

    async fn query(&self, stmt: Statement) -> DbResult<Vec<Row>> {
        DatabaseAdapter::query(self, stmt).await
    }

    async fn run_in_transaction(&self, stmts: Vec<Statement>) -> DbResult<RunResult> {
        DatabaseAdapter::run_in_transaction(self, stmts).await
    }
}

/// Direct access to the connection inside an exclusive section.
///
/// Only [`DatabaseAdapter::run_exclusively`] can create one.
#[derive(Clone)]
pub struct UncoordinatedAdapter {
    backend: SharedBackend,
    tracer: Arc<dyn SyncTracer>,
    active: Arc<AtomicBool>,
}

impl UncoordinatedAdapter {
    /// Returns false once the exclusive section has ended.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn check(&self) -> DbResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DbError::CapabilityExpired)
        }
    }

    /// Executes one write.
    pub async fn run(&self, stmt: impl Into<Statement>) -> DbResult<RunResult> {
        self.check()?;
        let stmt = stmt.into();
        let result = self.backend.lock().execute(&stmt);
        result
    }

    /// Executes one statement and returns its rows.
    pub async fn query(&self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        self.check()?;
        let stmt = stmt.into();
        let rows = self.backend.lock().query(&stmt);
        rows
    }

    /// Executes `stmts` atomically.
    pub async fn run_in_transaction(&self, stmts: Vec<Statement>) -> DbResult<RunResult> {
        self.check()?;
        execute_batch(&self.backend, self.tracer.as_ref(), &stmts)
    }

    /// Runs an interactive transaction; see [`DatabaseAdapter::transaction`].
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> DbResult<()> + Send,
        T: Send,
    {
        self.check()?;
        run_transaction(&self.backend, self.tracer.as_ref(), f)
    }
}

impl std::fmt::Debug for UncoordinatedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UncoordinatedAdapter")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DatabaseOps for UncoordinatedAdapter {
    async fn run(&self, stmt: Statement) -> DbResult<RunResult> {
        UncoordinatedAdapter::run(self, stmt).await
    }

    async fn query(&self, stmt: Statement) -> DbResult<Vec<Row>> {
        UncoordinatedAdapter::query(self, stmt).await
    }

    async fn run_in_transaction(&self, stmts: Vec<Statement>) -> DbResult<RunResult> {
        UncoordinatedAdapter::run_in_transaction(self, stmts).await
    }
}

struct Expiry(Arc<AtomicBool>);

impl Drop for Expiry {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn execute_batch(
    backend: &SharedBackend,
    tracer: &dyn SyncTracer,
    stmts: &[Statement],
) -> DbResult<RunResult> {
    let started = Instant::now();
    let result = backend.lock().execute_batch(stmts);
    if let Err(err) = &result {
        tracing::debug!(error = %err, statements = stmts.len(), "batch rolled back");
    }
    tracer.transaction_finished(result.is_ok(), started.elapsed());
    result
}

fn run_transaction<T, F>(backend: &SharedBackend, tracer: &dyn SyncTracer, f: F) -> DbResult<T>
where
    F: FnOnce(&mut Transaction<'_, T>) -> DbResult<()>,
{
    let started = Instant::now();
    let mut conn = backend.lock();
    let mut tx = Transaction::begin(&mut **conn)?;
    let outcome = f(&mut tx);
    let result = tx.finish(outcome);

    if let Err(err) = &result {
        tracing::debug!(error = %err, "transaction rolled back");
    }
    tracer.transaction_finished(result.is_ok(), started.elapsed());
    result
}

/// Handle passed to an interactive transaction body.
///
/// The first failing statement poisons the transaction: later statements
/// are refused and the transaction rolls back no matter what the body
/// returns. Dropping an unfinished transaction (for example while
/// unwinding from a panic) rolls it back.
pub struct Transaction<'a, T> {
    backend: &'a mut dyn DatabaseBackend,
    result: Option<T>,
    failure: Option<DbError>,
    finished: bool,
}

impl<'a, T> Transaction<'a, T> {
    fn begin(backend: &'a mut dyn DatabaseBackend) -> DbResult<Self> {
        backend.begin()?;
        Ok(Self {
            backend,
            result: None,
            failure: None,
            finished: false,
        })
    }

    /// Executes one write.
    pub fn run(&mut self, stmt: impl Into<Statement>) -> DbResult<RunResult> {
        let stmt = stmt.into();
        self.poisoned()?;
        let result = self.backend.execute(&stmt);
        self.record(result)
    }

    /// Executes one statement and returns its rows.
    pub fn query(&mut self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        let stmt = stmt.into();
        self.poisoned()?;
        let rows = self.backend.query(&stmt);
        self.record(rows)
    }

    /// Sets the value the transaction resolves to.
    ///
    /// A second call fails with [`DbError::ResultAlreadySet`] and aborts the
    /// transaction.
    pub fn set_result(&mut self, value: T) -> DbResult<()> {
        if self.result.is_some() {
            return self.record(Err(DbError::ResultAlreadySet));
        }
        self.result = Some(value);
        Ok(())
    }

    /// Returns true once any statement has failed.
    pub fn is_poisoned(&self) -> bool {
        self.failure.is_some()
    }

    fn poisoned(&self) -> DbResult<()> {
        match &self.failure {
            Some(first) => Err(DbError::aborted(format!("earlier statement failed: {first}"))),
            None => Ok(()),
        }
    }

    fn record<R>(&mut self, result: DbResult<R>) -> DbResult<R> {
        if let Err(err) = &result {
            if self.failure.is_none() {
                self.failure = Some(err.clone());
            }
        }
        result
    }

    fn finish(mut self, outcome: DbResult<()>) -> DbResult<T> {
        self.finished = true;

        let verdict = match (outcome, self.failure.take(), self.result.take()) {
            (Err(err), _, _) => Err(err),
            (Ok(()), Some(failure), _) => Err(failure),
            (Ok(()), None, None) => Err(DbError::MissingResult),
            (Ok(()), None, Some(value)) => Ok(value),
        };

        match verdict {
            Ok(value) => match self.backend.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.rollback_quietly();
                    Err(err)
                }
            },
            Err(err) => {
                self.rollback_quietly();
                Err(err)
            }
        }
    }

    fn rollback_quietly(&mut self) {
        if let Err(err) = self.backend.rollback() {
            tracing::warn!(error = %err, "rollback failed");
        }
    }
}

impl<T> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback_quietly();
        }
    }
}
