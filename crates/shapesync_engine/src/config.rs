//! Configuration for shape streams and the apply pipeline.

use crate::offset_store::Checkpoint;
use crate::signal::AbortSignal;
use rand::Rng;
use shapesync_core::{NoopTracer, Priority, SyncTracer};
use shapesync_protocol::{PgValueParser, ShapeDefinition, ValueParser};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`ShapeStream`](crate::ShapeStream).
#[derive(Clone)]
pub struct ShapeStreamConfig {
    /// Server base URL (e.g. `"https://sync.example.com/v1"`).
    pub base_url: String,
    /// The shape to follow.
    pub shape: ShapeDefinition,
    /// Where to resume from; `None` starts from the beginning.
    pub start: Option<Checkpoint>,
    /// Retry configuration for transient failures.
    pub retry: RetryConfig,
    /// Column value parser.
    pub parser: Arc<dyn ValueParser>,
    /// Telemetry hook.
    pub tracer: Arc<dyn SyncTracer>,
    /// External cancellation.
    pub abort: Option<AbortSignal>,
}

impl ShapeStreamConfig {
    /// Creates a configuration for `shape` served from `base_url`.
    pub fn new(base_url: impl Into<String>, shape: ShapeDefinition) -> Self {
        Self {
            base_url: base_url.into(),
            shape,
            start: None,
            retry: RetryConfig::default(),
            parser: Arc::new(PgValueParser),
            tracer: Arc::new(NoopTracer),
            abort: None,
        }
    }

    /// Resumes from a saved checkpoint.
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.start = Some(checkpoint);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the column value parser.
    pub fn with_parser(mut self, parser: Arc<dyn ValueParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Sets the tracer.
    pub fn with_tracer(mut self, tracer: Arc<dyn SyncTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets the abort signal.
    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }
}

impl fmt::Debug for ShapeStreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeStreamConfig")
            .field("base_url", &self.base_url)
            .field("shape", &self.shape)
            .field("start", &self.start)
            .field("retry", &self.retry)
            .field("abort", &self.abort)
            .finish_non_exhaustive()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per request, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for an [`ApplyPipeline`](crate::ApplyPipeline).
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Local table receiving the rows.
    pub table: String,
    /// Primary-key columns of the local table.
    pub primary_key: Vec<String>,
    /// Coordinator priority for apply transactions.
    pub priority: Priority,
    /// Table holding `(shape_key, handle, offset)` rows, written in the same
    /// transaction as each batch.
    pub offset_table: Option<String>,
    /// Key under which the checkpoint is stored.
    pub shape_key: String,
}

impl ApplyConfig {
    /// Creates a configuration for `table` keyed by `primary_key`.
    pub fn new<I, S>(table: impl Into<String>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        Self {
            shape_key: table.clone(),
            table,
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            priority: Priority::High,
            offset_table: None,
        }
    }

    /// Sets the apply priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Persists checkpoints into `table` under `shape_key`.
    pub fn with_offset_table(mut self, table: impl Into<String>, shape_key: impl Into<String>) -> Self {
        self.offset_table = Some(table.into());
        self.shape_key = shape_key.into();
        self
    }
}
