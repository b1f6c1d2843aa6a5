//! Injected telemetry hooks.

use std::time::Duration;

/// Observer of coordinator and stream activity.
///
/// Every method has an empty default so implementations only override what
/// they record.
pub trait SyncTracer: Send + Sync {
    /// A unit of work obtained the coordinator lock after `waited`.
    fn lock_acquired(&self, _priority: &str, _waited: Duration) {}

    /// A transaction finished; `committed` is false on rollback.
    fn transaction_finished(&self, _committed: bool, _elapsed: Duration) {}

    /// A shape request is about to be sent.
    fn fetch_started(&self, _url: &str) {}

    /// A shape response arrived.
    fn fetch_finished(&self, _status: u16, _messages: usize, _elapsed: Duration) {}

    /// The stream discarded its state and restarted from the beginning.
    fn stream_reset(&self, _reason: &str) {}

    /// A failed request will be retried after `delay`.
    fn retry_scheduled(&self, _attempt: u32, _delay: Duration) {}
}

/// Records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl SyncTracer for NoopTracer {}

/// Forwards every event to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl SyncTracer for LogTracer {
    fn lock_acquired(&self, priority: &str, waited: Duration) {
        tracing::debug!(priority, waited_ms = waited.as_millis() as u64, "lock acquired");
    }

    fn transaction_finished(&self, committed: bool, elapsed: Duration) {
        tracing::debug!(
            committed,
            elapsed_ms = elapsed.as_millis() as u64,
            "transaction finished"
        );
    }

    fn fetch_started(&self, url: &str) {
        tracing::debug!(url, "fetch started");
    }

    fn fetch_finished(&self, status: u16, messages: usize, elapsed: Duration) {
        tracing::debug!(
            status,
            messages,
            elapsed_ms = elapsed.as_millis() as u64,
            "fetch finished"
        );
    }

    fn stream_reset(&self, reason: &str) {
        tracing::debug!(reason, "stream reset");
    }

    fn retry_scheduled(&self, attempt: u32, delay: Duration) {
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
    }
}
