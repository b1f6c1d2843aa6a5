//! Coordinator configuration.

use crate::queue::Priority;
use std::time::Duration;

/// Configuration for a [`DatabaseAdapter`](crate::DatabaseAdapter).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Priority used by operations that do not name one.
    pub default_priority: Priority,

    /// Waiting longer than this for the lock logs a warning.
    pub slow_lock_warning: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_priority: Priority::Normal,
            slow_lock_warning: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default priority.
    #[must_use]
    pub const fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Sets the slow-lock warning threshold.
    #[must_use]
    pub const fn with_slow_lock_warning(mut self, threshold: Duration) -> Self {
        self.slow_lock_warning = threshold;
        self
    }
}
