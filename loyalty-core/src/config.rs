//! Configuration for the accrual reconciler

use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period between ticks
    pub poll_interval: Duration,

    /// Maximum orders examined per tick
    pub batch_size: usize,

    /// Upper bound on a single `Retry-After` sleep
    pub max_retry_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl ReconcilerConfig {
    /// Override the tick period
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Override the back-off cap
    pub fn with_max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }
}
