use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use super::{batching::BatchId, items::ItemSource};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("rejected by endpoint: {0}")]
    Rejected(String),

    #[error("gave up after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("shutting down, last error: {0}")]
    ShuttingDown(String),

    #[error("not delivered before the shutdown grace period ran out")]
    Abandoned,
}

/// Items of one batch that will not be delivered.
#[derive(Debug)]
pub struct FailedItems {
    pub batch_id: BatchId,
    pub items: Vec<ItemSource>,
    pub reason: FailureReason,
}

/// Final destination of items whose delivery did not succeed.
///
/// The handler owns the items; dropping them releases their storage.
pub trait FailureHandler: Send + Sync {
    fn on_failure(&self, failed: FailedItems);
}

/// Records the loss and drops the items.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureHandler;

impl FailureHandler for LoggingFailureHandler {
    fn on_failure(&self, failed: FailedItems) {
        warn!(
            "dropping {} items of batch {}: {}",
            failed.items.len(),
            failed.batch_id,
            failed.reason
        );
    }
}

fn default_min_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

/// How often transiently failed items are put back into a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Redeliveries per item; 0 drops on the first failure.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff_ms = min.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// An item that has been part of `attempts` deliveries may go again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Delay before the `attempts`-th redelivery (1-based).
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let max = Duration::from_millis(self.max_backoff_ms);
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_backoff_ms))
            .with_max_delay(max)
            .with_max_times(attempts.max(1) as usize)
            .build()
            .nth(attempts.saturating_sub(1) as usize)
            .unwrap_or(max)
    }
}
