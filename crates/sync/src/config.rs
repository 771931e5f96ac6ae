//! Sync configuration.

use std::time::Duration;

/// Configuration for block import and sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Heights imported per batch. Block maps of a batch are fetched
    /// together and its blocks are saved in height order.
    pub batch_limit: u64,

    /// States or operations buffered before they are written into the
    /// block write database.
    pub database_batch_limit: usize,

    /// Maximum number of item fetches running at once.
    pub max_parallel_fetches: usize,

    /// Timeout for one block map or item fetch.
    pub fetch_timeout: Duration,

    /// Retries of a failed fetch before the import gives up.
    pub max_retries_per_block: usize,

    /// Wait between fetch retries.
    pub retry_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_limit: 3,
            database_batch_limit: 333,
            max_parallel_fetches: 4,
            fetch_timeout: Duration::from_secs(5),
            max_retries_per_block: 3,
            retry_interval: Duration::from_millis(300),
        }
    }
}

impl SyncConfig {
    /// Create a config with a custom import batch size.
    pub fn with_batch_limit(batch_limit: u64) -> Self {
        Self {
            batch_limit: batch_limit.max(1),
            ..Default::default()
        }
    }

    pub fn with_database_batch_limit(mut self, limit: usize) -> Self {
        self.database_batch_limit = limit.max(1);
        self
    }

    pub fn with_max_parallel_fetches(mut self, n: usize) -> Self {
        self.max_parallel_fetches = n.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: usize, interval: Duration) -> Self {
        self.max_retries_per_block = retries;
        self.retry_interval = interval;
        self
    }
}
