use std::time::Duration;

use crate::{
    Error,
    client::{ChainClient, ConnectionPool},
    fetcher::{
        DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_RECEIPT_RETRIES, DEFAULT_RECEIPT_RETRY_DELAY,
        ReceiptFetcher,
    },
    monitor::{BlockMonitor, MonitorMode, RetryPolicy},
};

/// Default wait between two attempts at the same height.
pub const DEFAULT_BLOCK_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Default number of attempts at one height before backing off.
pub const DEFAULT_BLOCK_RETRY_LIMIT: usize = 5;
/// Default length of a backoff sleep.
pub const DEFAULT_CONNECTION_SLEEP_INTERVAL: Duration = Duration::from_secs(40);
/// Default number of backoff sleeps before the monitor gives up.
pub const DEFAULT_CONNECTION_SLEEP_RETRY_LIMIT: usize = 4;
/// Default capacity of the channel behind [`BlockMonitor::stream_from`].
///
/// One keeps at most one block in flight between the monitor and its consumer.
pub const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 1;

/// Builder/configuration for [`BlockMonitor`].
#[derive(Clone, Debug)]
pub struct BlockMonitorBuilder {
    pub mode: MonitorMode,
    pub retry_policy: RetryPolicy,
    /// Whether notifications carry the block's receipts.
    pub fetch_receipts: bool,
    pub max_concurrent_fetches: usize,
    pub receipt_retries: usize,
    pub receipt_retry_delay: Duration,
    pub buffer_capacity: usize,
}

impl Default for BlockMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMonitorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: MonitorMode::default(),
            retry_policy: RetryPolicy::default(),
            fetch_receipts: true,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            receipt_retries: DEFAULT_RECEIPT_RETRIES,
            receipt_retry_delay: DEFAULT_RECEIPT_RETRY_DELAY,
            buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the wait between two attempts at the same height.
    ///
    /// Also used as the polling interval while the next block has not been produced yet.
    #[must_use]
    pub fn block_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_policy.block_retry_interval = interval;
        self
    }

    /// Must be greater than 0.
    #[must_use]
    pub fn block_retry_limit(mut self, limit: usize) -> Self {
        self.retry_policy.block_retry_limit = limit;
        self
    }

    #[must_use]
    pub fn connection_sleep_interval(mut self, interval: Duration) -> Self {
        self.retry_policy.connection_sleep_interval = interval;
        self
    }

    /// Sets how many backoff sleeps are allowed before the monitor gives up. Zero means the
    /// monitor gives up as soon as the block retries are used up.
    #[must_use]
    pub fn connection_sleep_retry_limit(mut self, limit: usize) -> Self {
        self.retry_policy.connection_sleep_retry_limit = limit;
        self
    }

    #[must_use]
    pub fn fetch_receipts(mut self, fetch_receipts: bool) -> Self {
        self.fetch_receipts = fetch_receipts;
        self
    }

    /// Sets the cap on receipt lookups running at the same time.
    ///
    /// Must be greater than 0.
    #[must_use]
    pub fn max_concurrent_fetches(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches;
        self
    }

    #[must_use]
    pub fn receipt_retries(mut self, retries: usize) -> Self {
        self.receipt_retries = retries;
        self
    }

    #[must_use]
    pub fn receipt_retry_delay(mut self, delay: Duration) -> Self {
        self.receipt_retry_delay = delay;
        self
    }

    /// Sets the stream buffer capacity.
    ///
    /// Must be greater than 0.
    #[must_use]
    pub fn buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Builds a monitor on top of `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first setting that must be non-zero but is not.
    pub fn build<C: ChainClient>(self, pool: ConnectionPool<C>) -> Result<BlockMonitor<C>, Error> {
        if self.retry_policy.block_retry_limit == 0 {
            return Err(Error::InvalidConfig("block retry limit"));
        }
        if self.retry_policy.block_retry_interval.is_zero() {
            return Err(Error::InvalidConfig("block retry interval"));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::InvalidConfig("stream buffer capacity"));
        }

        let fetcher = ReceiptFetcher::new(pool.clone())
            .max_concurrent_fetches(self.max_concurrent_fetches)
            .retries(self.receipt_retries)
            .retry_delay(self.receipt_retry_delay);
        fetcher.validate()?;

        debug!(
            mode = ?self.mode,
            retry_policy = ?self.retry_policy,
            fetch_receipts = self.fetch_receipts,
            "Building block monitor"
        );

        Ok(BlockMonitor {
            pool,
            fetcher,
            mode: self.mode,
            retry_policy: self.retry_policy,
            fetch_receipts: self.fetch_receipts,
            buffer_capacity: self.buffer_capacity,
        })
    }
}
