use std::time::Duration;

use alloy::primitives::Bytes;
use backon::{ConstantBuilder, Retryable};
use futures::{StreamExt, TryStreamExt, stream};

use crate::{
    ClientError, Error,
    client::{ChainClient, ConnectionPool},
    types::Receipt,
};

/// Default cap on receipt lookups running at the same time.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 100;
/// Default number of retries per receipt lookup.
pub const DEFAULT_RECEIPT_RETRIES: usize = 5;
/// Default delay between two attempts of the same receipt lookup.
pub const DEFAULT_RECEIPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retrieves the receipts of a block, in transaction order.
///
/// When the chain client can return every receipt of a block in one call that call is used.
/// Otherwise each transaction receipt is looked up separately, at most
/// `max_concurrent_fetches` at a time, each lookup with its own bounded retry budget. The first
/// lookup that runs out of retries fails the whole fetch.
#[derive(Debug)]
pub struct ReceiptFetcher<C: ChainClient> {
    pool: ConnectionPool<C>,
    max_concurrent_fetches: usize,
    retries: usize,
    retry_delay: Duration,
}

impl<C: ChainClient> Clone for ReceiptFetcher<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            max_concurrent_fetches: self.max_concurrent_fetches,
            retries: self.retries,
            retry_delay: self.retry_delay,
        }
    }
}

impl<C: ChainClient> ReceiptFetcher<C> {
    #[must_use]
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self {
            pool,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            retries: DEFAULT_RECEIPT_RETRIES,
            retry_delay: DEFAULT_RECEIPT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn max_concurrent_fetches(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches;
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent_fetches == 0 {
            return Err(Error::InvalidConfig("max concurrent fetches"));
        }
        Ok(())
    }

    /// Fetches all receipts of the block described by `header`.
    ///
    /// # Errors
    ///
    /// Returns the last error of the first lookup that exhausted its retries.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub async fn fetch(&self, header: &C::Header) -> Result<Vec<Receipt>, ClientError> {
        let pool = self.pool.clone();
        let header = header.clone();

        if pool.capabilities().block_receipts {
            return with_retries(self.backoff(), move || {
                let pool = pool.clone();
                let header = header.clone();
                async move {
                    pool.call(move |client| async move { client.block_receipts(&header).await })
                        .await
                }
            })
            .await;
        }

        let hashes = with_retries(self.backoff(), move || {
            let pool = pool.clone();
            let header = header.clone();
            async move {
                pool.call(move |client| async move { client.transaction_hashes(&header).await })
                    .await
            }
        })
        .await?;
        self.fetch_receipts(&hashes).await
    }

    /// Fetches the receipts of `hashes` one by one, returning them in the order of `hashes`.
    ///
    /// # Errors
    ///
    /// Returns the last error of the first lookup that exhausted its retries; receipts fetched
    /// so far are discarded.
    pub async fn fetch_receipts(&self, hashes: &[Bytes]) -> Result<Vec<Receipt>, ClientError> {
        let lookups: Vec<_> = hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| self.lookup(index, hash.clone()))
            .collect();

        let mut fetched: Vec<(usize, Receipt)> = stream::iter(lookups)
            .buffer_unordered(self.max_concurrent_fetches.max(1))
            .try_collect()
            .await?;
        fetched.sort_unstable_by_key(|(index, _)| *index);

        debug!(receipts = fetched.len(), "Fetched transaction receipts");
        Ok(fetched.into_iter().map(|(_, receipt)| receipt).collect())
    }

    /// Lookup of the `index`th receipt of a block, owning everything it needs.
    fn lookup(
        &self,
        index: usize,
        hash: Bytes,
    ) -> impl Future<Output = Result<(usize, Receipt), ClientError>> + Send + 'static {
        let pool = self.pool.clone();
        let backoff = self.backoff();
        async move {
            let receipt = with_retries(backoff, move || {
                let pool = pool.clone();
                let hash = hash.clone();
                async move {
                    pool.call(move |client| async move { client.transaction_receipt(&hash).await })
                        .await
                }
            })
            .await?;
            Ok((index, receipt))
        }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default().with_delay(self.retry_delay).with_max_times(self.retries)
    }
}

async fn with_retries<T, F, Fut>(backoff: ConstantBuilder, operation: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    operation
        .retry(backoff)
        .when(|err: &ClientError| !matches!(err, ClientError::Unsupported(_)))
        .notify(|err: &ClientError, delay: Duration| {
            warn!(error = %err, retry_in_ms = delay.as_millis(), "Receipt lookup failed, retrying");
        })
        .sleep(tokio::time::sleep)
        .await
}
