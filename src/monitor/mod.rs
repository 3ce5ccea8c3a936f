//! Per-chain block monitoring.
//!
//! A [`BlockMonitor`] walks a chain one height at a time and turns every block into a
//! [`BlockNotification`]. It either polls the chain for the next height or, when the chain
//! client can push new heads, follows a subscription and catches up on any heights the
//! subscription skipped.
//!
//! # Retries
//!
//! Transport failures are retried in place according to the monitor's [`RetryPolicy`]; heights
//! are never skipped. A block that has not been produced yet is not a failure, the monitor just
//! waits `block_retry_interval` and asks again. Every successfully delivered block restores the
//! full retry budget.
//!
//! A push subscription that fails or ends is fatal.
//!
//! # Cancellation
//!
//! All waits (retry sleeps, backoff sleeps, remote calls and subscription reads) race against the
//! caller's [`CancellationToken`], so a stop request is observed immediately.

use std::fmt::Display;

use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::{
    ClientError, Error,
    client::{BlockHeader, ChainClient, ConnectionPool},
    fetcher::ReceiptFetcher,
    types::{BlockNotification, MonitorResult, TryStream},
};

mod builder;
mod retry;

pub use builder::{
    BlockMonitorBuilder, DEFAULT_BLOCK_RETRY_INTERVAL, DEFAULT_BLOCK_RETRY_LIMIT,
    DEFAULT_CONNECTION_SLEEP_INTERVAL, DEFAULT_CONNECTION_SLEEP_RETRY_LIMIT,
    DEFAULT_STREAM_BUFFER_CAPACITY,
};
pub use retry::RetryPolicy;

use retry::RetryBudget;

/// How a [`BlockMonitor`] learns about new blocks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MonitorMode {
    /// Ask for every height in turn.
    Poll,
    /// Follow the chain's new-heads subscription.
    Push,
    /// Push when the chain client supports subscriptions, poll otherwise.
    #[default]
    Auto,
}

/// Block monitor built by [`BlockMonitorBuilder`].
#[derive(Debug)]
pub struct BlockMonitor<C: ChainClient> {
    pub(crate) pool: ConnectionPool<C>,
    pub(crate) fetcher: ReceiptFetcher<C>,
    pub(crate) mode: MonitorMode,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) fetch_receipts: bool,
    pub(crate) buffer_capacity: usize,
}

impl<C: ChainClient> Clone for BlockMonitor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            fetcher: self.fetcher.clone(),
            mode: self.mode,
            retry_policy: self.retry_policy,
            fetch_receipts: self.fetch_receipts,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

impl<C: ChainClient> BlockMonitor<C> {
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// The mode the monitor runs in, with [`MonitorMode::Auto`] resolved.
    #[must_use]
    pub fn mode(&self) -> MonitorMode {
        match self.mode {
            MonitorMode::Auto if self.pool.capabilities().new_heads_subscription => {
                MonitorMode::Push
            }
            MonitorMode::Auto => MonitorMode::Poll,
            mode => mode,
        }
    }

    /// Monitors the chain from `start`, calling `on_block` once per height in order.
    ///
    /// Errors returned by `on_block` are logged and do not stop the monitor. Returns `Ok(())`
    /// once `cancel` fires.
    ///
    /// # Errors
    ///
    /// * [`Error::RetriesExhausted`] - a height kept failing through the whole retry policy.
    /// * [`Error::Subscription`] - the new-heads subscription could not be opened or failed.
    /// * [`Error::SubscriptionClosed`] - the new-heads subscription ended.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub async fn monitor<F, Fut, E>(
        &self,
        start: u64,
        on_block: F,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        F: FnMut(BlockNotification<C::Header>) -> Fut + Send,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display,
    {
        self.walker(start, cancel.clone(), Callback(on_block)).run().await
    }

    /// Streams blocks from `start` on.
    ///
    /// The monitor runs in a background task until `cancel` fires or the returned stream is
    /// dropped. A fatal error is yielded as the last item.
    #[must_use]
    pub fn stream_from(
        &self,
        start: u64,
        cancel: CancellationToken,
    ) -> ReceiverStream<MonitorResult<C::Header>> {
        let (blocks_sender, blocks_receiver) = mpsc::channel(self.buffer_capacity);
        let walker = self.walker(start, cancel, blocks_sender.clone());

        tokio::spawn(async move {
            let result = tokio::select! {
                result = walker.run() => result,
                () = blocks_sender.closed() => Ok(()),
            };
            if let Err(err) = result {
                _ = blocks_sender.try_stream(Err(err)).await;
            }
            debug!(start = start, "Block stream ended");
        });

        ReceiverStream::new(blocks_receiver)
    }

    fn walker<S>(&self, start: u64, cancel: CancellationToken, sink: S) -> Walker<C, S>
    where
        S: BlockSink<C::Header>,
    {
        Walker {
            monitor: self.clone(),
            cancel,
            sink,
            current: start,
            budget: RetryBudget::new(self.retry_policy),
        }
    }

    async fn block_at(
        &self,
        height: u64,
    ) -> Result<Option<BlockNotification<C::Header>>, ClientError> {
        let header = self
            .pool
            .call(move |client| async move { client.header_by_height(height).await })
            .await?;
        match header {
            Some(header) if header.height() == height => self.notification(header).await.map(Some),
            Some(header) => {
                warn!(
                    height = height,
                    reported = header.height(),
                    "Endpoint returned the header of another height"
                );
                Err(ClientError::Decode(format!(
                    "requested header {height}, got header {}",
                    header.height()
                )))
            }
            None => Ok(None),
        }
    }

    async fn notification(
        &self,
        header: C::Header,
    ) -> Result<BlockNotification<C::Header>, ClientError> {
        let receipts =
            if self.fetch_receipts { Some(self.fetcher.fetch(&header).await?) } else { None };
        Ok(BlockNotification { height: header.height(), hash: header.hash(), header, receipts })
    }
}

/// Where a monitor run delivers its blocks.
trait BlockSink<H> {
    /// Returns `false` when no more blocks are wanted.
    fn deliver(&mut self, block: BlockNotification<H>) -> impl Future<Output = bool> + Send;
}

struct Callback<F>(F);

impl<H, F, Fut, E> BlockSink<H> for Callback<F>
where
    H: Send,
    F: FnMut(BlockNotification<H>) -> Fut + Send,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Display,
{
    async fn deliver(&mut self, block: BlockNotification<H>) -> bool {
        let height = block.height;
        if let Err(err) = (self.0)(block).await {
            error!(height = height, error = %err, "Block callback failed");
        }
        true
    }
}

impl<H: std::fmt::Debug + Send> BlockSink<H> for mpsc::Sender<MonitorResult<H>> {
    async fn deliver(&mut self, block: BlockNotification<H>) -> bool {
        self.try_stream(Ok(block)).await
    }
}

/// State of one monitor run.
struct Walker<C: ChainClient, S> {
    monitor: BlockMonitor<C>,
    cancel: CancellationToken,
    sink: S,
    current: u64,
    budget: RetryBudget,
}

impl<C: ChainClient, S: BlockSink<C::Header>> Walker<C, S> {
    async fn run(mut self) -> Result<(), Error> {
        let mode = self.monitor.mode();
        info!(start = self.current, mode = ?mode, "Starting block monitor");
        match mode {
            MonitorMode::Push => self.push().await,
            _ => self.poll().await,
        }
    }

    async fn poll(&mut self) -> Result<(), Error> {
        loop {
            let Some(block) = self.next_block(None).await? else {
                return Ok(());
            };
            if !self.deliver(block).await {
                return Ok(());
            }
        }
    }

    async fn push(&mut self) -> Result<(), Error> {
        let pool = self.monitor.pool.clone();
        let subscribe = pool.call(|client| async move { client.subscribe_new_heads().await });
        let mut heads = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            heads = subscribe => heads.map_err(|err| {
                error!(error = %err, "Failed to subscribe to new heads");
                Error::Subscription(err)
            })?,
        };

        loop {
            let head = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                head = heads.next() => head,
            };
            let head = match head {
                Some(Ok(head)) => head,
                Some(Err(err)) => {
                    error!(height = self.current, error = %err, "New heads subscription failed");
                    return Err(Error::Subscription(err));
                }
                None => {
                    error!(height = self.current, "New heads subscription closed");
                    return Err(Error::SubscriptionClosed);
                }
            };

            if head.height() < self.current {
                trace!(head = head.height(), current = self.current, "Skipping stale head");
                continue;
            }
            if head.height() > self.current {
                debug!(head = head.height(), current = self.current, "Catching up to pushed head");
            }
            while self.current < head.height() {
                let Some(block) = self.next_block(None).await? else {
                    return Ok(());
                };
                if !self.deliver(block).await {
                    return Ok(());
                }
            }
            let Some(block) = self.next_block(Some(head)).await? else {
                return Ok(());
            };
            if !self.deliver(block).await {
                return Ok(());
            }
        }
    }

    async fn deliver(&mut self, block: BlockNotification<C::Header>) -> bool {
        debug!(height = block.height, "Delivering block");
        let keep_going = self.sink.deliver(block).await;
        self.current += 1;
        keep_going
    }

    /// Fetches the block at the current height, retrying per the retry policy.
    ///
    /// `known` is the current height's header when it is already at hand. Returns `None` once
    /// cancelled.
    async fn next_block(
        &mut self,
        known: Option<C::Header>,
    ) -> Result<Option<BlockNotification<C::Header>>, Error> {
        let height = self.current;
        loop {
            let monitor = self.monitor.clone();
            let header = known.clone();
            let attempt = async move {
                match header {
                    Some(header) => monitor.notification(header).await.map(Some),
                    None => monitor.block_at(height).await,
                }
            };
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(None),
                result = attempt => result,
            };

            let wait = match result {
                Ok(Some(block)) => {
                    self.budget.reset();
                    return Ok(Some(block));
                }
                Ok(None) => {
                    trace!(height = height, "Block not produced yet");
                    self.monitor.retry_policy.block_retry_interval
                }
                Err(err) => self.budget.on_failure(height, err)?,
            };
            if !self.sleep(wait).await {
                return Ok(None);
            }
        }
    }

    /// Returns `false` if cancelled before `duration` elapsed.
    async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        assert_closed, assert_next, assert_next_heights,
        client::{Capabilities, ConnectionPoolBuilder},
        test_utils::{MockChainClient, MockHeader},
    };

    fn monitor(client: &MockChainClient, builder: BlockMonitorBuilder) -> BlockMonitor<MockChainClient> {
        let pool = ConnectionPoolBuilder::new(vec![client.clone()])
            .call_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        builder.build(pool).unwrap()
    }

    fn fast() -> BlockMonitorBuilder {
        BlockMonitorBuilder::new()
            .mode(MonitorMode::Poll)
            .block_retry_interval(Duration::from_millis(100))
            .block_retry_limit(3)
            .connection_sleep_interval(Duration::from_secs(10))
            .connection_sleep_retry_limit(2)
    }

    fn push_capable(client: &MockChainClient) {
        client.set_capabilities(Capabilities { new_heads_subscription: true, ..Capabilities::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn polls_heights_in_order() {
        let client = MockChainClient::new();
        client.add_empty_blocks(10..=14);
        let cancel = CancellationToken::new();

        let mut stream = monitor(&client, fast()).stream_from(10, cancel.clone());

        assert_next_heights!(stream, 10..=14);
        cancel.cancel();
        assert_closed!(stream);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_unproduced_blocks_without_spending_retries() {
        let client = MockChainClient::new();
        client.add_empty_blocks(1..=2);
        let cancel = CancellationToken::new();
        let mut stream = monitor(&client, fast()).stream_from(1, cancel.clone());
        assert_next_heights!(stream, 1..=2);

        // far more polls than the whole retry policy allows
        tokio::time::sleep(Duration::from_secs(60)).await;
        client.add_block(3, vec![]);

        assert_next!(stream, height = 3);
        assert!(client.header_calls() > fast().retry_policy.max_attempts());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_is_fatal_after_exact_attempt_count() {
        let client = MockChainClient::new();
        client.add_empty_blocks(1..=3);
        client.fail_headers_forever();
        let monitor = monitor(&client, fast());

        let result = monitor.monitor(1, |_| async { Ok::<_, Error>(()) }, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::RetriesExhausted { height: 1, .. })));
        // 3 attempts per phase, initial phase plus 2 backoff cycles
        assert_eq!(client.header_calls(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn misnumbered_headers_spend_the_retry_budget() {
        let client = MockChainClient::new();
        client.misnumber_header(1, 0);
        let monitor = monitor(&client, fast());

        let result = monitor.monitor(1, |_| async { Ok::<_, Error>(()) }, &CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { height: 1, source: ClientError::Decode(_) })
        ));
        assert_eq!(client.header_calls(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_backoff() {
        let client = MockChainClient::new();
        client.add_empty_blocks(5..=6);
        client.fail_headers(4);
        let cancel = CancellationToken::new();

        let on_block = {
            let cancel = cancel.clone();
            move |block: BlockNotification<MockHeader>| {
                if block.height == 6 {
                    cancel.cancel();
                }
                async { Ok::<_, Error>(()) }
            }
        };
        let started = tokio::time::Instant::now();
        monitor(&client, fast()).monitor(5, on_block, &cancel).await.unwrap();

        // three failures, a backoff, one more failure, then heights 5 and 6
        assert_eq!(client.header_calls(), 6);
        // 100ms after each failure, plus the 10s backoff
        assert!(started.elapsed() >= Duration::from_millis(10_400));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_returns_immediately() {
        let client = MockChainClient::new();
        client.fail_headers_forever();
        let cancel = CancellationToken::new();
        let monitor = monitor(&client, fast().connection_sleep_interval(Duration::from_secs(3600)));

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.monitor(1, |_| async { Ok::<_, Error>(()) }, &cancel).await })
        };

        // the third failure starts the hour-long backoff sleep
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.header_calls(), 3);

        let stopped_at = tokio::time::Instant::now();
        cancel.cancel();
        let result = task.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(tokio::time::Instant::now(), stopped_at);
    }

    #[tokio::test(start_paused = true)]
    async fn both_entry_points_run_as_spawned_tasks() {
        let client = MockChainClient::new();
        client.add_empty_blocks(1..=3);
        let monitor = monitor(&client, fast());
        let cancel = CancellationToken::new();

        let (heights_tx, mut heights_rx) = mpsc::unbounded_channel();
        let callback_task = {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let on_block = move |block: BlockNotification<MockHeader>| {
                    let sent = heights_tx.send(block.height);
                    async move { sent }
                };
                monitor.monitor(1, on_block, &cancel).await
            })
        };
        let stream_task = {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut stream = monitor.stream_from(1, cancel);
                let mut heights = vec![];
                while let Some(block) = stream.next().await {
                    heights.push(block?.height);
                    if heights.len() == 3 {
                        break;
                    }
                }
                Ok::<_, Error>(heights)
            })
        };

        assert_eq!(stream_task.await.unwrap().unwrap(), vec![1, 2, 3]);
        for height in 1..=3 {
            assert_eq!(heights_rx.recv().await, Some(height));
        }
        cancel.cancel();
        assert!(callback_task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn callback_errors_do_not_stop_the_monitor() {
        let client = MockChainClient::new();
        client.add_empty_blocks(1..=4);
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(vec![]));

        let on_block = {
            let seen = Arc::clone(&seen);
            let cancel = cancel.clone();
            move |block: BlockNotification<_>| {
                let seen = Arc::clone(&seen);
                let cancel = cancel.clone();
                async move {
                    let mut seen = seen.lock().unwrap();
                    seen.push(block.height);
                    if seen.len() == 4 {
                        cancel.cancel();
                    }
                    if block.height % 2 == 0 { Err("rejected") } else { Ok(()) }
                }
            }
        };

        monitor(&client, fast()).monitor(1, on_block, &cancel).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_carry_receipts() {
        let client = MockChainClient::new();
        client.add_block(8, vec![crate::test_utils::receipt(vec![])]);
        let cancel = CancellationToken::new();

        let mut stream = monitor(&client, fast()).stream_from(8, cancel.clone());
        let block = stream.next().await.unwrap().unwrap();
        assert_eq!(block.receipts.map(|r| r.len()), Some(1));

        let mut stream = monitor(&client, fast().fetch_receipts(false)).stream_from(8, cancel.clone());
        let block = stream.next().await.unwrap().unwrap();
        assert!(block.receipts.is_none());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn push_catches_up_on_skipped_heights() {
        let client = MockChainClient::new();
        push_capable(&client);
        client.add_empty_blocks(1..=6);
        let cancel = CancellationToken::new();
        let monitor = monitor(&client, fast().mode(MonitorMode::Auto));
        assert_eq!(monitor.mode(), MonitorMode::Push);

        let mut stream = monitor.stream_from(3, cancel.clone());
        client.push_head(2);
        client.push_head(5);
        client.push_head(6);

        assert_next_heights!(stream, 3..=6);
        assert_eq!(client.subscribe_calls(), 1);
        // 3 and 4 are fetched, 5 and 6 come with the pushed heads
        assert_eq!(client.header_calls(), 2);
        cancel.cancel();
        assert_closed!(stream);
    }

    #[tokio::test(start_paused = true)]
    async fn push_subscription_failure_is_fatal() {
        let client = MockChainClient::new();
        push_capable(&client);
        client.add_empty_blocks(1..=1);
        let cancel = CancellationToken::new();

        let mut stream = monitor(&client, fast().mode(MonitorMode::Push)).stream_from(1, cancel);
        client.push_head(1);
        client.push_head_error(ClientError::Transport("socket closed".to_owned()));

        assert_next!(stream, height = 1);
        assert_next!(stream, Err(Error::Subscription(ClientError::Timeout)));
        assert_closed!(stream);
    }

    #[tokio::test(start_paused = true)]
    async fn push_subscription_end_is_fatal() {
        let client = MockChainClient::new();
        push_capable(&client);
        let cancel = CancellationToken::new();

        let mut stream = monitor(&client, fast().mode(MonitorMode::Push)).stream_from(1, cancel);
        client.close_heads();

        assert_next!(stream, Err(Error::SubscriptionClosed));
        assert_closed!(stream);
    }

    #[tokio::test(start_paused = true)]
    async fn push_without_subscription_support_fails() {
        let client = MockChainClient::new();
        let mut stream =
            monitor(&client, fast().mode(MonitorMode::Push)).stream_from(1, CancellationToken::new());

        assert_next!(stream, Err(Error::Subscription(ClientError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_stops_the_monitor() {
        let client = MockChainClient::new();
        let stream = monitor(&client, fast()).stream_from(1, CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let calls = client.header_calls();

        drop(stream);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(client.header_calls() <= calls + 1);
    }
}
