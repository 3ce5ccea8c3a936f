//! The receive loop.
//!
//! A [`Receiver`] drives a [`BlockMonitor`] from a starting height, extracts the receipt proofs
//! of every block and hands them to the relay callback, one block at a time. Block heights must
//! arrive in strict `+1` steps; anything else faults the loop.
//!
//! ```text
//! Idle -> Running -> Stopping -> Stopped
//!            \
//!             `---> Faulted
//! ```
//!
//! Both `Stopped` and `Faulted` are terminal. A faulted loop is not restarted; the owner recovers
//! its height and starts a new one.

use std::{fmt::Display, sync::Arc};

use alloy::primitives::Bytes;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    client::{ChainClient, LogDecoder},
    extractor::extract,
    monitor::BlockMonitor,
    types::{MonitorResult, ProofBatch, ReceiptProof},
};

mod builder;
mod handle;

pub use builder::ReceiverBuilder;
pub use handle::ReceiverHandle;

/// Lifecycle of a receive loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

impl LoopState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Faulted)
    }
}

/// What to do with blocks that carry no proofs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyBatchPolicy {
    /// Invoke the relay callback with an empty batch, so downstream height tracking advances.
    #[default]
    Deliver,
    /// Do not invoke the relay callback.
    Skip,
}

/// Progress of a receive loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    /// Height of the next block to deliver.
    pub next_height: u64,
    /// One past the highest event sequence delivered so far.
    ///
    /// Sequences are counted per destination link, so this is progress bookkeeping only; events
    /// are never filtered by it.
    pub next_sequence: u64,
}

impl Cursor {
    /// Height of the last delivered block, `None` when starting from genesis.
    #[must_use]
    pub fn last_delivered_height(&self) -> Option<u64> {
        self.next_height.checked_sub(1)
    }
}

/// A receive loop, ready to start.
#[derive(Debug)]
pub struct Receiver<C: ChainClient, D> {
    pub(crate) monitor: BlockMonitor<C>,
    pub(crate) decoder: Arc<D>,
    pub(crate) bridge_address: Bytes,
    pub(crate) empty_batch_policy: EmptyBatchPolicy,
}

impl<C: ChainClient, D: LogDecoder> Receiver<C, D> {
    #[must_use]
    pub fn bridge_address(&self) -> &Bytes {
        &self.bridge_address
    }

    /// Starts the loop at block `height`, expecting event sequences from `sequence` on.
    ///
    /// `on_proofs` is called once per block, in height order, and never concurrently with itself.
    /// An error from `on_proofs` faults the loop. `on_stop` runs exactly once when the loop ends,
    /// whatever the reason.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<P, Fut, E, S>(
        self,
        height: u64,
        sequence: u64,
        on_proofs: P,
        on_stop: S,
    ) -> ReceiverHandle
    where
        P: FnMut(ProofBatch) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display,
        S: FnOnce() + Send + 'static,
    {
        let cursor = Cursor { next_height: height, next_sequence: sequence };
        let state = Arc::new(watch::Sender::new(LoopState::Running));
        let (cursor_tx, cursor_rx) = watch::channel(cursor);
        let cancel = CancellationToken::new();

        info!(height = height, sequence = sequence, "Starting receive loop");

        let blocks = self.monitor.stream_from(height, cancel.child_token());

        let task = {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut shutdown =
                    Shutdown { on_stop: Some(on_stop), state, terminal: LoopState::Faulted };
                let result = self
                    .drive(blocks, cursor, &cursor_tx, &cancel, &shutdown.state, on_proofs)
                    .await;
                cancel.cancel();
                match &result {
                    Ok(()) => shutdown.terminal = LoopState::Stopped,
                    Err(err) => error!(error = %err, "Receive loop faulted"),
                }
                drop(shutdown);
                result
            })
        };

        ReceiverHandle { state, cursor: cursor_rx, cancel, task }
    }

    async fn drive<B, P, Fut, E>(
        &self,
        mut blocks: B,
        mut cursor: Cursor,
        cursor_tx: &watch::Sender<Cursor>,
        cancel: &CancellationToken,
        state: &watch::Sender<LoopState>,
        mut on_proofs: P,
    ) -> Result<(), Error>
    where
        B: Stream<Item = MonitorResult<C::Header>> + Unpin,
        P: FnMut(ProofBatch) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                block = blocks.next() => Some(block),
            };
            let block = match next {
                None => {
                    state.send_if_modified(|state| {
                        let running = *state == LoopState::Running;
                        if running {
                            *state = LoopState::Stopping;
                        }
                        running
                    });
                    return Ok(());
                }
                Some(None) => return Err(Error::MonitorClosed),
                Some(Some(Err(err))) => return Err(err),
                Some(Some(Ok(block))) => block,
            };

            if block.height != cursor.next_height {
                error!(
                    expected = cursor.next_height,
                    got = block.height,
                    "Non-monotonic block height"
                );
                return Err(Error::HeightMismatch { expected: cursor.next_height, got: block.height });
            }

            let proofs = extract(&block, &self.bridge_address, self.decoder.as_ref());
            let highest = highest_sequence(&proofs);

            if proofs.is_empty() && self.empty_batch_policy == EmptyBatchPolicy::Skip {
                trace!(height = block.height, "Skipping block without proofs");
            } else {
                debug!(height = block.height, proofs = proofs.len(), "Delivering proofs");
                let batch = ProofBatch { height: block.height, proofs };
                if let Err(err) = on_proofs(batch).await {
                    return Err(Error::Delivery { height: block.height, reason: err.to_string() });
                }
            }

            cursor.next_height += 1;
            if let Some(highest) = highest {
                cursor.next_sequence = cursor.next_sequence.max(highest.saturating_add(1));
            }
            cursor_tx.send_replace(cursor);
        }
    }
}

fn highest_sequence(proofs: &[ReceiptProof]) -> Option<u64> {
    proofs.iter().flat_map(|proof| proof.events.iter()).map(|event| event.sequence).max()
}

/// Runs the stop callback and publishes the terminal state when dropped.
struct Shutdown<S: FnOnce()> {
    on_stop: Option<S>,
    state: Arc<watch::Sender<LoopState>>,
    terminal: LoopState,
}

impl<S: FnOnce()> Drop for Shutdown<S> {
    fn drop(&mut self) {
        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
        self.state.send_replace(self.terminal);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        ConnectionPool,
        client::evm::{BmcMessageDecoder, encode_message_log},
        monitor::{BlockMonitorBuilder, MonitorMode},
        test_utils::{
            MockChainClient, MockDecoder, MockHeader, block_hash, bridge_log, foreign_log,
            receipt,
        },
        types::{BlockNotification, Event},
    };

    const BRIDGE: [u8; 20] = [0xaa; 20];

    fn receiver(
        client: &MockChainClient,
        policy: EmptyBatchPolicy,
    ) -> anyhow::Result<Receiver<MockChainClient, MockDecoder>> {
        let monitor = BlockMonitorBuilder::new()
            .mode(MonitorMode::Poll)
            .block_retry_interval(Duration::from_millis(100))
            .block_retry_limit(2)
            .connection_sleep_interval(Duration::from_secs(1))
            .connection_sleep_retry_limit(1)
            .build(ConnectionPool::new(vec![client.clone()])?)?;
        Ok(ReceiverBuilder::new(BRIDGE.to_vec())
            .empty_batch_policy(policy)
            .build(monitor, MockDecoder::default())?)
    }

    type Batches = mpsc::UnboundedReceiver<ProofBatch>;

    fn collect() -> (
        impl FnMut(ProofBatch) -> std::future::Ready<Result<(), &'static str>> + Send + 'static,
        Batches,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_proofs = move |batch| std::future::ready(tx.send(batch).map_err(|_| "closed"));
        (on_proofs, rx)
    }

    fn counted_stop() -> (impl FnOnce() + Send + 'static, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let on_stop = move || {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        (on_stop, stops)
    }

    async fn next_batch(batches: &mut Batches) -> anyhow::Result<ProofBatch> {
        tokio::time::timeout(Duration::from_secs(30), batches.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("proof channel closed"))
    }

    fn notification(height: u64) -> MonitorResult<MockHeader> {
        Ok(BlockNotification {
            height,
            hash: block_hash(height),
            header: MockHeader::new(height, vec![]),
            receipts: Some(vec![]),
        })
    }

    fn proof(index: usize, sequences: &[u64]) -> ReceiptProof {
        ReceiptProof {
            index,
            height: 1,
            events: sequences
                .iter()
                .map(|&sequence| Event { message: Bytes::new(), next: String::new(), sequence })
                .collect(),
        }
    }

    #[test]
    fn highest_sequence_spans_every_proof() {
        let proofs = vec![proof(0, &[3, 4]), proof(1, &[9]), proof(4, &[6, 7])];
        assert_eq!(highest_sequence(&proofs), Some(9));
        assert_eq!(highest_sequence(&[]), None);
        assert_eq!(highest_sequence(&[proof(2, &[])]), None);
    }

    #[test]
    fn cursor_from_genesis() {
        let cursor = Cursor { next_height: 0, next_sequence: 0 };
        assert_eq!(cursor.last_delivered_height(), None);
        assert_eq!(Cursor { next_height: 11, next_sequence: 0 }.last_delivered_height(), Some(10));
    }

    #[test]
    fn terminal_states() {
        assert!(LoopState::Stopped.is_terminal());
        assert!(LoopState::Faulted.is_terminal());
        assert!(!LoopState::Stopping.is_terminal());
        assert!(!LoopState::Idle.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_batches_in_height_order() -> anyhow::Result<()> {
        let client = MockChainClient::new();
        client.add_block(1, vec![receipt(vec![bridge_log(&BRIDGE, 0, b"a")])]);
        client.add_block(
            2,
            vec![
                receipt(vec![foreign_log(&[0x11; 20])]),
                receipt(vec![bridge_log(&BRIDGE, 1, b"b"), bridge_log(&BRIDGE, 2, b"c")]),
            ],
        );
        client.add_empty_blocks([3]);

        let (on_proofs, mut batches) = collect();
        let (on_stop, stops) = counted_stop();
        let handle = receiver(&client, EmptyBatchPolicy::Deliver)?.start(1, 0, on_proofs, on_stop);
        assert_eq!(handle.state(), LoopState::Running);

        let first = next_batch(&mut batches).await?;
        assert_eq!(first.height, 1);
        assert_eq!(first.events().map(|e| e.sequence).collect::<Vec<_>>(), vec![0]);

        let second = next_batch(&mut batches).await?;
        assert_eq!(second.height, 2);
        assert_eq!(second.proofs.len(), 1);
        assert_eq!(second.proofs[0].index, 1);
        assert_eq!(second.events().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);

        let third = next_batch(&mut batches).await?;
        assert_eq!(third.height, 3);
        assert!(third.proofs.is_empty());

        handle.stop();
        assert_eq!(handle.wait_for_state(LoopState::Stopped).await, LoopState::Stopped);
        assert_eq!(handle.cursor(), Cursor { next_height: 4, next_sequence: 3 });
        handle.join().await?;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_leaves_out_empty_blocks() -> anyhow::Result<()> {
        let client = MockChainClient::new();
        client.add_empty_blocks([5]);
        client.add_block(6, vec![receipt(vec![bridge_log(&BRIDGE, 9, b"x")])]);
        client.add_block(7, vec![receipt(vec![foreign_log(&BRIDGE)])]);
        client.add_block(8, vec![receipt(vec![bridge_log(&BRIDGE, 10, b"y")])]);

        let (on_proofs, mut batches) = collect();
        let handle = receiver(&client, EmptyBatchPolicy::Skip)?.start(5, 9, on_proofs, || {});

        assert_eq!(next_batch(&mut batches).await?.height, 6);
        assert_eq!(next_batch(&mut batches).await?.height, 8);

        handle.stop();
        handle.join().await?;
        assert!(batches.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn events_of_every_link_are_delivered() -> anyhow::Result<()> {
        let client = MockChainClient::new();
        let icon = encode_message_log(&BRIDGE, "btp://0x1.icon/cx01", 100, b"a");
        let bsc = encode_message_log(&BRIDGE, "btp://0x2.bsc/0x02", 5, b"b");
        client.add_block(1, vec![receipt(vec![icon])]);
        client.add_block(2, vec![receipt(vec![bsc])]);
        let monitor = receiver(&client, EmptyBatchPolicy::Deliver)?.monitor;
        let receiver = ReceiverBuilder::new(BRIDGE.to_vec()).build(monitor, BmcMessageDecoder)?;

        let (on_proofs, mut batches) = collect();
        let handle = receiver.start(1, 1, on_proofs, || {});

        let first = next_batch(&mut batches).await?;
        let events: Vec<_> = first.events().map(|e| (e.next.clone(), e.sequence)).collect();
        assert_eq!(events, vec![("btp://0x1.icon/cx01".to_owned(), 100)]);

        let second = next_batch(&mut batches).await?;
        let events: Vec<_> = second.events().map(|e| (e.next.clone(), e.sequence)).collect();
        assert_eq!(events, vec![("btp://0x2.bsc/0x02".to_owned(), 5)]);

        assert_eq!(handle.cursor(), Cursor { next_height: 3, next_sequence: 101 });
        handle.stop();
        handle.join().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sequences_below_the_start_sequence_are_still_delivered() -> anyhow::Result<()> {
        let client = MockChainClient::new();
        client.add_block(
            1,
            vec![
                receipt(vec![bridge_log(&BRIDGE, 3, b"x"), bridge_log(&BRIDGE, 4, b"y")]),
                receipt(vec![bridge_log(&BRIDGE, 5, b"z")]),
            ],
        );

        let (on_proofs, mut batches) = collect();
        let handle = receiver(&client, EmptyBatchPolicy::Deliver)?.start(1, 5, on_proofs, || {});

        let first = next_batch(&mut batches).await?;
        let indexes: Vec<_> = first.proofs.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert_eq!(first.events().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(handle.cursor().next_sequence, 6);

        handle.stop();
        handle.join().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_faults_the_loop() -> anyhow::Result<()> {
        let client = MockChainClient::new();
        client.add_block(1, vec![receipt(vec![bridge_log(&BRIDGE, 0, b"a")])]);
        client.add_empty_blocks([2]);

        let calls = Arc::new(AtomicUsize::new(0));
        let on_proofs = {
            let calls = Arc::clone(&calls);
            move |_batch: ProofBatch| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>("destination unreachable"))
            }
        };
        let (on_stop, stops) = counted_stop();
        let handle = receiver(&client, EmptyBatchPolicy::Deliver)?.start(1, 0, on_proofs, on_stop);

        assert_eq!(handle.wait_for_state(LoopState::Stopped).await, LoopState::Faulted);
        assert_eq!(handle.cursor().next_height, 1);
        match handle.join().await {
            Err(Error::Delivery { height, reason }) => {
                assert_eq!(height, 1);
                assert_eq!(reason, "destination unreachable");
            }
            other => panic!("expected delivery failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_monitor_faults_the_loop() -> anyhow::Result<()> {
        let client = MockChainClient::new();
        client.fail_headers_forever();

        let (on_proofs, _batches) = collect();
        let (on_stop, stops) = counted_stop();
        let handle = receiver(&client, EmptyBatchPolicy::Deliver)?.start(1, 0, on_proofs, on_stop);

        let result = handle.join().await;
        assert!(matches!(result, Err(Error::RetriesExhausted { height: 1, .. })));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_waiting_for_blocks() -> anyhow::Result<()> {
        let client = MockChainClient::new();

        let (on_proofs, _batches) = collect();
        let (on_stop, stops) = counted_stop();
        let handle = receiver(&client, EmptyBatchPolicy::Deliver)?.start(1, 0, on_proofs, on_stop);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.state(), LoopState::Running);

        handle.stop();
        handle.stop();
        assert_eq!(handle.wait_for_state(LoopState::Stopped).await, LoopState::Stopped);
        handle.join().await?;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn out_of_order_block_is_a_protocol_violation() -> anyhow::Result<()> {
        let receiver = receiver(&MockChainClient::new(), EmptyBatchPolicy::Deliver)?;
        let blocks = tokio_stream::iter(vec![notification(1), notification(3)]);
        let cursor = Cursor { next_height: 1, next_sequence: 0 };
        let (cursor_tx, cursor_rx) = watch::channel(cursor);
        let state = watch::Sender::new(LoopState::Running);
        let (on_proofs, mut batches) = collect();

        let result = receiver
            .drive(
                blocks,
                cursor,
                &cursor_tx,
                &CancellationToken::new(),
                &state,
                on_proofs,
            )
            .await;

        assert!(matches!(result, Err(Error::HeightMismatch { expected: 2, got: 3 })));
        assert_eq!(cursor_rx.borrow().next_height, 2);
        assert_eq!(batches.recv().await.map(|batch| batch.height), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn ended_block_stream_without_stop_is_an_error() -> anyhow::Result<()> {
        let receiver = receiver(&MockChainClient::new(), EmptyBatchPolicy::Deliver)?;
        let blocks = tokio_stream::iter(vec![notification(1)]);
        let (cursor_tx, _cursor_rx) = watch::channel(Cursor { next_height: 1, next_sequence: 0 });
        let state = watch::Sender::new(LoopState::Running);
        let (on_proofs, _batches) = collect();

        let result = receiver
            .drive(
                blocks,
                Cursor { next_height: 1, next_sequence: 0 },
                &cursor_tx,
                &CancellationToken::new(),
                &state,
                on_proofs,
            )
            .await;

        assert!(matches!(result, Err(Error::MonitorClosed)));
        Ok(())
    }
}
