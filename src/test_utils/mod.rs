//! Scripted chain client and stream assertions for tests.
//!
//! [`MockChainClient`] serves headers and receipts from an in-memory chain, can be told to fail
//! or stall specific calls, and counts everything it is asked to do. Clones share state, so a test
//! keeps one handle for scripting while the code under test owns another.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::primitives::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    ClientError,
    client::{BlockHeader, Capabilities, ChainClient, HeadStream},
    types::{Event, LogEntry, Receipt, ReceiptStatus},
};

pub mod macros;

/// Header served by [`MockChainClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockHeader {
    pub height: u64,
    pub hash: Bytes,
    pub transactions: Vec<Bytes>,
}

impl MockHeader {
    #[must_use]
    pub fn new(height: u64, transactions: Vec<Bytes>) -> Self {
        Self { height, hash: block_hash(height), transactions }
    }
}

impl BlockHeader for MockHeader {
    fn height(&self) -> u64 {
        self.height
    }

    fn hash(&self) -> Bytes {
        self.hash.clone()
    }
}

/// Deterministic block hash for `height`.
#[must_use]
pub fn block_hash(height: u64) -> Bytes {
    let mut hash = vec![0xbb; 24];
    hash.extend_from_slice(&height.to_be_bytes());
    Bytes::from(hash)
}

/// Deterministic transaction hash for transaction `index` of block `height`.
#[must_use]
pub fn tx_hash(height: u64, index: usize) -> Bytes {
    let mut hash = vec![0xcc; 16];
    hash.extend_from_slice(&height.to_be_bytes());
    hash.extend_from_slice(&(index as u64).to_be_bytes());
    Bytes::from(hash)
}

/// First topic of logs understood by [`MockDecoder`].
pub const BRIDGE_TOPIC: [u8; 32] = [0xee; 32];

/// A log carrying a bridge event as understood by [`MockDecoder`].
///
/// The data is the big-endian sequence followed by the payload.
#[must_use]
pub fn bridge_log(emitter: &[u8], sequence: u64, payload: &[u8]) -> LogEntry {
    let mut data = sequence.to_be_bytes().to_vec();
    data.extend_from_slice(payload);
    LogEntry {
        address: Bytes::copy_from_slice(emitter),
        topics: vec![Bytes::from(BRIDGE_TOPIC.to_vec())],
        data: Bytes::from(data),
    }
}

/// A log that is not a bridge event.
#[must_use]
pub fn foreign_log(emitter: &[u8]) -> LogEntry {
    LogEntry {
        address: Bytes::copy_from_slice(emitter),
        topics: vec![Bytes::from(vec![0x01; 32])],
        data: Bytes::from_static(b"noise"),
    }
}

/// Decoder for logs built with [`bridge_log`].
#[derive(Clone, Debug)]
pub struct MockDecoder {
    pub next: String,
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self { next: "btp://0x2.bsc/0xdestination".to_owned() }
    }
}

impl crate::client::LogDecoder for MockDecoder {
    fn decode(&self, log: &LogEntry) -> Option<Event> {
        if log.topics.first().map(Bytes::as_ref) != Some(BRIDGE_TOPIC.as_slice()) {
            return None;
        }
        let sequence = u64::from_be_bytes(log.data.get(..8)?.try_into().ok()?);
        Some(Event {
            message: Bytes::copy_from_slice(&log.data[8..]),
            next: self.next.clone(),
            sequence,
        })
    }
}

#[derive(Default)]
struct Chain {
    headers: BTreeMap<u64, MockHeader>,
    receipts: HashMap<Bytes, Receipt>,
    header_failures: Option<usize>,
    block_receipt_failures: usize,
    receipt_failures: HashMap<Bytes, usize>,
    receipt_delays: HashMap<Bytes, Duration>,
    header_delay: Option<Duration>,
    heads: Option<mpsc::UnboundedReceiver<Result<MockHeader, ClientError>>>,
}

#[derive(Default)]
struct Counters {
    header_calls: AtomicUsize,
    receipt_calls: AtomicUsize,
    block_receipt_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct Shared {
    chain: Mutex<Chain>,
    capabilities: Mutex<Capabilities>,
    counters: Counters,
    heads_tx: Mutex<Option<mpsc::UnboundedSender<Result<MockHeader, ClientError>>>>,
}

/// In-memory [`ChainClient`] with failure injection and call instrumentation.
#[derive(Clone)]
pub struct MockChainClient {
    label: &'static str,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MockChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChainClient").field("label", &self.label).finish_non_exhaustive()
    }
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockChainClient {
    #[must_use]
    pub fn new() -> Self {
        let (heads_tx, heads_rx) = mpsc::unbounded_channel();
        let chain = Chain { heads: Some(heads_rx), ..Chain::default() };
        Self {
            label: "mock",
            shared: Arc::new(Shared {
                chain: Mutex::new(chain),
                capabilities: Mutex::new(Capabilities::default()),
                counters: Counters::default(),
                heads_tx: Mutex::new(Some(heads_tx)),
            }),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    fn chain(&self) -> MutexGuard<'_, Chain> {
        self.shared.chain.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.shared.capabilities.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            capabilities;
    }

    /// Adds a block at `height` whose transactions produced `receipts`, returning its header.
    ///
    /// Receipt transaction hashes are overwritten with [`tx_hash`] values.
    pub fn add_block(&self, height: u64, receipts: Vec<Receipt>) -> MockHeader {
        let mut chain = self.chain();
        let mut transactions = Vec::with_capacity(receipts.len());
        for (index, mut receipt) in receipts.into_iter().enumerate() {
            let hash = tx_hash(height, index);
            receipt.transaction_hash = hash.clone();
            chain.receipts.insert(hash.clone(), receipt);
            transactions.push(hash);
        }
        let header = MockHeader::new(height, transactions);
        chain.headers.insert(height, header.clone());
        header
    }

    /// Adds empty blocks for every height in `heights`.
    pub fn add_empty_blocks(&self, heights: impl IntoIterator<Item = u64>) {
        for height in heights {
            self.add_block(height, vec![]);
        }
    }

    /// Serves a header numbered `reported` whenever `height` is requested.
    pub fn misnumber_header(&self, height: u64, reported: u64) {
        self.chain().headers.insert(height, MockHeader::new(reported, vec![]));
    }

    /// Makes the next `times` header lookups fail with a refused connection.
    pub fn fail_headers(&self, times: usize) {
        self.chain().header_failures = Some(times);
    }

    /// Makes every header lookup fail with a refused connection.
    pub fn fail_headers_forever(&self) {
        self.chain().header_failures = Some(usize::MAX);
    }

    pub fn delay_headers(&self, delay: Duration) {
        self.chain().header_delay = Some(delay);
    }

    /// Makes the next `times` block-receipt lookups fail.
    pub fn fail_block_receipts(&self, times: usize) {
        self.chain().block_receipt_failures = times;
    }

    /// Makes the next `times` lookups of the receipt `hash` fail.
    pub fn fail_receipt(&self, hash: &Bytes, times: usize) {
        self.chain().receipt_failures.insert(hash.clone(), times);
    }

    /// Delays every lookup of the receipt `hash` by `delay`.
    pub fn delay_receipt(&self, hash: &Bytes, delay: Duration) {
        self.chain().receipt_delays.insert(hash.clone(), delay);
    }

    /// Pushes a new head to the subscription; the head's block must have been added already.
    pub fn push_head(&self, height: u64) {
        let header = self.chain().headers.get(&height).cloned();
        let header = header.unwrap_or_else(|| MockHeader::new(height, vec![]));
        self.send_head(Ok(header));
    }

    pub fn push_head_error(&self, error: ClientError) {
        self.send_head(Err(error));
    }

    /// Ends the subscription stream once the pushed items are consumed.
    pub fn close_heads(&self) {
        self.heads_tx().take();
    }

    fn heads_tx(
        &self,
    ) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Result<MockHeader, ClientError>>>> {
        self.shared.heads_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn send_head(&self, head: Result<MockHeader, ClientError>) {
        if let Some(tx) = self.heads_tx().as_ref() {
            let _ = tx.send(head);
        }
    }

    #[must_use]
    pub fn header_calls(&self) -> usize {
        self.shared.counters.header_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn receipt_calls(&self) -> usize {
        self.shared.counters.receipt_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn block_receipt_calls(&self) -> usize {
        self.shared.counters.block_receipt_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.shared.counters.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Highest number of receipt lookups observed running at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.shared.counters.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_failure(count: &mut usize) -> bool {
        match *count {
            0 => false,
            usize::MAX => true,
            _ => {
                *count -= 1;
                true
            }
        }
    }

    fn refused(&self) -> ClientError {
        ClientError::ConnectionRefused(format!("{}: injected failure", self.label))
    }
}

impl ChainClient for MockChainClient {
    type Header = MockHeader;

    fn capabilities(&self) -> Capabilities {
        *self.shared.capabilities.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn header_by_height(&self, height: u64) -> Result<Option<MockHeader>, ClientError> {
        self.shared.counters.header_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.chain().header_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut chain = self.chain();
        if chain.header_failures.as_mut().is_some_and(Self::take_failure) {
            return Err(self.refused());
        }
        Ok(chain.headers.get(&height).cloned())
    }

    async fn transaction_hashes(&self, header: &MockHeader) -> Result<Vec<Bytes>, ClientError> {
        Ok(header.transactions.clone())
    }

    async fn transaction_receipt(&self, hash: &Bytes) -> Result<Receipt, ClientError> {
        let counters = &self.shared.counters;
        counters.receipt_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(counters);

        let delay = self.chain().receipt_delays.get(hash).copied();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let mut chain = self.chain();
        if chain.receipt_failures.get_mut(hash).is_some_and(Self::take_failure) {
            return Err(self.refused());
        }
        chain.receipts.get(hash).cloned().ok_or_else(|| ClientError::NotFound(format!("{hash}")))
    }

    async fn block_receipts(&self, header: &MockHeader) -> Result<Vec<Receipt>, ClientError> {
        self.shared.counters.block_receipt_calls.fetch_add(1, Ordering::SeqCst);
        if !self.capabilities().block_receipts {
            return Err(ClientError::Unsupported("block receipts"));
        }
        let mut chain = self.chain();
        if Self::take_failure(&mut chain.block_receipt_failures) {
            return Err(self.refused());
        }
        header
            .transactions
            .iter()
            .map(|hash| {
                let receipt = chain.receipts.get(hash).cloned();
                receipt.ok_or_else(|| ClientError::NotFound(format!("{hash}")))
            })
            .collect()
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream<MockHeader>, ClientError> {
        self.shared.counters.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.capabilities().new_heads_subscription {
            return Err(ClientError::Unsupported("new heads subscription"));
        }
        let rx = self
            .chain()
            .heads
            .take()
            .ok_or_else(|| ClientError::Transport("already subscribed".to_owned()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// A successful receipt with the given logs.
#[must_use]
pub fn receipt(logs: Vec<LogEntry>) -> Receipt {
    Receipt { transaction_hash: Bytes::new(), logs, status: ReceiptStatus::Success }
}
