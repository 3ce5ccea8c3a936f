use std::fmt::Debug;

use alloy::primitives::Bytes;
use tokio::sync::mpsc;

use crate::Error;

/// A raw, chain-native log record.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct LogEntry {
    /// Address of the contract that emitted the log.
    pub address: Bytes,
    pub topics: Vec<Bytes>,
    pub data: Bytes,
}

/// Execution status of a transaction receipt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// A transaction receipt, in the order the transaction appears in its block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: Bytes,
    pub logs: Vec<LogEntry>,
    pub status: ReceiptStatus,
}

/// A decoded bridge event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Opaque BTP-encoded payload.
    pub message: Bytes,
    /// BTP address of the next hop.
    pub next: String,
    pub sequence: u64,
}

/// The bridge events emitted by one transaction.
///
/// `index` is the transaction position within the block at `height`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptProof {
    pub index: usize,
    pub height: u64,
    pub events: Vec<Event>,
}

/// The receipt proofs of one block, handed to the relay callback.
///
/// `proofs` may be empty when the receive loop is configured to deliver empty blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofBatch {
    pub height: u64,
    pub proofs: Vec<ReceiptProof>,
}

impl ProofBatch {
    /// Iterates over every event of the batch in block order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.proofs.iter().flat_map(|proof| proof.events.iter())
    }
}

/// One monitored block.
///
/// `receipts` is `None` when the monitor was configured not to fetch receipts.
#[derive(Clone, Debug)]
pub struct BlockNotification<H> {
    pub height: u64,
    pub hash: Bytes,
    pub header: H,
    pub receipts: Option<Vec<Receipt>>,
}

/// Items yielded by a block monitor stream. An `Err` item is always the last one.
pub type MonitorResult<H> = Result<BlockNotification<H>, Error>;

pub(crate) trait TryStream<T> {
    /// Sends `item` downstream, returning `false` when the receiver is gone.
    fn try_stream(&self, item: Result<T, Error>) -> impl Future<Output = bool> + Send;
}

impl<T: Debug + Send> TryStream<T> for mpsc::Sender<Result<T, Error>> {
    async fn try_stream(&self, item: Result<T, Error>) -> bool {
        if let Err(err) = &item {
            debug!(error = %err, "Sending error downstream");
        }
        if self.send(item).await.is_err() {
            warn!("Downstream channel closed, stopping stream");
            return false;
        }
        true
    }
}
