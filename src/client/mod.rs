//! Chain capability interface.
//!
//! The monitor, fetcher and extractor are written against [`ChainClient`] and [`LogDecoder`]
//! only. Supporting a new chain means implementing these two traits in a thin adapter; the
//! [`evm`] module is the adapter for EVM-compatible chains.
//!
//! Remote calls are made through a [`ConnectionPool`], which picks one of several redundant
//! endpoints per call and bounds every call with a timeout.

use std::{fmt::Debug, pin::Pin};

use alloy::primitives::Bytes;
use tokio_stream::Stream;

use crate::{
    ClientError,
    types::{Event, LogEntry, Receipt},
};

pub mod evm;
pub mod pool;

pub use pool::{ConnectionPool, ConnectionPoolBuilder, DEFAULT_CALL_TIMEOUT, SelectionStrategy};

/// Stream of new block headers produced by [`ChainClient::subscribe_new_heads`].
pub type HeadStream<H> = Pin<Box<dyn Stream<Item = Result<H, ClientError>> + Send>>;

/// A chain-native block header.
pub trait BlockHeader: Clone + Debug + Send + Sync + 'static {
    fn height(&self) -> u64;
    fn hash(&self) -> Bytes;
}

/// Optional operations a chain client supports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// All receipts of a block can be fetched with a single call.
    pub block_receipts: bool,
    /// New block headers can be pushed through a subscription.
    pub new_heads_subscription: bool,
}

/// Per-chain adapter used by the monitoring core.
///
/// Connection handles are expected to be cheap to clone and safe to use from several tasks.
pub trait ChainClient: Clone + Send + Sync + 'static {
    type Header: BlockHeader;

    fn capabilities(&self) -> Capabilities;

    /// Fetch the header at `height`, or `None` if the block has not been produced yet.
    fn header_by_height(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<Option<Self::Header>, ClientError>> + Send;

    /// Transaction hashes of the block, in block order.
    fn transaction_hashes(
        &self,
        header: &Self::Header,
    ) -> impl Future<Output = Result<Vec<Bytes>, ClientError>> + Send;

    /// Fetch the receipt of a single transaction.
    fn transaction_receipt(
        &self,
        hash: &Bytes,
    ) -> impl Future<Output = Result<Receipt, ClientError>> + Send;

    /// Fetch all receipts of a block in one call.
    ///
    /// Only called when [`Capabilities::block_receipts`] is set.
    fn block_receipts(
        &self,
        _header: &Self::Header,
    ) -> impl Future<Output = Result<Vec<Receipt>, ClientError>> + Send {
        async { Err(ClientError::Unsupported("block receipts")) }
    }

    /// Subscribe to new block headers.
    ///
    /// Only called when [`Capabilities::new_heads_subscription`] is set.
    fn subscribe_new_heads(
        &self,
    ) -> impl Future<Output = Result<HeadStream<Self::Header>, ClientError>> + Send {
        async { Err(ClientError::Unsupported("new heads subscription")) }
    }
}

/// Decodes bridge events from raw logs.
///
/// Returning `None` means the log is not a bridge event; it is skipped without error.
pub trait LogDecoder: Send + Sync + 'static {
    fn decode(&self, log: &LogEntry) -> Option<Event>;
}

impl<F> LogDecoder for F
where
    F: Fn(&LogEntry) -> Option<Event> + Send + Sync + 'static,
{
    fn decode(&self, log: &LogEntry) -> Option<Event> {
        self(log)
    }
}
