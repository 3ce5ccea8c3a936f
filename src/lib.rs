//! BTP relay core: the source-chain half of a cross-chain message relay.
//!
//! A relay watches a source chain for messages that its bridge contract (the BMC) emitted,
//! groups them into per-transaction receipt proofs and hands them, block by block, to whatever
//! submits them on the destination chain.
//!
//! The pipeline is assembled from these parts:
//!
//! - [`ConnectionPool`] holds redundant clients for one chain and bounds every call with a
//!   timeout.
//! - [`BlockMonitor`] walks the chain height by height, by polling or by following a new-heads
//!   subscription, and retries transport failures according to its [`RetryPolicy`].
//! - [`ReceiptFetcher`] collects the receipts of a block with bounded concurrency, preserving
//!   transaction order.
//! - [`extract`] turns a block's receipts into [`ReceiptProof`]s for the bridge contract.
//! - [`Receiver`] ties it together into a receive loop controlled through a [`ReceiverHandle`].
//! - [`classify`] maps raw chain errors into the actionable [`RelayError`] set.
//!
//! Chains plug in through the [`ChainClient`] trait; [`client::evm`] implements it on top of
//! `alloy`.
//!
//! # Ordering
//!
//! Blocks are delivered in strictly increasing height order, with no gaps. Within a block,
//! proofs follow transaction order and events follow log order. A block delivered out of order
//! is a protocol violation and faults the receive loop with [`Error::HeightMismatch`].
//!
//! # Example
//!
//! ```no_run
//! use btp_relay::{BlockMonitor, ChainConfig, ProofBatch, client::evm::BmcMessageDecoder};
//!
//! # async fn run(config: ChainConfig) -> Result<(), btp_relay::Error> {
//! let pool = config.connect_evm().await?;
//! let monitor = config.monitor_builder().build(pool)?;
//! let receiver = config.receiver_builder()?.build(monitor, BmcMessageDecoder)?;
//!
//! let handle = receiver.start(
//!     config.start_height,
//!     config.start_sequence,
//!     |batch: ProofBatch| async move {
//!         println!("{} proofs at height {}", batch.proofs.len(), batch.height);
//!         Ok::<_, btp_relay::Error>(())
//!     },
//!     || println!("receiver stopped"),
//! );
//!
//! handle.join().await
//! # }
//! ```

#[macro_use]
mod logging;

pub mod classifier;
pub mod client;
pub mod config;
pub mod extractor;
pub mod fetcher;
pub mod monitor;
pub mod receiver;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

mod error;

pub use classifier::{RelayError, RevertCode, RevertLayer, classify, classify_failure};
pub use client::{
    BlockHeader, Capabilities, ChainClient, ConnectionPool, ConnectionPoolBuilder, LogDecoder,
    SelectionStrategy,
};
pub use config::{BtpAddress, ChainConfig};
pub use error::{ClientError, Error};
pub use extractor::extract;
pub use fetcher::ReceiptFetcher;
pub use monitor::{BlockMonitor, BlockMonitorBuilder, MonitorMode, RetryPolicy};
pub use receiver::{Cursor, EmptyBatchPolicy, LoopState, Receiver, ReceiverBuilder, ReceiverHandle};
pub use types::{
    BlockNotification, Event, LogEntry, MonitorResult, ProofBatch, Receipt, ReceiptProof,
    ReceiptStatus,
};
