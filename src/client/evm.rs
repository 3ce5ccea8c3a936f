//! Adapter for EVM-compatible chains, built on `alloy`.

use std::error::Error as StdError;

use alloy::{
    eips::{BlockId, BlockNumberOrTag},
    network::Ethereum,
    primitives::{B256, Bytes, U256},
    providers::{Provider, RootProvider},
    rpc::types::{Block, Log, TransactionReceipt},
    sol,
    sol_types::SolEvent,
    transports::{RpcError, TransportErrorKind},
};
use tokio_stream::StreamExt;

use crate::{
    ClientError,
    client::{BlockHeader, Capabilities, ChainClient, HeadStream, LogDecoder},
    types::{Event, LogEntry, Receipt, ReceiptStatus},
};

sol! {
    /// Emitted by the BMC contract for every outgoing BTP message.
    #[derive(Debug)]
    event Message(string _next, uint256 _seq, bytes _msg);
}

impl From<RpcError<TransportErrorKind>> for ClientError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        match error {
            RpcError::ErrorResp(payload) => {
                ClientError::JsonRpc { code: payload.code, message: payload.message.to_string() }
            }
            RpcError::Transport(TransportErrorKind::HttpError(http)) => {
                ClientError::Http { status: http.status, message: http.body }
            }
            RpcError::Transport(kind) => {
                if is_connection_refused(&kind) {
                    ClientError::ConnectionRefused(kind.to_string())
                } else {
                    ClientError::Transport(kind.to_string())
                }
            }
            RpcError::NullResp => ClientError::NotFound("null response".to_owned()),
            RpcError::DeserError { err, .. } => ClientError::Decode(err.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

fn is_connection_refused(kind: &TransportErrorKind) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = match kind {
        TransportErrorKind::Custom(err) => Some(err.as_ref() as &(dyn StdError + 'static)),
        _ => None,
    };
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = err.source();
    }
    false
}

/// Header of an EVM block.
///
/// Headers pushed by a `newHeads` subscription carry no transaction list; it is fetched lazily by
/// [`EvmClient::transaction_hashes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvmHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub transactions: Option<Vec<B256>>,
}

impl EvmHeader {
    fn from_block(block: &Block) -> Self {
        Self {
            number: block.header.inner.number,
            hash: block.header.hash,
            parent_hash: block.header.inner.parent_hash,
            timestamp: block.header.inner.timestamp,
            transactions: Some(block.transactions.hashes().collect()),
        }
    }

    fn from_head(head: &alloy::rpc::types::Header) -> Self {
        Self {
            number: head.inner.number,
            hash: head.hash,
            parent_hash: head.inner.parent_hash,
            timestamp: head.inner.timestamp,
            transactions: None,
        }
    }
}

impl BlockHeader for EvmHeader {
    fn height(&self) -> u64 {
        self.number
    }

    fn hash(&self) -> Bytes {
        Bytes::copy_from_slice(self.hash.as_slice())
    }
}

/// [`ChainClient`] over a single alloy [`RootProvider`].
#[derive(Clone, Debug)]
pub struct EvmClient {
    provider: RootProvider<Ethereum>,
    block_receipts: bool,
}

impl EvmClient {
    #[must_use]
    pub fn new(provider: RootProvider<Ethereum>) -> Self {
        Self { provider, block_receipts: true }
    }

    /// Connects to `url`; `ws://` and `wss://` endpoints enable the new-heads subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be established.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let provider = RootProvider::<Ethereum>::connect(url).await?;
        Ok(Self::new(provider))
    }

    /// Disable `eth_getBlockReceipts` for nodes that do not serve it.
    #[must_use]
    pub fn without_block_receipts(mut self) -> Self {
        self.block_receipts = false;
        self
    }

    #[must_use]
    pub fn provider(&self) -> &RootProvider<Ethereum> {
        &self.provider
    }
}

impl ChainClient for EvmClient {
    type Header = EvmHeader;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            block_receipts: self.block_receipts,
            new_heads_subscription: self.provider.client().pubsub_frontend().is_some(),
        }
    }

    async fn header_by_height(&self, height: u64) -> Result<Option<EvmHeader>, ClientError> {
        let block = self.provider.get_block_by_number(BlockNumberOrTag::Number(height)).await?;
        Ok(block.as_ref().map(EvmHeader::from_block))
    }

    async fn transaction_hashes(&self, header: &EvmHeader) -> Result<Vec<Bytes>, ClientError> {
        let hashes = match &header.transactions {
            Some(hashes) => hashes.clone(),
            None => {
                let block = self
                    .provider
                    .get_block_by_hash(header.hash)
                    .await?
                    .ok_or_else(|| ClientError::NotFound(format!("block {}", header.hash)))?;
                block.transactions.hashes().collect()
            }
        };
        Ok(hashes.iter().map(|hash| Bytes::copy_from_slice(hash.as_slice())).collect())
    }

    async fn transaction_receipt(&self, hash: &Bytes) -> Result<Receipt, ClientError> {
        let tx_hash = B256::try_from(hash.as_ref())
            .map_err(|_| ClientError::Decode(format!("invalid transaction hash {hash}")))?;
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("receipt {tx_hash}")))?;
        Ok(convert_receipt(&receipt))
    }

    async fn block_receipts(&self, header: &EvmHeader) -> Result<Vec<Receipt>, ClientError> {
        let receipts = self
            .provider
            .get_block_receipts(BlockId::from(header.hash))
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("receipts of block {}", header.hash)))?;
        Ok(receipts.iter().map(convert_receipt).collect())
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream<EvmHeader>, ClientError> {
        let subscription = self.provider.subscribe_blocks().await?;
        let stream = subscription.into_stream().map(|head| Ok(EvmHeader::from_head(&head)));
        Ok(Box::pin(stream))
    }
}

fn convert_receipt(receipt: &TransactionReceipt) -> Receipt {
    Receipt {
        transaction_hash: Bytes::copy_from_slice(receipt.transaction_hash.as_slice()),
        logs: receipt.inner.logs().iter().map(convert_log).collect(),
        status: if receipt.inner.status() { ReceiptStatus::Success } else { ReceiptStatus::Failure },
    }
}

fn convert_log(log: &Log) -> LogEntry {
    LogEntry {
        address: Bytes::copy_from_slice(log.address().as_slice()),
        topics: log.topics().iter().map(|topic| Bytes::copy_from_slice(topic.as_slice())).collect(),
        data: log.data().data.clone(),
    }
}

/// Decodes BMC `Message` events.
#[derive(Copy, Clone, Debug, Default)]
pub struct BmcMessageDecoder;

impl LogDecoder for BmcMessageDecoder {
    fn decode(&self, log: &LogEntry) -> Option<Event> {
        if log.topics.first().map(Bytes::as_ref) != Some(Message::SIGNATURE_HASH.as_slice()) {
            return None;
        }
        let topics = log
            .topics
            .iter()
            .map(|topic| B256::try_from(topic.as_ref()).ok())
            .collect::<Option<Vec<_>>>()?;
        let message = Message::decode_raw_log(topics, &log.data).ok()?;
        Some(Event {
            message: message._msg,
            next: message._next,
            sequence: u64::try_from(message._seq).ok()?,
        })
    }
}

/// Encodes a BMC `Message` event as a raw log emitted by `emitter`.
#[must_use]
pub fn encode_message_log(emitter: &[u8], next: &str, sequence: u64, payload: &[u8]) -> LogEntry {
    let event = Message {
        _next: next.to_owned(),
        _seq: U256::from(sequence),
        _msg: Bytes::copy_from_slice(payload),
    };
    let data = event.encode_log_data();
    LogEntry {
        address: Bytes::copy_from_slice(emitter),
        topics: data.topics().iter().map(|topic| Bytes::copy_from_slice(topic.as_slice())).collect(),
        data: data.data,
    }
}
