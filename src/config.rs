//! Per-chain settings as handed over by the relay's configuration loader.
//!
//! Nothing here reads files or the environment; [`ChainConfig`] is deserialized by the caller
//! from whatever format it uses and turned into builders.

use std::{fmt, str::FromStr, time::Duration};

use alloy::{hex, primitives::Bytes};
use serde::{Deserialize, Deserializer};

use crate::{
    Error,
    client::{
        ChainClient, ConnectionPool, ConnectionPoolBuilder, DEFAULT_CALL_TIMEOUT,
        SelectionStrategy, evm::EvmClient,
    },
    fetcher::DEFAULT_MAX_CONCURRENT_FETCHES,
    monitor::{
        BlockMonitorBuilder, DEFAULT_BLOCK_RETRY_INTERVAL, DEFAULT_BLOCK_RETRY_LIMIT,
        DEFAULT_CONNECTION_SLEEP_INTERVAL, DEFAULT_CONNECTION_SLEEP_RETRY_LIMIT,
    },
    receiver::{EmptyBatchPolicy, ReceiverBuilder},
};

const BTP_SCHEME: &str = "btp://";

/// A BTP address, `btp://<network>/<account>`.
///
/// The network is `<network address>.<blockchain>`, e.g. `0x61.bsc`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BtpAddress {
    network: String,
    account: String,
}

impl BtpAddress {
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The part of the network before the dot, e.g. `0x61`.
    #[must_use]
    pub fn network_address(&self) -> &str {
        self.network.split_once('.').map_or(self.network.as_str(), |(address, _)| address)
    }

    /// The part of the network after the dot, e.g. `bsc`.
    #[must_use]
    pub fn blockchain(&self) -> &str {
        self.network.split_once('.').map_or("", |(_, blockchain)| blockchain)
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Decodes the account into raw address bytes.
    ///
    /// Accepts the `0x` prefix as well as the `hx`/`cx` prefixes used for ICON accounts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBtpAddress`] if the account is not hex.
    pub fn contract_address(&self) -> Result<Bytes, Error> {
        let account = self.account.as_str();
        let digits = ["0x", "0X", "hx", "cx"]
            .iter()
            .find_map(|prefix| account.strip_prefix(prefix))
            .unwrap_or(account);
        hex::decode(digits)
            .map(Bytes::from)
            .map_err(|err| Error::InvalidBtpAddress(format!("{self}: {err}")))
    }
}

impl fmt::Display for BtpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BTP_SCHEME}{}/{}", self.network, self.account)
    }
}

impl FromStr for BtpAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidBtpAddress(s.to_owned());

        let rest = s.strip_prefix(BTP_SCHEME).ok_or_else(invalid)?;
        let (network, account) = rest.split_once('/').ok_or_else(invalid)?;
        let (address, blockchain) = network.split_once('.').ok_or_else(invalid)?;
        if address.is_empty() || blockchain.is_empty() || account.is_empty() || account.contains('/')
        {
            return Err(invalid());
        }

        Ok(Self { network: network.to_owned(), account: account.to_owned() })
    }
}

impl<'de> Deserialize<'de> for BtpAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Settings of one source chain.
///
/// Durations are in milliseconds. Missing tunables take the builders' defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Endpoint URLs, in pool order.
    pub endpoints: Vec<String>,
    /// BTP address of the bridge contract on the source chain.
    pub src: BtpAddress,
    #[serde(default)]
    pub start_height: u64,
    #[serde(default)]
    pub start_sequence: u64,
    #[serde(default = "defaults::block_retry_interval")]
    pub block_retry_interval: u64,
    #[serde(default = "defaults::block_retry_limit")]
    pub block_retry_limit: usize,
    #[serde(default = "defaults::connection_sleep_interval")]
    pub connection_sleep_interval: u64,
    #[serde(default = "defaults::connection_sleep_retry_limit")]
    pub connection_sleep_retry_limit: usize,
    #[serde(default = "defaults::call_timeout")]
    pub call_timeout: u64,
    #[serde(default = "defaults::max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub empty_batch_policy: EmptyBatchPolicy,
}

mod defaults {
    use super::*;

    fn millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub(super) fn block_retry_interval() -> u64 {
        millis(DEFAULT_BLOCK_RETRY_INTERVAL)
    }

    pub(super) fn block_retry_limit() -> usize {
        DEFAULT_BLOCK_RETRY_LIMIT
    }

    pub(super) fn connection_sleep_interval() -> u64 {
        millis(DEFAULT_CONNECTION_SLEEP_INTERVAL)
    }

    pub(super) fn connection_sleep_retry_limit() -> usize {
        DEFAULT_CONNECTION_SLEEP_RETRY_LIMIT
    }

    pub(super) fn call_timeout() -> u64 {
        millis(DEFAULT_CALL_TIMEOUT)
    }

    pub(super) fn max_concurrent_fetches() -> usize {
        DEFAULT_MAX_CONCURRENT_FETCHES
    }
}

impl ChainConfig {
    #[must_use]
    pub fn monitor_builder(&self) -> BlockMonitorBuilder {
        BlockMonitorBuilder::new()
            .block_retry_interval(Duration::from_millis(self.block_retry_interval))
            .block_retry_limit(self.block_retry_limit)
            .connection_sleep_interval(Duration::from_millis(self.connection_sleep_interval))
            .connection_sleep_retry_limit(self.connection_sleep_retry_limit)
            .max_concurrent_fetches(self.max_concurrent_fetches)
    }

    /// A pool builder over `clients` with the configured strategy and call timeout.
    #[must_use]
    pub fn pool_builder<C: ChainClient>(&self, clients: Vec<C>) -> ConnectionPoolBuilder<C> {
        ConnectionPoolBuilder::new(clients)
            .strategy(self.strategy)
            .call_timeout(Duration::from_millis(self.call_timeout))
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidBtpAddress`] if the source account is not a hex address.
    pub fn receiver_builder(&self) -> Result<ReceiverBuilder, Error> {
        Ok(ReceiverBuilder::new(self.src.contract_address()?)
            .empty_batch_policy(self.empty_batch_policy))
    }

    /// Connects to every endpoint as an EVM chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Client`] for the first endpoint that cannot be reached, and
    /// [`Error::EmptyPool`] or [`Error::InvalidConfig`] for an unusable pool configuration.
    pub async fn connect_evm(&self) -> Result<ConnectionPool<EvmClient>, Error> {
        let mut clients = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            debug!(endpoint = %endpoint, "Connecting to endpoint");
            clients.push(EvmClient::connect(endpoint).await?);
        }
        self.pool_builder(clients).build()
    }
}
