use std::sync::Arc;

use alloy::primitives::Bytes;

use crate::{
    Error,
    client::{ChainClient, LogDecoder},
    monitor::BlockMonitor,
    receiver::{EmptyBatchPolicy, Receiver},
};

/// Builder/configuration for [`Receiver`].
#[derive(Clone, Debug)]
pub struct ReceiverBuilder {
    /// Chain-native address of the bridge contract whose events are relayed.
    pub bridge_address: Bytes,
    pub empty_batch_policy: EmptyBatchPolicy,
}

impl ReceiverBuilder {
    #[must_use]
    pub fn new(bridge_address: impl Into<Bytes>) -> Self {
        Self { bridge_address: bridge_address.into(), empty_batch_policy: EmptyBatchPolicy::default() }
    }

    #[must_use]
    pub fn empty_batch_policy(mut self, policy: EmptyBatchPolicy) -> Self {
        self.empty_batch_policy = policy;
        self
    }

    /// Builds a receive loop that reads blocks from `monitor` and decodes bridge logs with
    /// `decoder`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the bridge address is empty.
    pub fn build<C: ChainClient, D: LogDecoder>(
        self,
        monitor: BlockMonitor<C>,
        decoder: D,
    ) -> Result<Receiver<C, D>, Error> {
        if self.bridge_address.is_empty() {
            return Err(Error::InvalidConfig("bridge address length"));
        }

        Ok(Receiver {
            monitor,
            decoder: Arc::new(decoder),
            bridge_address: self.bridge_address,
            empty_batch_policy: self.empty_batch_policy,
        })
    }
}
