use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use serde::Deserialize;
use tokio::time::timeout;

use crate::{
    ClientError, Error,
    client::{Capabilities, ChainClient},
};

/// Default timeout applied to every call made through a [`ConnectionPool`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How a [`ConnectionPool`] picks the endpoint for the next call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cycle through the endpoints in insertion order.
    #[default]
    RoundRobin,
    /// Pick a uniformly random endpoint per call.
    Random,
}

/// A set of redundant connections to the same chain.
///
/// The endpoint list is immutable after construction and shared by every clone of the pool, so
/// the pool can be handed to any number of tasks.
#[derive(Debug)]
pub struct ConnectionPool<C> {
    clients: Arc<[C]>,
    cursor: Arc<AtomicUsize>,
    strategy: SelectionStrategy,
    call_timeout: Duration,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            clients: Arc::clone(&self.clients),
            cursor: Arc::clone(&self.cursor),
            strategy: self.strategy,
            call_timeout: self.call_timeout,
        }
    }
}

impl<C: ChainClient> ConnectionPool<C> {
    /// Builds a round-robin pool with the default call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyPool`] if `clients` is empty.
    pub fn new(clients: Vec<C>) -> Result<Self, Error> {
        ConnectionPoolBuilder::new(clients).build()
    }

    /// Number of endpoints in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Always false; pools cannot be built empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Capabilities of the pool's endpoints.
    ///
    /// All endpoints serve the same chain; the first one is asked.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.clients.first().map(ChainClient::capabilities).unwrap_or_default()
    }

    /// Returns the connection to use for the next call.
    #[must_use]
    pub fn client(&self) -> &C {
        let idx = match self.strategy {
            SelectionStrategy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len()
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..self.clients.len()),
        };
        &self.clients[idx]
    }

    /// Runs `operation` against the next connection, bounded by the call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if the call does not finish in time, otherwise whatever the
    /// operation returned.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ClientError>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let client = self.client().clone();
        timeout(self.call_timeout, operation(client)).await.map_err(|_| {
            trace!(timeout_ms = self.call_timeout.as_millis(), "Remote call timed out");
            ClientError::Timeout
        })?
    }
}

/// Builder for [`ConnectionPool`].
pub struct ConnectionPoolBuilder<C> {
    clients: Vec<C>,
    strategy: SelectionStrategy,
    call_timeout: Duration,
}

impl<C: ChainClient> ConnectionPoolBuilder<C> {
    #[must_use]
    pub fn new(clients: Vec<C>) -> Self {
        Self { clients, strategy: SelectionStrategy::default(), call_timeout: DEFAULT_CALL_TIMEOUT }
    }

    /// Add one more endpoint.
    #[must_use]
    pub fn endpoint(mut self, client: C) -> Self {
        self.clients.push(client);
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the timeout applied to each remote call.
    #[must_use]
    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// # Errors
    ///
    /// * [`Error::EmptyPool`] - if no endpoint was supplied.
    /// * [`Error::InvalidConfig`] - if the call timeout is zero.
    pub fn build(self) -> Result<ConnectionPool<C>, Error> {
        if self.clients.is_empty() {
            return Err(Error::EmptyPool);
        }
        if self.call_timeout.is_zero() {
            return Err(Error::InvalidConfig("call timeout"));
        }

        debug!(
            endpoints = self.clients.len(),
            strategy = ?self.strategy,
            call_timeout_ms = self.call_timeout.as_millis(),
            "Building connection pool"
        );

        Ok(ConnectionPool {
            clients: self.clients.into(),
            cursor: Arc::new(AtomicUsize::new(0)),
            strategy: self.strategy,
            call_timeout: self.call_timeout,
        })
    }
}
