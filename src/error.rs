use std::mem::discriminant;

use thiserror::Error;

/// Raw errors raised by a chain adapter.
///
/// These are transport- and chain-native failures. Pass them through
/// [`classify`](crate::classify) to obtain an actionable [`RelayError`](crate::RelayError).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The endpoint refused the connection or could not be dialed.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The HTTP layer returned a non-success status.
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// The node answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    /// A transaction was executed and its result reports a failure code.
    #[error("transaction failed with code {code}: {message}")]
    TransactionFailed { code: i64, message: String },

    /// The remote call did not complete within the configured call timeout.
    #[error("operation timed out")]
    Timeout,

    /// The requested object does not exist on the remote chain.
    #[error("not found: {0}")]
    NotFound(String),

    /// The chain client does not implement the requested capability.
    #[error("unsupported capability: {0}")]
    Unsupported(&'static str),

    /// A response could not be converted into relay types.
    #[error("decode error: {0}")]
    Decode(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors produced by the monitoring pipeline.
///
/// [`Error::HeightMismatch`] is the only protocol-invariant violation; everything else is either a
/// configuration problem or an exhausted transport budget.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The block monitor used up its retry and connection-sleep budgets on one height.
    #[error("retries exhausted at height {height}: {source}")]
    RetriesExhausted { height: u64, source: ClientError },

    /// The new-head subscription could not be created or failed while streaming.
    #[error("subscription failed: {0}")]
    Subscription(ClientError),

    /// The new-head subscription ended.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The block stream ended although no stop was requested.
    #[error("block monitor stopped unexpectedly")]
    MonitorClosed,

    /// A block notification arrived out of order.
    #[error("non-monotonic block height: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    /// The relay callback rejected a proof batch.
    #[error("proof delivery failed at height {height}: {reason}")]
    Delivery { height: u64, reason: String },

    /// A connection pool was built without endpoints.
    #[error("connection pool requires at least one endpoint")]
    EmptyPool,

    /// A configuration value that must be non-zero was zero.
    #[error("{0} must be greater than 0")]
    InvalidConfig(&'static str),

    /// A BTP address could not be parsed.
    #[error("invalid BTP address: {0}")]
    InvalidBtpAddress(String),

    /// A chain client call failed outside any retry policy.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl Error {
    /// Returns true for protocol-invariant violations, as opposed to transport trouble.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::HeightMismatch { .. })
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        discriminant(self) == discriminant(other)
    }
}
