//! Translation of raw chain-client errors into actionable relay error kinds.
//!
//! Transport failures become [`RelayError::ConnectFail`], JSON-RPC submission errors become one
//! of the `Send*`/`ResultPending` kinds, and on-chain failure codes inside the revert window
//! become a layered [`RevertCode`]. Anything else is passed through untouched as
//! [`RelayError::Unclassified`].

use thiserror::Error;

use crate::ClientError;

mod revert;

pub use revert::{BmcRevert, BmvRevert, RevertCode, RevertLayer};

/// JSON-RPC error code for a generic system error carrying a nested sub-code.
pub const CODE_SYSTEM_ERROR: i64 = -31000;
/// JSON-RPC error code reported when the transaction pool is full.
pub const CODE_POOL_OVERFLOW: i64 = -31001;
/// JSON-RPC error code for a transaction that is still pending.
pub const CODE_PENDING: i64 = -31002;
/// JSON-RPC error code for a transaction that is still executing.
pub const CODE_EXECUTING: i64 = -31003;

/// System-error sub-code: transaction pool overflow.
pub const SUBCODE_POOL_OVERFLOW: u32 = 2001;
/// System-error sub-code: transaction timestamp expired.
pub const SUBCODE_EXPIRED: u32 = 2002;
/// System-error sub-code: transaction timestamp too far in the future.
pub const SUBCODE_FUTURE: u32 = 2003;

/// First on-chain failure code of the revert window.
pub const REVERT_CODE_BASE: i64 = 32;
/// Last on-chain failure code of the revert window.
pub const REVERT_CODE_END: i64 = 99;

/// Semantic relay error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The endpoint could not be reached.
    #[error("connect fail: {0}")]
    ConnectFail(ClientError),

    /// The node dropped the transaction because its timestamp is too old.
    #[error("transaction expired")]
    SendExpired,

    /// The node refused the transaction because its timestamp is ahead of the chain.
    #[error("transaction timestamp in the future")]
    SendFuture,

    /// The node's transaction pool is full; resubmit later.
    #[error("transaction pool overflow")]
    SendOverflow,

    /// The transaction result is not available yet.
    #[error("transaction result pending")]
    ResultPending,

    /// The contract rejected the transaction.
    #[error("chain revert: {0}")]
    ChainRevert(RevertCode),

    /// An on-chain failure outside the revert window.
    #[error("transaction failure {code}: {message}")]
    Failure { code: i64, message: String },

    /// The raw error did not match any known kind.
    #[error(transparent)]
    Unclassified(ClientError),
}

impl RelayError {
    /// Returns true for kinds that go away by waiting and polling again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::ConnectFail(_) | RelayError::ResultPending)
    }
}

impl From<ClientError> for RelayError {
    fn from(error: ClientError) -> Self {
        classify(error)
    }
}

/// Maps a raw client error to its [`RelayError`] kind.
///
/// Never fails; unrecognized errors come back as [`RelayError::Unclassified`].
#[must_use]
pub fn classify(error: ClientError) -> RelayError {
    match error {
        ClientError::ConnectionRefused(_) | ClientError::Http { .. } => {
            RelayError::ConnectFail(error)
        }
        ClientError::JsonRpc { code, ref message } => match code {
            CODE_POOL_OVERFLOW => RelayError::SendOverflow,
            CODE_PENDING | CODE_EXECUTING => RelayError::ResultPending,
            CODE_SYSTEM_ERROR => match system_subcode(message) {
                Some(SUBCODE_POOL_OVERFLOW) => RelayError::SendOverflow,
                Some(SUBCODE_EXPIRED) => RelayError::SendExpired,
                Some(SUBCODE_FUTURE) => RelayError::SendFuture,
                _ => RelayError::Unclassified(error),
            },
            _ => RelayError::Unclassified(error),
        },
        ClientError::TransactionFailed { code, message } => classify_failure(code, message),
        other => RelayError::Unclassified(other),
    }
}

/// Maps an on-chain failure code to a revert or a generic failure.
#[must_use]
pub fn classify_failure(code: i64, message: String) -> RelayError {
    if (REVERT_CODE_BASE..=REVERT_CODE_END).contains(&code) {
        match u32::try_from(code - REVERT_CODE_BASE) {
            Ok(revert) => RelayError::ChainRevert(RevertCode::from_code(revert)),
            Err(_) => RelayError::Failure { code, message },
        }
    } else {
        RelayError::Failure { code, message }
    }
}

/// Parses the sub-code of a system error message, e.g. `"E2002:transaction expired"`.
fn system_subcode(message: &str) -> Option<u32> {
    message.get(1..5)?.parse().ok()
}
