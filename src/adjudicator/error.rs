use crate::channel::{ChannelId, Idx, LedgerBackendId};
use thiserror::Error;

pub type AdjudicatorResult<T> = Result<T, AdjudicatorError>;

#[derive(Debug, Clone, Error)]
pub enum AdjudicatorError {
    /// The transaction was sent but not included in time. It may still be
    /// included later.
    #[error("transaction timed out: {0}")]
    TxTimedOut(String),

    /// The ledger could not be contacted, nothing was sent.
    #[error("chain not reachable: {0}")]
    ChainNotReachable(String),

    #[error("no adjudicator for ledger {0}")]
    UnknownLedger(LedgerBackendId),

    /// The ledger refused the transaction.
    #[error("rejected by the ledger: {0}")]
    Rejected(String),

    #[error("channel {0} is not registered")]
    NotRegistered(ChannelId),

    #[error("challenge period of {0} has not elapsed")]
    TimeoutNotElapsed(ChannelId),

    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl AdjudicatorError {
    pub fn tx_timed_out(reason: impl Into<String>) -> Self {
        Self::TxTimedOut(reason.into())
    }

    pub fn chain_not_reachable(reason: impl Into<String>) -> Self {
        Self::ChainNotReachable(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Errors after which retrying the same call makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdjudicatorError::TxTimedOut(_) | AdjudicatorError::ChainNotReachable(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum FundingError {
    /// Some participants did not deposit in time.
    #[error("participants {missing:?} did not fund on ledger {ledger}")]
    Timeout {
        ledger: LedgerBackendId,
        missing: Vec<Idx>,
    },

    #[error("no funder for ledger {0}")]
    UnknownLedger(LedgerBackendId),

    #[error("transaction timed out: {0}")]
    TxTimedOut(String),

    #[error("chain not reachable: {0}")]
    ChainNotReachable(String),

    #[error("deposit rejected: {0}")]
    Rejected(String),
}
