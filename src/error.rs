use crate::{
    adjudicator::{AdjudicatorError, FundingError},
    channel::{ChannelId, InvalidUpdate, MachineError},
    encoding,
    matcher::MatchError,
    persistence::PersistenceError,
    sig,
    watcher::WatcherError,
    wire::WireError,
};
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("peer rejected: {0}")]
    PeerRejected(String),
    #[error("request timed out")]
    RequestTimedOut,
    /// Another update of the channel is in progress.
    #[error("channel is busy")]
    ChannelBusy,
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    /// The funds of a sub-channel can only be released off-chain while the
    /// parent is off-chain. Otherwise they are withdrawn through the
    /// parent's dispute.
    #[error("parent channel {0} is on-chain")]
    ParentOnChain(ChannelId),
    #[error("channel has no app")]
    NoApp,
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Adjudicator(#[from] AdjudicatorError),
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Sig(#[from] sig::Error),
    #[error(transparent)]
    Encoding(#[from] encoding::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl From<InvalidUpdate> for Error {
    fn from(e: InvalidUpdate) -> Self {
        Error::Machine(e.into())
    }
}

impl Error {
    /// A transaction was sent but not mined in time.
    pub fn is_tx_timed_out(&self) -> bool {
        matches!(
            self,
            Error::Adjudicator(AdjudicatorError::TxTimedOut(_))
                | Error::Funding(FundingError::TxTimedOut(_))
        )
    }

    pub fn is_chain_not_reachable(&self) -> bool {
        matches!(
            self,
            Error::Adjudicator(AdjudicatorError::ChainNotReachable(_))
                | Error::Funding(FundingError::ChainNotReachable(_))
                | Error::Watcher(WatcherError::Adjudicator(
                    AdjudicatorError::ChainNotReachable(_)
                ))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ledger_errors() {
        let timed_out: Error = AdjudicatorError::tx_timed_out("withdraw").into();
        assert!(timed_out.is_tx_timed_out());
        assert!(!timed_out.is_chain_not_reachable());

        let down: Error = FundingError::ChainNotReachable("rpc".into()).into();
        assert!(down.is_chain_not_reachable());

        let watcher: Error = WatcherError::from(AdjudicatorError::chain_not_reachable("rpc")).into();
        assert!(watcher.is_chain_not_reachable());

        let invalid: Error = InvalidUpdate::LockedChanged.into();
        assert!(matches!(
            invalid,
            Error::Machine(MachineError::InvalidUpdate(InvalidUpdate::LockedChanged))
        ));
        assert!(!Error::ChannelBusy.is_tx_timed_out());
    }
}
