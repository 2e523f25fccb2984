//! Interfaces to the on-chain side of the protocol.
//!
//! Implementations exist per ledger backend. [crate::multi] combines them for
//! channels with assets on several ledgers, [crate::sim] is an in-memory
//! ledger.

mod error;
mod event;

pub use error::{AdjudicatorError, AdjudicatorResult, FundingError};
pub use event::{AdjudicatorEvent, Timeout};

use crate::{
    channel::{Balances, ChannelId, Idx, Params, SignedState, State, Transaction},
    encoding::types::{Address, Signature},
};
use async_trait::async_trait;

/// Everything needed to register or withdraw a channel.
#[derive(Debug, Clone)]
pub struct AdjudicatorReq {
    pub params: Params,
    /// Receiver of the withdrawn funds.
    pub acc: Address,
    pub tx: Transaction,
    pub idx: Idx,
    /// Set if the other participant is expected to send the transaction, the
    /// backend may then skip it if it was already sent.
    pub secondary: bool,
}

/// On-chain progression of an app channel after its registration timed out.
#[derive(Debug, Clone)]
pub struct ProgressReq {
    pub req: AdjudicatorReq,
    pub new_state: State,
    /// Signature of the actor (`req.idx`) over `new_state`.
    pub sig: Signature,
}

#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Params,
    pub state: State,
    pub idx: Idx,
    /// Amount every participant has to deposit, `[asset][participant]`.
    pub agreement: Balances,
}

/// Deposits the funds of a new ledger channel.
#[async_trait]
pub trait Funder: Send + Sync {
    /// Deposits our part of the agreement and waits until all participants
    /// deposited theirs.
    async fn fund(&self, req: &FundingReq) -> Result<(), FundingError>;
}

#[async_trait]
pub trait Adjudicator: Send + Sync {
    /// Registers `req.tx` together with the states of all sub-channels locked
    /// in it.
    ///
    /// Registering a version that is not newer than the registered one is
    /// not an error.
    async fn register(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()>;

    async fn progress(&self, req: &ProgressReq) -> AdjudicatorResult<()>;

    /// Concludes the channel (if not done yet) and withdraws the funds of
    /// participant `req.idx`.
    async fn withdraw(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()>;

    /// Events concerning channel `id`, starting with its current on-chain
    /// registration if there is one.
    async fn subscribe(&self, id: ChannelId) -> AdjudicatorResult<Box<dyn AdjudicatorSubscription>>;
}

#[async_trait]
pub trait AdjudicatorSubscription: Send {
    /// Next event, `None` once the subscription ended.
    ///
    /// Must be cancel-safe: dropping the future loses no event.
    async fn next(&mut self) -> Option<AdjudicatorResult<AdjudicatorEvent>>;

    async fn close(&mut self);
}
