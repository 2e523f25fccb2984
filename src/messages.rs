//! Messages exchanged between the participants of a channel.
//!
//! The types in here are the checked, in-memory representation. The protobuf
//! types in [crate::wire::proto] are converted with `TryFrom`/`From`.

mod channel;
mod proposal;
mod sync;
mod update;

#[cfg(test)]
mod tests;

pub use proposal::{
    BaseChannelProposal, ChannelProposal, ChannelProposalAcc, ChannelProposalRej, ProposalKind,
};
pub use sync::ChannelSyncMsg;
pub use update::{
    ChannelUpdate, ChannelUpdateAcc, ChannelUpdateMsg, ChannelUpdateRej, UpdateProposal,
    VirtualChannelFundingProposalMsg, VirtualChannelSettlementProposalMsg,
};

use crate::{
    channel::{ChannelId, MachineError},
    encoding,
};
use thiserror::Error;

/// Off-chain network identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub Vec<u8>);

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.as_bytes().to_vec())
    }
}

impl core::fmt::Display for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("byte length of {0} does not match")]
    ByteLengthMissmatch(&'static str),
    #[error("expected {0} to be set")]
    ExptectedSome(&'static str),
    #[error("number of participants does not match")]
    ParticipantSizeMissmatch,
    #[error("channel id {expected} does not match the params ({actual})")]
    ChannelIdMismatch {
        expected: ChannelId,
        actual: ChannelId,
    },
    #[error(transparent)]
    Phase(#[from] MachineError),
    #[error(transparent)]
    Encoding(#[from] encoding::Error),
}

/// Messages sent between participants of a channel.
#[derive(Debug, Clone)]
pub enum ParticipantMessage {
    ChannelProposal(ChannelProposal),
    ProposalAccepted(ChannelProposalAcc),
    ProposalRejected(ChannelProposalRej),
    ChannelUpdate(UpdateProposal),
    ChannelUpdateAccepted(ChannelUpdateAcc),
    ChannelUpdateRejected(ChannelUpdateRej),
    ChannelSync(ChannelSyncMsg),
}

impl ParticipantMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ParticipantMessage::ChannelProposal(_) => "ChannelProposal",
            ParticipantMessage::ProposalAccepted(_) => "ChannelProposalAcc",
            ParticipantMessage::ProposalRejected(_) => "ChannelProposalRej",
            ParticipantMessage::ChannelUpdate(_) => "ChannelUpdate",
            ParticipantMessage::ChannelUpdateAccepted(_) => "ChannelUpdateAcc",
            ParticipantMessage::ChannelUpdateRejected(_) => "ChannelUpdateRej",
            ParticipantMessage::ChannelSync(_) => "ChannelSync",
        }
    }
}

/// A message with its routing information.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Identity,
    pub recipient: Identity,
    pub msg: ParticipantMessage,
}
