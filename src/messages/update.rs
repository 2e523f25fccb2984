use super::{
    channel::{hash_from, index_map_from, index_map_into, signature_from},
    ConversionError,
};
use crate::{
    channel::{ChannelId, Idx, Params, State, Transaction},
    encoding::types::{Hash, Signature},
    wire::proto,
};

/// A proposed next state and who proposed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub state: State,
    pub actor_idx: Idx,
}

/// [ChannelUpdate] with the signature of the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdateMsg {
    pub update: ChannelUpdate,
    pub sig: Signature,
}

impl ChannelUpdateMsg {
    pub fn channel(&self) -> ChannelId {
        self.update.state.id()
    }

    pub fn version(&self) -> u64 {
        self.update.state.version()
    }
}

/// Asks the intermediary to lock funds for a virtual channel in the parent
/// channel the proposal is sent on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannelFundingProposalMsg {
    pub base: ChannelUpdateMsg,
    /// Fully signed initial state of the virtual channel.
    pub initial: Transaction,
    pub params: Params,
    /// Maps the virtual channel participants to the parent channel.
    pub index_map: Vec<Idx>,
}

/// Asks the intermediary to release the funds of a finished virtual channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannelSettlementProposalMsg {
    pub base: ChannelUpdateMsg,
    /// Fully signed final state of the virtual channel.
    pub final_tx: Transaction,
    pub params: Params,
}

/// Every kind of update that can be proposed on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateProposal {
    Plain(ChannelUpdateMsg),
    /// Locks funds for the sub-channel `sub`.
    SubChannelFunding { base: ChannelUpdateMsg, sub: ChannelId },
    /// Releases the funds of the final sub-channel `sub`.
    SubChannelSettlement { base: ChannelUpdateMsg, sub: ChannelId },
    VirtualFunding(VirtualChannelFundingProposalMsg),
    VirtualSettlement(VirtualChannelSettlementProposalMsg),
}

impl UpdateProposal {
    pub fn base(&self) -> &ChannelUpdateMsg {
        match self {
            UpdateProposal::Plain(base)
            | UpdateProposal::SubChannelFunding { base, .. }
            | UpdateProposal::SubChannelSettlement { base, .. } => base,
            UpdateProposal::VirtualFunding(msg) => &msg.base,
            UpdateProposal::VirtualSettlement(msg) => &msg.base,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.base().channel()
    }

    pub fn version(&self) -> u64 {
        self.base().version()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateProposal::Plain(_) => "plain",
            UpdateProposal::SubChannelFunding { .. } => "sub-channel funding",
            UpdateProposal::SubChannelSettlement { .. } => "sub-channel settlement",
            UpdateProposal::VirtualFunding(_) => "virtual funding",
            UpdateProposal::VirtualSettlement(_) => "virtual settlement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdateAcc {
    pub channel: Hash,
    pub version: u64,
    pub sig: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdateRej {
    pub channel: Hash,
    pub version: u64,
    pub reason: String,
}

impl TryFrom<proto::ChannelUpdateMsg> for ChannelUpdateMsg {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelUpdateMsg) -> Result<Self, Self::Error> {
        let update = value
            .channel_update
            .ok_or(ConversionError::ExptectedSome("channel_update"))?;

        Ok(Self {
            update: ChannelUpdate {
                state: update
                    .state
                    .ok_or(ConversionError::ExptectedSome("state"))?
                    .try_into()?,
                actor_idx: update.actor_idx as Idx,
            },
            sig: signature_from(value.sig)?,
        })
    }
}

impl From<&ChannelUpdateMsg> for proto::ChannelUpdateMsg {
    fn from(value: &ChannelUpdateMsg) -> Self {
        Self {
            channel_update: Some(proto::ChannelUpdate {
                state: Some((&value.update.state).into()),
                actor_idx: value.update.actor_idx as u32,
            }),
            sig: value.sig.0.to_vec(),
        }
    }
}

fn base_from(base: Option<proto::ChannelUpdateMsg>) -> Result<ChannelUpdateMsg, ConversionError> {
    base.ok_or(ConversionError::ExptectedSome("base"))?
        .try_into()
}

impl TryFrom<proto::UpdateProposalMsg> for UpdateProposal {
    type Error = ConversionError;

    fn try_from(value: proto::UpdateProposalMsg) -> Result<Self, Self::Error> {
        use proto::update_proposal_msg::Kind;

        Ok(match value.kind.ok_or(ConversionError::ExptectedSome("kind"))? {
            Kind::Plain(msg) => UpdateProposal::Plain(msg.try_into()?),
            Kind::SubChannelFunding(msg) => UpdateProposal::SubChannelFunding {
                base: base_from(msg.base)?,
                sub: hash_from(msg.sub, "sub")?,
            },
            Kind::SubChannelSettlement(msg) => UpdateProposal::SubChannelSettlement {
                base: base_from(msg.base)?,
                sub: hash_from(msg.sub, "sub")?,
            },
            Kind::VirtualFunding(msg) => {
                UpdateProposal::VirtualFunding(VirtualChannelFundingProposalMsg {
                    base: base_from(msg.base)?,
                    initial: msg
                        .initial
                        .ok_or(ConversionError::ExptectedSome("initial"))?
                        .try_into()?,
                    params: msg
                        .params
                        .ok_or(ConversionError::ExptectedSome("params"))?
                        .try_into()?,
                    index_map: index_map_from(
                        msg.index_map
                            .ok_or(ConversionError::ExptectedSome("index_map"))?,
                    ),
                })
            }
            Kind::VirtualSettlement(msg) => {
                UpdateProposal::VirtualSettlement(VirtualChannelSettlementProposalMsg {
                    base: base_from(msg.base)?,
                    final_tx: msg
                        .final_tx
                        .ok_or(ConversionError::ExptectedSome("final_tx"))?
                        .try_into()?,
                    params: msg
                        .params
                        .ok_or(ConversionError::ExptectedSome("params"))?
                        .try_into()?,
                })
            }
        })
    }
}

impl From<&UpdateProposal> for proto::UpdateProposalMsg {
    fn from(value: &UpdateProposal) -> Self {
        use proto::update_proposal_msg::Kind;

        let kind = match value {
            UpdateProposal::Plain(msg) => Kind::Plain(msg.into()),
            UpdateProposal::SubChannelFunding { base, sub } => {
                Kind::SubChannelFunding(proto::SubChannelUpdateMsg {
                    base: Some(base.into()),
                    sub: sub.0.to_vec(),
                })
            }
            UpdateProposal::SubChannelSettlement { base, sub } => {
                Kind::SubChannelSettlement(proto::SubChannelUpdateMsg {
                    base: Some(base.into()),
                    sub: sub.0.to_vec(),
                })
            }
            UpdateProposal::VirtualFunding(msg) => {
                Kind::VirtualFunding(proto::VirtualChannelFundingProposalMsg {
                    base: Some((&msg.base).into()),
                    initial: Some((&msg.initial).into()),
                    params: Some((&msg.params).into()),
                    index_map: Some(index_map_into(&msg.index_map)),
                })
            }
            UpdateProposal::VirtualSettlement(msg) => {
                Kind::VirtualSettlement(proto::VirtualChannelSettlementProposalMsg {
                    base: Some((&msg.base).into()),
                    final_tx: Some((&msg.final_tx).into()),
                    params: Some((&msg.params).into()),
                })
            }
        };
        Self { kind: Some(kind) }
    }
}

impl TryFrom<proto::ChannelUpdateAccMsg> for ChannelUpdateAcc {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelUpdateAccMsg) -> Result<Self, Self::Error> {
        Ok(ChannelUpdateAcc {
            channel: hash_from(value.channel_id, "channel_id")?,
            version: value.version,
            sig: signature_from(value.sig)?,
        })
    }
}

impl From<&ChannelUpdateAcc> for proto::ChannelUpdateAccMsg {
    fn from(value: &ChannelUpdateAcc) -> Self {
        Self {
            channel_id: value.channel.0.to_vec(),
            version: value.version,
            sig: value.sig.0.to_vec(),
        }
    }
}

impl TryFrom<proto::ChannelUpdateRejMsg> for ChannelUpdateRej {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelUpdateRejMsg) -> Result<Self, Self::Error> {
        Ok(ChannelUpdateRej {
            channel: hash_from(value.channel_id, "channel_id")?,
            version: value.version,
            reason: value.reason,
        })
    }
}

impl From<&ChannelUpdateRej> for proto::ChannelUpdateRejMsg {
    fn from(value: &ChannelUpdateRej) -> Self {
        Self {
            channel_id: value.channel.0.to_vec(),
            version: value.version,
            reason: value.reason.clone(),
        }
    }
}
