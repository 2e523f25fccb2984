use super::{
    channel::{address_from, hash_from, index_map_from, index_map_into},
    ConversionError, Identity,
};
use crate::{
    channel::{Allocation, Balances, ChannelId, Idx, NonceShare},
    encoding::types::{Address, Bytes32, Hash},
    wire::proto,
};
use rand::Rng;

/// Fields common to all kinds of channel proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseChannelProposal {
    pub proposal_id: Hash,
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    /// Zero address for payment channels.
    pub app: Address,
    pub init_data: Vec<u8>,
    pub init_bals: Allocation,
    /// How much each participant has to deposit, `[asset][participant]`.
    pub funding_agreement: Balances,
}

impl BaseChannelProposal {
    fn new(challenge_duration: u64, app: Address, init_data: Vec<u8>, init_bals: Allocation) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            proposal_id: rng.gen(),
            challenge_duration,
            nonce_share: rng.gen(),
            app,
            init_data,
            funding_agreement: init_bals.balances.clone(),
            init_bals,
        }
    }
}

/// Where the funds of the proposed channel come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalKind {
    /// Funded on the ledgers of its assets.
    Ledger,
    /// Funded from an existing channel between the same participants.
    Sub { parent: ChannelId },
    /// Funded from one parent channel per participant, each shared with the
    /// same intermediary.
    ///
    /// `parents[i]` is the parent of participant `i`, `index_maps[i]` maps
    /// the virtual channel participants to the indices in `parents[i]`.
    Virtual {
        parents: Vec<ChannelId>,
        index_maps: Vec<Vec<Idx>>,
    },
}

/// Channel configuration (also exchanged over the network)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposal {
    pub base: BaseChannelProposal,
    /// Address of the proposer inside the channel.
    pub participant: Address,
    /// Network identities of all participants, the proposer first.
    pub peers: Vec<Identity>,
    pub kind: ProposalKind,
}

impl ChannelProposal {
    /// Proposal with a random proposal id and nonce share.
    pub fn ledger(
        challenge_duration: u64,
        participant: Address,
        init_bals: Allocation,
        peers: Vec<Identity>,
    ) -> Self {
        Self {
            base: BaseChannelProposal::new(challenge_duration, Address::default(), vec![], init_bals),
            participant,
            peers,
            kind: ProposalKind::Ledger,
        }
    }

    pub fn sub(
        parent: ChannelId,
        challenge_duration: u64,
        participant: Address,
        init_bals: Allocation,
        peers: Vec<Identity>,
    ) -> Self {
        Self {
            base: BaseChannelProposal::new(challenge_duration, Address::default(), vec![], init_bals),
            participant,
            peers,
            kind: ProposalKind::Sub { parent },
        }
    }

    pub fn virtual_channel(
        parents: Vec<ChannelId>,
        index_maps: Vec<Vec<Idx>>,
        challenge_duration: u64,
        participant: Address,
        init_bals: Allocation,
        peers: Vec<Identity>,
    ) -> Self {
        Self {
            base: BaseChannelProposal::new(challenge_duration, Address::default(), vec![], init_bals),
            participant,
            peers,
            kind: ProposalKind::Virtual {
                parents,
                index_maps,
            },
        }
    }

    /// Sets an app, which allows progressing the channel on-chain.
    pub fn with_app(mut self, app: Address, init_data: Vec<u8>) -> Self {
        self.base.app = app;
        self.base.init_data = init_data;
        self
    }

    pub fn proposal_id(&self) -> Hash {
        self.base.proposal_id
    }
}

/// Message sent when a participant accepts the proposed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposalAcc {
    pub proposal_id: Hash,
    pub nonce_share: NonceShare,
    pub participant: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposalRej {
    pub proposal_id: Hash,
    pub reason: String,
}

impl TryFrom<proto::ChannelProposalMsg> for ChannelProposal {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelProposalMsg) -> Result<Self, Self::Error> {
        use proto::channel_proposal_msg::Kind;

        let base = value
            .base_channel_proposal
            .ok_or(ConversionError::ExptectedSome("base_channel_proposal"))?;
        let init_bals = base
            .init_bals
            .ok_or(ConversionError::ExptectedSome("init_bals"))?;
        let funding_agreement = base
            .funding_agreement
            .ok_or(ConversionError::ExptectedSome("funding_agreement"))?;

        let kind = match value.kind.ok_or(ConversionError::ExptectedSome("kind"))? {
            Kind::Ledger(_) => ProposalKind::Ledger,
            Kind::SubParent(parent) => ProposalKind::Sub {
                parent: hash_from(parent, "parent")?,
            },
            Kind::Virtual(v) => ProposalKind::Virtual {
                parents: v
                    .parents
                    .into_iter()
                    .map(|p| hash_from(p, "parent"))
                    .collect::<Result<_, _>>()?,
                index_maps: v.index_maps.into_iter().map(index_map_from).collect(),
            },
        };

        Ok(ChannelProposal {
            base: BaseChannelProposal {
                proposal_id: hash_from(base.proposal_id, "proposal_id")?,
                challenge_duration: base.challenge_duration,
                nonce_share: Bytes32::try_from(base.nonce_share.as_slice())
                    .or(Err(ConversionError::ByteLengthMissmatch("nonce_share")))?,
                app: address_from(base.app, "app")?,
                init_data: base.init_data,
                init_bals: init_bals.try_into()?,
                funding_agreement: funding_agreement.try_into()?,
            },
            participant: address_from(value.participant, "participant")?,
            peers: value.peers.into_iter().map(Identity).collect(),
            kind,
        })
    }
}

impl From<&ChannelProposal> for proto::ChannelProposalMsg {
    fn from(value: &ChannelProposal) -> Self {
        use proto::channel_proposal_msg::Kind;

        let kind = match &value.kind {
            ProposalKind::Ledger => Kind::Ledger(proto::LedgerKind {}),
            ProposalKind::Sub { parent } => Kind::SubParent(parent.0.to_vec()),
            ProposalKind::Virtual {
                parents,
                index_maps,
            } => Kind::Virtual(proto::VirtualKind {
                parents: parents.iter().map(|p| p.0.to_vec()).collect(),
                index_maps: index_maps.iter().map(|m| index_map_into(m)).collect(),
            }),
        };

        Self {
            base_channel_proposal: Some(proto::BaseChannelProposal {
                proposal_id: value.base.proposal_id.0.to_vec(),
                challenge_duration: value.base.challenge_duration,
                nonce_share: value.base.nonce_share.0.to_vec(),
                app: value.base.app.0.to_vec(),
                init_data: value.base.init_data.clone(),
                init_bals: Some((&value.base.init_bals).into()),
                funding_agreement: Some((&value.base.funding_agreement).into()),
            }),
            participant: value.participant.0.to_vec(),
            peers: value.peers.iter().map(|p| p.0.clone()).collect(),
            kind: Some(kind),
        }
    }
}

impl TryFrom<proto::ChannelProposalAccMsg> for ChannelProposalAcc {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelProposalAccMsg) -> Result<Self, Self::Error> {
        Ok(ChannelProposalAcc {
            proposal_id: hash_from(value.proposal_id, "proposal_id")?,
            nonce_share: Bytes32::try_from(value.nonce_share.as_slice())
                .or(Err(ConversionError::ByteLengthMissmatch("nonce_share")))?,
            participant: address_from(value.participant, "participant")?,
        })
    }
}

impl From<&ChannelProposalAcc> for proto::ChannelProposalAccMsg {
    fn from(value: &ChannelProposalAcc) -> Self {
        Self {
            proposal_id: value.proposal_id.0.to_vec(),
            nonce_share: value.nonce_share.0.to_vec(),
            participant: value.participant.0.to_vec(),
        }
    }
}

impl TryFrom<proto::ChannelProposalRejMsg> for ChannelProposalRej {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelProposalRejMsg) -> Result<Self, Self::Error> {
        Ok(ChannelProposalRej {
            proposal_id: hash_from(value.proposal_id, "proposal_id")?,
            reason: value.reason,
        })
    }
}

impl From<&ChannelProposalRej> for proto::ChannelProposalRejMsg {
    fn from(value: &ChannelProposalRej) -> Self {
        Self {
            proposal_id: value.proposal_id.0.to_vec(),
            reason: value.reason.clone(),
        }
    }
}
