//! Protobuf representation of the participant messages.
//!
//! Field numbers are part of the wire format, don't reuse them.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: Vec<u8>,
    #[prost(oneof = "envelope::Msg", tags = "3, 4, 5, 6, 7, 8, 9")]
    pub msg: Option<envelope::Msg>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "3")]
        ChannelProposalMsg(super::ChannelProposalMsg),
        #[prost(message, tag = "4")]
        ChannelProposalAccMsg(super::ChannelProposalAccMsg),
        #[prost(message, tag = "5")]
        ChannelProposalRejMsg(super::ChannelProposalRejMsg),
        #[prost(message, tag = "6")]
        UpdateProposalMsg(super::UpdateProposalMsg),
        #[prost(message, tag = "7")]
        ChannelUpdateAccMsg(super::ChannelUpdateAccMsg),
        #[prost(message, tag = "8")]
        ChannelUpdateRejMsg(super::ChannelUpdateRejMsg),
        #[prost(message, tag = "9")]
        ChannelSyncMsg(super::ChannelSyncMsg),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Params {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub challenge_duration: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub parts: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "5")]
    pub app: Vec<u8>,
    #[prost(bool, tag = "6")]
    pub ledger_channel: bool,
    #[prost(bool, tag = "7")]
    pub virtual_channel: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Asset {
    #[prost(uint32, tag = "1")]
    pub backend: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub chain_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub holder: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Balance {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub balance: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Balances {
    #[prost(message, repeated, tag = "1")]
    pub balances: Vec<Balance>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexMap {
    #[prost(uint32, repeated, tag = "1")]
    pub index_map: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubAlloc {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub bals: Option<Balance>,
    #[prost(message, optional, tag = "3")]
    pub index_map: Option<IndexMap>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Allocation {
    #[prost(message, repeated, tag = "1")]
    pub assets: Vec<Asset>,
    #[prost(message, optional, tag = "2")]
    pub balances: Option<Balances>,
    #[prost(message, repeated, tag = "3")]
    pub locked: Vec<SubAlloc>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct State {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(message, optional, tag = "3")]
    pub allocation: Option<Allocation>,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "5")]
    pub is_final: bool,
}

/// Missing signatures are encoded as empty bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Transaction {
    #[prost(message, optional, tag = "1")]
    pub state: Option<State>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub sigs: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BaseChannelProposal {
    #[prost(bytes = "vec", tag = "1")]
    pub proposal_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub challenge_duration: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub nonce_share: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub app: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub init_data: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub init_bals: Option<Allocation>,
    #[prost(message, optional, tag = "7")]
    pub funding_agreement: Option<Balances>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VirtualKind {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub parents: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub index_maps: Vec<IndexMap>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LedgerKind {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub base_channel_proposal: Option<BaseChannelProposal>,
    #[prost(bytes = "vec", tag = "2")]
    pub participant: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub peers: Vec<Vec<u8>>,
    #[prost(oneof = "channel_proposal_msg::Kind", tags = "4, 5, 6")]
    pub kind: Option<channel_proposal_msg::Kind>,
}

pub mod channel_proposal_msg {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "4")]
        Ledger(super::LedgerKind),
        #[prost(bytes, tag = "5")]
        SubParent(Vec<u8>),
        #[prost(message, tag = "6")]
        Virtual(super::VirtualKind),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelProposalAccMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub proposal_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce_share: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub participant: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelProposalRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub proposal_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdate {
    #[prost(message, optional, tag = "1")]
    pub state: Option<State>,
    #[prost(uint32, tag = "2")]
    pub actor_idx: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdateMsg {
    #[prost(message, optional, tag = "1")]
    pub channel_update: Option<ChannelUpdate>,
    #[prost(bytes = "vec", tag = "2")]
    pub sig: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubChannelUpdateMsg {
    #[prost(message, optional, tag = "1")]
    pub base: Option<ChannelUpdateMsg>,
    #[prost(bytes = "vec", tag = "2")]
    pub sub: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VirtualChannelFundingProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub base: Option<ChannelUpdateMsg>,
    #[prost(message, optional, tag = "2")]
    pub initial: Option<Transaction>,
    #[prost(message, optional, tag = "3")]
    pub params: Option<Params>,
    #[prost(message, optional, tag = "4")]
    pub index_map: Option<IndexMap>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VirtualChannelSettlementProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub base: Option<ChannelUpdateMsg>,
    #[prost(message, optional, tag = "2")]
    pub final_tx: Option<Transaction>,
    #[prost(message, optional, tag = "3")]
    pub params: Option<Params>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateProposalMsg {
    #[prost(oneof = "update_proposal_msg::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<update_proposal_msg::Kind>,
}

pub mod update_proposal_msg {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Plain(super::ChannelUpdateMsg),
        #[prost(message, tag = "2")]
        SubChannelFunding(super::SubChannelUpdateMsg),
        #[prost(message, tag = "3")]
        SubChannelSettlement(super::SubChannelUpdateMsg),
        #[prost(message, tag = "4")]
        VirtualFunding(super::VirtualChannelFundingProposalMsg),
        #[prost(message, tag = "5")]
        VirtualSettlement(super::VirtualChannelSettlementProposalMsg),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdateAccMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub sig: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelUpdateRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(string, tag = "3")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelSyncMsg {
    #[prost(uint32, tag = "1")]
    pub phase: u32,
    #[prost(message, optional, tag = "2")]
    pub current: Option<Transaction>,
}
