use super::ChannelId;
use crate::encoding::{
    self,
    types::{Address, U256},
};
use serde::Serialize;

/// Identifies the kind of ledger (e.g. an EVM chain, a simulated ledger).
pub type BackendId = u32;

/// Identifies one ledger of a backend, usually its chain id.
pub type LedgerId = U256;

/// Key used to find the adjudicator and funder responsible for an asset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerBackendId {
    pub backend: BackendId,
    pub ledger: LedgerId,
}

impl core::fmt::Display for LedgerBackendId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.backend, self.ledger)
    }
}

/// Uniquely identifies an Asset by backend + chain + AssetHolder.
#[derive(Serialize, Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Asset {
    pub backend: BackendId,
    pub chain_id: U256,
    pub holder: Address,
}

impl Asset {
    pub fn ledger(&self) -> LedgerBackendId {
        LedgerBackendId {
            backend: self.backend,
            ledger: self.chain_id,
        }
    }
}

/// Parameters for this channel, exchanged during channel proposal and sent
/// on-chain during a dispute.
///
/// The fields can't be changed after construction, the cached id would no
/// longer match.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    challenge_duration: u64,
    nonce: U256,
    participants: Vec<Address>,
    app: Address,
    ledger_channel: bool,
    virtual_channel: bool,
    #[serde(skip)]
    id: ChannelId,
}

impl Params {
    pub fn new(
        challenge_duration: u64,
        nonce: U256,
        participants: Vec<Address>,
        app: Address,
        ledger_channel: bool,
        virtual_channel: bool,
    ) -> Result<Self, encoding::Error> {
        let mut params = Self {
            challenge_duration,
            nonce,
            participants,
            app,
            ledger_channel,
            virtual_channel,
            id: ChannelId::default(),
        };
        // `id` is skipped by the serializer, so hashing the placeholder is fine.
        params.id = encoding::to_hash(&params)?;
        Ok(params)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn challenge_duration(&self) -> u64 {
        self.challenge_duration
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn participants(&self) -> &[Address] {
        &self.participants
    }

    pub fn num_parts(&self) -> usize {
        self.participants.len()
    }

    pub fn app(&self) -> Address {
        self.app
    }

    /// Channels without an app only allow cooperative updates, they can't be
    /// progressed on-chain.
    pub fn has_app(&self) -> bool {
        !self.app.is_zero()
    }

    pub fn ledger_channel(&self) -> bool {
        self.ledger_channel
    }

    pub fn virtual_channel(&self) -> bool {
        self.virtual_channel
    }
}
