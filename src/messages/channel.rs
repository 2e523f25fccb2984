//! Conversions of the channel data model from and to protobuf.

use super::ConversionError;
use crate::{
    channel::{Allocation, Asset, Balances, Idx, Params, State, SubAlloc, Transaction},
    encoding::types::{Address, Hash, Signature, U256},
    wire::proto,
};

pub(crate) fn hash_from(bytes: Vec<u8>, field: &'static str) -> Result<Hash, ConversionError> {
    Hash::try_from(bytes.as_slice()).or(Err(ConversionError::ByteLengthMissmatch(field)))
}

pub(crate) fn address_from(bytes: Vec<u8>, field: &'static str) -> Result<Address, ConversionError> {
    Address::try_from(bytes.as_slice()).or(Err(ConversionError::ByteLengthMissmatch(field)))
}

pub(crate) fn signature_from(bytes: Vec<u8>) -> Result<Signature, ConversionError> {
    Signature::try_from(bytes.as_slice()).or(Err(ConversionError::ByteLengthMissmatch("sig")))
}

pub(crate) fn u256_from(bytes: &[u8], field: &'static str) -> Result<U256, ConversionError> {
    // from_big_endian panics on more than 32 bytes
    if bytes.len() > 32 {
        return Err(ConversionError::ByteLengthMissmatch(field));
    }
    Ok(U256::from_big_endian(bytes))
}

pub(crate) fn index_map_from(value: proto::IndexMap) -> Vec<Idx> {
    value.index_map.into_iter().map(|i| i as Idx).collect()
}

pub(crate) fn index_map_into(value: &[Idx]) -> proto::IndexMap {
    proto::IndexMap {
        index_map: value.iter().map(|&i| i as u32).collect(),
    }
}

impl TryFrom<proto::Params> for Params {
    type Error = ConversionError;

    fn try_from(value: proto::Params) -> Result<Self, Self::Error> {
        let participants = value
            .parts
            .into_iter()
            .map(|p| address_from(p, "participant"))
            .collect::<Result<Vec<_>, _>>()?;

        let params = Params::new(
            value.challenge_duration,
            u256_from(&value.nonce, "nonce")?,
            participants,
            address_from(value.app, "app")?,
            value.ledger_channel,
            value.virtual_channel,
        )?;

        // The id is sent along, it has to match what we compute.
        let expected = hash_from(value.id, "id")?;
        if expected != params.id() {
            return Err(ConversionError::ChannelIdMismatch {
                expected,
                actual: params.id(),
            });
        }
        Ok(params)
    }
}

impl From<&Params> for proto::Params {
    fn from(value: &Params) -> Self {
        Self {
            id: value.id().0.to_vec(),
            challenge_duration: value.challenge_duration(),
            nonce: value.nonce().to_be_bytes().to_vec(),
            parts: value.participants().iter().map(|a| a.0.to_vec()).collect(),
            app: value.app().0.to_vec(),
            ledger_channel: value.ledger_channel(),
            virtual_channel: value.virtual_channel(),
        }
    }
}

impl TryFrom<proto::Asset> for Asset {
    type Error = ConversionError;

    fn try_from(value: proto::Asset) -> Result<Self, Self::Error> {
        Ok(Asset {
            backend: value.backend,
            chain_id: u256_from(&value.chain_id, "chain_id")?,
            holder: address_from(value.holder, "holder")?,
        })
    }
}

impl From<&Asset> for proto::Asset {
    fn from(value: &Asset) -> Self {
        Self {
            backend: value.backend,
            chain_id: value.chain_id.to_be_bytes().to_vec(),
            holder: value.holder.0.to_vec(),
        }
    }
}

fn balance_from(value: proto::Balance) -> Result<Vec<U256>, ConversionError> {
    value
        .balance
        .iter()
        .map(|b| u256_from(b, "balance"))
        .collect()
}

fn balance_into(value: &[U256]) -> proto::Balance {
    proto::Balance {
        balance: value.iter().map(|b| b.to_be_bytes().to_vec()).collect(),
    }
}

impl TryFrom<proto::Balances> for Balances {
    type Error = ConversionError;

    fn try_from(value: proto::Balances) -> Result<Self, Self::Error> {
        Ok(Balances(
            value
                .balances
                .into_iter()
                .map(balance_from)
                .collect::<Result<_, _>>()?,
        ))
    }
}

impl From<&Balances> for proto::Balances {
    fn from(value: &Balances) -> Self {
        Self {
            balances: value.0.iter().map(|b| balance_into(b)).collect(),
        }
    }
}

impl TryFrom<proto::SubAlloc> for SubAlloc {
    type Error = ConversionError;

    fn try_from(value: proto::SubAlloc) -> Result<Self, Self::Error> {
        Ok(SubAlloc {
            id: hash_from(value.id, "sub_alloc.id")?,
            bals: balance_from(value.bals.ok_or(ConversionError::ExptectedSome("sub_alloc.bals"))?)?,
            index_map: index_map_from(
                value
                    .index_map
                    .ok_or(ConversionError::ExptectedSome("sub_alloc.index_map"))?,
            ),
        })
    }
}

impl From<&SubAlloc> for proto::SubAlloc {
    fn from(value: &SubAlloc) -> Self {
        Self {
            id: value.id.0.to_vec(),
            bals: Some(balance_into(&value.bals)),
            index_map: Some(index_map_into(&value.index_map)),
        }
    }
}

impl TryFrom<proto::Allocation> for Allocation {
    type Error = ConversionError;

    fn try_from(value: proto::Allocation) -> Result<Self, Self::Error> {
        Ok(Allocation {
            assets: value
                .assets
                .into_iter()
                .map(Asset::try_from)
                .collect::<Result<_, _>>()?,
            balances: value
                .balances
                .ok_or(ConversionError::ExptectedSome("balances"))?
                .try_into()?,
            locked: value
                .locked
                .into_iter()
                .map(SubAlloc::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<&Allocation> for proto::Allocation {
    fn from(value: &Allocation) -> Self {
        Self {
            assets: value.assets.iter().map(Into::into).collect(),
            balances: Some((&value.balances).into()),
            locked: value.locked.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<proto::State> for State {
    type Error = ConversionError;

    fn try_from(value: proto::State) -> Result<Self, Self::Error> {
        Ok(State::from_parts(
            hash_from(value.id, "state.id")?,
            value.version,
            value
                .allocation
                .ok_or(ConversionError::ExptectedSome("allocation"))?
                .try_into()?,
            value.data,
            value.is_final,
        ))
    }
}

impl From<&State> for proto::State {
    fn from(value: &State) -> Self {
        Self {
            id: value.id().0.to_vec(),
            version: value.version(),
            allocation: Some((&value.allocation).into()),
            data: value.app_data.clone(),
            is_final: value.is_final,
        }
    }
}

impl TryFrom<proto::Transaction> for Transaction {
    type Error = ConversionError;

    fn try_from(value: proto::Transaction) -> Result<Self, Self::Error> {
        let sigs = value
            .sigs
            .into_iter()
            .map(|s| {
                if s.is_empty() {
                    Ok(None)
                } else {
                    signature_from(s).map(Some)
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(Transaction {
            state: value
                .state
                .ok_or(ConversionError::ExptectedSome("state"))?
                .try_into()?,
            sigs,
        })
    }
}

impl From<&Transaction> for proto::Transaction {
    fn from(value: &Transaction) -> Self {
        Self {
            state: Some((&value.state).into()),
            sigs: value
                .sigs
                .iter()
                .map(|s| s.map(|s| s.0.to_vec()).unwrap_or_default())
                .collect(),
        }
    }
}
