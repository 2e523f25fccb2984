use super::{Asset, ChannelId, Idx, InvalidUpdate, Params};
use crate::encoding::{
    self,
    types::{Hash, U256},
};
use serde::Serialize;

/// Stores the complete state of a channel.
///
/// `id` and `version` are private: the only way to get a state with a higher
/// version is [State::make_next_state].
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    id: ChannelId,
    version: u64,
    pub allocation: Allocation,
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

impl State {
    pub fn new(params: &Params, allocation: Allocation, app_data: Vec<u8>) -> Self {
        State {
            id: params.id(),
            version: 0,
            allocation,
            app_data,
            is_final: false,
        }
    }

    /// Rebuild a state received from a peer or read from storage.
    pub(crate) fn from_parts(
        id: ChannelId,
        version: u64,
        allocation: Allocation,
        app_data: Vec<u8>,
        is_final: bool,
    ) -> Self {
        State {
            id,
            version,
            allocation,
            app_data,
            is_final,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create a new state that will replace this state.
    pub fn make_next_state(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            allocation: self.allocation.clone(),
            app_data: self.app_data.clone(),
            is_final: self.is_final,
        }
    }

    /// Hash that is signed by the participants.
    pub fn hash(&self) -> Result<Hash, encoding::Error> {
        encoding::to_hash(self)
    }
}

/// Separate type for storing just the allocated balance, not the assets.
///
/// Indexed as `[asset][participant]`. Also used in the channel proposals to
/// specify the funding agreement.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Balances(pub Vec<Vec<U256>>);

impl Balances {
    pub fn zero(num_assets: usize, num_parts: usize) -> Self {
        Self(vec![vec![U256::zero(); num_parts]; num_assets])
    }

    /// Sum per asset, `None` on overflow.
    pub fn sum(&self) -> Option<Vec<U256>> {
        self.0
            .iter()
            .map(|bals| {
                bals.iter()
                    .try_fold(U256::zero(), |acc, b| acc.checked_add(*b))
            })
            .collect()
    }

    /// Balances of one participant, per asset.
    pub fn of(&self, idx: Idx) -> Option<Vec<U256>> {
        self.0.iter().map(|bals| bals.get(idx).copied()).collect()
    }
}

/// Funds locked in a sub- or virtual channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SubAlloc {
    pub id: ChannelId,
    /// Locked amount per asset.
    pub bals: Vec<U256>,
    /// `index_map[i]` is the index in this channel of participant `i` of the
    /// sub-channel.
    pub index_map: Vec<Idx>,
}

/// Stores which participant has how much of each asset.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub assets: Vec<Asset>,
    pub balances: Balances,
    pub locked: Vec<SubAlloc>,
}

impl Allocation {
    pub fn new(assets: Vec<Asset>, balances: Balances) -> Self {
        Self {
            assets,
            balances,
            locked: Vec::new(),
        }
    }

    pub fn num_assets(&self) -> usize {
        self.assets.len()
    }

    /// Total amount per asset including locked funds, `None` on overflow.
    pub fn total_assets(&self) -> Option<Vec<U256>> {
        let mut totals = self.balances.sum()?;
        for sub in &self.locked {
            for (total, locked) in totals.iter_mut().zip(&sub.bals) {
                *total = total.checked_add(*locked)?;
            }
        }
        Some(totals)
    }

    pub fn sub_alloc(&self, id: ChannelId) -> Option<&SubAlloc> {
        self.locked.iter().find(|s| s.id == id)
    }

    /// Checks that the dimensions agree with the number of assets and
    /// participants.
    pub fn valid(&self, num_parts: usize) -> Result<(), InvalidUpdate> {
        if self.balances.0.len() != self.assets.len() {
            return Err(InvalidUpdate::AssetsMismatch);
        }
        if self.balances.0.iter().any(|bals| bals.len() != num_parts) {
            return Err(InvalidUpdate::ParticipantCountMismatch);
        }
        for sub in &self.locked {
            if sub.bals.len() != self.assets.len() {
                return Err(InvalidUpdate::InvalidSubAllocation(format!(
                    "sub-allocation {} has {} assets, expected {}",
                    sub.id,
                    sub.bals.len(),
                    self.assets.len()
                )));
            }
            if sub.index_map.iter().any(|&i| i >= num_parts) {
                return Err(InvalidUpdate::InvalidSubAllocation(format!(
                    "sub-allocation {} maps to unknown participant",
                    sub.id
                )));
            }
        }
        let mut ids: Vec<ChannelId> = self.locked.iter().map(|s| s.id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.locked.len() {
            return Err(InvalidUpdate::InvalidSubAllocation(
                "duplicate sub-allocation".to_string(),
            ));
        }
        Ok(())
    }

    /// Moves `bals` (indexed by sub-channel participant) from the balances into
    /// a new sub-allocation.
    pub fn lock(&mut self, id: ChannelId, bals: &Balances, index_map: Vec<Idx>) -> Result<(), InvalidUpdate> {
        if self.sub_alloc(id).is_some() {
            return Err(InvalidUpdate::InvalidSubAllocation(format!(
                "{} is already locked",
                id
            )));
        }
        if bals.0.len() != self.assets.len() {
            return Err(InvalidUpdate::AssetsMismatch);
        }
        let mut locked = Vec::with_capacity(self.assets.len());
        for (asset, sub_bals) in bals.0.iter().enumerate() {
            if sub_bals.len() != index_map.len() {
                return Err(InvalidUpdate::ParticipantCountMismatch);
            }
            let mut total = U256::zero();
            for (sub_idx, amount) in sub_bals.iter().enumerate() {
                let parent_bal = self
                    .balances
                    .0
                    .get_mut(asset)
                    .and_then(|b| b.get_mut(index_map[sub_idx]))
                    .ok_or(InvalidUpdate::ParticipantCountMismatch)?;
                *parent_bal = parent_bal.checked_sub(*amount).ok_or_else(|| {
                    InvalidUpdate::InvalidSubAllocation("insufficient funds".to_string())
                })?;
                total = total
                    .checked_add(*amount)
                    .ok_or(InvalidUpdate::TotalAllocationAmountMismatch)?;
            }
            locked.push(total);
        }
        self.locked.push(SubAlloc {
            id,
            bals: locked,
            index_map,
        });
        Ok(())
    }

    /// Removes the sub-allocation `id` and credits `final_bals` (indexed by
    /// sub-channel participant) back to the parent participants.
    pub fn unlock(&mut self, id: ChannelId, final_bals: &Balances) -> Result<(), InvalidUpdate> {
        let pos = self
            .locked
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| InvalidUpdate::InvalidSubAllocation(format!("{} is not locked", id)))?;
        let sub = self.locked.remove(pos);

        if final_bals.sum().as_ref() != Some(&sub.bals) {
            return Err(InvalidUpdate::TotalAllocationAmountMismatch);
        }
        for (asset, sub_bals) in final_bals.0.iter().enumerate() {
            if sub_bals.len() != sub.index_map.len() {
                return Err(InvalidUpdate::ParticipantCountMismatch);
            }
            for (sub_idx, amount) in sub_bals.iter().enumerate() {
                let parent_bal = self
                    .balances
                    .0
                    .get_mut(asset)
                    .and_then(|b| b.get_mut(sub.index_map[sub_idx]))
                    .ok_or(InvalidUpdate::ParticipantCountMismatch)?;
                *parent_bal = parent_bal
                    .checked_add(*amount)
                    .ok_or(InvalidUpdate::TotalAllocationAmountMismatch)?;
            }
        }
        Ok(())
    }
}
