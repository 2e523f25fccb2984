//! Channel data model and the per-channel phase machine.
//!
//! Nothing in here talks to the network or the ledger, the controller in
//! [crate::client] drives the [Machine] and does all I/O.

mod machine;
mod params;
mod state;
mod transaction;


use crate::encoding::types::{Bytes32, Hash, U256};

pub use machine::{check_valid_transition, InvalidUpdate, Machine, MachineError, Phase};
pub use params::{Asset, BackendId, LedgerBackendId, LedgerId, Params};
pub use state::{Allocation, Balances, State, SubAlloc};
pub use transaction::{SignedState, Transaction};

/// Hash of the encoded [Params].
pub type ChannelId = Hash;

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type Idx = usize;

/// The nonce added by each participant.
///
/// They are combined into a single [U256] using SHA3-256.
pub type NonceShare = Bytes32;

/// Combines the nonce shares of all participants, in participant order.
pub fn combine_nonce_shares<'a>(shares: impl IntoIterator<Item = &'a NonceShare>) -> U256 {
    use sha3::{Digest, Sha3_256};

    let mut hasher = Sha3_256::new();
    for share in shares {
        hasher.update(share.0);
    }
    U256::from_big_endian(hasher.finalize().as_slice())
}
