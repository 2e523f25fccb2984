//! Handles the creation and verification of (Ethereum) Signatures.
//!
//! The protocol only talks to the [Wallet] and [Verifier] traits, the
//! [k256] module provides the implementation used by default.

use crate::encoding::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub mod k256;
pub use self::k256::{Recoverer, Signer};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed signature: {0}")]
    Malformed(&'static str),
    #[error("signing backend failed: {0}")]
    Backend(String),
}

/// Holds the key of one participant.
pub trait Wallet: core::fmt::Debug + Send + Sync {
    fn address(&self) -> Address;

    /// Signs `hash` using the Ethereum signed-message format.
    fn sign_hash(&self, hash: Hash) -> Result<Signature, Error>;
}

pub trait Verifier: Send + Sync {
    /// Returns the address whose key produced `sig` over `hash`.
    fn recover(&self, hash: Hash, sig: &Signature) -> Result<Address, Error>;

    fn verify(&self, addr: Address, hash: Hash, sig: &Signature) -> Result<bool, Error> {
        Ok(self.recover(hash, sig)? == addr)
    }
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}
