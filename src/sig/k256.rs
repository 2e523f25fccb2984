//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::encoding::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::{hash_to_eth_signed_msg_hash, Error, Verifier, Wallet};

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        // The uncompressed point is 0x04 || X || Y, the address is the last
        // 20 bytes of keccak(X || Y).
        let point = key.to_encoded_point(false);
        let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl From<k256::ecdsa::Error> for Error {
    fn from(e: k256::ecdsa::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = Address::from(&key.verifying_key());
        Self { key, addr }
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(secret)?;
        let addr = Address::from(&key.verifying_key());
        Ok(Self { key, addr })
    }

    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0)?;

        // The recoverable signature is r || s || v, v has to be shifted by 27
        // to be accepted by the EVM.
        let mut sig = Signature::try_from(sig.as_bytes())
            .map_err(|_| Error::Malformed("unexpected signature length"))?;
        sig.0[64] += 27;
        Ok(sig)
    }
}

impl Wallet for Signer {
    fn address(&self) -> Address {
        self.addr
    }

    fn sign_hash(&self, hash: Hash) -> Result<Signature, Error> {
        self.sign_eth(hash)
    }
}

/// Recovers signer addresses, holds no key material.
#[derive(Debug, Default, Clone, Copy)]
pub struct Recoverer;

impl Verifier for Recoverer {
    fn recover(&self, msg: Hash, eth_sig: &Signature) -> Result<Address, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // Undo adding the 27, to go back to the format expected below
        let mut sig_bytes: [u8; 65] = eth_sig.0;
        sig_bytes[64] = sig_bytes[64]
            .checked_sub(27)
            .ok_or(Error::Malformed("recovery id below 27"))?;

        let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
        let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
        Ok(Address::from(&verifying_key))
    }
}
