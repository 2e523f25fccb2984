use super::{to_writer, types::Hash, Error, Writer};
use serde::Serialize;
use sha3::{Digest, Keccak256};

/// Feeds the canonical encoding into a digest without buffering it.
#[derive(Default)]
pub struct HashWriter<D: Digest> {
    digest: D,
}

impl<D: Digest> Writer for HashWriter<D> {
    fn write(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }
}

/// Digest of the canonical encoding of `value`.
///
/// Only 32 byte digests fit into a [Hash].
pub fn to_digest<D, T>(value: &T) -> Result<Hash, Error>
where
    D: Digest + Default,
    T: Serialize + ?Sized,
{
    let mut writer = HashWriter::<D>::default();
    to_writer(value, &mut writer)?;
    let out = writer.digest.finalize();
    let bytes: [u8; 32] = out
        .as_slice()
        .try_into()
        .map_err(|_| Error::Custom(format!("digest has {} bytes", out.len())))?;
    Ok(Hash(bytes))
}

/// Keccak-256 of the canonical encoding, what participants sign and what
/// channel ids are made of.
pub fn to_hash<T>(value: &T) -> Result<Hash, Error>
where
    T: Serialize + ?Sized,
{
    to_digest::<Keccak256, T>(value)
}
