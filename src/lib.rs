//! Off-chain state channels between two participants, backed by one or more
//! ledgers.
//!
//! [PerunClient] opens channels, runs the update protocol with the peer and
//! goes on-chain through the [adjudicator::Adjudicator] when the peer stops
//! cooperating. The [watcher::Watcher] refutes registrations of outdated
//! states in the background.

pub mod encoding {
    mod error;
    mod hashing;
    mod ser;

    pub mod types;

    pub use error::{Error, Result};
    pub use hashing::{to_digest, to_hash, HashWriter};
    pub use ser::{to_bytes, to_writer, Serializer, Writer};

    #[cfg(test)]
    mod tests;
}
pub mod sig;

pub mod adjudicator;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod matcher;
pub mod messages;
pub mod multi;
pub mod persistence;
pub mod sim;
pub mod watcher;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use client::PerunClient;
pub use encoding::types::{Address, Hash, U256};
pub use error::{Error, Result};
