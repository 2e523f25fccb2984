//! Transport abstraction between the participants.

mod encoding;
pub mod local;
pub mod proto;

#[cfg(test)]
mod tests;

pub use encoding::{decode_frame, encode_frame, MAX_FRAME_LEN};
pub use local::{LocalBus, LocalNetwork};

use crate::messages::{ConversionError, Envelope, Identity};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encoded message is {0} bytes, frames are limited to {max}", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error("frame is truncated")]
    Truncated,
    #[error("envelope carries no message")]
    EmptyEnvelope,
    #[error(transparent)]
    Encode(#[from] prost::EncodeError),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("no route to {0}")]
    UnknownRecipient(Identity),
}

/// Sends messages to other participants.
///
/// Incoming messages are handed to [crate::PerunClient::handle_message] by
/// whoever owns the receiving end of the transport.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, env: Envelope) -> Result<(), WireError>;
}
