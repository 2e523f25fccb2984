use prost::{bytes::BufMut, Message};

use super::{
    proto::{self, envelope},
    WireError,
};
use crate::messages::{Envelope, Identity, ParticipantMessage};

/// The length prefix is a `u16`.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

impl From<&Envelope> for proto::Envelope {
    fn from(value: &Envelope) -> Self {
        let msg = match &value.msg {
            ParticipantMessage::ChannelProposal(msg) => envelope::Msg::ChannelProposalMsg(msg.into()),
            ParticipantMessage::ProposalAccepted(msg) => {
                envelope::Msg::ChannelProposalAccMsg(msg.into())
            }
            ParticipantMessage::ProposalRejected(msg) => {
                envelope::Msg::ChannelProposalRejMsg(msg.into())
            }
            ParticipantMessage::ChannelUpdate(msg) => envelope::Msg::UpdateProposalMsg(msg.into()),
            ParticipantMessage::ChannelUpdateAccepted(msg) => {
                envelope::Msg::ChannelUpdateAccMsg(msg.into())
            }
            ParticipantMessage::ChannelUpdateRejected(msg) => {
                envelope::Msg::ChannelUpdateRejMsg(msg.into())
            }
            ParticipantMessage::ChannelSync(msg) => envelope::Msg::ChannelSyncMsg(msg.into()),
        };

        Self {
            sender: value.sender.0.clone(),
            recipient: value.recipient.0.clone(),
            msg: Some(msg),
        }
    }
}

impl TryFrom<proto::Envelope> for Envelope {
    type Error = WireError;

    fn try_from(value: proto::Envelope) -> Result<Self, Self::Error> {
        let msg = match value.msg.ok_or(WireError::EmptyEnvelope)? {
            envelope::Msg::ChannelProposalMsg(msg) => {
                ParticipantMessage::ChannelProposal(msg.try_into()?)
            }
            envelope::Msg::ChannelProposalAccMsg(msg) => {
                ParticipantMessage::ProposalAccepted(msg.try_into()?)
            }
            envelope::Msg::ChannelProposalRejMsg(msg) => {
                ParticipantMessage::ProposalRejected(msg.try_into()?)
            }
            envelope::Msg::UpdateProposalMsg(msg) => {
                ParticipantMessage::ChannelUpdate(msg.try_into()?)
            }
            envelope::Msg::ChannelUpdateAccMsg(msg) => {
                ParticipantMessage::ChannelUpdateAccepted(msg.try_into()?)
            }
            envelope::Msg::ChannelUpdateRejMsg(msg) => {
                ParticipantMessage::ChannelUpdateRejected(msg.try_into()?)
            }
            envelope::Msg::ChannelSyncMsg(msg) => ParticipantMessage::ChannelSync(msg.try_into()?),
        };

        Ok(Envelope {
            sender: Identity(value.sender),
            recipient: Identity(value.recipient),
            msg,
        })
    }
}

/// Encodes `env` as protobuf, prefixed with its length as big-endian `u16`.
///
/// go-perun writes a u16 for the length (2 bytes), this means we cannot use
/// `encode_length_delimited`, which would write a variable length integer
/// using LEB128.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, WireError> {
    let msg = proto::Envelope::from(env);
    let len = msg.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut buf = Vec::with_capacity(2 + len);
    buf.put_slice(&(len as u16).to_be_bytes());
    msg.encode(&mut buf)?;
    Ok(buf)
}

/// Decodes one frame written by [encode_frame].
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, WireError> {
    if frame.len() < 2 {
        return Err(WireError::Truncated);
    }
    let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let body = frame.get(2..2 + len).ok_or(WireError::Truncated)?;
    proto::Envelope::decode(body)?.try_into()
}
