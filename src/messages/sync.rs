use super::ConversionError;
use crate::{
    channel::{Phase, Transaction},
    wire::proto,
};

/// Sent to the peer after restoring a channel, so both sides continue from
/// the newest fully signed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSyncMsg {
    pub phase: Phase,
    pub current: Transaction,
}

impl TryFrom<proto::ChannelSyncMsg> for ChannelSyncMsg {
    type Error = ConversionError;

    fn try_from(value: proto::ChannelSyncMsg) -> Result<Self, Self::Error> {
        Ok(ChannelSyncMsg {
            phase: Phase::try_from(value.phase)?,
            current: value
                .current
                .ok_or(ConversionError::ExptectedSome("current"))?
                .try_into()?,
        })
    }
}

impl From<&ChannelSyncMsg> for proto::ChannelSyncMsg {
    fn from(value: &ChannelSyncMsg) -> Self {
        Self {
            phase: value.phase.into(),
            current: Some((&value.current).into()),
        }
    }
}
