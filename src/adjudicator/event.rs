use crate::{
    channel::{ChannelId, Idx, State},
    encoding::types::Signature,
};
use tokio::time::Instant;

/// End of a challenge period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Elapsed,
    At(Instant),
}

impl Timeout {
    pub fn is_elapsed(&self) -> bool {
        match self {
            Timeout::Elapsed => true,
            Timeout::At(at) => *at <= Instant::now(),
        }
    }

    /// Returns once the timeout elapsed.
    pub async fn wait(&self) {
        if let Timeout::At(at) = self {
            tokio::time::sleep_until(*at).await;
        }
    }
}

/// Something happened to a channel on-chain.
#[derive(Debug, Clone)]
pub enum AdjudicatorEvent {
    Registered {
        id: ChannelId,
        version: u64,
        timeout: Timeout,
        state: State,
        sigs: Vec<Signature>,
    },
    Progressed {
        id: ChannelId,
        version: u64,
        timeout: Timeout,
        state: State,
        /// Participant that progressed the state.
        idx: Idx,
    },
    Concluded {
        id: ChannelId,
        version: u64,
        timeout: Timeout,
    },
}

impl AdjudicatorEvent {
    pub fn id(&self) -> ChannelId {
        match self {
            AdjudicatorEvent::Registered { id, .. }
            | AdjudicatorEvent::Progressed { id, .. }
            | AdjudicatorEvent::Concluded { id, .. } => *id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            AdjudicatorEvent::Registered { version, .. }
            | AdjudicatorEvent::Progressed { version, .. }
            | AdjudicatorEvent::Concluded { version, .. } => *version,
        }
    }

    pub fn timeout(&self) -> Timeout {
        match self {
            AdjudicatorEvent::Registered { timeout, .. }
            | AdjudicatorEvent::Progressed { timeout, .. }
            | AdjudicatorEvent::Concluded { timeout, .. } => *timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdjudicatorEvent::Registered { .. } => "Registered",
            AdjudicatorEvent::Progressed { .. } => "Progressed",
            AdjudicatorEvent::Concluded { .. } => "Concluded",
        }
    }
}
