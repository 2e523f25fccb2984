//! Bringing channels back after a restart.

use super::{Channel, Shared};
use crate::{
    channel::{Machine, Phase},
    error::{Error, Result},
    messages::{ChannelSyncMsg, Identity, ParticipantMessage},
    persistence::ChannelSource,
};
use std::sync::Arc;
use tracing::{debug, info};

impl Channel {
    /// Recreates a persisted channel, starts watching it and asks the peer
    /// for newer states.
    pub(super) async fn restore(shared: &Arc<Shared>, source: ChannelSource) -> Result<Channel> {
        let ChannelSource {
            params,
            idx,
            phase,
            current,
            peers,
            parent,
        } = source;
        let machine = Machine::restore(
            shared.wallet.clone(),
            shared.verifier.clone(),
            params,
            idx,
            phase,
            current,
        )?;
        let channel = Channel::new(shared.clone(), machine, peers, parent);
        shared.insert_channel(channel.clone());

        let m = channel.lock_machine().await;
        if m.current().is_fully_signed() && !matches!(m.phase(), Phase::Withdrawing | Phase::Withdrawn) {
            if let Err(e) = channel.start_watching(&m).await {
                shared.remove_channel(&channel.id());
                return Err(e);
            }
        }
        let off_chain = m.phase().is_off_chain();
        info!(channel = %channel.id(), phase = %m.phase(), version = m.current().version(), "Restored channel");
        drop(m);

        if off_chain {
            channel.send_sync().await?;
        }
        Ok(channel)
    }

    /// Sends our current transaction to the peer.
    pub async fn send_sync(&self) -> Result<()> {
        let msg = {
            let m = self.inner.machine.lock().await;
            ChannelSyncMsg {
                phase: m.phase(),
                current: m.current().clone(),
            }
        };
        debug!(channel = %self.id(), version = msg.current.version(), "Syncing");
        self.shared()
            .send(self.peer(), ParticipantMessage::ChannelSync(msg))
            .await
    }

    /// Adopts a newer transaction of the peer, or answers with ours if the
    /// peer is behind.
    pub(super) async fn handle_sync(&self, from: &Identity, msg: ChannelSyncMsg) -> Result<()> {
        if from != self.peer() {
            return Err(Error::InvalidProposal(format!("{} is not part of channel {}", from, self.id())));
        }
        let mut m = self.inner.machine.lock().await;
        let ours = m.current().version();
        let theirs = msg.current.version();
        let before = m.current().state.clone();

        if m.sync(msg.current)? {
            info!(channel = %self.id(), from = ours, to = theirs, peer_phase = %msg.phase, "Adopted newer state");
            self.committed(&m, &before).await;
            return Ok(());
        }
        if ours > theirs && m.current().is_fully_signed() {
            drop(m);
            debug!(channel = %self.id(), ours, theirs, "Peer is behind");
            return self.send_sync().await;
        }
        Ok(())
    }
}
