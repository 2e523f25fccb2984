//! The two-party update protocol.

use super::{signature_of, subchannel, virtual_channel, Channel, Shared};
use crate::{
    channel::{Idx, InvalidUpdate, Machine, Phase, State},
    encoding::types::Signature,
    error::{Error, Result},
    messages::{
        ChannelUpdate, ChannelUpdateAcc, ChannelUpdateMsg, ChannelUpdateRej, Identity,
        ParticipantMessage, UpdateProposal,
    },
};
use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub(crate) enum UpdateResponse {
    Accepted(Signature),
    Rejected(String),
}

/// A locked machine with a staged update. Dropping it before
/// [StagedUpdate::commit] discards the staged state.
pub(super) struct StagedUpdate {
    machine: OwnedMutexGuard<Machine>,
    committed: bool,
}

impl StagedUpdate {
    fn stage(mut machine: OwnedMutexGuard<Machine>, state: State, actor: Idx) -> Result<Self> {
        machine.update(state, actor)?;
        Ok(Self {
            machine,
            committed: false,
        })
    }

    fn version(&self) -> u64 {
        self.machine.staging().map_or(0, |tx| tx.version())
    }

    /// Makes the fully signed staged state current.
    fn commit(&mut self) -> Result<()> {
        self.machine.enable_update()?;
        self.committed = true;
        Ok(())
    }
}

impl Deref for StagedUpdate {
    type Target = Machine;

    fn deref(&self) -> &Machine {
        &self.machine
    }
}

impl DerefMut for StagedUpdate {
    fn deref_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }
}

impl Drop for StagedUpdate {
    fn drop(&mut self) {
        if self.committed || self.machine.phase() != Phase::Signing {
            return;
        }
        let id = self.machine.id();
        match self.machine.discard_update() {
            Ok(()) => debug!(channel = %id, "Discarded staged update"),
            Err(e) => warn!(channel = %id, error = %e, "Discarding staged update failed"),
        }
    }
}

/// Answers an update proposed by the peer. Consumed by answering, dropping
/// it without an answer discards the update.
pub struct UpdateResponder {
    channel: Channel,
    staged: StagedUpdate,
    from: State,
}

impl core::fmt::Debug for UpdateResponder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UpdateResponder")
            .field("channel", &self.channel.id())
            .field("version", &self.staged.version())
            .finish()
    }
}

impl UpdateResponder {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The proposed state.
    pub fn state(&self) -> Option<&State> {
        self.staged.staging().map(|tx| &tx.state)
    }

    pub(super) fn machine(&self) -> &Machine {
        &self.staged
    }

    /// Signs the proposed state and enables it.
    pub async fn accept(mut self) -> Result<()> {
        let sig = self.staged.sig()?;
        let acc = ChannelUpdateAcc {
            channel: self.channel.id(),
            version: self.staged.version(),
            sig,
        };
        self.channel
            .shared()
            .send(self.channel.peer(), ParticipantMessage::ChannelUpdateAccepted(acc))
            .await?;
        self.staged.commit()?;
        self.channel.committed(&self.staged, &self.from).await;
        Ok(())
    }

    pub async fn reject(self, reason: &str) -> Result<()> {
        let UpdateResponder { channel, staged, .. } = self;
        let version = staged.version();
        drop(staged);
        reject(channel.shared(), channel.peer(), &channel, version, reason).await;
        Ok(())
    }
}

async fn reject(shared: &Shared, to: &Identity, channel: &Channel, version: u64, reason: &str) {
    debug!(channel = %channel.id(), version, reason, "Rejecting update");
    let rej = ChannelUpdateRej {
        channel: channel.id(),
        version,
        reason: reason.to_string(),
    };
    if let Err(e) = shared.send(to, ParticipantMessage::ChannelUpdateRejected(rej)).await {
        warn!(channel = %channel.id(), error = %e, "Sending rejection failed");
    }
}

/// Answers an update for a channel we don't know.
pub(super) async fn reject_unknown(shared: &Shared, to: &Identity, proposal: &UpdateProposal) {
    let rej = ChannelUpdateRej {
        channel: proposal.channel(),
        version: proposal.version(),
        reason: "unknown channel".to_string(),
    };
    if let Err(e) = shared.send(to, ParticipantMessage::ChannelUpdateRejected(rej)).await {
        warn!(channel = %proposal.channel(), error = %e, "Sending rejection failed");
    }
}

impl Channel {
    /// Proposes the state produced by `mutator` from the current one and
    /// waits until the peer accepted it.
    ///
    /// Funds locked in sub-channels can't be changed this way.
    pub async fn update(&self, mutator: impl FnOnce(&mut State) + Send) -> Result<State> {
        let timeout = self.shared().cfg.update_timeout();
        self.update_with_timeout(timeout, mutator).await
    }

    pub async fn update_with_timeout(
        &self,
        timeout: Duration,
        mutator: impl FnOnce(&mut State) + Send,
    ) -> Result<State> {
        self.propose_with(
            timeout,
            |current| {
                let mut next = current.make_next_state();
                mutator(&mut next);
                if next.allocation.locked != current.allocation.locked {
                    return Err(InvalidUpdate::LockedChanged.into());
                }
                Ok(next)
            },
            UpdateProposal::Plain,
        )
        .await
    }

    /// Locks the machine, builds the next state from the current one and
    /// runs the update protocol with the peer.
    pub(super) async fn propose_with<B, W>(&self, timeout: Duration, build: B, wrap: W) -> Result<State>
    where
        B: FnOnce(&State) -> Result<State> + Send,
        W: FnOnce(ChannelUpdateMsg) -> UpdateProposal + Send,
    {
        let machine = self.try_lock_machine()?;
        let from = machine.current().state.clone();
        let next = build(&from)?;
        let idx = self.idx();

        let mut staged = StagedUpdate::stage(machine, next.clone(), idx)?;
        let sig = staged.sig()?;
        let msg = ChannelUpdateMsg {
            update: ChannelUpdate {
                state: next.clone(),
                actor_idx: idx,
            },
            sig,
        };
        let proposal = wrap(msg);
        let kind = proposal.kind();
        debug!(channel = %self.id(), version = next.version(), kind, "Proposing update");

        let shared = self.shared();
        let mut pending = shared.expect_update_response(self.id(), next.version());
        shared
            .send(self.peer(), ParticipantMessage::ChannelUpdate(proposal))
            .await?;
        let peer_sig = signature_of(pending.wait(timeout).await?)?;
        drop(pending);

        staged.add_sig(self.peer_idx(), peer_sig)?;
        staged.commit()?;
        info!(channel = %self.id(), version = next.version(), kind, "Update accepted");
        self.committed(&staged, &from).await;
        Ok(next)
    }

    /// Handles an update proposed by `from`.
    pub(super) async fn handle_update_req(&self, from: &Identity, proposal: UpdateProposal) -> Result<()> {
        let shared = self.shared().clone();
        let version = proposal.version();
        let machine = match self.try_lock_machine() {
            Ok(m) => m,
            Err(e) => {
                reject(&shared, from, self, version, "channel busy").await;
                return Err(e);
            }
        };

        let staged = match self.check_and_stage(machine, from, &proposal).await {
            Ok(staged) => staged,
            Err(e) => {
                reject(&shared, from, self, version, &e.to_string()).await;
                return Err(e);
            }
        };
        let responder = UpdateResponder {
            channel: self.clone(),
            from: staged.current().state.clone(),
            staged,
        };

        match proposal {
            UpdateProposal::Plain(msg) => match shared.update_handler() {
                Some(handler) => {
                    let current = responder.from.clone();
                    handler.handle_update(current, msg.update, responder).await;
                    Ok(())
                }
                None => responder.reject("no update handler").await,
            },
            UpdateProposal::SubChannelFunding { sub, .. } => {
                responder.accept().await?;
                if !shared.notify_sub_funded(&sub) {
                    warn!(channel = %self.id(), %sub, "Nobody waits for sub-channel funding");
                }
                Ok(())
            }
            UpdateProposal::SubChannelSettlement { sub, .. } => {
                responder.accept().await?;
                if let Ok(sub) = shared.channel(&sub) {
                    sub.close_tree().await;
                }
                Ok(())
            }
            UpdateProposal::VirtualFunding(msg) => virtual_channel::match_funding(responder, msg).await,
            UpdateProposal::VirtualSettlement(msg) => virtual_channel::match_settlement(responder, msg).await,
        }
    }

    /// Validates `proposal` against the current state and stages it with the
    /// proposer's signature.
    async fn check_and_stage(
        &self,
        machine: OwnedMutexGuard<Machine>,
        from: &Identity,
        proposal: &UpdateProposal,
    ) -> Result<StagedUpdate> {
        let ChannelUpdateMsg { update, sig } = proposal.base();
        let sender = self.peers().iter().position(|p| p == from);
        if sender != Some(update.actor_idx) || update.actor_idx == self.idx() {
            return Err(InvalidUpdate::ActorMismatch {
                actor: update.actor_idx,
            }
            .into());
        }
        machine.check_update(&update.state, update.actor_idx, sig)?;

        let current = &machine.current().state;
        let next = &update.state;
        match proposal {
            UpdateProposal::Plain(_) => {
                if next.allocation.locked != current.allocation.locked {
                    return Err(InvalidUpdate::LockedChanged.into());
                }
            }
            UpdateProposal::SubChannelFunding { sub, .. } => {
                subchannel::check_funding(self, current, next, *sub)?
            }
            UpdateProposal::SubChannelSettlement { sub, .. } => {
                subchannel::check_settlement(self, current, next, *sub)?
            }
            UpdateProposal::VirtualFunding(msg) => virtual_channel::check_funding(&machine, next, msg)?,
            UpdateProposal::VirtualSettlement(msg) => virtual_channel::check_settlement(&machine, next, msg)?,
        }

        let mut staged = StagedUpdate::stage(machine, next.clone(), update.actor_idx)?;
        staged.add_sig(update.actor_idx, *sig)?;
        Ok(staged)
    }
}

pub(super) fn check_next(expected: &State, next: &State) -> Result<()> {
    if expected.allocation != next.allocation
        || expected.app_data != next.app_data
        || expected.is_final != next.is_final
    {
        return Err(Error::InvalidProposal(
            "state does not match the announced change".to_string(),
        ));
    }
    Ok(())
}
