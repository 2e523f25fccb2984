//! Opening channels: proposal, exchange of the initial signatures and
//! funding.

use super::{signature_of, subchannel, virtual_channel, Channel, Pending, Shared};
use crate::{
    adjudicator::FundingReq,
    channel::{combine_nonce_shares, ChannelId, Idx, Machine, NonceShare, Params, Phase, State},
    encoding::types::Hash,
    error::{Error, Result},
    messages::{
        ChannelProposal, ChannelProposalAcc, ChannelProposalRej, ChannelUpdateAcc, Identity,
        ParticipantMessage, ProposalKind,
    },
};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) enum ProposalResponse {
    Accepted(ChannelProposalAcc),
    Rejected(String),
}

/// Answers a channel proposal. Consumed by answering, dropping it without an
/// answer lets the proposer time out.
pub struct ProposalResponder {
    shared: Arc<Shared>,
    from: Identity,
    proposal: ChannelProposal,
}

impl core::fmt::Debug for ProposalResponder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProposalResponder")
            .field("from", &self.from)
            .field("proposal_id", &self.proposal.proposal_id())
            .finish()
    }
}

/// Parent channel participant `idx` funds the channel from.
fn parent_of(kind: &ProposalKind, idx: Idx) -> Option<ChannelId> {
    match kind {
        ProposalKind::Ledger => None,
        ProposalKind::Sub { parent } => Some(*parent),
        ProposalKind::Virtual { parents, .. } => parents.get(idx).copied(),
    }
}

fn build_params(proposal: &ChannelProposal, acc: &ChannelProposalAcc) -> Result<Params> {
    let base = &proposal.base;
    let nonce = combine_nonce_shares([&base.nonce_share, &acc.nonce_share]);
    Ok(Params::new(
        base.challenge_duration,
        nonce,
        vec![proposal.participant, acc.participant],
        base.app,
        matches!(proposal.kind, ProposalKind::Ledger),
        matches!(proposal.kind, ProposalKind::Virtual { .. }),
    )?)
}

impl ProposalResponder {
    pub fn proposal(&self) -> &ChannelProposal {
        &self.proposal
    }

    pub fn peer(&self) -> &Identity {
        &self.from
    }

    /// Accepts the channel and returns it once it is funded.
    pub async fn accept(self) -> Result<Channel> {
        let ProposalResponder {
            shared,
            from,
            proposal,
        } = self;
        let nonce_share: NonceShare = rand::thread_rng().gen();
        let acc = ChannelProposalAcc {
            proposal_id: proposal.proposal_id(),
            nonce_share,
            participant: shared.wallet.address(),
        };
        let params = build_params(&proposal, &acc)?;
        let init = State::new(&params, proposal.base.init_bals.clone(), proposal.base.init_data.clone());
        let machine = Machine::new(shared.wallet.clone(), shared.verifier.clone(), params, 1, init)?;
        let channel = Channel::new(
            shared.clone(),
            machine,
            proposal.peers.clone(),
            parent_of(&proposal.kind, 1),
        );
        shared.insert_channel(channel.clone());

        match shared.accept_channel(&channel, &from, &proposal, acc).await {
            Ok(()) => Ok(channel),
            Err(e) => {
                warn!(channel = %channel.id(), error = %e, "Opening channel failed");
                shared.remove_channel(&channel.id());
                Err(e)
            }
        }
    }

    pub async fn reject(self, reason: &str) -> Result<()> {
        self.shared
            .reject_proposal(&self.from, self.proposal.proposal_id(), reason)
            .await
    }
}

impl Shared {
    async fn reject_proposal(&self, to: &Identity, proposal_id: Hash, reason: &str) -> Result<()> {
        debug!(%to, reason, "Rejecting proposal");
        let rej = ChannelProposalRej {
            proposal_id,
            reason: reason.to_string(),
        };
        self.send(to, ParticipantMessage::ProposalRejected(rej)).await
    }

    /// Checks the constraints of a proposal that don't depend on the user's
    /// decision.
    async fn check_proposal(&self, from: &Identity, proposal: &ChannelProposal) -> Result<()> {
        let invalid = |reason: &str| Err(Error::InvalidProposal(reason.to_string()));
        if proposal.peers.len() != 2 {
            return invalid("only two-party channels are supported");
        }
        if &proposal.peers[0] != from || proposal.peers[1] != self.identity {
            return invalid("peers do not match sender and receiver");
        }
        let base = &proposal.base;
        base.init_bals.valid(2)?;
        if base.funding_agreement.0.len() != base.init_bals.num_assets()
            || base.funding_agreement.sum() != base.init_bals.balances.sum()
        {
            return invalid("funding agreement does not match the initial balances");
        }
        if base.challenge_duration == 0 {
            return invalid("challenge duration must not be zero");
        }

        match &proposal.kind {
            ProposalKind::Ledger => Ok(()),
            ProposalKind::Sub { parent } => self.check_parent(*parent, Some(from)).await,
            ProposalKind::Virtual {
                parents,
                index_maps,
            } => {
                if parents.len() != 2 || index_maps.len() != 2 {
                    return invalid("virtual channels need one parent per participant");
                }
                if index_maps.iter().any(|m| m.len() != 2) {
                    return invalid("index maps must cover both participants");
                }
                self.check_parent(parents[1], None).await
            }
        }
    }

    /// `parent` has to be an open channel of ours, shared with `with` if
    /// given.
    async fn check_parent(&self, parent: ChannelId, with: Option<&Identity>) -> Result<()> {
        let channel = self.channel(&parent)?;
        if let Some(with) = with.filter(|w| !channel.peers().contains(w)) {
            return Err(Error::InvalidProposal(format!("parent {} is not shared with {}", parent, with)));
        }
        let phase = channel.phase().await;
        if phase != Phase::Acting {
            return Err(Error::InvalidProposal(format!("parent {} is in phase {}", parent, phase)));
        }
        Ok(())
    }

    pub(super) async fn handle_proposal(self: &Arc<Self>, from: Identity, proposal: ChannelProposal) -> Result<()> {
        let id = proposal.proposal_id();
        if let Err(e) = self.check_proposal(&from, &proposal).await {
            self.reject_proposal(&from, id, &e.to_string()).await?;
            return Err(e);
        }
        let Some(handler) = self.proposal_handler() else {
            return self.reject_proposal(&from, id, "no proposal handler").await;
        };
        let responder = ProposalResponder {
            shared: self.clone(),
            from,
            proposal: proposal.clone(),
        };
        handler.handle_proposal(proposal, responder).await;
        Ok(())
    }

    pub(super) async fn propose_channel(self: &Arc<Self>, proposal: ChannelProposal) -> Result<Channel> {
        if proposal.peers.len() != 2 || proposal.peers[0] != self.identity {
            return Err(Error::InvalidProposal("we have to be the first of two peers".to_string()));
        }
        if proposal.participant != self.wallet.address() {
            return Err(Error::InvalidProposal("participant is not our address".to_string()));
        }
        proposal.base.init_bals.valid(2)?;
        match &proposal.kind {
            ProposalKind::Ledger => {}
            ProposalKind::Sub { parent } => self.check_parent(*parent, Some(&proposal.peers[1])).await?,
            ProposalKind::Virtual {
                parents,
                index_maps,
            } => {
                if parents.len() != 2 || index_maps.len() != 2 {
                    return Err(Error::InvalidProposal(
                        "virtual channels need one parent per participant".to_string(),
                    ));
                }
                self.check_parent(parents[0], None).await?;
            }
        }

        let peer = &proposal.peers[1];
        let mut pending = self.expect_proposal_response(proposal.proposal_id());
        self.send(peer, ParticipantMessage::ChannelProposal(proposal.clone()))
            .await?;
        let acc = match pending.wait(self.cfg.proposal_timeout()).await? {
            ProposalResponse::Accepted(acc) => acc,
            ProposalResponse::Rejected(reason) => return Err(Error::PeerRejected(reason)),
        };
        drop(pending);

        let params = build_params(&proposal, &acc)?;
        let init = State::new(&params, proposal.base.init_bals.clone(), proposal.base.init_data.clone());
        let machine = Machine::new(self.wallet.clone(), self.verifier.clone(), params, 0, init.clone())?;
        let channel = Channel::new(
            self.clone(),
            machine,
            proposal.peers.clone(),
            parent_of(&proposal.kind, 0),
        );
        self.insert_channel(channel.clone());

        match self.open_channel(&channel, &proposal, &init).await {
            Ok(()) => Ok(channel),
            Err(e) => {
                warn!(channel = %channel.id(), error = %e, "Opening channel failed");
                self.remove_channel(&channel.id());
                Err(e)
            }
        }
    }

    /// Proposer side: sends our initial signature first, then funds.
    async fn open_channel(&self, channel: &Channel, proposal: &ChannelProposal, init: &State) -> Result<()> {
        let id = channel.id();
        {
            let mut m = channel.inner.machine.lock().await;
            let sig = m.sig()?;
            let mut pending = self.expect_update_response(id, 0);
            let acc = ChannelUpdateAcc {
                channel: id,
                version: 0,
                sig,
            };
            self.send(channel.peer(), ParticipantMessage::ChannelUpdateAccepted(acc))
                .await?;
            let peer_sig = signature_of(pending.wait(self.cfg.proposal_timeout()).await?)?;
            m.add_sig(1, peer_sig)?;
            m.enable_init()?;
            m.set_funding()?;
        }
        debug!(channel = %id, "Initial state signed");

        match &proposal.kind {
            ProposalKind::Ledger => self.fund_ledger(channel, proposal).await?,
            ProposalKind::Sub { .. } => subchannel::fund(channel, init).await?,
            ProposalKind::Virtual { index_maps, .. } => {
                virtual_channel::fund(channel, index_maps[0].clone()).await?
            }
        }
        self.funded(channel).await
    }

    /// Responder side: waits for the proposer's initial signature before
    /// sending ours, then funds.
    async fn accept_channel(
        &self,
        channel: &Channel,
        from: &Identity,
        proposal: &ChannelProposal,
        acc: ChannelProposalAcc,
    ) -> Result<()> {
        let id = channel.id();
        let mut pending = self.expect_update_response(id, 0);
        let sub_funded = match proposal.kind {
            ProposalKind::Sub { .. } => Some(self.expect_sub_funding(id)),
            _ => None,
        };
        self.send(from, ParticipantMessage::ProposalAccepted(acc)).await?;

        let peer_sig = signature_of(pending.wait(self.cfg.proposal_timeout()).await?)?;
        drop(pending);
        let sig = {
            let mut m = channel.inner.machine.lock().await;
            m.add_sig(0, peer_sig)?;
            let sig = m.sig()?;
            m.enable_init()?;
            m.set_funding()?;
            sig
        };
        let acc = ChannelUpdateAcc {
            channel: id,
            version: 0,
            sig,
        };
        self.send(from, ParticipantMessage::ChannelUpdateAccepted(acc))
            .await?;
        debug!(channel = %id, "Initial state signed");

        match (&proposal.kind, sub_funded) {
            (ProposalKind::Ledger, _) | (ProposalKind::Sub { .. }, None) => {
                self.fund_ledger(channel, proposal).await?
            }
            (ProposalKind::Sub { .. }, Some(pending)) => self.wait_sub_funded(pending).await?,
            (ProposalKind::Virtual { index_maps, .. }, _) => {
                virtual_channel::fund(channel, index_maps[1].clone()).await?
            }
        }
        self.funded(channel).await
    }

    async fn fund_ledger(&self, channel: &Channel, proposal: &ChannelProposal) -> Result<()> {
        let req = {
            let m = channel.inner.machine.lock().await;
            FundingReq {
                params: m.params().clone(),
                state: m.current().state.clone(),
                idx: m.idx(),
                agreement: proposal.base.funding_agreement.clone(),
            }
        };
        match tokio::time::timeout(self.cfg.funding_timeout(), self.funder.fund(&req)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::RequestTimedOut),
        }
    }

    async fn wait_sub_funded(&self, mut pending: Pending<'_, ChannelId, ()>) -> Result<()> {
        pending.wait(self.cfg.funding_timeout()).await
    }

    /// Marks the channel funded, starts watching and persists it.
    async fn funded(&self, channel: &Channel) -> Result<()> {
        let mut m = channel.inner.machine.lock().await;
        m.set_funded()?;
        channel.start_watching(&m).await?;
        channel.persist_created(&m).await;
        info!(
            channel = %channel.id(),
            idx = m.idx(),
            parent = ?channel.parent(),
            "Channel opened"
        );
        Ok(())
    }
}
