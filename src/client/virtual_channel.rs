//! Virtual channels: funded from two parent channels, one per participant,
//! that both end at the same intermediary.
//!
//! The intermediary only locks funds (or releases them) in one parent once
//! the matching proposal arrived on the other parent.

use super::{update::check_next, Channel, UpdateResponder};
use crate::{
    channel::{ChannelId, Idx, Machine, MachineError, Phase, SignedState, State},
    error::{Error, Result},
    messages::{UpdateProposal, VirtualChannelFundingProposalMsg, VirtualChannelSettlementProposalMsg},
};
use tracing::{debug, info};

/// What the intermediary pairs up: one proposal per parent channel.
#[derive(Debug, Clone)]
pub(crate) struct VirtualMatch {
    parent: ChannelId,
    /// Index of the proposer in the virtual channel.
    role: Idx,
    state: State,
}

impl VirtualMatch {
    fn matches(a: &Self, b: &Self) -> bool {
        a.parent != b.parent && a.role != b.role && a.state == b.state
    }
}

fn parent_of(ch: &Channel) -> Result<Channel> {
    let parent = ch.parent().ok_or(Error::UnknownChannel(ch.id()))?;
    ch.shared().channel(&parent)
}

/// Timeout of a parent update that has to wait for the intermediary.
fn timeout(ch: &Channel) -> std::time::Duration {
    let cfg = &ch.shared().cfg;
    cfg.update_timeout() + cfg.virtual_match_timeout()
}

/// Locks our part of the virtual channel in our parent.
pub(super) async fn fund(ch: &Channel, index_map: Vec<Idx>) -> Result<()> {
    let parent = parent_of(ch)?;
    let (params, initial) = {
        let m = ch.inner.machine.lock().await;
        (m.params().clone(), m.current().clone())
    };
    let id = ch.id();
    let bals = initial.state.allocation.balances.clone();
    let map = index_map.clone();

    parent
        .propose_with(
            timeout(ch),
            |current| {
                let mut next = current.make_next_state();
                next.allocation.lock(id, &bals, map)?;
                Ok(next)
            },
            |base| {
                UpdateProposal::VirtualFunding(VirtualChannelFundingProposalMsg {
                    base,
                    initial,
                    params,
                    index_map,
                })
            },
        )
        .await?;
    info!(channel = %id, parent = %parent.id(), "Virtual channel funded");
    Ok(())
}

/// Releases the funds of a final virtual channel in our parent and forgets
/// the virtual channel.
pub(super) async fn settle(ch: &Channel) -> Result<()> {
    let parent = parent_of(ch)?;
    let m = ch.lock_machine().await;
    if m.phase() != Phase::Final {
        return Err(MachineError::WrongPhase {
            expected: Phase::Final,
            actual: m.phase(),
        }
        .into());
    }
    if parent.phase().await.is_on_chain() {
        return Err(Error::ParentOnChain(parent.id()));
    }

    let id = ch.id();
    let final_tx = m.current().clone();
    let params = m.params().clone();
    let final_bals = final_tx.state.allocation.balances.clone();
    parent
        .propose_with(
            timeout(ch),
            |current| {
                let mut next = current.make_next_state();
                next.allocation.unlock(id, &final_bals)?;
                Ok(next)
            },
            |base| {
                UpdateProposal::VirtualSettlement(VirtualChannelSettlementProposalMsg {
                    base,
                    final_tx,
                    params,
                })
            },
        )
        .await?;
    drop(m);

    info!(channel = %id, parent = %parent.id(), "Virtual channel settled");
    ch.close_tree().await;
    Ok(())
}

/// Checks a funding proposal received by the intermediary.
pub(super) fn check_funding(parent: &Machine, next: &State, msg: &VirtualChannelFundingProposalMsg) -> Result<()> {
    let id = msg.params.id();
    if !msg.params.virtual_channel() {
        return Err(Error::InvalidProposal(format!("{} is not a virtual channel", id)));
    }
    msg.initial.verify(&msg.params, parent.verifier())?;
    if msg.initial.version() != 0 || msg.index_map.len() != msg.params.num_parts() {
        return Err(Error::InvalidProposal("invalid virtual channel funding".to_string()));
    }
    role(parent, &msg.index_map)?;

    let mut expected = parent.current().state.make_next_state();
    expected
        .allocation
        .lock(id, &msg.initial.state.allocation.balances, msg.index_map.clone())?;
    check_next(&expected, next)
}

/// Checks a settlement proposal received by the intermediary.
pub(super) fn check_settlement(
    parent: &Machine,
    next: &State,
    msg: &VirtualChannelSettlementProposalMsg,
) -> Result<()> {
    let id = msg.params.id();
    msg.final_tx.verify(&msg.params, parent.verifier())?;
    if !msg.final_tx.state.is_final {
        return Err(Error::InvalidProposal(format!("state of {} is not final", id)));
    }
    let sub = parent
        .current()
        .state
        .allocation
        .sub_alloc(id)
        .ok_or_else(|| Error::InvalidProposal(format!("{} is not funded from this channel", id)))?;
    role(parent, &sub.index_map)?;

    let mut expected = parent.current().state.make_next_state();
    expected
        .allocation
        .unlock(id, &msg.final_tx.state.allocation.balances)?;
    check_next(&expected, next)
}

/// Index in the virtual channel of the participant on the other end of
/// `parent`, the intermediary has to be the other one.
fn role(parent: &Machine, index_map: &[Idx]) -> Result<Idx> {
    let peer = 1 - parent.idx();
    match (index_map.iter().position(|&i| i == peer), index_map.iter().position(|&i| i == parent.idx())) {
        (Some(role), Some(ours)) if role != ours => Ok(role),
        _ => Err(Error::InvalidProposal("index map does not connect both ends".to_string())),
    }
}

/// Waits for the funding proposal on the other parent, then accepts both.
pub(super) async fn match_funding(responder: UpdateResponder, msg: VirtualChannelFundingProposalMsg) -> Result<()> {
    let parent = responder.channel().clone();
    let id = msg.params.id();
    let item = VirtualMatch {
        parent: parent.id(),
        role: role(responder.machine(), &msg.index_map)?,
        state: msg.initial.state.clone(),
    };
    pair(responder, id, item).await?;

    if let Some(signed) = SignedState::from_transaction(msg.params, &msg.initial) {
        parent.shared().add_hub_sub_state(parent.id(), signed);
    }
    info!(channel = %id, parent = %parent.id(), "Locked funds for virtual channel");
    Ok(())
}

/// Waits for the settlement proposal on the other parent, then accepts both.
pub(super) async fn match_settlement(
    responder: UpdateResponder,
    msg: VirtualChannelSettlementProposalMsg,
) -> Result<()> {
    let parent = responder.channel().clone();
    let id = msg.params.id();
    let item = VirtualMatch {
        parent: parent.id(),
        role: settlement_role(&responder, id)?,
        state: msg.final_tx.state.clone(),
    };
    pair(responder, id, item).await?;

    parent.shared().remove_hub_sub_state(&parent.id(), &id);
    info!(channel = %id, parent = %parent.id(), "Released funds of virtual channel");
    Ok(())
}

fn settlement_role(responder: &UpdateResponder, id: ChannelId) -> Result<Idx> {
    let m = responder.machine();
    let sub = m
        .current()
        .state
        .allocation
        .sub_alloc(id)
        .ok_or_else(|| Error::InvalidProposal(format!("{} is not funded from this channel", id)))?;
    role(m, &sub.index_map)
}

async fn pair(responder: UpdateResponder, id: ChannelId, item: VirtualMatch) -> Result<()> {
    let shared = responder.channel().shared().clone();
    let timeout = shared.cfg.virtual_match_timeout();
    debug!(channel = %id, parent = %item.parent, role = item.role, "Waiting for the other parent");
    match shared.virtual_matcher.pair(id, item, VirtualMatch::matches, timeout).await {
        Ok(_) => responder.accept().await,
        Err(e) => {
            responder.reject(&e.to_string()).await?;
            Err(e.into())
        }
    }
}
