//! Sub-channels: funded from a parent channel between the same
//! participants instead of a ledger.

use super::{update::check_next, Channel};
use crate::{
    channel::{ChannelId, Idx, MachineError, Params, Phase, State},
    error::{Error, Result},
    messages::UpdateProposal,
    watcher::WatcherError,
};
use tracing::info;

/// Indices of the sub-channel participants in the parent channel.
pub(super) fn index_map(sub: &Params, parent: &Params) -> Result<Vec<Idx>> {
    sub.participants()
        .iter()
        .map(|addr| {
            parent
                .participants()
                .iter()
                .position(|p| p == addr)
                .ok_or_else(|| Error::InvalidProposal(format!("{} is not part of the parent channel", addr)))
        })
        .collect()
}

/// The sub-channel `sub` of `parent`, which has to be in `phase`.
///
/// Called with the parent locked, so the sub-channel is only tried: a
/// sub-channel that is busy registering waits for the parent lock.
fn expect_sub(parent: &Channel, sub: ChannelId, phase: Phase) -> Result<(Channel, State)> {
    let sub = parent.shared().channel(&sub)?;
    if sub.parent() != Some(parent.id()) {
        return Err(Error::InvalidProposal(format!(
            "{} is not a sub-channel of {}",
            sub.id(),
            parent.id()
        )));
    }
    let m = sub.try_lock_machine()?;
    if m.phase() != phase {
        return Err(MachineError::WrongPhase {
            expected: phase,
            actual: m.phase(),
        }
        .into());
    }
    let state = m.current().state.clone();
    drop(m);
    Ok((sub, state))
}

/// Locks the initial balances of `sub` in its parent. Called by the
/// proposer of the sub-channel once the initial state is signed.
pub(super) async fn fund(sub: &Channel, init: &State) -> Result<()> {
    let parent_id = sub.parent().ok_or(Error::UnknownChannel(sub.id()))?;
    let parent = sub.shared().channel(&parent_id)?;
    let index_map = index_map(sub.params(), parent.params())?;
    let id = sub.id();
    let timeout = sub.shared().cfg.update_timeout();

    parent
        .propose_with(
            timeout,
            |current| {
                let mut next = current.make_next_state();
                next.allocation.lock(id, &init.allocation.balances, index_map)?;
                Ok(next)
            },
            |base| UpdateProposal::SubChannelFunding { base, sub: id },
        )
        .await?;
    info!(channel = %parent_id, sub = %id, "Sub-channel funded");
    Ok(())
}

/// Checks that `next` locks exactly the initial balances of the pending
/// sub-channel `sub`.
pub(super) fn check_funding(parent: &Channel, current: &State, next: &State, sub: ChannelId) -> Result<()> {
    let (sub, init) = expect_sub(parent, sub, Phase::Funding)?;
    let mut expected = current.make_next_state();
    expected
        .allocation
        .lock(sub.id(), &init.allocation.balances, index_map(sub.params(), parent.params())?)?;
    check_next(&expected, next)
}

/// Checks that `next` releases the final balances of `sub`.
pub(super) fn check_settlement(parent: &Channel, current: &State, next: &State, sub: ChannelId) -> Result<()> {
    let (sub, fin) = expect_sub(parent, sub, Phase::Final)?;
    let mut expected = current.make_next_state();
    expected.allocation.unlock(sub.id(), &fin.allocation.balances)?;
    check_next(&expected, next)
}

/// Releases the funds of a final sub-channel into its parent and forgets the
/// sub-channel.
pub(super) async fn settle(sub: &Channel) -> Result<()> {
    let parent_id = sub.parent().ok_or(Error::UnknownChannel(sub.id()))?;
    let m = sub.lock_machine().await;
    if m.phase() != Phase::Final {
        return Err(MachineError::WrongPhase {
            expected: Phase::Final,
            actual: m.phase(),
        }
        .into());
    }
    if !sub.shared().children(&sub.id()).is_empty() {
        return Err(WatcherError::HasChildren(sub.id()).into());
    }
    let parent = sub.shared().channel(&parent_id)?;
    if parent.phase().await.is_on_chain() {
        return Err(Error::ParentOnChain(parent_id));
    }

    let id = sub.id();
    let final_bals = m.current().state.allocation.balances.clone();
    let timeout = sub.shared().cfg.update_timeout();
    parent
        .propose_with(
            timeout,
            |current| {
                let mut next = current.make_next_state();
                next.allocation.unlock(id, &final_bals)?;
                Ok(next)
            },
            |base| UpdateProposal::SubChannelSettlement { base, sub: id },
        )
        .await?;
    drop(m);

    info!(channel = %parent_id, sub = %id, "Sub-channel settled");
    sub.close_tree().await;
    Ok(())
}
