use super::{lock, Shared};
use crate::{
    adjudicator::AdjudicatorReq,
    channel::{ChannelId, Idx, Machine, Params, Phase, SignedState, State, Transaction},
    error::{Error, Result},
    messages::Identity,
    persistence::ChannelSource,
    watcher::{EventsSub, StatesPub, WatcherError},
};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

type UpdateCallback = Box<dyn Fn(&State, &State) + Send + Sync>;

pub(crate) struct ChannelInner {
    shared: Arc<Shared>,
    id: ChannelId,
    idx: Idx,
    params: Params,
    /// Network identities by participant index.
    peers: Vec<Identity>,
    parent: Option<ChannelId>,
    pub(super) machine: Arc<tokio::sync::Mutex<Machine>>,
    states: Mutex<Option<StatesPub>>,
    pub(super) events: Mutex<Option<EventsSub>>,
    on_update: Mutex<Vec<UpdateCallback>>,
}

/// Controller of one channel, cheap to clone.
///
/// All clones refer to the same channel. Operations on a channel are
/// serialized by the lock around its [Machine]: a second update started
/// while one is in flight fails with [Error::ChannelBusy]. A child may wait
/// for its parent's lock, a parent never waits for a child's.
#[derive(Clone)]
pub struct Channel {
    pub(super) inner: Arc<ChannelInner>,
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("idx", &self.inner.idx)
            .field("parent", &self.inner.parent)
            .finish()
    }
}

impl Channel {
    pub(super) fn new(
        shared: Arc<Shared>,
        machine: Machine,
        peers: Vec<Identity>,
        parent: Option<ChannelId>,
    ) -> Self {
        Channel {
            inner: Arc::new(ChannelInner {
                shared,
                id: machine.id(),
                idx: machine.idx(),
                params: machine.params().clone(),
                peers,
                parent,
                machine: Arc::new(tokio::sync::Mutex::new(machine)),
                states: Mutex::new(None),
                events: Mutex::new(None),
                on_update: Mutex::default(),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Our participant index.
    pub fn idx(&self) -> Idx {
        self.inner.idx
    }

    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    /// Channel the funds of this sub- or virtual channel are locked in.
    pub fn parent(&self) -> Option<ChannelId> {
        self.inner.parent
    }

    pub fn peers(&self) -> &[Identity] {
        &self.inner.peers
    }

    pub(super) fn peer_idx(&self) -> Idx {
        1 - self.inner.idx
    }

    pub(super) fn peer(&self) -> &Identity {
        &self.inner.peers[self.peer_idx()]
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// The current, fully signed state.
    pub async fn state(&self) -> State {
        self.inner.machine.lock().await.current().state.clone()
    }

    pub async fn transaction(&self) -> Transaction {
        self.inner.machine.lock().await.current().clone()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.machine.lock().await.phase()
    }

    /// Calls `f(from, to)` after every state both participants agreed on.
    pub fn on_update(&self, f: impl Fn(&State, &State) + Send + Sync + 'static) {
        lock(&self.inner.on_update).push(Box::new(f));
    }

    pub(super) fn try_lock_machine(&self) -> Result<OwnedMutexGuard<Machine>> {
        self.inner
            .machine
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::ChannelBusy)
    }

    pub(super) async fn lock_machine(&self) -> OwnedMutexGuard<Machine> {
        self.inner.machine.clone().lock_owned().await
    }

    pub(super) fn source(&self, m: &Machine) -> ChannelSource {
        ChannelSource {
            params: m.params().clone(),
            idx: m.idx(),
            phase: m.phase(),
            current: m.current().clone(),
            peers: self.inner.peers.clone(),
            parent: self.inner.parent,
        }
    }

    pub(super) fn adjudicator_req(&self, m: &Machine, secondary: bool) -> AdjudicatorReq {
        AdjudicatorReq {
            params: m.params().clone(),
            acc: self.inner.shared.wallet.address(),
            tx: m.current().clone(),
            idx: m.idx(),
            secondary,
        }
    }

    pub(super) async fn persist_created(&self, m: &Machine) {
        let Some(persister) = &self.inner.shared.persister else {
            return;
        };
        if let Err(e) = persister.channel_created(&self.source(m)).await {
            warn!(channel = %self.id(), error = %e, "Persisting new channel failed");
        }
    }

    pub(super) async fn persist_updated(&self, m: &Machine) {
        let Some(persister) = &self.inner.shared.persister else {
            return;
        };
        if let Err(e) = persister.channel_updated(&self.source(m)).await {
            warn!(channel = %self.id(), version = m.current().version(), error = %e, "Persisting channel failed");
        }
    }

    /// Runs everything that follows a newly agreed state: callbacks, the
    /// watcher and persistence.
    pub(super) async fn committed(&self, m: &Machine, from: &State) {
        let to = &m.current().state;
        debug!(channel = %self.id(), version = to.version(), "Update enabled");
        for f in lock(&self.inner.on_update).iter() {
            f(from, to);
        }
        self.publish(m.current().clone());
        self.persist_updated(m).await;
    }

    fn publish(&self, tx: Transaction) {
        if let Some(states) = lock(&self.inner.states).as_ref() {
            if let Err(e) = states.publish(tx) {
                warn!(channel = %self.id(), error = %e, "Publishing to watcher failed");
            }
        }
    }

    /// Starts watching the channel with its current transaction. Sub- and
    /// virtual channels are watched below their parent.
    pub(super) async fn start_watching(&self, m: &Machine) -> Result<()> {
        let watcher = &self.inner.shared.watcher;
        let (params, idx, tx) = (m.params().clone(), m.idx(), m.current().clone());
        let (states, events) = match self.inner.parent {
            None => watcher.start_watching_ledger_channel(params, idx, tx).await?,
            Some(parent) => watcher.start_watching_sub_channel(parent, params, idx, tx).await?,
        };
        *lock(&self.inner.states) = Some(states);
        *lock(&self.inner.events) = Some(events);
        Ok(())
    }

    /// Latest fully signed state as published to the watcher.
    fn latest_signed(&self) -> Option<SignedState> {
        let tx = lock(&self.inner.states).as_ref().map(StatesPub::latest)?;
        SignedState::from_transaction(self.inner.params.clone(), &tx)
    }

    /// This channel followed by all its descendants, parents before children.
    fn tree(&self) -> Vec<Channel> {
        let mut tree = vec![self.clone()];
        let mut i = 0;
        while i < tree.len() {
            let children = self.inner.shared.children(&tree[i].id());
            tree.extend(children);
            i += 1;
        }
        tree
    }

    /// States of all descendants, needed to register this channel. Includes
    /// the virtual channels an intermediary funded from this tree.
    pub(super) fn sub_states(&self) -> Vec<SignedState> {
        let shared = &self.inner.shared;
        let tree = self.tree();
        let mut states: Vec<SignedState> = tree.iter().skip(1).filter_map(Channel::latest_signed).collect();
        for ch in &tree {
            states.extend(shared.hub_sub_states(&ch.id()));
        }
        states
    }

    /// Ledger channel at the top of this channel's tree.
    pub(super) fn root(&self) -> Result<Channel> {
        let mut ch = self.clone();
        while let Some(parent) = ch.parent() {
            ch = self.inner.shared.channel(&parent)?;
        }
        Ok(ch)
    }

    /// Stops watching this channel and its descendants and forgets them,
    /// children first.
    pub(super) async fn close_tree(&self) {
        let shared = &self.inner.shared;
        for ch in self.tree().iter().rev() {
            match shared.watcher.stop_watching(ch.id()).await {
                Ok(()) | Err(WatcherError::NotWatched(_)) => {}
                Err(e) => warn!(channel = %ch.id(), error = %e, "Stopping watcher failed"),
            }
            ch.close_events();
            shared.remove_channel(&ch.id());
            if let Some(persister) = &shared.persister {
                if let Err(e) = persister.channel_removed(ch.id()).await {
                    debug!(channel = %ch.id(), error = %e, "Removing persisted channel failed");
                }
            }
        }
        info!(channel = %self.id(), "Channel closed");
    }

    pub(super) fn close_events(&self) {
        lock(&self.inner.states).take();
        lock(&self.inner.events).take();
    }
}
