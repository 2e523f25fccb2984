//! Watches channels on-chain and refutes registrations of outdated states.
//!
//! Every watched channel gets a node with its own task. The task consumes
//! the adjudicator events of the channel and, whenever a version older than
//! the latest published one is registered, registers the latest states of
//! the whole channel tree (root ledger channel plus all sub-channels).

use crate::{
    adjudicator::{Adjudicator, AdjudicatorError, AdjudicatorEvent, AdjudicatorReq, AdjudicatorSubscription},
    channel::{ChannelId, Idx, Params, SignedState, Transaction},
    encoding::types::Address,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("channel {0} is already watched")]
    AlreadyWatched(ChannelId),
    #[error("channel {0} is not watched")]
    NotWatched(ChannelId),
    #[error("parent channel {0} is not watched")]
    ParentNotWatched(ChannelId),
    #[error("channel {0} has watched sub-channels")]
    HasChildren(ChannelId),
    #[error("published version {published} is older than the current version {current}")]
    OutOfOrderPublish { current: u64, published: u64 },
    #[error("transaction of version {0} is not fully signed")]
    NotFullySigned(u64),
    #[error("transaction belongs to channel {actual}, expected {expected}")]
    ChannelMismatch { expected: ChannelId, actual: ChannelId },
    #[error(transparent)]
    Adjudicator(#[from] AdjudicatorError),
}

/// Outcome of a refutation triggered by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refutation {
    /// Version that was registered to refute.
    pub version: u64,
    /// Set if the refutation failed, it is retried on the next outdated
    /// registration.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchedEvent {
    pub event: AdjudicatorEvent,
    pub refutation: Option<Refutation>,
}

/// Publishes newly agreed states of one channel to its watcher node.
#[derive(Debug)]
pub struct StatesPub {
    id: ChannelId,
    num_parts: usize,
    tx: watch::Sender<Transaction>,
}

fn check_tx(id: ChannelId, num_parts: usize, tx: &Transaction) -> Result<(), WatcherError> {
    if tx.state.id() != id {
        return Err(WatcherError::ChannelMismatch {
            expected: id,
            actual: tx.state.id(),
        });
    }
    if tx.sigs.len() != num_parts || !tx.is_fully_signed() {
        return Err(WatcherError::NotFullySigned(tx.version()));
    }
    Ok(())
}

impl StatesPub {
    /// Replaces the state the watcher refutes with. Publishing an older
    /// version than the last one is an error and changes nothing.
    pub fn publish(&self, tx: Transaction) -> Result<(), WatcherError> {
        check_tx(self.id, self.num_parts, &tx)?;
        let current = self.tx.borrow().version();
        if tx.version() < current {
            return Err(WatcherError::OutOfOrderPublish {
                current,
                published: tx.version(),
            });
        }
        debug!(channel = %self.id, version = tx.version(), "Published to watcher");
        self.tx.send_replace(tx);
        Ok(())
    }

    pub fn latest(&self) -> Transaction {
        self.tx.borrow().clone()
    }
}

/// Adjudicator events of one channel, as seen by its watcher node.
#[derive(Debug)]
pub struct EventsSub {
    rx: mpsc::UnboundedReceiver<WatchedEvent>,
}

impl EventsSub {
    /// `None` once the channel is no longer watched.
    pub async fn next(&mut self) -> Option<WatchedEvent> {
        self.rx.recv().await
    }
}

struct Node {
    params: Params,
    idx: Idx,
    parent: Option<ChannelId>,
    latest: watch::Receiver<Transaction>,
    /// Latest version a refutation of this node's tree succeeded with.
    refuted_with: Mutex<Option<u64>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    fn id(&self) -> ChannelId {
        self.params.id()
    }

    fn latest(&self) -> Transaction {
        self.latest.borrow().clone()
    }

    fn refuted_with(&self) -> MutexGuard<'_, Option<u64>> {
        self.refuted_with.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    adjudicator: Arc<dyn Adjudicator>,
    acc: Address,
    resubscribe_delay: Duration,
    nodes: Mutex<HashMap<ChannelId, Arc<Node>>>,
    /// Held while refuting, one registration covers a whole tree.
    refuting: tokio::sync::Mutex<()>,
}

/// Cheap to clone, all clones share the watched channels.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Watcher")
            .field("acc", &self.inner.acc)
            .field("watched", &self.inner.lock().len())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<Node>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Root ledger channel of `node` and every channel below it.
    fn tree_of(&self, node: &Arc<Node>) -> Result<(Arc<Node>, Vec<Arc<Node>>), WatcherError> {
        let nodes = self.lock();
        let mut root = node.clone();
        while let Some(parent) = root.parent {
            root = nodes
                .get(&parent)
                .cloned()
                .ok_or(WatcherError::ParentNotWatched(parent))?;
        }

        let mut in_tree = HashSet::from([root.id()]);
        let mut subs = Vec::new();
        // Children are only added after their parent, a fixed point is
        // reached after at most depth many passes.
        loop {
            let before = subs.len();
            for n in nodes.values() {
                if let Some(parent) = n.parent {
                    if in_tree.contains(&parent) && in_tree.insert(n.id()) {
                        subs.push(n.clone());
                    }
                }
            }
            if subs.len() == before {
                break;
            }
        }
        Ok((root, subs))
    }

    /// Registers the latest states of the tree of `node`. Returns the nodes
    /// the registration covered, with the version each was registered with.
    async fn refute(&self, node: &Arc<Node>) -> Result<Vec<(Arc<Node>, u64)>, WatcherError> {
        let (root, subs) = self.tree_of(node)?;
        let tx = root.latest();
        let mut covered = vec![(root.clone(), tx.version())];
        let mut sub_states = Vec::new();
        for n in subs {
            let latest = n.latest();
            if let Some(state) = SignedState::from_transaction(n.params.clone(), &latest) {
                covered.push((n, latest.version()));
                sub_states.push(state);
            }
        }
        let req = AdjudicatorReq {
            params: root.params.clone(),
            acc: self.acc,
            tx,
            idx: root.idx,
            secondary: false,
        };
        info!(channel = %node.id(), root = %root.id(), subs = sub_states.len(), "Refuting");
        self.adjudicator.register(&req, &sub_states).await?;
        Ok(covered)
    }

    async fn handle_event(&self, node: &Arc<Node>, event: &AdjudicatorEvent) -> Option<Refutation> {
        let AdjudicatorEvent::Registered { version, .. } = event else {
            return None;
        };
        if *version >= node.latest().version() {
            return None;
        }
        let _refuting = self.refuting.lock().await;
        let latest = node.latest().version();
        if *node.refuted_with() == Some(latest) {
            debug!(channel = %node.id(), version, latest, "Already refuted");
            return None;
        }

        warn!(channel = %node.id(), version, latest, "Outdated state registered");
        match self.refute(node).await {
            Ok(covered) => {
                for (n, v) in covered {
                    *n.refuted_with() = Some(v);
                }
                Some(Refutation {
                    version: latest,
                    error: None,
                })
            }
            Err(e) => {
                warn!(channel = %node.id(), error = %e, "Refutation failed");
                Some(Refutation {
                    version: latest,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Re-opens the subscription after the delay until it succeeds, `None`
    /// if the node was cancelled meanwhile.
    async fn resubscribe(&self, node: &Node) -> Option<Box<dyn AdjudicatorSubscription>> {
        loop {
            tokio::select! {
                _ = node.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
            match self.adjudicator.subscribe(node.id()).await {
                Ok(sub) => {
                    debug!(channel = %node.id(), "Resubscribed");
                    return Some(sub);
                }
                Err(e) => warn!(channel = %node.id(), error = %e, "Resubscribing failed"),
            }
        }
    }
}

async fn run_node(
    inner: Arc<Inner>,
    node: Arc<Node>,
    mut sub: Box<dyn AdjudicatorSubscription>,
    events: mpsc::UnboundedSender<WatchedEvent>,
) {
    loop {
        let next = tokio::select! {
            _ = node.cancel.cancelled() => break,
            next = sub.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                debug!(channel = %node.id(), event = event.name(), version = event.version(), "Adjudicator event");
                let refutation = inner.handle_event(&node, &event).await;
                // Nobody listening is fine, we keep watching.
                let _ = events.send(WatchedEvent { event, refutation });
            }
            Some(Err(e)) => warn!(channel = %node.id(), error = %e, "Subscription error"),
            None => {
                warn!(channel = %node.id(), "Subscription ended");
                sub.close().await;
                match inner.resubscribe(&node).await {
                    Some(new) => sub = new,
                    None => {
                        debug!(channel = %node.id(), "Stopped watching");
                        return;
                    }
                }
            }
        }
    }
    sub.close().await;
    debug!(channel = %node.id(), "Stopped watching");
}

impl Watcher {
    /// `acc` receives funds if the watcher has to register.
    pub fn new(adjudicator: Arc<dyn Adjudicator>, acc: Address, resubscribe_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                adjudicator,
                acc,
                resubscribe_delay,
                nodes: Mutex::default(),
                refuting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub async fn start_watching_ledger_channel(
        &self,
        params: Params,
        idx: Idx,
        tx: Transaction,
    ) -> Result<(StatesPub, EventsSub), WatcherError> {
        self.start(params, idx, None, tx).await
    }

    /// The parent has to be watched already.
    pub async fn start_watching_sub_channel(
        &self,
        parent: ChannelId,
        params: Params,
        idx: Idx,
        tx: Transaction,
    ) -> Result<(StatesPub, EventsSub), WatcherError> {
        self.start(params, idx, Some(parent), tx).await
    }

    async fn start(
        &self,
        params: Params,
        idx: Idx,
        parent: Option<ChannelId>,
        tx: Transaction,
    ) -> Result<(StatesPub, EventsSub), WatcherError> {
        let id = params.id();
        check_tx(id, params.num_parts(), &tx)?;
        let version = tx.version();

        // Subscribe first, so no event between now and the start of the task
        // is missed.
        let mut sub = Some(self.inner.adjudicator.subscribe(id).await?);

        let started = {
            let mut nodes = self.inner.lock();
            if nodes.contains_key(&id) {
                Err(WatcherError::AlreadyWatched(id))
            } else if let Some(p) = parent.filter(|p| !nodes.contains_key(p)) {
                Err(WatcherError::ParentNotWatched(p))
            } else {
                let (states_tx, states_rx) = watch::channel(tx);
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let num_parts = params.num_parts();
                let node = Arc::new(Node {
                    params,
                    idx,
                    parent,
                    latest: states_rx,
                    refuted_with: Mutex::new(None),
                    cancel: CancellationToken::new(),
                    handle: Mutex::new(None),
                });
                if let Some(sub) = sub.take() {
                    let handle = tokio::spawn(run_node(self.inner.clone(), node.clone(), sub, events_tx));
                    *node.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                }
                nodes.insert(id, node);
                Ok((
                    StatesPub {
                        id,
                        num_parts,
                        tx: states_tx,
                    },
                    EventsSub { rx: events_rx },
                ))
            }
        };
        if let Some(mut sub) = sub {
            sub.close().await;
        }
        if started.is_ok() {
            info!(channel = %id, version, parent = ?parent, "Started watching");
        }
        started
    }

    pub fn is_watching(&self, id: &ChannelId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Stops watching `id` and waits for its task to end. Sub-channels have
    /// to be stopped first.
    pub async fn stop_watching(&self, id: ChannelId) -> Result<(), WatcherError> {
        let node = {
            let mut nodes = self.inner.lock();
            if !nodes.contains_key(&id) {
                return Err(WatcherError::NotWatched(id));
            }
            if nodes.values().any(|n| n.parent == Some(id)) {
                return Err(WatcherError::HasChildren(id));
            }
            nodes.remove(&id)
        };
        let Some(node) = node else {
            return Err(WatcherError::NotWatched(id));
        };

        node.cancel.cancel();
        let handle = node.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(channel = %id, error = %e, "Watcher task failed");
            }
        }
        info!(channel = %id, "Stopped watching");
        Ok(())
    }

    /// Stops all nodes, children before their parents.
    pub async fn stop_all(&self) {
        loop {
            let leaf = {
                let nodes = self.inner.lock();
                nodes
                    .keys()
                    .find(|id| !nodes.values().any(|n| n.parent == Some(**id)))
                    .copied()
            };
            let Some(id) = leaf else { break };
            if let Err(e) = self.stop_watching(id).await {
                debug!(channel = %id, error = %e, "Stopping failed");
            }
        }
    }
}

#[cfg(test)]
mod tests;
