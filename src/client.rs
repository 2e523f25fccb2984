//! The client drives channels: it proposes and accepts channels, exchanges
//! updates with peers and handles disputes.
//!
//! All backends (wallet, transport, ledgers, storage) are passed in through
//! [Backends]. Incoming messages are handed to [PerunClient::handle_message],
//! either directly or by [PerunClient::serve].

mod channel;
mod dispute;
mod proposal;
mod subchannel;
mod sync;
mod update;
mod virtual_channel;


pub use channel::Channel;
pub use proposal::ProposalResponder;
pub use update::UpdateResponder;

use crate::{
    adjudicator::{Adjudicator, AdjudicatorEvent, Funder},
    channel::{ChannelId, Phase, SignedState, State},
    config::ClientConfig,
    encoding::types::{Hash, Signature},
    error::{Error, Result},
    matcher::Matcher,
    messages::{ChannelProposal, ChannelUpdate, Envelope, Identity, ParticipantMessage},
    persistence::{parents_first, Persister, Restorer},
    sig::{Verifier, Wallet},
    watcher::Watcher,
    wire::Bus,
};
use async_trait::async_trait;
use proposal::ProposalResponse;
use std::{
    collections::HashMap,
    hash::Hash as StdHash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use update::UpdateResponse;
use virtual_channel::VirtualMatch;

/// Decides about channels proposed by peers.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle_proposal(&self, proposal: ChannelProposal, responder: ProposalResponder);
}

/// Decides about plain updates proposed by peers.
///
/// Updates locking or releasing funds of nested channels are checked and
/// accepted by the client itself.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, current: State, update: ChannelUpdate, responder: UpdateResponder);
}

#[async_trait]
pub trait AdjudicatorEventHandler: Send + Sync {
    async fn handle_adjudicator_event(&self, channel: ChannelId, event: AdjudicatorEvent);
}

/// Everything the client talks to.
#[derive(Clone)]
pub struct Backends {
    pub wallet: Arc<dyn Wallet>,
    pub verifier: Arc<dyn Verifier>,
    pub bus: Arc<dyn Bus>,
    pub funder: Arc<dyn Funder>,
    pub adjudicator: Arc<dyn Adjudicator>,
    pub persister: Option<Arc<dyn Persister>>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Slots<K, V> = Mutex<HashMap<K, oneshot::Sender<V>>>;

/// Receiver for one expected answer, registered before the request is sent.
///
/// The slot is removed when this is dropped.
pub(crate) struct Pending<'a, K: Eq + StdHash + Clone, V> {
    slots: &'a Slots<K, V>,
    key: K,
    rx: oneshot::Receiver<V>,
}

impl<'a, K: Eq + StdHash + Clone, V> Pending<'a, K, V> {
    fn register(slots: &'a Slots<K, V>, key: K) -> Self {
        let (tx, rx) = oneshot::channel();
        lock(slots).insert(key.clone(), tx);
        Self { slots, key, rx }
    }

    pub(crate) async fn wait(&mut self, timeout: Duration) -> Result<V> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(v)) => Ok(v),
            _ => Err(Error::RequestTimedOut),
        }
    }
}

impl<K: Eq + StdHash + Clone, V> Drop for Pending<'_, K, V> {
    fn drop(&mut self) {
        self.rx.close();
        let mut slots = lock(self.slots);
        // A newer request may have replaced the slot.
        if slots.get(&self.key).map_or(false, oneshot::Sender::is_closed) {
            slots.remove(&self.key);
        }
    }
}

/// Delivers an answer to its [Pending] receiver, `false` if nobody waits.
fn deliver<K: Eq + StdHash, V>(slots: &Slots<K, V>, key: &K, value: V) -> bool {
    match lock(slots).remove(key) {
        Some(tx) => tx.send(value).is_ok(),
        None => false,
    }
}

#[derive(Default)]
struct Handlers {
    proposal: Option<Arc<dyn ProposalHandler>>,
    update: Option<Arc<dyn UpdateHandler>>,
}

pub(crate) struct Shared {
    pub(crate) identity: Identity,
    pub(crate) cfg: ClientConfig,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) verifier: Arc<dyn Verifier>,
    bus: Arc<dyn Bus>,
    pub(crate) funder: Arc<dyn Funder>,
    pub(crate) adjudicator: Arc<dyn Adjudicator>,
    pub(crate) persister: Option<Arc<dyn Persister>>,
    pub(crate) watcher: Watcher,
    handlers: Mutex<Handlers>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    proposals: Slots<Hash, ProposalResponse>,
    responses: Slots<(ChannelId, u64), UpdateResponse>,
    /// Sub-channels waiting for their funds to be locked in the parent.
    sub_funding: Slots<ChannelId, ()>,
    pub(crate) virtual_matcher: Matcher<ChannelId, VirtualMatch>,
    /// Virtual channels an intermediary has to present when registering the
    /// parent, by parent id.
    hub_sub_states: Mutex<HashMap<ChannelId, Vec<SignedState>>>,
}

impl Shared {
    pub(crate) async fn send(&self, recipient: &Identity, msg: ParticipantMessage) -> Result<()> {
        debug!(to = %recipient, msg = msg.name(), "Sending");
        self.bus
            .publish(Envelope {
                sender: self.identity.clone(),
                recipient: recipient.clone(),
                msg,
            })
            .await?;
        Ok(())
    }

    pub(crate) fn channel(&self, id: &ChannelId) -> Result<Channel> {
        lock(&self.channels)
            .get(id)
            .cloned()
            .ok_or(Error::UnknownChannel(*id))
    }

    pub(crate) fn insert_channel(&self, channel: Channel) {
        lock(&self.channels).insert(channel.id(), channel);
    }

    pub(crate) fn remove_channel(&self, id: &ChannelId) {
        lock(&self.channels).remove(id);
    }

    /// Channels whose parent is `id`.
    pub(crate) fn children(&self, id: &ChannelId) -> Vec<Channel> {
        lock(&self.channels)
            .values()
            .filter(|c| c.parent() == Some(*id))
            .cloned()
            .collect()
    }

    pub(crate) fn expect_proposal_response(&self, id: Hash) -> Pending<'_, Hash, ProposalResponse> {
        Pending::register(&self.proposals, id)
    }

    pub(crate) fn expect_update_response(
        &self,
        id: ChannelId,
        version: u64,
    ) -> Pending<'_, (ChannelId, u64), UpdateResponse> {
        Pending::register(&self.responses, (id, version))
    }

    pub(crate) fn expect_sub_funding(&self, sub: ChannelId) -> Pending<'_, ChannelId, ()> {
        Pending::register(&self.sub_funding, sub)
    }

    pub(crate) fn notify_sub_funded(&self, sub: &ChannelId) -> bool {
        deliver(&self.sub_funding, sub, ())
    }

    pub(crate) fn add_hub_sub_state(&self, parent: ChannelId, state: SignedState) {
        let mut hub = lock(&self.hub_sub_states);
        let states = hub.entry(parent).or_default();
        states.retain(|s| s.params.id() != state.params.id());
        states.push(state);
    }

    pub(crate) fn remove_hub_sub_state(&self, parent: &ChannelId, sub: &ChannelId) {
        if let Some(states) = lock(&self.hub_sub_states).get_mut(parent) {
            states.retain(|s| s.params.id() != *sub);
        }
    }

    pub(crate) fn hub_sub_states(&self, parent: &ChannelId) -> Vec<SignedState> {
        lock(&self.hub_sub_states)
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    fn update_handler(&self) -> Option<Arc<dyn UpdateHandler>> {
        lock(&self.handlers).update.clone()
    }

    fn proposal_handler(&self) -> Option<Arc<dyn ProposalHandler>> {
        lock(&self.handlers).proposal.clone()
    }

    async fn handle_message(self: &Arc<Self>, env: Envelope) -> Result<()> {
        if env.recipient != self.identity {
            debug!(to = %env.recipient, "Dropping message for someone else");
            return Ok(());
        }
        let from = env.sender;
        debug!(%from, msg = env.msg.name(), "Received");

        match env.msg {
            ParticipantMessage::ChannelProposal(prop) => self.handle_proposal(from, prop).await,
            ParticipantMessage::ProposalAccepted(acc) => {
                let id = acc.proposal_id;
                if !deliver(&self.proposals, &id, ProposalResponse::Accepted(acc)) {
                    debug!("Late or unknown proposal acceptance");
                }
                Ok(())
            }
            ParticipantMessage::ProposalRejected(rej) => {
                let id = rej.proposal_id;
                if !deliver(&self.proposals, &id, ProposalResponse::Rejected(rej.reason)) {
                    debug!("Late or unknown proposal rejection");
                }
                Ok(())
            }
            ParticipantMessage::ChannelUpdate(proposal) => {
                let channel = match self.channel(&proposal.channel()) {
                    Ok(ch) => ch,
                    Err(e) => {
                        update::reject_unknown(self, &from, &proposal).await;
                        return Err(e);
                    }
                };
                channel.handle_update_req(&from, proposal).await
            }
            ParticipantMessage::ChannelUpdateAccepted(acc) => {
                let key = (acc.channel, acc.version);
                if !deliver(&self.responses, &key, UpdateResponse::Accepted(acc.sig)) {
                    debug!(channel = %acc.channel, version = acc.version, "Late or unknown update acceptance");
                }
                Ok(())
            }
            ParticipantMessage::ChannelUpdateRejected(rej) => {
                let key = (rej.channel, rej.version);
                if !deliver(&self.responses, &key, UpdateResponse::Rejected(rej.reason)) {
                    debug!(channel = %rej.channel, version = rej.version, "Late or unknown update rejection");
                }
                Ok(())
            }
            ParticipantMessage::ChannelSync(msg) => {
                let channel = self.channel(&msg.current.state.id())?;
                channel.handle_sync(&from, msg).await
            }
        }
    }
}

/// Answer to an update we proposed, delivered by [Shared::handle_message].
pub(crate) fn signature_of(resp: UpdateResponse) -> Result<Signature> {
    match resp {
        UpdateResponse::Accepted(sig) => Ok(sig),
        UpdateResponse::Rejected(reason) => Err(Error::PeerRejected(reason)),
    }
}

/// The main Perun object, used to create new channels and to react to
/// messages from peers.
///
/// Cheap to clone, clones share all channels.
#[derive(Clone)]
pub struct PerunClient {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for PerunClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerunClient")
            .field("identity", &self.shared.identity)
            .field("address", &self.shared.wallet.address())
            .field("channels", &lock(&self.shared.channels).len())
            .finish()
    }
}

impl PerunClient {
    pub fn new(identity: Identity, cfg: ClientConfig, backends: Backends) -> Self {
        let watcher = Watcher::new(
            backends.adjudicator.clone(),
            backends.wallet.address(),
            cfg.resubscribe_delay(),
        );
        PerunClient {
            shared: Arc::new(Shared {
                identity,
                cfg,
                wallet: backends.wallet,
                verifier: backends.verifier,
                bus: backends.bus,
                funder: backends.funder,
                adjudicator: backends.adjudicator,
                persister: backends.persister,
                watcher,
                handlers: Mutex::default(),
                channels: Mutex::default(),
                proposals: Mutex::default(),
                responses: Mutex::default(),
                sub_funding: Mutex::default(),
                virtual_matcher: Matcher::new(),
                hub_sub_states: Mutex::default(),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Sets the handlers for incoming proposals and updates. Without them,
    /// proposals and plain updates are rejected.
    pub fn handle(&self, proposals: Arc<dyn ProposalHandler>, updates: Arc<dyn UpdateHandler>) {
        let mut handlers = lock(&self.shared.handlers);
        handlers.proposal = Some(proposals);
        handlers.update = Some(updates);
    }

    /// Processes one incoming message. Waits for the handlers, so messages
    /// should be handled concurrently (see [PerunClient::serve]).
    pub async fn handle_message(&self, env: Envelope) -> Result<()> {
        self.shared.handle_message(env).await
    }

    /// Handles every message of `incoming` in its own task until the sender
    /// side is closed.
    pub async fn serve(&self, mut incoming: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(env) = incoming.recv().await {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let msg = env.msg.name();
                if let Err(e) = shared.handle_message(env).await {
                    warn!(msg, error = %e, "Handling message failed");
                }
            });
        }
        debug!(identity = %self.shared.identity, "Stopped serving");
    }

    /// Proposes a channel to the peer in `proposal.peers` and returns it once
    /// it is funded.
    pub async fn propose_channel(&self, proposal: ChannelProposal) -> Result<Channel> {
        self.shared.propose_channel(proposal).await
    }

    pub fn channel(&self, id: &ChannelId) -> Result<Channel> {
        self.shared.channel(id)
    }

    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.shared.channels).values().cloned().collect()
    }

    /// Recreates the channels persisted in `restorer`, parents first, and
    /// synchronizes them with the peers.
    pub async fn restore(&self, restorer: &dyn Restorer) -> Result<Vec<Channel>> {
        let sources = parents_first(restorer.restore_all().await?);
        let mut restored = Vec::with_capacity(sources.len());
        for source in sources {
            let id = source.id();
            if source.phase == Phase::Withdrawn {
                continue;
            }
            if self.shared.channel(&id).is_ok() {
                debug!(channel = %id, "Already open, not restoring");
                continue;
            }
            match Channel::restore(&self.shared, source).await {
                Ok(channel) => restored.push(channel),
                Err(e) => warn!(channel = %id, error = %e, "Restoring channel failed"),
            }
        }
        info!(restored = restored.len(), "Restored channels");
        Ok(restored)
    }

    /// Stops watching all channels and forgets them. Channels are not
    /// settled.
    pub async fn close(&self) {
        let channels: Vec<Channel> = lock(&self.shared.channels).drain().map(|(_, c)| c).collect();
        for ch in &channels {
            ch.close_events();
        }
        self.shared.watcher.stop_all().await;
        info!(identity = %self.shared.identity, channels = channels.len(), "Client closed");
    }
}
