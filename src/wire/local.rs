//! In-memory transport, connects clients running in the same process.

use super::{decode_frame, encode_frame, Bus, WireError};
use crate::messages::{Envelope, Identity};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Routes {
    peers: HashMap<Identity, mpsc::UnboundedSender<Envelope>>,
    offline: HashSet<Identity>,
}

/// Routes envelopes by recipient.
///
/// With [LocalNetwork::with_codec] every message goes through the protobuf
/// framing, which checks that all messages survive encoding.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
    codec: bool,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec() -> Self {
        Self {
            codec: true,
            ..Self::default()
        }
    }

    /// Registers `identity`, replacing an earlier connection.
    pub fn connect(&self, identity: Identity) -> (LocalBus, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes();
        routes.offline.remove(&identity);
        routes.peers.insert(identity.clone(), tx);
        drop(routes);
        let bus = LocalBus {
            identity,
            net: self.clone(),
        };
        (bus, rx)
    }

    /// Messages to an offline peer are silently dropped, like on a lossy
    /// network.
    pub fn set_offline(&self, identity: &Identity, offline: bool) {
        let mut routes = self.routes();
        if offline {
            routes.offline.insert(identity.clone());
        } else {
            routes.offline.remove(identity);
        }
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, env: Envelope) -> Result<(), WireError> {
        let env = if self.codec {
            decode_frame(&encode_frame(&env)?)?
        } else {
            env
        };

        let routes = self.routes();
        if routes.offline.contains(&env.recipient) || routes.offline.contains(&env.sender) {
            tracing::debug!(recipient = %env.recipient, msg = env.msg.name(), "Dropping message");
            return Ok(());
        }
        let peer = routes
            .peers
            .get(&env.recipient)
            .ok_or_else(|| WireError::UnknownRecipient(env.recipient.clone()))?;
        let recipient = env.recipient.clone();
        peer.send(env)
            .map_err(|_| WireError::UnknownRecipient(recipient))
    }
}

/// Sending half of a [LocalNetwork] connection.
#[derive(Clone)]
pub struct LocalBus {
    identity: Identity,
    net: LocalNetwork,
}

impl LocalBus {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, env: Envelope) -> Result<(), WireError> {
        tracing::trace!(from = %env.sender, to = %env.recipient, msg = env.msg.name(), "Publishing");
        self.net.route(env)
    }
}
