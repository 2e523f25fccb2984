//! Storing channels so a client can continue after a restart.

use crate::{
    channel::{ChannelId, Idx, Params, Phase, Transaction},
    messages::Identity,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("channel {0} is not persisted")]
    UnknownChannel(ChannelId),
    #[error("persistence backend failed: {0}")]
    Backend(String),
}

/// Everything needed to restore a channel controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSource {
    pub params: Params,
    pub idx: Idx,
    pub phase: Phase,
    pub current: Transaction,
    /// Network identities of the participants, by participant index.
    pub peers: Vec<Identity>,
    pub parent: Option<ChannelId>,
}

impl ChannelSource {
    pub fn id(&self) -> ChannelId {
        self.params.id()
    }
}

#[async_trait]
pub trait Persister: Send + Sync {
    async fn channel_created(&self, source: &ChannelSource) -> Result<(), PersistenceError>;

    /// Called after every phase change or new fully signed state.
    async fn channel_updated(&self, source: &ChannelSource) -> Result<(), PersistenceError>;

    async fn channel_removed(&self, id: ChannelId) -> Result<(), PersistenceError>;
}

#[async_trait]
pub trait Restorer: Send + Sync {
    async fn restore_all(&self) -> Result<Vec<ChannelSource>, PersistenceError>;

    /// Channels shared with `peer`.
    async fn restore_peer(&self, peer: &Identity) -> Result<Vec<ChannelSource>, PersistenceError>;
}

/// Keeps channels in memory, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    channels: Mutex<HashMap<ChannelId, ChannelSource>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelSource>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &ChannelId) -> Option<ChannelSource> {
        self.lock().get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn channel_created(&self, source: &ChannelSource) -> Result<(), PersistenceError> {
        self.lock().insert(source.id(), source.clone());
        Ok(())
    }

    async fn channel_updated(&self, source: &ChannelSource) -> Result<(), PersistenceError> {
        match self.lock().get_mut(&source.id()) {
            Some(stored) => {
                *stored = source.clone();
                Ok(())
            }
            None => Err(PersistenceError::UnknownChannel(source.id())),
        }
    }

    async fn channel_removed(&self, id: ChannelId) -> Result<(), PersistenceError> {
        self.lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(PersistenceError::UnknownChannel(id))
    }
}

#[async_trait]
impl Restorer for MemoryPersister {
    async fn restore_all(&self) -> Result<Vec<ChannelSource>, PersistenceError> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn restore_peer(&self, peer: &Identity) -> Result<Vec<ChannelSource>, PersistenceError> {
        Ok(self
            .lock()
            .values()
            .filter(|s| s.peers.contains(peer))
            .cloned()
            .collect())
    }
}

/// Orders `sources` so every parent comes before its children. Channels whose
/// parent is missing are dropped.
pub fn parents_first(sources: Vec<ChannelSource>) -> Vec<ChannelSource> {
    let mut ordered: Vec<ChannelSource> = Vec::with_capacity(sources.len());
    let mut rest = sources;
    loop {
        let (ready, pending): (Vec<_>, Vec<_>) = rest.into_iter().partition(|s| match s.parent {
            None => true,
            Some(parent) => ordered.iter().any(|o| o.id() == parent),
        });
        if ready.is_empty() {
            if !pending.is_empty() {
                tracing::warn!(orphans = pending.len(), "Dropping channels without parent");
            }
            return ordered;
        }
        ordered.extend(ready);
        rest = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Allocation, State},
        encoding::types::{Address, U256},
        sig::Wallet,
        testing::{asset, balances, signed_tx, signers},
    };

    fn source(seed: u64, parent: Option<ChannelId>) -> ChannelSource {
        let (a, b) = signers(seed);
        let params = Params::new(
            10,
            U256::from(seed),
            vec![a.address(), b.address()],
            Address::default(),
            parent.is_none(),
            false,
        )
        .unwrap();
        let state = State::new(
            &params,
            Allocation::new(vec![asset(0, 1)], balances(&[&[1, 2]])),
            vec![],
        );
        ChannelSource {
            current: signed_tx(state, &[&a, &b]),
            params,
            idx: 0,
            phase: Phase::Acting,
            peers: vec!["alice".into(), "bob".into()],
            parent,
        }
    }

    #[tokio::test]
    async fn memory_persister_tracks_channels() {
        let p = MemoryPersister::new();
        let mut s = source(1, None);
        p.channel_created(&s).await.unwrap();

        s.phase = Phase::Final;
        p.channel_updated(&s).await.unwrap();
        assert_eq!(p.get(&s.id()).unwrap().phase, Phase::Final);

        assert_eq!(p.restore_peer(&Identity::from("bob")).await.unwrap().len(), 1);
        assert!(p.restore_peer(&Identity::from("carol")).await.unwrap().is_empty());

        p.channel_removed(s.id()).await.unwrap();
        assert!(p.is_empty());
        assert!(matches!(
            p.channel_updated(&s).await,
            Err(PersistenceError::UnknownChannel(_))
        ));
    }

    #[test]
    fn parents_are_ordered_first() {
        let root = source(1, None);
        let child = source(2, Some(root.id()));
        let grandchild = source(3, Some(child.id()));
        let orphan = source(4, Some(ChannelId::default()));

        let ordered = parents_first(vec![grandchild.clone(), orphan, child.clone(), root.clone()]);
        let ids: Vec<_> = ordered.iter().map(ChannelSource::id).collect();
        assert_eq!(ids, vec![root.id(), child.id(), grandchild.id()]);
    }
}
