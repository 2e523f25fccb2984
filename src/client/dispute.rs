//! Going on-chain: registering, progressing and withdrawing.

use super::{lock, subchannel, virtual_channel, AdjudicatorEventHandler, Channel};
use crate::{
    adjudicator::{AdjudicatorError, AdjudicatorEvent, ProgressReq, Timeout},
    channel::{Machine, MachineError, Phase, State, Transaction},
    error::{Error, Result},
    watcher::WatcherError,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Channel {
    /// Forwards the adjudicator events of this channel to `handler` until the
    /// channel is no longer watched. Registrations and progressions made by
    /// the peer are applied to the channel first.
    pub async fn watch(&self, handler: Arc<dyn AdjudicatorEventHandler>) -> Result<()> {
        let events = lock(&self.inner.events).take();
        let Some(mut events) = events else {
            return Err(WatcherError::NotWatched(self.id()).into());
        };
        while let Some(watched) = events.next().await {
            if let Some(refutation) = &watched.refutation {
                match &refutation.error {
                    None => info!(channel = %self.id(), version = refutation.version, "Refuted"),
                    Some(e) => warn!(channel = %self.id(), version = refutation.version, error = %e, "Refutation failed"),
                }
            }
            self.apply_event(&watched.event).await;
            handler.handle_adjudicator_event(self.id(), watched.event).await;
        }
        debug!(channel = %self.id(), "Event stream ended");
        Ok(())
    }

    async fn apply_event(&self, event: &AdjudicatorEvent) {
        let mut m = self.inner.machine.lock().await;
        let res = match event {
            AdjudicatorEvent::Registered { .. } if m.phase().is_off_chain() && m.phase() != Phase::Signing => {
                m.set_registered()
            }
            AdjudicatorEvent::Progressed { state, idx, .. }
                if m.phase() == Phase::Registered && *idx != m.idx() =>
            {
                let tx = Transaction::new(state.clone(), m.params().num_parts());
                m.set_progressing(state.clone()).and_then(|()| m.set_progressed(tx))
            }
            _ => return,
        };
        match res {
            Ok(()) => {
                debug!(channel = %self.id(), event = event.name(), phase = %m.phase(), "Applied event");
                self.persist_updated(&m).await;
            }
            Err(e) => warn!(channel = %self.id(), event = event.name(), error = %e, "Applying event failed"),
        }
    }

    /// Registers the current state on-chain, together with the states of all
    /// sub-channels. Sub-channels are registered through the root of their
    /// tree.
    pub async fn register(&self) -> Result<()> {
        let mut m = self.lock_machine().await;
        self.register_locked(&mut m).await
    }

    pub(super) async fn register_locked(&self, m: &mut Machine) -> Result<()> {
        if matches!(m.phase(), Phase::Registered | Phase::Progressed) {
            return Ok(());
        }
        if self.parent().is_none() {
            return self.register_root(m).await;
        }
        let root = self.root()?;
        {
            let mut root_m = root.lock_machine().await;
            root.register_root(&mut root_m).await?;
        }
        m.set_registered()?;
        self.persist_updated(m).await;
        Ok(())
    }

    async fn register_root(&self, m: &mut Machine) -> Result<()> {
        if matches!(m.phase(), Phase::Registered | Phase::Progressed) {
            return Ok(());
        }
        m.set_registering()?;
        let req = self.adjudicator_req(m, false);
        let sub_states = self.sub_states();
        debug!(channel = %self.id(), version = req.tx.version(), subs = sub_states.len(), "Registering");
        self.shared().adjudicator.register(&req, &sub_states).await?;
        m.set_registered()?;
        info!(channel = %self.id(), version = req.tx.version(), "Registered");
        self.persist_updated(m).await;
        Ok(())
    }

    /// Challenge timeout of the current on-chain registration.
    async fn registered_timeout(&self) -> Result<Timeout> {
        let shared = self.shared();
        let mut sub = shared.adjudicator.subscribe(self.id()).await?;
        let wait = async {
            while let Some(event) = sub.next().await {
                match event {
                    Ok(AdjudicatorEvent::Concluded { .. }) => return Some(Timeout::Elapsed),
                    Ok(event) => return Some(event.timeout()),
                    Err(e) => warn!(channel = %self.id(), error = %e, "Subscription error"),
                }
            }
            None
        };
        let timeout = tokio::time::timeout(shared.cfg.event_timeout(), wait).await;
        sub.close().await;
        match timeout {
            Ok(Some(timeout)) => Ok(timeout),
            _ => Err(Error::RequestTimedOut),
        }
    }

    /// Waits until the channel is concluded on-chain.
    async fn await_concluded(&self) -> Result<()> {
        let shared = self.shared();
        let mut sub = shared.adjudicator.subscribe(self.id()).await?;
        let wait = async {
            while let Some(event) = sub.next().await {
                if let Ok(AdjudicatorEvent::Concluded { .. }) = event {
                    return true;
                }
            }
            false
        };
        let concluded = tokio::time::timeout(shared.cfg.event_timeout(), wait).await;
        sub.close().await;
        match concluded {
            Ok(true) => Ok(()),
            _ => Err(Error::RequestTimedOut),
        }
    }

    /// Progresses an app channel on-chain with the state produced by
    /// `mutator`, registering first if needed.
    pub async fn force_update(&self, mutator: impl FnOnce(&mut State) + Send) -> Result<State> {
        if !self.params().has_app() {
            return Err(Error::NoApp);
        }
        let mut m = self.lock_machine().await;
        match m.phase() {
            Phase::Registered => {}
            Phase::Progressed => m.set_registered()?,
            _ => self.register_locked(&mut m).await?,
        }
        self.registered_timeout().await?.wait().await;

        let mut next = m.current().state.make_next_state();
        mutator(&mut next);
        m.set_progressing(next.clone())?;
        let sig = m.sig()?;
        let req = ProgressReq {
            req: self.adjudicator_req(&m, false),
            new_state: next.clone(),
            sig,
        };
        if let Err(e) = self.shared().adjudicator.progress(&req).await {
            m.set_registered()?;
            return Err(e.into());
        }
        let tx = m.staging().cloned().ok_or(MachineError::NoStagedUpdate)?;
        m.set_progressed(tx)?;
        info!(channel = %self.id(), version = next.version(), "Progressed");
        self.persist_updated(&m).await;
        Ok(next)
    }

    /// Closes the channel and pays out its funds.
    ///
    /// Ledger channels are registered (if not done yet), and withdrawn once
    /// the challenge period is over. Sub- and virtual channels have to be
    /// final, their funds go back into the parent.
    ///
    /// With `secondary` set the peer is expected to conclude the channel on
    /// the ledger, we only withdraw our share. Ignored off-chain.
    pub async fn settle(&self, secondary: bool) -> Result<()> {
        if self.params().virtual_channel() {
            return virtual_channel::settle(self).await;
        }
        if self.parent().is_some() {
            return subchannel::settle(self).await;
        }

        let mut m = self.lock_machine().await;
        if m.phase() == Phase::Withdrawn {
            return Ok(());
        }
        if m.phase() != Phase::Withdrawing {
            self.register_locked(&mut m).await?;
            self.registered_timeout().await?.wait().await;
            m.set_withdrawing()?;
        }

        let req = self.adjudicator_req(&m, secondary);
        let sub_states = self.sub_states();
        match self.shared().adjudicator.withdraw(&req, &sub_states).await {
            Ok(()) => {}
            Err(e @ AdjudicatorError::TxTimedOut(_)) => {
                warn!(channel = %self.id(), error = %e, "Withdrawal not confirmed, waiting for conclusion");
                self.await_concluded().await?;
            }
            Err(e) => return Err(e.into()),
        }
        m.set_withdrawn()?;
        info!(channel = %self.id(), version = m.current().version(), "Withdrawn");
        drop(m);

        self.close_tree().await;
        Ok(())
    }
}
