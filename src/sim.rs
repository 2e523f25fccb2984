//! In-memory ledger implementing [Funder] and [Adjudicator] for one
//! [LedgerBackendId].
//!
//! Time is measured in blocks, a challenge duration of `n` lasts
//! `n * block_time`.

use crate::{
    adjudicator::{
        Adjudicator, AdjudicatorError, AdjudicatorEvent, AdjudicatorReq, AdjudicatorResult,
        AdjudicatorSubscription, Funder, FundingError, FundingReq, ProgressReq, Timeout,
    },
    channel::{check_valid_transition, ChannelId, Idx, LedgerBackendId, Params, SignedState, State},
    encoding::types::{Signature, U256},
    sig::Verifier,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info};

type EventSender = mpsc::UnboundedSender<AdjudicatorResult<AdjudicatorEvent>>;

/// Blocks a secondary withdrawal waits for the other participant to
/// conclude before concluding itself.
const SECONDARY_GRACE_BLOCKS: u32 = 10;

#[derive(Debug, Clone)]
struct Registration {
    state: State,
    sigs: Vec<Signature>,
    timeout: Timeout,
    /// Set by the first progression, registrations are frozen afterwards.
    progressed_by: Option<Idx>,
    concluded: bool,
}

impl Registration {
    fn event(&self) -> AdjudicatorEvent {
        match self.progressed_by {
            None => AdjudicatorEvent::Registered {
                id: self.state.id(),
                version: self.state.version(),
                timeout: self.timeout,
                state: self.state.clone(),
                sigs: self.sigs.clone(),
            },
            Some(idx) => AdjudicatorEvent::Progressed {
                id: self.state.id(),
                version: self.state.version(),
                timeout: self.timeout,
                state: self.state.clone(),
                idx,
            },
        }
    }

    fn concluded_event(&self) -> AdjudicatorEvent {
        AdjudicatorEvent::Concluded {
            id: self.state.id(),
            version: self.state.version(),
            timeout: Timeout::Elapsed,
        }
    }
}

#[derive(Default)]
struct Ledger {
    deposits: HashMap<(ChannelId, Idx), Vec<U256>>,
    registrations: HashMap<ChannelId, Registration>,
    withdrawn: HashMap<(ChannelId, Idx), Vec<U256>>,
    concluded_by: HashMap<ChannelId, Idx>,
    subscribers: HashMap<ChannelId, Vec<EventSender>>,
    register_calls: usize,
    unreachable: bool,
}

impl Ledger {
    fn emit(&mut self, id: ChannelId, event: AdjudicatorResult<AdjudicatorEvent>) {
        if let Some(subs) = self.subscribers.get_mut(&id) {
            subs.retain(|s| s.send(event.clone()).is_ok());
        }
    }
}

/// Simulated ledger, cheap to clone.
#[derive(Clone)]
pub struct SimulatedLedger {
    ledger: LedgerBackendId,
    block_time: Duration,
    funding_timeout: Duration,
    verifier: Arc<dyn Verifier>,
    inner: Arc<Mutex<Ledger>>,
    deposits_changed: Arc<watch::Sender<()>>,
}

impl SimulatedLedger {
    pub fn new(ledger: LedgerBackendId, verifier: Arc<dyn Verifier>, block_time: Duration) -> Self {
        let (deposits_changed, _) = watch::channel(());
        Self {
            ledger,
            block_time,
            funding_timeout: Duration::from_secs(10),
            verifier,
            inner: Arc::default(),
            deposits_changed: Arc::new(deposits_changed),
        }
    }

    pub fn with_funding_timeout(mut self, timeout: Duration) -> Self {
        self.funding_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> LedgerBackendId {
        self.ledger
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn challenge_period(&self, params: &Params) -> Duration {
        let blocks = u32::try_from(params.challenge_duration()).unwrap_or(u32::MAX);
        self.block_time.saturating_mul(blocks)
    }

    /// Indices of the assets that live on this ledger.
    fn local_assets(&self, state: &State) -> Vec<usize> {
        state
            .allocation
            .assets
            .iter()
            .enumerate()
            .filter(|(_, a)| a.ledger() == self.ledger)
            .map(|(i, _)| i)
            .collect()
    }

    fn check_reachable(&self, ledger: &Ledger) -> AdjudicatorResult<()> {
        if ledger.unreachable {
            return Err(AdjudicatorError::chain_not_reachable(format!("ledger {}", self.ledger)));
        }
        Ok(())
    }

    /// Makes every call fail with [AdjudicatorError::ChainNotReachable].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Sends `err` to every subscription of `id`.
    pub fn inject_subscription_error(&self, id: ChannelId, err: AdjudicatorError) {
        self.lock().emit(id, Err(err));
    }

    /// Ends all subscriptions of `id`, as if the connection dropped.
    pub fn drop_subscriptions(&self, id: ChannelId) {
        self.lock().subscribers.remove(&id);
    }

    /// Number of `register` calls so far, including no-ops.
    pub fn register_calls(&self) -> usize {
        self.lock().register_calls
    }

    pub fn registered_version(&self, id: ChannelId) -> Option<u64> {
        self.lock().registrations.get(&id).map(|r| r.state.version())
    }

    pub fn is_concluded(&self, id: ChannelId) -> bool {
        self.lock()
            .registrations
            .get(&id)
            .map_or(false, |r| r.concluded)
    }

    /// Participant whose withdrawal concluded `id`.
    pub fn concluded_by(&self, id: ChannelId) -> Option<Idx> {
        self.lock().concluded_by.get(&id).copied()
    }

    /// Gives the primary participant some blocks to conclude `id`.
    async fn await_conclusion(&self, id: ChannelId) {
        for _ in 0..SECONDARY_GRACE_BLOCKS {
            if self.is_concluded(id) {
                return;
            }
            tokio::time::sleep(self.block_time).await;
        }
        debug!(channel = %id, ledger = %self.ledger, "Not concluded by the primary");
    }

    pub fn deposited(&self, id: ChannelId, idx: Idx) -> Option<Vec<U256>> {
        self.lock().deposits.get(&(id, idx)).cloned()
    }

    /// Amount per asset of this ledger paid out to participant `idx`.
    pub fn withdrawn(&self, id: ChannelId, idx: Idx) -> Option<Vec<U256>> {
        self.lock().withdrawn.get(&(id, idx)).cloned()
    }

    fn missing_deposits(&self, ledger: &Ledger, req: &FundingReq, assets: &[usize]) -> Vec<Idx> {
        let id = req.params.id();
        (0..req.params.num_parts())
            .filter(|idx| {
                let needed: Vec<U256> = assets
                    .iter()
                    .map(|&a| {
                        req.agreement
                            .0
                            .get(a)
                            .and_then(|b| b.get(*idx))
                            .copied()
                            .unwrap_or_default()
                    })
                    .collect();
                match ledger.deposits.get(&(id, *idx)) {
                    Some(dep) => dep.iter().zip(&needed).any(|(d, n)| d < n),
                    None => needed.iter().any(|n| !n.is_zero()),
                }
            })
            .collect()
    }

    /// Registers one channel, the caller checked reachability.
    fn register_one(
        &self,
        ledger: &mut Ledger,
        params: &Params,
        state: &State,
        sigs: Vec<Signature>,
        timeout: Timeout,
    ) -> AdjudicatorResult<bool> {
        let id = params.id();
        if state.id() != id {
            return Err(AdjudicatorError::rejected("state does not belong to params"));
        }
        if sigs.len() != params.num_parts() {
            return Err(AdjudicatorError::rejected("missing signatures"));
        }
        let hash = state
            .hash()
            .map_err(|e| AdjudicatorError::rejected(e.to_string()))?;
        for (idx, sig) in sigs.iter().enumerate() {
            let valid = self
                .verifier
                .verify(params.participants()[idx], hash, sig)
                .map_err(|e| AdjudicatorError::rejected(e.to_string()))?;
            if !valid {
                return Err(AdjudicatorError::rejected(format!("invalid signature of participant {}", idx)));
            }
        }

        if let Some(reg) = ledger.registrations.get_mut(&id) {
            if state.version() <= reg.state.version() {
                return Ok(false);
            }
            if reg.concluded || reg.progressed_by.is_some() {
                return Err(AdjudicatorError::rejected("channel can no longer be registered"));
            }
            if reg.timeout.is_elapsed() {
                return Err(AdjudicatorError::rejected("challenge period is over"));
            }
            // Refutation keeps the original timeout, unless the state is final.
            reg.state = state.clone();
            reg.sigs = sigs;
            if state.is_final {
                reg.timeout = Timeout::Elapsed;
            }
        } else {
            let timeout = if state.is_final { Timeout::Elapsed } else { timeout };
            ledger.registrations.insert(
                id,
                Registration {
                    state: state.clone(),
                    sigs,
                    timeout,
                    progressed_by: None,
                    concluded: false,
                },
            );
        }
        Ok(true)
    }

    /// What participant `idx` of channel `id` gets, including funds locked in
    /// registered sub-channels.
    fn payout(&self, ledger: &Ledger, id: ChannelId, idx: Idx) -> AdjudicatorResult<Vec<U256>> {
        let reg = ledger
            .registrations
            .get(&id)
            .ok_or(AdjudicatorError::NotRegistered(id))?;
        let alloc = &reg.state.allocation;
        let mut payout = alloc
            .balances
            .of(idx)
            .ok_or_else(|| AdjudicatorError::rejected("unknown participant"))?;

        for sub in &alloc.locked {
            let sub_reg = ledger.registrations.get(&sub.id).ok_or_else(|| {
                AdjudicatorError::rejected(format!("sub-channel {} not registered", sub.id))
            })?;
            if !sub_reg.timeout.is_elapsed() {
                return Err(AdjudicatorError::TimeoutNotElapsed(sub.id));
            }
            for (sub_idx, parent_idx) in sub.index_map.iter().enumerate() {
                if *parent_idx != idx {
                    continue;
                }
                let bals = self.payout(ledger, sub.id, sub_idx)?;
                for (p, b) in payout.iter_mut().zip(bals) {
                    *p = p.saturating_add(b);
                }
            }
        }
        Ok(payout)
    }
}

#[async_trait]
impl Funder for SimulatedLedger {
    async fn fund(&self, req: &FundingReq) -> Result<(), FundingError> {
        let assets = self.local_assets(&req.state);
        if assets.is_empty() {
            return Ok(());
        }
        let id = req.params.id();

        let mut changed = self.deposits_changed.subscribe();
        {
            let mut ledger = self.lock();
            if ledger.unreachable {
                return Err(FundingError::ChainNotReachable(format!("ledger {}", self.ledger)));
            }
            let deposit = assets
                .iter()
                .map(|&a| {
                    req.agreement
                        .0
                        .get(a)
                        .and_then(|b| b.get(req.idx))
                        .copied()
                        .ok_or_else(|| FundingError::Rejected("agreement does not match assets".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            debug!(channel = %id, ledger = %self.ledger, idx = req.idx, "Depositing");
            ledger.deposits.insert((id, req.idx), deposit);
        }
        let _ = self.deposits_changed.send(());

        let wait_all = async {
            loop {
                {
                    let ledger = self.lock();
                    if self.missing_deposits(&ledger, req, &assets).is_empty() {
                        return;
                    }
                }
                if changed.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(self.funding_timeout, wait_all).await {
            Ok(()) => {
                debug!(channel = %id, ledger = %self.ledger, "Funded");
                Ok(())
            }
            Err(_) => {
                let ledger = self.lock();
                Err(FundingError::Timeout {
                    ledger: self.ledger,
                    missing: self.missing_deposits(&ledger, req, &assets),
                })
            }
        }
    }
}

#[async_trait]
impl Adjudicator for SimulatedLedger {
    async fn register(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()> {
        let mut ledger = self.lock();
        ledger.register_calls += 1;
        self.check_reachable(&ledger)?;

        let sigs = req
            .tx
            .signatures()
            .ok_or_else(|| AdjudicatorError::rejected("transaction is not fully signed"))?;
        let timeout = Timeout::At(Instant::now() + self.challenge_period(&req.params));

        let mut registered = Vec::new();
        if self.register_one(&mut ledger, &req.params, &req.tx.state, sigs, timeout)? {
            registered.push(req.params.id());
        }
        for sub in sub_states {
            if self.register_one(&mut ledger, &sub.params, &sub.state, sub.sigs.clone(), timeout)? {
                registered.push(sub.params.id());
            }
        }

        for id in registered {
            if let Some(event) = ledger.registrations.get(&id).map(Registration::event) {
                info!(channel = %id, version = event.version(), ledger = %self.ledger, "Registered");
                ledger.emit(id, Ok(event));
            }
        }
        Ok(())
    }

    async fn progress(&self, req: &ProgressReq) -> AdjudicatorResult<()> {
        let mut ledger = self.lock();
        self.check_reachable(&ledger)?;

        let params = &req.req.params;
        let id = params.id();
        if !params.has_app() {
            return Err(AdjudicatorError::rejected("channel has no app"));
        }
        let period = self.challenge_period(params);
        let reg = ledger
            .registrations
            .get_mut(&id)
            .ok_or(AdjudicatorError::NotRegistered(id))?;
        if reg.concluded {
            return Err(AdjudicatorError::rejected("channel is concluded"));
        }
        if !reg.timeout.is_elapsed() {
            return Err(AdjudicatorError::TimeoutNotElapsed(id));
        }
        check_valid_transition(&reg.state, &req.new_state, params.num_parts())
            .map_err(|e| AdjudicatorError::rejected(e.to_string()))?;

        let actor = *params
            .participants()
            .get(req.req.idx)
            .ok_or_else(|| AdjudicatorError::rejected("unknown actor"))?;
        let hash = req
            .new_state
            .hash()
            .map_err(|e| AdjudicatorError::rejected(e.to_string()))?;
        let valid = self
            .verifier
            .verify(actor, hash, &req.sig)
            .map_err(|e| AdjudicatorError::rejected(e.to_string()))?;
        if !valid {
            return Err(AdjudicatorError::rejected("invalid actor signature"));
        }

        reg.state = req.new_state.clone();
        reg.sigs = vec![req.sig];
        reg.progressed_by = Some(req.req.idx);
        reg.timeout = if req.new_state.is_final {
            Timeout::Elapsed
        } else {
            Timeout::At(Instant::now() + period)
        };
        let event = reg.event();
        info!(channel = %id, version = event.version(), "Progressed");
        ledger.emit(id, Ok(event));
        Ok(())
    }

    async fn withdraw(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()> {
        let id = req.params.id();
        if req.secondary {
            self.await_conclusion(id).await;
        }
        // Final states can be concluded without a prior registration.
        if req.tx.state.is_final && self.registered_version(id).is_none() {
            self.register(req, sub_states).await?;
        }

        let mut ledger = self.lock();
        self.check_reachable(&ledger)?;

        let reg = ledger
            .registrations
            .get(&id)
            .ok_or(AdjudicatorError::NotRegistered(id))?;
        if !reg.timeout.is_elapsed() {
            return Err(AdjudicatorError::TimeoutNotElapsed(id));
        }
        if reg.progressed_by.is_none() && reg.state.version() != req.tx.version() {
            return Err(AdjudicatorError::rejected(format!(
                "registered version {} differs from {}",
                reg.state.version(),
                req.tx.version()
            )));
        }
        let assets = self.local_assets(&reg.state);

        if !reg.concluded {
            let event = reg.concluded_event();
            let subs: Vec<ChannelId> = reg.state.allocation.locked.iter().map(|s| s.id).collect();
            for sub in subs.iter().chain(std::iter::once(&id)) {
                if let Some(r) = ledger.registrations.get_mut(sub) {
                    r.concluded = true;
                }
            }
            info!(channel = %id, version = event.version(), idx = req.idx, ledger = %self.ledger, "Concluded");
            ledger.concluded_by.insert(id, req.idx);
            ledger.emit(id, Ok(event));
        }

        if ledger.withdrawn.contains_key(&(id, req.idx)) {
            return Ok(());
        }
        let payout = self.payout(&ledger, id, req.idx)?;
        let local: Vec<U256> = assets.iter().map(|&a| payout[a]).collect();
        debug!(channel = %id, idx = req.idx, ledger = %self.ledger, "Withdrawn");
        ledger.withdrawn.insert((id, req.idx), local);
        Ok(())
    }

    async fn subscribe(&self, id: ChannelId) -> AdjudicatorResult<Box<dyn AdjudicatorSubscription>> {
        let mut ledger = self.lock();
        self.check_reachable(&ledger)?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(reg) = ledger.registrations.get(&id) {
            let _ = tx.send(Ok(reg.event()));
            if reg.concluded {
                let _ = tx.send(Ok(reg.concluded_event()));
            }
        }
        ledger.subscribers.entry(id).or_default().push(tx);
        Ok(Box::new(SimSubscription { rx }))
    }
}

struct SimSubscription {
    rx: mpsc::UnboundedReceiver<AdjudicatorResult<AdjudicatorEvent>>,
}

#[async_trait]
impl AdjudicatorSubscription for SimSubscription {
    async fn next(&mut self) -> Option<AdjudicatorResult<AdjudicatorEvent>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests;
