//! Funding and adjudication of channels whose assets live on several ledgers.
//!
//! Every call is dispatched to the backend of each distinct
//! [LedgerBackendId] of the channel's assets. All calls run concurrently and
//! are awaited before the first error (if any) is returned. Nothing is
//! rolled back if only some ledgers fail.
//!
//! Subscriptions only know the channel id, they go to every configured
//! ledger.

use crate::{
    adjudicator::{
        Adjudicator, AdjudicatorError, AdjudicatorEvent, AdjudicatorReq, AdjudicatorResult,
        AdjudicatorSubscription, Funder, FundingError, FundingReq, ProgressReq,
    },
    channel::{ChannelId, LedgerBackendId, SignedState, State},
};
use async_trait::async_trait;
use futures::future::{join_all, select_all};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, warn};

/// Distinct ledgers of `state` in order of first appearance.
fn ledgers_of(state: &State) -> Vec<LedgerBackendId> {
    let mut seen = HashSet::new();
    state
        .allocation
        .assets
        .iter()
        .map(|a| a.ledger())
        .filter(|l| seen.insert(*l))
        .collect()
}

/// First error of a round, after every call finished.
fn first_error<E>(results: Vec<Result<(), E>>) -> Result<(), E> {
    results.into_iter().collect()
}

#[derive(Default, Clone)]
pub struct MultiFunder {
    funders: HashMap<LedgerBackendId, Arc<dyn Funder>>,
    egoistic: HashSet<LedgerBackendId>,
}

impl MultiFunder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_funder(mut self, ledger: LedgerBackendId, funder: Arc<dyn Funder>) -> Self {
        self.funders.insert(ledger, funder);
        self
    }

    /// Funding on egoistic ledgers starts only after all other ledgers are
    /// funded.
    pub fn set_egoistic(&mut self, ledger: LedgerBackendId, egoistic: bool) {
        if egoistic {
            self.egoistic.insert(ledger);
        } else {
            self.egoistic.remove(&ledger);
        }
    }

    pub fn is_egoistic(&self, ledger: &LedgerBackendId) -> bool {
        self.egoistic.contains(ledger)
    }

    async fn fund_round(&self, req: &FundingReq, ledgers: &[(LedgerBackendId, Arc<dyn Funder>)]) -> Result<(), FundingError> {
        if ledgers.is_empty() {
            return Ok(());
        }
        let results = join_all(ledgers.iter().map(|(ledger, funder)| async move {
            debug!(channel = %req.params.id(), %ledger, "Funding");
            funder.fund(req).await
        }))
        .await;
        first_error(results)
    }
}

#[async_trait]
impl Funder for MultiFunder {
    async fn fund(&self, req: &FundingReq) -> Result<(), FundingError> {
        let mut normal = Vec::new();
        let mut egoistic = Vec::new();
        for ledger in ledgers_of(&req.state) {
            let funder = self
                .funders
                .get(&ledger)
                .cloned()
                .ok_or(FundingError::UnknownLedger(ledger))?;
            if self.is_egoistic(&ledger) {
                egoistic.push((ledger, funder));
            } else {
                normal.push((ledger, funder));
            }
        }

        self.fund_round(req, &normal).await?;
        self.fund_round(req, &egoistic).await
    }
}

#[derive(Default, Clone)]
pub struct MultiAdjudicator {
    adjudicators: HashMap<LedgerBackendId, Arc<dyn Adjudicator>>,
}

impl MultiAdjudicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adjudicator(mut self, ledger: LedgerBackendId, adjudicator: Arc<dyn Adjudicator>) -> Self {
        self.adjudicators.insert(ledger, adjudicator);
        self
    }

    /// Backends for every ledger of `state`, fails before any call if one is
    /// missing.
    fn dispatch(&self, state: &State) -> AdjudicatorResult<Vec<(LedgerBackendId, &Arc<dyn Adjudicator>)>> {
        ledgers_of(state)
            .into_iter()
            .map(|ledger| {
                self.adjudicators
                    .get(&ledger)
                    .map(|a| (ledger, a))
                    .ok_or(AdjudicatorError::UnknownLedger(ledger))
            })
            .collect()
    }
}

#[async_trait]
impl Adjudicator for MultiAdjudicator {
    async fn register(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()> {
        let targets = self.dispatch(&req.tx.state)?;
        let results = join_all(targets.into_iter().map(|(ledger, adj)| async move {
            let res = adj.register(req, sub_states).await;
            if let Err(e) = &res {
                warn!(channel = %req.params.id(), %ledger, error = %e, "Register failed");
            }
            res
        }))
        .await;
        first_error(results)
    }

    async fn progress(&self, req: &ProgressReq) -> AdjudicatorResult<()> {
        let targets = self.dispatch(&req.req.tx.state)?;
        let results = join_all(targets.into_iter().map(|(_, adj)| adj.progress(req))).await;
        first_error(results)
    }

    async fn withdraw(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()> {
        let targets = self.dispatch(&req.tx.state)?;
        let results = join_all(targets.into_iter().map(|(ledger, adj)| async move {
            let res = adj.withdraw(req, sub_states).await;
            if let Err(e) = &res {
                warn!(channel = %req.params.id(), %ledger, error = %e, "Withdraw failed");
            }
            res
        }))
        .await;
        first_error(results)
    }

    /// Subscribes on every configured ledger, a ledger without assets of
    /// the channel just never reports anything.
    async fn subscribe(&self, id: ChannelId) -> AdjudicatorResult<Box<dyn AdjudicatorSubscription>> {
        let mut subs = Vec::with_capacity(self.adjudicators.len());
        for adj in self.adjudicators.values() {
            match adj.subscribe(id).await {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    let mut merged = MultiSubscription { subs };
                    merged.close().await;
                    return Err(e);
                }
            }
        }
        Ok(Box::new(MultiSubscription { subs }))
    }
}

/// Events of all ledgers of a channel.
///
/// Ends as soon as one of the merged subscriptions ends, so the caller
/// re-subscribes to all of them.
pub struct MultiSubscription {
    subs: Vec<Box<dyn AdjudicatorSubscription>>,
}

#[async_trait]
impl AdjudicatorSubscription for MultiSubscription {
    async fn next(&mut self) -> Option<AdjudicatorResult<AdjudicatorEvent>> {
        if self.subs.is_empty() {
            return None;
        }
        // Cancel-safe because every constituent `next` is.
        let (event, _, _) = select_all(self.subs.iter_mut().map(|s| s.next())).await;
        event
    }

    async fn close(&mut self) {
        join_all(self.subs.iter_mut().map(|s| s.close())).await;
    }
}

#[cfg(test)]
mod tests;
