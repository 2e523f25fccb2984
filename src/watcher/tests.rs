use super::*;
use crate::{
    adjudicator::{AdjudicatorResult, ProgressReq},
    channel::{Allocation, State},
    multi::MultiAdjudicator,
    sig::{Signer, Wallet},
    sim::SimulatedLedger,
    testing::{
        adjudicator_req, asset, balances, init_tracing, ledger_id, ledger_params, signed_tx, signers, verifier,
    },
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK: Duration = Duration::from_millis(10);
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

struct Chain {
    a: Arc<Signer>,
    b: Arc<Signer>,
    params: Params,
    txs: Vec<Transaction>,
}

/// Fully signed versions 0..=n of a payment channel, each moving one unit
/// from A to B.
fn chain(seed: u64, n: usize) -> Chain {
    let (a, b) = signers(seed);
    let params = ledger_params(&[&a, &b], Address::default());
    let mut state = State::new(
        &params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[100, 100]])),
        vec![],
    );
    let mut txs = vec![signed_tx(state.clone(), &[&a, &b])];
    for i in 1..=n as u64 {
        state = state.make_next_state();
        state.allocation.balances = balances(&[&[100 - i, 100 + i]]);
        txs.push(signed_tx(state.clone(), &[&a, &b]));
    }
    Chain { a, b, params, txs }
}

impl Chain {
    fn req(&self, version: usize, idx: Idx) -> AdjudicatorReq {
        adjudicator_req(&self.params, self.txs[version].clone(), idx)
    }
}

async fn next_event(events: &mut EventsSub) -> WatchedEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.next())
        .await
        .expect("no event in time")
        .expect("events ended")
}

fn watcher_on(adj: Arc<dyn Adjudicator>) -> Watcher {
    Watcher::new(adj, Address::default(), BLOCK)
}

#[tokio::test]
async fn outdated_registration_is_refuted() {
    init_tracing();
    let c = chain(50, 2);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim.clone()));

    let (states, mut events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[0].clone())
        .await
        .unwrap();
    states.publish(c.txs[1].clone()).unwrap();
    states.publish(c.txs[2].clone()).unwrap();

    // The peer registers an old state.
    sim.register(&c.req(1, 1), &[]).await.unwrap();

    let stale = next_event(&mut events).await;
    assert_eq!(stale.event.version(), 1);
    assert_eq!(
        stale.refutation,
        Some(Refutation {
            version: 2,
            error: None
        })
    );
    let refuted = next_event(&mut events).await;
    assert_eq!(refuted.event.version(), 2);
    assert_eq!(refuted.refutation, None);
    assert_eq!(sim.registered_version(c.params.id()), Some(2));
}

#[tokio::test]
async fn current_registration_is_not_refuted() {
    let c = chain(51, 1);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim.clone()));
    let (states, mut events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[0].clone())
        .await
        .unwrap();
    states.publish(c.txs[1].clone()).unwrap();

    sim.register(&c.req(1, 1), &[]).await.unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.refutation, None);
    assert_eq!(sim.register_calls(), 1);
}

#[tokio::test]
async fn one_refutation_across_ledgers() {
    let (a, b) = signers(52);
    let params = ledger_params(&[&a, &b], Address::default());
    let init = State::new(
        &params,
        Allocation::new(
            vec![asset(0, 1), asset(0, 2)],
            balances(&[&[10, 10], &[10, 10]]),
        ),
        vec![],
    );
    let v1 = init.make_next_state();
    let v2 = v1.make_next_state();
    let txs = [init, v1, v2].map(|s| signed_tx(s, &[&a, &b]));

    let l1 = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let l2 = SimulatedLedger::new(ledger_id(0, 2), verifier(), BLOCK);
    let multi = MultiAdjudicator::new()
        .with_adjudicator(l1.ledger(), Arc::new(l1.clone()))
        .with_adjudicator(l2.ledger(), Arc::new(l2.clone()));
    let multi = Arc::new(multi);
    let watcher = watcher_on(multi.clone());

    let (states, mut events) = watcher
        .start_watching_ledger_channel(params.clone(), 0, txs[0].clone())
        .await
        .unwrap();
    states.publish(txs[2].clone()).unwrap();

    let stale = adjudicator_req(&params, txs[1].clone(), 1);
    multi.register(&stale, &[]).await.unwrap();

    // Two stale events (one per ledger) and two refuted ones.
    let mut refutations = 0;
    for _ in 0..4 {
        if next_event(&mut events).await.refutation.is_some() {
            refutations += 1;
        }
    }
    assert_eq!(refutations, 1);
    assert_eq!(l1.register_calls(), 2);
    assert_eq!(l2.register_calls(), 2);
    assert_eq!(l1.registered_version(params.id()), Some(2));
    assert_eq!(l2.registered_version(params.id()), Some(2));
}

#[tokio::test]
async fn refutation_includes_sub_channels() {
    let c = chain(53, 1);
    let sub_params = Params::new(
        10,
        crate::encoding::types::U256::from(3u64),
        vec![c.a.address(), c.b.address()],
        Address::default(),
        false,
        false,
    )
    .unwrap();
    let sub_init = State::new(
        &sub_params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[5, 5]])),
        vec![],
    );
    let mut sub_v1 = sub_init.make_next_state();
    sub_v1.allocation.balances = balances(&[&[2, 8]]);

    let mut parent_v2 = c.txs[1].state.make_next_state();
    parent_v2
        .allocation
        .lock(sub_params.id(), &balances(&[&[5, 5]]), vec![0, 1])
        .unwrap();
    let parent_v2 = signed_tx(parent_v2, &[&c.a, &c.b]);

    let sub_init = signed_tx(sub_init, &[&c.a, &c.b]);

    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim.clone()));
    let (parent_pub, mut parent_events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[0].clone())
        .await
        .unwrap();
    parent_pub.publish(parent_v2).unwrap();
    let (sub_pub, mut sub_events) = watcher
        .start_watching_sub_channel(c.params.id(), sub_params.clone(), 0, sub_init.clone())
        .await
        .unwrap();
    sub_pub.publish(signed_tx(sub_v1, &[&c.a, &c.b])).unwrap();

    // Both the parent and the sub-channel are registered outdated, one
    // registration of the tree answers both.
    let stale_sub = SignedState::from_transaction(sub_params.clone(), &sub_init).unwrap();
    sim.register(&c.req(1, 1), &[stale_sub]).await.unwrap();
    let parent_stale = next_event(&mut parent_events).await;
    let sub_stale = next_event(&mut sub_events).await;
    assert_eq!(parent_stale.event.version(), 1);
    assert_eq!(sub_stale.event.version(), 0);

    let refutations: Vec<Refutation> = [parent_stale, sub_stale]
        .into_iter()
        .filter_map(|e| e.refutation)
        .collect();
    assert_eq!(refutations.len(), 1);
    assert_eq!(refutations[0].error, None);
    assert_eq!(sim.registered_version(c.params.id()), Some(2));
    assert_eq!(sim.registered_version(sub_params.id()), Some(1));
    assert_eq!(sim.register_calls(), 2);
}

#[tokio::test]
async fn failed_refutation_is_reported_and_retried() {
    let c = chain(54, 2);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim.clone()));
    let (states, mut events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[2].clone())
        .await
        .unwrap();

    sim.register(&c.req(0, 1), &[]).await.unwrap();
    sim.set_unreachable(true);
    let failed = next_event(&mut events).await;
    assert!(failed.refutation.unwrap().error.is_some());

    sim.set_unreachable(false);
    sim.register(&c.req(1, 1), &[]).await.unwrap();
    let retried = next_event(&mut events).await;
    assert_eq!(retried.refutation.unwrap().error, None);
    assert_eq!(sim.registered_version(c.params.id()), Some(2));
    drop(states);
}

#[tokio::test]
async fn resubscribes_after_subscription_ends() {
    let c = chain(55, 1);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim.clone()));
    let (_states, mut events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[1].clone())
        .await
        .unwrap();

    sim.inject_subscription_error(c.params.id(), AdjudicatorError::Subscription("flaky".into()));
    sim.drop_subscriptions(c.params.id());
    // Nobody is subscribed right now, the resubscription replays it.
    sim.register(&c.req(0, 1), &[]).await.unwrap();

    let stale = next_event(&mut events).await;
    assert_eq!(stale.event.version(), 0);
    assert!(stale.refutation.is_some());
    assert_eq!(sim.registered_version(c.params.id()), Some(1));
}

/// Counts how many of its subscriptions were closed.
struct CountingCloses {
    sim: SimulatedLedger,
    closed: Arc<AtomicUsize>,
}

struct CountedSub {
    sub: Box<dyn AdjudicatorSubscription>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl AdjudicatorSubscription for CountedSub {
    async fn next(&mut self) -> Option<AdjudicatorResult<AdjudicatorEvent>> {
        self.sub.next().await
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.sub.close().await;
    }
}

#[async_trait]
impl Adjudicator for CountingCloses {
    async fn register(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()> {
        self.sim.register(req, sub_states).await
    }

    async fn progress(&self, req: &ProgressReq) -> AdjudicatorResult<()> {
        self.sim.progress(req).await
    }

    async fn withdraw(&self, req: &AdjudicatorReq, sub_states: &[SignedState]) -> AdjudicatorResult<()> {
        self.sim.withdraw(req, sub_states).await
    }

    async fn subscribe(&self, id: ChannelId) -> AdjudicatorResult<Box<dyn AdjudicatorSubscription>> {
        let sub = self.sim.subscribe(id).await?;
        Ok(Box::new(CountedSub {
            sub,
            closed: self.closed.clone(),
        }))
    }
}

#[tokio::test]
async fn ended_subscription_is_closed() {
    let c = chain(57, 1);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let closed = Arc::new(AtomicUsize::new(0));
    let watcher = watcher_on(Arc::new(CountingCloses {
        sim: sim.clone(),
        closed: closed.clone(),
    }));
    let (_states, mut events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[1].clone())
        .await
        .unwrap();

    sim.drop_subscriptions(c.params.id());
    sim.register(&c.req(0, 1), &[]).await.unwrap();
    next_event(&mut events).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    watcher.stop_watching(c.params.id()).await.unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn publish_rejects_older_versions() {
    let c = chain(56, 2);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim));
    let (states, _events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[2].clone())
        .await
        .unwrap();

    assert!(matches!(
        states.publish(c.txs[1].clone()),
        Err(WatcherError::OutOfOrderPublish {
            current: 2,
            published: 1
        })
    ));
    assert_eq!(states.latest().version(), 2);

    let mut unsigned = c.txs[2].clone();
    unsigned.sigs[0] = None;
    assert!(matches!(
        states.publish(unsigned),
        Err(WatcherError::NotFullySigned(2))
    ));
}

#[tokio::test]
async fn stop_watching_children_first() {
    let c = chain(57, 0);
    let sub = chain(58, 0);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim));
    let parent = c.params.id();

    let (_p, mut parent_events) = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[0].clone())
        .await
        .unwrap();
    assert!(matches!(
        watcher
            .start_watching_ledger_channel(c.params.clone(), 0, c.txs[0].clone())
            .await,
        Err(WatcherError::AlreadyWatched(_))
    ));
    assert!(matches!(
        watcher
            .start_watching_sub_channel(sub.params.id(), sub.params.clone(), 0, sub.txs[0].clone())
            .await,
        Err(WatcherError::ParentNotWatched(_))
    ));
    let _s = watcher
        .start_watching_sub_channel(parent, sub.params.clone(), 0, sub.txs[0].clone())
        .await
        .unwrap();

    assert!(matches!(
        watcher.stop_watching(parent).await,
        Err(WatcherError::HasChildren(_))
    ));
    watcher.stop_watching(sub.params.id()).await.unwrap();
    watcher.stop_watching(parent).await.unwrap();
    assert!(matches!(
        watcher.stop_watching(parent).await,
        Err(WatcherError::NotWatched(_))
    ));
    assert!(!watcher.is_watching(&parent));
    // The task is gone, so is the sender of the events.
    assert!(parent_events.next().await.is_none());
}

#[tokio::test]
async fn stop_all_stops_the_whole_tree() {
    let c = chain(59, 0);
    let sub = chain(60, 0);
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let watcher = watcher_on(Arc::new(sim));
    let _p = watcher
        .start_watching_ledger_channel(c.params.clone(), 0, c.txs[0].clone())
        .await
        .unwrap();
    let _s = watcher
        .start_watching_sub_channel(c.params.id(), sub.params.clone(), 1, sub.txs[0].clone())
        .await
        .unwrap();

    watcher.stop_all().await;
    assert!(!watcher.is_watching(&c.params.id()));
    assert!(!watcher.is_watching(&sub.params.id()));
}
