use super::*;
use crate::{
    channel::{Allocation, Params, Transaction},
    encoding::types::{Address, U256},
    sim::SimulatedLedger,
    testing::{adjudicator_req, asset, balances, ledger_id, ledger_params, signed_tx, signers, verifier},
};
use std::{
    sync::Mutex,
    time::Duration,
};

const BLOCK: Duration = Duration::from_millis(10);

fn two_ledger_state(params: &Params) -> State {
    State::new(
        params,
        Allocation::new(
            vec![asset(0, 1), asset(0, 2)],
            balances(&[&[10, 20], &[30, 40]]),
        ),
        vec![],
    )
}

struct Setup {
    l1: SimulatedLedger,
    l2: SimulatedLedger,
    multi: MultiAdjudicator,
    params: Params,
    tx: Transaction,
}

fn setup(seed: u64) -> Setup {
    let (a, b) = signers(seed);
    let params = ledger_params(&[&a, &b], Address::default());
    let tx = signed_tx(two_ledger_state(&params).make_next_state(), &[&a, &b]);
    let l1 = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let l2 = SimulatedLedger::new(ledger_id(0, 2), verifier(), BLOCK);
    let multi = MultiAdjudicator::new()
        .with_adjudicator(l1.ledger(), Arc::new(l1.clone()))
        .with_adjudicator(l2.ledger(), Arc::new(l2.clone()));
    Setup {
        l1,
        l2,
        multi,
        params,
        tx,
    }
}

#[test]
fn ledgers_are_deduplicated() {
    let (a, b) = signers(40);
    let params = ledger_params(&[&a, &b], Address::default());
    let state = State::new(
        &params,
        Allocation::new(
            vec![asset(0, 1), asset(1, 1), asset(0, 1)],
            balances(&[&[1, 1], &[1, 1], &[1, 1]]),
        ),
        vec![],
    );
    assert_eq!(ledgers_of(&state), vec![ledger_id(0, 1), ledger_id(1, 1)]);
}

#[tokio::test]
async fn register_reaches_every_ledger() {
    let s = setup(41);
    s.multi.register(&adjudicator_req(&s.params, s.tx.clone(), 0), &[]).await.unwrap();
    assert_eq!(s.l1.register_calls(), 1);
    assert_eq!(s.l2.register_calls(), 1);
    assert_eq!(s.l1.registered_version(s.params.id()), Some(1));
    assert_eq!(s.l2.registered_version(s.params.id()), Some(1));
}

#[tokio::test]
async fn failing_ledger_does_not_stop_the_others() {
    let s = setup(42);
    s.l2.set_unreachable(true);
    let err = s
        .multi
        .register(&adjudicator_req(&s.params, s.tx.clone(), 0), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AdjudicatorError::ChainNotReachable(_)));
    // No rollback on the ledger that succeeded.
    assert_eq!(s.l1.registered_version(s.params.id()), Some(1));
}

#[tokio::test]
async fn unknown_ledger_fails_before_any_call() {
    let s = setup(43);
    let multi = MultiAdjudicator::new().with_adjudicator(s.l1.ledger(), Arc::new(s.l1.clone()));
    let err = multi
        .register(&adjudicator_req(&s.params, s.tx.clone(), 0), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AdjudicatorError::UnknownLedger(l) if l == ledger_id(0, 2)));
    assert_eq!(s.l1.register_calls(), 0);
}

#[tokio::test]
async fn withdraw_pays_out_on_each_ledger() {
    let s = setup(44);
    let mut fin = s.tx.clone();
    fin.state.is_final = true;
    let (a, b) = signers(44);
    let fin = signed_tx(fin.state, &[&a, &b]);

    s.multi.withdraw(&adjudicator_req(&s.params, fin.clone(), 1), &[]).await.unwrap();
    assert_eq!(s.l1.withdrawn(s.params.id(), 1), Some(vec![U256::from(20u64)]));
    assert_eq!(s.l2.withdrawn(s.params.id(), 1), Some(vec![U256::from(40u64)]));
}

#[tokio::test]
async fn subscription_merges_ledgers() {
    let s = setup(45);
    let mut sub = s.multi.subscribe(s.params.id()).await.unwrap();
    s.multi.register(&adjudicator_req(&s.params, s.tx.clone(), 0), &[]).await.unwrap();

    for _ in 0..2 {
        let event = sub.next().await.unwrap().unwrap();
        assert_eq!(event.version(), 1);
    }

    // One ledger dropping ends the merged subscription.
    s.l1.drop_subscriptions(s.params.id());
    assert!(sub.next().await.is_none());
    sub.close().await;
}

#[tokio::test]
async fn subscribe_fails_if_one_ledger_is_down() {
    let s = setup(46);
    s.l1.set_unreachable(true);
    assert!(s.multi.subscribe(s.params.id()).await.is_err());
}


/// Funder that records when it starts and finishes.
struct RecordingFunder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl Funder for RecordingFunder {
    async fn fund(&self, _req: &FundingReq) -> Result<(), FundingError> {
        self.log.lock().unwrap().push(format!("start {}", self.name));
        tokio::time::sleep(BLOCK).await;
        self.log.lock().unwrap().push(format!("end {}", self.name));
        if self.fail {
            return Err(FundingError::Rejected(self.name.to_string()));
        }
        Ok(())
    }
}

fn funding_req(chains: &[u64]) -> FundingReq {
    let (a, b) = signers(47);
    let params = ledger_params(&[&a, &b], Address::default());
    let assets = chains.iter().map(|c| asset(0, *c)).collect();
    const ONE_EACH: &[u64] = &[1, 1];
    let bals: Vec<&[u64]> = chains.iter().map(|_| ONE_EACH).collect();
    let state = State::new(&params, Allocation::new(assets, balances(&bals)), vec![]);
    FundingReq {
        params,
        agreement: state.allocation.balances.clone(),
        state,
        idx: 0,
    }
}

fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str, fail: bool) -> Arc<dyn Funder> {
    Arc::new(RecordingFunder {
        name,
        log: log.clone(),
        fail,
    })
}

#[tokio::test]
async fn egoistic_ledgers_fund_last() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut funder = MultiFunder::new()
        .with_funder(ledger_id(0, 1), recording(&log, "ego", false))
        .with_funder(ledger_id(0, 2), recording(&log, "a", false))
        .with_funder(ledger_id(0, 3), recording(&log, "b", false));
    funder.set_egoistic(ledger_id(0, 1), true);

    funder.fund(&funding_req(&[1, 2, 3])).await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 6);
    // Both normal ledgers run concurrently and finish before the egoistic one.
    assert!(log[..2].iter().all(|l| l.starts_with("start")));
    assert!(log[2..4].iter().all(|l| l.starts_with("end")));
    assert_eq!(log[4..], ["start ego".to_string(), "end ego".to_string()]);
}

#[tokio::test]
async fn funding_error_is_returned_after_the_round() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut funder = MultiFunder::new()
        .with_funder(ledger_id(0, 1), recording(&log, "bad", true))
        .with_funder(ledger_id(0, 2), recording(&log, "good", false))
        .with_funder(ledger_id(0, 3), recording(&log, "ego", false));
    funder.set_egoistic(ledger_id(0, 3), true);

    let err = funder.fund(&funding_req(&[1, 2, 3])).await.unwrap_err();
    assert!(matches!(err, FundingError::Rejected(name) if name == "bad"));
    let log = log.lock().unwrap().clone();
    assert!(log.contains(&"end good".to_string()));
    // The egoistic round never starts.
    assert!(!log.iter().any(|l| l.contains("ego")));
}

#[tokio::test]
async fn funding_with_unknown_ledger_fails() {
    let funder = MultiFunder::new();
    assert!(matches!(
        funder.fund(&funding_req(&[1])).await,
        Err(FundingError::UnknownLedger(_))
    ));
}

#[tokio::test]
async fn funding_through_simulated_ledgers() {
    let l1 = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let l2 = SimulatedLedger::new(ledger_id(0, 2), verifier(), BLOCK);
    let funder = MultiFunder::new()
        .with_funder(l1.ledger(), Arc::new(l1.clone()))
        .with_funder(l2.ledger(), Arc::new(l2.clone()));
    let req0 = funding_req(&[1, 2]);
    let mut req1 = req0.clone();
    req1.idx = 1;

    let (r0, r1) = tokio::join!(funder.fund(&req0), funder.fund(&req1));
    r0.unwrap();
    r1.unwrap();
    let id = req0.params.id();
    assert_eq!(l1.deposited(id, 0), Some(vec![U256::from(1u64)]));
    assert_eq!(l2.deposited(id, 1), Some(vec![U256::from(1u64)]));
}
