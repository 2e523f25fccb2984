use super::*;
use crate::{
    channel::{Allocation, Transaction},
    encoding::types::Address,
    sig::Wallet,
    testing::{adjudicator_req, asset, balances, ledger_id, ledger_params, signed_tx, signers, verifier},
};

const BLOCK: Duration = Duration::from_millis(10);

struct Fixture {
    sim: SimulatedLedger,
    params: Params,
    init: State,
    a: Arc<crate::sig::Signer>,
    b: Arc<crate::sig::Signer>,
}

fn fixture(seed: u64) -> Fixture {
    let (a, b) = signers(seed);
    let params = ledger_params(&[&a, &b], Address::default());
    let init = State::new(
        &params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[100, 50]])),
        vec![],
    );
    Fixture {
        sim: SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK),
        params,
        init,
        a,
        b,
    }
}

impl Fixture {
    fn tx(&self, state: State) -> Transaction {
        signed_tx(state, &[&self.a, &self.b])
    }

    fn req(&self, tx: Transaction, idx: Idx) -> AdjudicatorReq {
        adjudicator_req(&self.params, tx, idx)
    }

    fn funding(&self, idx: Idx) -> FundingReq {
        FundingReq {
            params: self.params.clone(),
            state: self.init.clone(),
            idx,
            agreement: self.init.allocation.balances.clone(),
        }
    }
}

#[tokio::test]
async fn funding_waits_for_all_participants() {
    let f = fixture(30);
    let (req0, req1) = (f.funding(0), f.funding(1));
    let (r0, r1) = tokio::join!(f.sim.fund(&req0), async {
        tokio::time::sleep(BLOCK).await;
        f.sim.fund(&req1).await
    });
    r0.unwrap();
    r1.unwrap();
    assert_eq!(
        f.sim.deposited(f.params.id(), 1),
        Some(vec![U256::from(50u64)])
    );
}

#[tokio::test]
async fn funding_timeout_names_missing_participants() {
    let f = fixture(31);
    let sim = f.sim.clone().with_funding_timeout(BLOCK * 3);
    match sim.fund(&f.funding(0)).await {
        Err(FundingError::Timeout { missing, .. }) => assert_eq!(missing, vec![1]),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn newer_state_refutes_older_registration() {
    let f = fixture(32);
    let id = f.params.id();
    let mut sub = f.sim.subscribe(id).await.unwrap();

    let v1 = f.init.make_next_state();
    let v2 = v1.make_next_state();
    f.sim.register(&f.req(f.tx(v1.clone()), 1), &[]).await.unwrap();
    f.sim.register(&f.req(f.tx(v2), 0), &[]).await.unwrap();

    let first = sub.next().await.unwrap().unwrap();
    let second = sub.next().await.unwrap().unwrap();
    assert_eq!(first.version(), 1);
    assert_eq!(second.version(), 2);
    // Refutation keeps the timeout.
    assert_eq!(first.timeout(), second.timeout());

    // Registering an older version again is a no-op.
    f.sim.register(&f.req(f.tx(v1), 1), &[]).await.unwrap();
    assert_eq!(f.sim.registered_version(id), Some(2));
    assert_eq!(f.sim.register_calls(), 3);
}

#[tokio::test]
async fn partially_signed_registration_is_rejected() {
    let f = fixture(33);
    let mut tx = f.tx(f.init.make_next_state());
    tx.sigs[1] = None;
    assert!(matches!(
        f.sim.register(&f.req(tx, 0), &[]).await,
        Err(AdjudicatorError::Rejected(_))
    ));

    // Signature of the wrong participant.
    let mut tx = f.tx(f.init.make_next_state());
    tx.sigs[1] = tx.sigs[0];
    assert!(f.sim.register(&f.req(tx, 0), &[]).await.is_err());
}

#[tokio::test]
async fn withdraw_after_timeout_pays_out() {
    let f = fixture(34);
    let id = f.params.id();
    let tx = f.tx(f.init.make_next_state());
    f.sim.register(&f.req(tx.clone(), 0), &[]).await.unwrap();

    assert!(matches!(
        f.sim.withdraw(&f.req(tx.clone(), 0), &[]).await,
        Err(AdjudicatorError::TimeoutNotElapsed(_))
    ));

    tokio::time::sleep(BLOCK * 11).await;
    // Too late to refute.
    let late = f.tx(tx.state.make_next_state());
    assert!(f.sim.register(&f.req(late, 1), &[]).await.is_err());

    f.sim.withdraw(&f.req(tx.clone(), 0), &[]).await.unwrap();
    f.sim.withdraw(&f.req(tx, 1), &[]).await.unwrap();
    assert!(f.sim.is_concluded(id));
    assert_eq!(f.sim.withdrawn(id, 0), Some(vec![U256::from(100u64)]));
    assert_eq!(f.sim.withdrawn(id, 1), Some(vec![U256::from(50u64)]));
}

#[tokio::test]
async fn final_state_concludes_immediately() {
    let f = fixture(35);
    let mut fin = f.init.make_next_state();
    fin.is_final = true;
    let tx = f.tx(fin);
    f.sim.withdraw(&f.req(tx, 1), &[]).await.unwrap();
    assert_eq!(
        f.sim.withdrawn(f.params.id(), 1),
        Some(vec![U256::from(50u64)])
    );
}

#[tokio::test]
async fn secondary_withdrawal_leaves_conclusion_to_the_peer() {
    let f = fixture(39);
    let mut fin = f.init.make_next_state();
    fin.is_final = true;
    let tx = f.tx(fin);
    let mut secondary = f.req(tx.clone(), 1);
    secondary.secondary = true;

    let (r0, r1) = tokio::join!(f.sim.withdraw(&secondary, &[]), async {
        tokio::time::sleep(BLOCK * 3).await;
        f.sim.withdraw(&f.req(tx.clone(), 0), &[]).await
    });
    r0.unwrap();
    r1.unwrap();
    assert_eq!(f.sim.concluded_by(f.params.id()), Some(0));
    assert_eq!(f.sim.withdrawn(f.params.id(), 1), Some(vec![U256::from(50u64)]));
}

#[tokio::test]
async fn secondary_withdrawal_concludes_when_the_peer_does_not() {
    let f = fixture(40);
    let mut fin = f.init.make_next_state();
    fin.is_final = true;
    let mut req = f.req(f.tx(fin), 1);
    req.secondary = true;
    f.sim.withdraw(&req, &[]).await.unwrap();
    assert_eq!(f.sim.concluded_by(f.params.id()), Some(1));
}

#[tokio::test]
async fn locked_funds_need_sub_states() {
    let f = fixture(36);
    let sub_params = Params::new(
        5,
        U256::from(99u64),
        vec![f.a.address(), f.b.address()],
        Address::default(),
        false,
        false,
    )
    .unwrap();
    let sub_init = State::new(
        &sub_params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[10, 10]])),
        vec![],
    );
    let mut sub_final = sub_init.make_next_state();
    sub_final.allocation.balances = balances(&[&[5, 15]]);
    sub_final.is_final = true;
    let sub_tx = f.tx(sub_final);

    let mut parent = f.init.make_next_state();
    parent
        .allocation
        .lock(sub_params.id(), &balances(&[&[10, 10]]), vec![0, 1])
        .unwrap();
    parent.is_final = true;
    let tx = f.tx(parent);

    // Without the sub-state the locked funds can't be distributed.
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    assert!(sim.withdraw(&f.req(tx.clone(), 0), &[]).await.is_err());

    let sub_state = SignedState::from_transaction(sub_params, &sub_tx).unwrap();
    f.sim
        .register(&f.req(tx.clone(), 0), &[sub_state])
        .await
        .unwrap();
    f.sim.withdraw(&f.req(tx.clone(), 0), &[]).await.unwrap();
    f.sim.withdraw(&f.req(tx, 1), &[]).await.unwrap();
    assert_eq!(
        f.sim.withdrawn(f.params.id(), 0),
        Some(vec![U256::from(95u64)])
    );
    assert_eq!(
        f.sim.withdrawn(f.params.id(), 1),
        Some(vec![U256::from(55u64)])
    );
}

#[tokio::test]
async fn progression_requires_app_and_elapsed_timeout() {
    let (a, b) = signers(37);
    let params = ledger_params(&[&a, &b], Address([0xaa; 20]));
    let init = State::new(
        &params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[1, 1]])),
        vec![1],
    );
    let sim = SimulatedLedger::new(ledger_id(0, 1), verifier(), BLOCK);
    let tx = signed_tx(init.clone(), &[&a, &b]);
    let req = adjudicator_req(&params, tx, 0);
    sim.register(&req, &[]).await.unwrap();

    let mut next = init.make_next_state();
    next.app_data = vec![2];
    let progress = ProgressReq {
        req: req.clone(),
        sig: a.sign_hash(next.hash().unwrap()).unwrap(),
        new_state: next,
    };
    assert!(matches!(
        sim.progress(&progress).await,
        Err(AdjudicatorError::TimeoutNotElapsed(_))
    ));

    tokio::time::sleep(BLOCK * 11).await;
    let mut sub = sim.subscribe(params.id()).await.unwrap();
    sim.progress(&progress).await.unwrap();
    let _registered = sub.next().await.unwrap().unwrap();
    match sub.next().await.unwrap().unwrap() {
        AdjudicatorEvent::Progressed { version, idx, .. } => {
            assert_eq!(version, 1);
            assert_eq!(idx, 0);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The signature has to come from the actor.
    let mut wrong = progress.clone();
    wrong.new_state = wrong.new_state.make_next_state();
    wrong.sig = b.sign_hash(wrong.new_state.hash().unwrap()).unwrap();
    assert!(sim.progress(&wrong).await.is_err());
}

#[tokio::test]
async fn unreachable_ledger_fails_all_calls() {
    let f = fixture(38);
    f.sim.set_unreachable(true);
    let tx = f.tx(f.init.make_next_state());
    assert!(f
        .sim
        .register(&f.req(tx, 0), &[])
        .await
        .unwrap_err()
        .is_retryable());
    assert!(f.sim.subscribe(f.params.id()).await.is_err());
}
