//! Fixtures shared by the unit tests.

use crate::{
    adjudicator::AdjudicatorReq,
    channel::{Allocation, Asset, Balances, Idx, LedgerBackendId, Machine, Params, State, Transaction},
    encoding::types::{Address, U256},
    sig::{Recoverer, Signer, Verifier, Wallet},
};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn signers(seed: u64) -> (Arc<Signer>, Arc<Signer>) {
    let mut rng = StdRng::seed_from_u64(seed);
    (Arc::new(Signer::new(&mut rng)), Arc::new(Signer::new(&mut rng)))
}

pub(crate) fn verifier() -> Arc<dyn Verifier> {
    Arc::new(Recoverer)
}

pub(crate) fn asset(backend: u32, chain_id: u64) -> Asset {
    Asset {
        backend,
        chain_id: U256::from(chain_id),
        holder: Address([backend as u8 + 1; 20]),
    }
}

/// `bals[asset][participant]`
pub(crate) fn balances(bals: &[&[u64]]) -> Balances {
    Balances(
        bals.iter()
            .map(|a| a.iter().map(|b| U256::from(*b)).collect())
            .collect(),
    )
}

pub(crate) fn ledger_params(parts: &[&Arc<Signer>], app: Address) -> Params {
    Params::new(
        10,
        U256::from(7u64),
        parts.iter().map(|s| s.address()).collect(),
        app,
        true,
        false,
    )
    .unwrap()
}

/// A pair of machines in [crate::channel::Phase::Acting] over a fully signed
/// initial state `[[100, 50]]` on one asset.
pub(crate) fn acting_machines(seed: u64) -> (Machine, Machine) {
    let (a, b) = signers(seed);
    let params = ledger_params(&[&a, &b], Address::default());
    let alloc = Allocation::new(vec![asset(0, 1)], balances(&[&[100, 50]]));
    let init = State::new(&params, alloc, vec![]);

    let mut ma = Machine::new(a.clone(), verifier(), params.clone(), 0, init.clone()).unwrap();
    let mut mb = Machine::new(b.clone(), verifier(), params, 1, init).unwrap();
    let sig_a = ma.sig().unwrap();
    let sig_b = mb.sig().unwrap();
    ma.add_sig(1, sig_b).unwrap();
    mb.add_sig(0, sig_a).unwrap();
    for m in [&mut ma, &mut mb] {
        m.enable_init().unwrap();
        m.set_funding().unwrap();
        m.set_funded().unwrap();
    }
    (ma, mb)
}

pub(crate) fn signed_tx(state: State, signers: &[&Arc<Signer>]) -> Transaction {
    let mut tx = Transaction::new(state, signers.len());
    for (idx, s) in signers.iter().enumerate() {
        let signer: &Signer = s;
        tx.sign(idx, signer).unwrap();
    }
    tx
}

/// Primary request of participant `idx`, paying out to the zero address.
pub(crate) fn adjudicator_req(params: &Params, tx: Transaction, idx: Idx) -> AdjudicatorReq {
    AdjudicatorReq {
        params: params.clone(),
        acc: Address::default(),
        tx,
        idx,
        secondary: false,
    }
}

pub(crate) fn ledger_id(backend: u32, chain_id: u64) -> LedgerBackendId {
    asset(backend, chain_id).ledger()
}
