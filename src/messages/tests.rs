use super::*;
use crate::{
    channel::{Allocation, Params, State, Transaction},
    encoding::types::Address,
    testing::{asset, balances, ledger_params, signers},
    wire::proto,
};

fn sample_proposal() -> ChannelProposal {
    let (a, _) = signers(10);
    let mut alloc = Allocation::new(vec![asset(0, 1), asset(1, 5)], balances(&[&[10, 20], &[3, 4]]));
    alloc
        .lock(crate::encoding::types::Hash([3; 32]), &balances(&[&[1, 1], &[0, 1]]), vec![0, 1])
        .unwrap();
    ChannelProposal::virtual_channel(
        vec![crate::encoding::types::Hash([1; 32]), crate::encoding::types::Hash([2; 32])],
        vec![vec![0, 1], vec![1, 0]],
        60,
        crate::sig::Wallet::address(&*a),
        alloc,
        vec!["alice".into(), "bob".into()],
    )
    .with_app(Address([0xee; 20]), vec![1, 2, 3])
}

#[test]
fn proposal_survives_protobuf() {
    let prop = sample_proposal();
    let msg = proto::ChannelProposalMsg::from(&prop);
    let back = ChannelProposal::try_from(msg).unwrap();
    assert_eq!(back, prop);
}

#[test]
fn proposals_get_fresh_ids() {
    let a = sample_proposal();
    let b = sample_proposal();
    assert_ne!(a.proposal_id(), b.proposal_id());
    assert_ne!(a.base.nonce_share, b.base.nonce_share);
}

#[test]
fn params_with_wrong_id_are_rejected() {
    let (a, b) = signers(11);
    let params = ledger_params(&[&a, &b], Address::default());
    let mut msg = proto::Params::from(&params);
    assert_eq!(Params::try_from(msg.clone()).unwrap(), params);

    msg.challenge_duration += 1;
    assert!(matches!(
        Params::try_from(msg),
        Err(ConversionError::ChannelIdMismatch { .. })
    ));
}

#[test]
fn missing_signatures_are_kept_as_none() {
    let (a, b) = signers(12);
    let params = ledger_params(&[&a, &b], Address::default());
    let state = State::new(
        &params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[1, 2]])),
        vec![],
    );
    let mut tx = Transaction::new(state, 2);
    tx.sign(1, &*b).unwrap();

    let back = Transaction::try_from(proto::Transaction::from(&tx)).unwrap();
    assert_eq!(back, tx);
    assert!(back.sigs[0].is_none());
    assert!(back.sigs[1].is_some());
}

#[test]
fn malformed_fields_are_reported() {
    let msg = proto::ChannelProposalAccMsg {
        proposal_id: vec![0; 31],
        nonce_share: vec![0; 32],
        participant: vec![0; 20],
    };
    assert!(matches!(
        ChannelProposalAcc::try_from(msg),
        Err(ConversionError::ByteLengthMissmatch("proposal_id"))
    ));

    let msg = proto::UpdateProposalMsg { kind: None };
    assert!(matches!(
        UpdateProposal::try_from(msg),
        Err(ConversionError::ExptectedSome("kind"))
    ));

    let msg = proto::ChannelSyncMsg {
        phase: 99,
        current: None,
    };
    assert!(ChannelSyncMsg::try_from(msg).is_err());
}
