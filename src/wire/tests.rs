use super::*;
use crate::{
    channel::{Allocation, State},
    encoding::types::Address,
    messages::{ChannelUpdate, ChannelUpdateMsg, ChannelUpdateRej, ParticipantMessage, UpdateProposal},
    sig::Wallet,
    testing::{asset, balances, ledger_params, signers},
};

fn update_envelope() -> Envelope {
    let (a, b) = signers(20);
    let params = ledger_params(&[&a, &b], Address::default());
    let state = State::new(
        &params,
        Allocation::new(vec![asset(0, 1)], balances(&[&[5, 5]])),
        vec![],
    )
    .make_next_state();
    let sig = a.sign_hash(state.hash().unwrap()).unwrap();
    Envelope {
        sender: "alice".into(),
        recipient: "bob".into(),
        msg: ParticipantMessage::ChannelUpdate(UpdateProposal::SubChannelFunding {
            base: ChannelUpdateMsg {
                update: ChannelUpdate {
                    state,
                    actor_idx: 0,
                },
                sig,
            },
            sub: crate::encoding::types::Hash([4; 32]),
        }),
    }
}

#[test]
fn frame_has_big_endian_length_prefix() {
    let env = update_envelope();
    let frame = encode_frame(&env).unwrap();
    let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    assert_eq!(len + 2, frame.len());

    let back = decode_frame(&frame).unwrap();
    assert_eq!(back.sender, env.sender);
    match (back.msg, env.msg) {
        (ParticipantMessage::ChannelUpdate(a), ParticipantMessage::ChannelUpdate(b)) => {
            assert_eq!(a, b)
        }
        _ => panic!("wrong message type"),
    }
}

#[test]
fn truncated_frames_fail() {
    let frame = encode_frame(&update_envelope()).unwrap();
    assert!(matches!(decode_frame(&frame[..1]), Err(WireError::Truncated)));
    assert!(matches!(
        decode_frame(&frame[..frame.len() - 1]),
        Err(WireError::Truncated)
    ));
}

#[tokio::test]
async fn local_network_routes_by_recipient() {
    let net = LocalNetwork::with_codec();
    let (alice, _alice_rx) = net.connect("alice".into());
    let (_bob, mut bob_rx) = net.connect("bob".into());

    alice.publish(update_envelope()).await.unwrap();
    let received = bob_rx.recv().await.unwrap();
    assert_eq!(received.sender, Identity::from("alice"));

    let env = Envelope {
        sender: "alice".into(),
        recipient: "carol".into(),
        msg: ParticipantMessage::ChannelUpdateRejected(ChannelUpdateRej {
            channel: Default::default(),
            version: 1,
            reason: "no".to_string(),
        }),
    };
    assert!(matches!(
        alice.publish(env).await,
        Err(WireError::UnknownRecipient(_))
    ));
}

#[tokio::test]
async fn offline_peers_lose_messages() {
    let net = LocalNetwork::new();
    let (alice, _alice_rx) = net.connect("alice".into());
    let (_bob, mut bob_rx) = net.connect("bob".into());

    net.set_offline(&"bob".into(), true);
    alice.publish(update_envelope()).await.unwrap();
    assert!(bob_rx.try_recv().is_err());

    net.set_offline(&"bob".into(), false);
    alice.publish(update_envelope()).await.unwrap();
    assert!(bob_rx.try_recv().is_ok());
}
