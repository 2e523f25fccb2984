use super::{Error, Recoverer, Signer, Verifier, Wallet};
use crate::encoding::{to_hash, types::Hash};
use rand::{rngs::StdRng, SeedableRng};

fn data() -> Hash {
    let d: Vec<u8> = vec![0xa1, 0xa2, 0xa3, 0xa4];
    to_hash(&d).unwrap()
}

#[test]
fn sign_and_recover() {
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);
    let sig = signer.sign_hash(data()).unwrap();

    // Ethereum style recovery id.
    assert!(sig.0[64] == 27 || sig.0[64] == 28);
    assert_eq!(Recoverer.recover(data(), &sig).unwrap(), signer.address());
    assert!(Recoverer.verify(signer.address(), data(), &sig).unwrap());
}

#[test]
fn other_signer_does_not_verify() {
    let mut rng = StdRng::seed_from_u64(1);
    let alice = Signer::new(&mut rng);
    let bob = Signer::new(&mut rng);
    assert_ne!(alice.address(), bob.address());

    let sig = alice.sign_hash(data()).unwrap();
    assert!(!Recoverer.verify(bob.address(), data(), &sig).unwrap());
}

#[test]
fn tampered_message_recovers_other_address() {
    let mut rng = StdRng::seed_from_u64(2);
    let signer = Signer::new(&mut rng);
    let sig = signer.sign_hash(data()).unwrap();

    let other = to_hash(&vec![0u8; 4]).unwrap();
    match Recoverer.recover(other, &sig) {
        Ok(addr) => assert_ne!(addr, signer.address()),
        Err(_) => {}
    }
}

#[test]
fn known_key_has_known_address() {
    // Private key 1 is the generator point.
    let mut secret = [0u8; 32];
    secret[31] = 1;
    let signer = Signer::from_bytes(&secret).unwrap();
    assert_eq!(
        hex::encode(signer.address().0),
        "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
    );
}

#[test]
fn invalid_recovery_id_is_rejected() {
    let mut rng = StdRng::seed_from_u64(3);
    let signer = Signer::new(&mut rng);
    let mut sig = signer.sign_hash(data()).unwrap();
    sig.0[64] = 0;
    assert!(matches!(
        Recoverer.recover(data(), &sig),
        Err(Error::Malformed(_))
    ));
}
