use super::{
    to_bytes, to_digest, to_hash,
    types::{Address, Hash, U256},
    Error,
};
use serde::Serialize;
use std::collections::BTreeMap;

#[test]
fn integers_are_big_endian() {
    assert_eq!(to_bytes(&0x0102u16).unwrap(), vec![0x01, 0x02]);
    assert_eq!(
        to_bytes(&0x01020304_05060708u64).unwrap(),
        hex::decode("0102030405060708").unwrap()
    );
    assert_eq!(to_bytes(&true).unwrap(), vec![1]);
}

#[test]
fn bytes_and_sequences_are_length_prefixed() {
    let data: Vec<u8> = vec![0xa1, 0xa2, 0xa3];
    assert_eq!(
        to_bytes(&data).unwrap(),
        hex::decode("00000003a1a2a3").unwrap()
    );

    let seq: Vec<u16> = vec![1, 2];
    assert_eq!(
        to_bytes(&seq).unwrap(),
        hex::decode("0000000200010002").unwrap()
    );
}

#[test]
fn structs_concatenate_fields() {
    #[derive(Serialize)]
    struct Foo {
        a: u8,
        b: Option<u8>,
        c: Option<u8>,
    }

    let foo = Foo {
        a: 7,
        b: None,
        c: Some(9),
    };
    assert_eq!(to_bytes(&foo).unwrap(), vec![7, 0, 1, 9]);
}

#[test]
fn enum_variants_are_tagged_with_index() {
    #[derive(Serialize)]
    enum Kind {
        First,
        Second(u8),
    }

    assert_eq!(to_bytes(&Kind::First).unwrap(), vec![0, 0, 0, 0]);
    assert_eq!(to_bytes(&Kind::Second(3)).unwrap(), vec![0, 0, 0, 1, 3]);
}

#[test]
fn u256_and_address_have_fixed_width() {
    let value = U256::from(0x1234u64);
    let bytes = to_bytes(&value).unwrap();
    assert_eq!(bytes.len(), 4 + 32);
    assert_eq!(&bytes[bytes.len() - 2..], &[0x12, 0x34]);

    let addr = Address([0xab; 20]);
    assert_eq!(to_bytes(&addr).unwrap().len(), 4 + 20);
}

#[test]
fn maps_and_floats_are_rejected() {
    let mut map = BTreeMap::new();
    map.insert(1u8, 2u8);
    assert!(matches!(
        to_bytes(&map),
        Err(Error::TypeNotRepresentable("map"))
    ));
    assert!(matches!(
        to_bytes(&1.5f64),
        Err(Error::TypeNotRepresentable("f64"))
    ));
}

#[test]
fn hash_is_keccak_of_encoding() {
    // keccak256("") with an empty length prefix in front.
    let empty: Vec<u8> = vec![];
    let hash = to_hash(&empty).unwrap();
    let expected: Hash = {
        use sha3::{Digest, Keccak256};
        Hash(Keccak256::digest([0u8, 0, 0, 0]).into())
    };
    assert_eq!(hash, expected);
    assert_ne!(to_hash(&1u8).unwrap(), to_hash(&2u8).unwrap());
}

#[test]
fn digest_is_pluggable() {
    use sha3::{Digest, Sha3_256};

    let value = (7u64, true);
    let expected = Hash(Sha3_256::digest(to_bytes(&value).unwrap()).into());
    assert_eq!(to_digest::<Sha3_256, _>(&value).unwrap(), expected);
    assert_ne!(to_digest::<Sha3_256, _>(&value).unwrap(), to_hash(&value).unwrap());
}
