// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::io::Write;

use crate::{sync_copy_and_hash, sync_verified_copy, Digest, Fingerprint, StreamingHasher};

#[test]
fn hashes() {
    let mut src = "meep".as_bytes();

    let dst = Vec::with_capacity(10);
    let mut hasher = super::WriterHasher::new(dst);
    assert_eq!(std::io::copy(&mut src, &mut hasher).unwrap(), 4);
    let want = (
        Digest::new(
            Fingerprint::from_hex_string(
                "23e92dfba8fb0c93cfba31ad2962b4e35a47054296d1d375d7f7e13e0185de7a",
            )
            .unwrap(),
            4,
        ),
        "meep".as_bytes().to_vec(),
    );
    assert_eq!(hasher.finish(), want);
}

#[test]
fn hashes_while_writing() {
    let mut hasher = super::WriterHasher::new(Vec::new());
    hasher.write_all(b"me").unwrap();
    hasher.write_all(b"ep").unwrap();
    let (digest, written) = hasher.finish();
    assert_eq!(written, b"meep".to_vec());
    assert_eq!(digest, Digest::of_bytes(b"meep"));
}

#[test]
fn copy_and_hash_round_trip() {
    let input = vec![0xfa; 8192];
    let mut dst = Vec::new();
    let digest = sync_copy_and_hash(&mut input.as_slice(), &mut dst).unwrap();
    assert_eq!(dst, input);
    assert_eq!(digest, Digest::of_bytes(&input));
}

#[test]
fn verified_copy_detects_mismatch() {
    let input = b"the quick brown fox";
    let expected = Digest::of_bytes(input);

    let mut dst = Vec::new();
    assert!(sync_verified_copy(expected, &mut &input[..], &mut dst).unwrap());

    let mut tampered = input.to_vec();
    tampered[3] ^= 0x01;
    let mut dst = Vec::new();
    assert!(!sync_verified_copy(expected, &mut tampered.as_slice(), &mut dst).unwrap());
}

#[test]
fn streaming_hasher_matches_of_bytes() {
    let mut hasher = StreamingHasher::new();
    hasher.update(b"lock file one\n");
    hasher.update(b"lock file two\n");
    assert_eq!(
        hasher.finish(),
        Digest::of_bytes(b"lock file one\nlock file two\n")
    );
}
