//! Obfuscation codec properties
//!
//! Exercises the wire format from outside the crate: lossless round-trips,
//! padding nondeterminism, integrity under corruption, and key pairing
//! between instances.

use veil_proxy::obfuscation::{
    Direction, JitterRange, Obfuscator, ObfuscationError, LENGTH_PREFIX_LEN, MAC_LEN,
    MIN_FRAME_LEN,
};

#[test]
fn test_round_trip_various_sizes() {
    let obfuscator = Obfuscator::new().unwrap();

    for size in [0usize, 1, 16, 1024, 1024 * 1024] {
        let body: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        for direction in [Direction::Request, Direction::Response] {
            let frame = obfuscator.encode(direction, &body).unwrap();
            let decoded = obfuscator.decode(direction, &frame).unwrap();
            assert_eq!(decoded, body, "size {} must round-trip", size);
        }
    }
}

#[test]
fn test_empty_body_round_trips() {
    let obfuscator = Obfuscator::new().unwrap();
    let frame = obfuscator.encode(Direction::Request, b"").unwrap();
    assert_eq!(obfuscator.decode(Direction::Request, &frame).unwrap(), b"");
}

#[test]
fn test_padding_varies_for_identical_input() {
    let obfuscator = Obfuscator::new().unwrap();
    let body = b"identical input";

    let lengths: std::collections::HashSet<usize> = (0..24)
        .map(|_| obfuscator.encode(Direction::Request, body).unwrap().len())
        .collect();

    assert!(
        lengths.len() > 1,
        "repeated encodes of the same body must not share a length"
    );
}

#[test]
fn test_wire_bytes_do_not_contain_plaintext() {
    let obfuscator = Obfuscator::new().unwrap();
    let frame = obfuscator.encode(Direction::Request, b"ping").unwrap();

    assert!(
        !frame.windows(4).any(|window| window == b"ping"),
        "plaintext must not appear on the wire"
    );
}

#[test]
fn test_every_tag_byte_is_load_bearing() {
    let obfuscator = Obfuscator::new()
        .unwrap()
        .with_jitter(JitterRange { min: 0, max: 0 });
    let frame = obfuscator.encode(Direction::Request, b"payload").unwrap();

    // With zero jitter the tag occupies the bytes right after the length
    // prefix; flipping any single one must be detected
    for offset in LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + MAC_LEN {
        let mut corrupted = frame.clone();
        corrupted[offset] ^= 0x01;
        assert!(
            matches!(
                obfuscator.decode(Direction::Request, &corrupted),
                Err(ObfuscationError::Integrity)
            ),
            "flip at offset {} must be rejected",
            offset
        );
    }
}

#[test]
fn test_every_ciphertext_byte_is_load_bearing() {
    let obfuscator = Obfuscator::new()
        .unwrap()
        .with_jitter(JitterRange { min: 0, max: 0 });
    let frame = obfuscator.encode(Direction::Request, b"payload").unwrap();

    for offset in LENGTH_PREFIX_LEN + MAC_LEN..frame.len() {
        let mut corrupted = frame.clone();
        corrupted[offset] ^= 0x01;
        assert!(
            obfuscator.decode(Direction::Request, &corrupted).is_err(),
            "flip at offset {} must be rejected, never silently corrupted",
            offset
        );
    }
}

#[test]
fn test_undersized_frames_rejected_outright() {
    let obfuscator = Obfuscator::new().unwrap();

    for len in 0..MIN_FRAME_LEN {
        let frame = vec![0xAA; len];
        assert!(matches!(
            obfuscator.decode(Direction::Request, &frame),
            Err(ObfuscationError::FrameTooShort(_))
        ));
    }
}

#[test]
fn test_paired_instances_share_keys() {
    let request_key = [0x11u8; 32];
    let response_key = [0x22u8; 32];
    let mac_key = [0x33u8; 64];

    let near = Obfuscator::from_keys(
        &request_key,
        &response_key,
        &mac_key,
        JitterRange::default(),
    )
    .unwrap();
    let far = Obfuscator::from_keys(
        &request_key,
        &response_key,
        &mac_key,
        JitterRange::default(),
    )
    .unwrap();

    let outbound = near.encode(Direction::Request, b"hello far end").unwrap();
    assert_eq!(
        far.decode(Direction::Request, &outbound).unwrap(),
        b"hello far end"
    );

    let inbound = far.encode(Direction::Response, b"hello near end").unwrap();
    assert_eq!(
        near.decode(Direction::Response, &inbound).unwrap(),
        b"hello near end"
    );
}

#[test]
fn test_unpaired_instances_reject_each_other() {
    let a = Obfuscator::new().unwrap();
    let b = Obfuscator::new().unwrap();

    let frame = a.encode(Direction::Request, b"secret").unwrap();
    assert!(b.decode(Direction::Request, &frame).is_err());
}
