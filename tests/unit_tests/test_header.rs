// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use hex_literal::hex;
use wsrpc_rs::{
    error::RpcError,
    proto::header::{HEADER_LEN, IoHeader, encode_frame, split_frame},
};

#[test]
fn header_is_sixteen_bytes_big_endian() {
    let frame = encode_frame(0x0102_0304, 0x1122_3344_5566_7788, &[0xAA, 0xBB]);

    // call_id (4, BE) || pad (4, zero) || result_id (8, BE) || payload
    let expected = hex!(
        "01020304"
        "00000000"
        "1122334455667788"
        "AABB"
    );
    assert_eq!(frame.as_ref(), expected.as_slice());
    assert_eq!(frame.len(), HEADER_LEN + 2);
}

#[test]
fn decode_reverses_network_byte_order() {
    let wire = hex!("000000FF" "00000000" "0000000000000001");
    let header = IoHeader::decode(&wire).expect("header should decode");
    assert_eq!(header.call_id(), 255);
    assert_eq!(header.result_id(), 1);
}

#[test]
fn round_trip_preserves_extreme_ids() {
    let frame = encode_frame(u32::MAX, u64::MAX, &[]);
    let header = IoHeader::decode(&frame).expect("header should decode");
    assert_eq!(header.call_id(), u32::MAX);
    assert_eq!(header.result_id(), u64::MAX);
}

#[test]
fn short_buffer_is_a_malformed_header() {
    let wire = [0u8; HEADER_LEN - 1];
    assert!(matches!(
        IoHeader::decode(&wire),
        Err(RpcError::InvalidHeader)
    ));

    let frame = Bytes::from_static(&[0u8; 3]);
    assert!(matches!(split_frame(&frame), Err(RpcError::InvalidHeader)));
}

#[test]
fn split_frame_hands_back_the_payload_without_the_envelope() {
    let frame = encode_frame(7, 0, b"payload");
    let (header, payload) = split_frame(&frame).expect("frame should split");
    assert_eq!(header.call_id(), 7);
    assert_eq!(header.result_id(), 0);
    assert_eq!(payload.as_ref(), b"payload");
}

#[test]
fn empty_payload_is_a_bare_envelope() {
    let frame = encode_frame(1, 2, &[]);
    assert_eq!(frame.len(), HEADER_LEN);
    let (_, payload) = split_frame(&frame).expect("frame should split");
    assert!(payload.is_empty());
}
