// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    crypto::testing::{NullHeaderKey, NullKey},
    packet::number::PacketNumberSpace,
};
use s2n_codec::{Encoder, EncoderBuffer};

const DCID: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8];
const SCID: &[u8] = &[9, 10, 11, 12];
const TAG_LEN: usize = 16;

fn build_long(
    packet_type: long::Type,
    version: u32,
    token: Option<&[u8]>,
    pn_value: u32,
    payload: &[u8],
    buffer: &mut Vec<u8>,
) {
    let space = match packet_type {
        long::Type::Initial => PacketNumberSpace::Initial,
        long::Type::Handshake => PacketNumberSpace::Handshake,
        _ => PacketNumberSpace::ApplicationData,
    };
    let pn = space.new_packet_number(VarInt::from_u32(pn_value));
    let truncated = pn
        .truncate(space.new_packet_number(VarInt::ZERO))
        .expect("small packet numbers always truncate");

    let start = buffer.len();
    buffer.resize(start + 1500, 0);

    let (pn_offset, packet_len) = {
        let mut encoder = EncoderBuffer::new(&mut buffer[start..]);
        let pn_offset = long::encode_header(
            &mut encoder,
            packet_type,
            version,
            DCID,
            SCID,
            token,
            truncated,
            payload.len() + TAG_LEN,
        );
        encoder.write_slice(payload);
        encoder.write_repeated(TAG_LEN, 0);
        (pn_offset, encoder.len())
    };

    seal(
        &NullHeaderKey,
        &NullKey,
        pn,
        &mut buffer[start..start + packet_len],
        pn_offset,
        truncated.len(),
    )
    .unwrap();

    buffer.truncate(start + packet_len);
}

#[test]
fn initial_round_trip_test() {
    let mut buffer = vec![];
    build_long(
        long::Type::Initial,
        VERSION_V1,
        Some(b"token"),
        5,
        b"hello quic",
        &mut buffer,
    );

    let (packet, remaining) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::Encrypted(packet) => packet,
        other => panic!("unexpected packet {other:?}"),
    };

    assert_eq!(packet.level(), Level::Initial);
    assert_eq!(packet.version(), Some(VERSION_V1));
    assert_eq!(packet.destination_connection_id(), DCID);
    assert_eq!(packet.source_connection_id(), Some(SCID));
    assert_eq!(packet.token(), Some(&b"token"[..]));

    let cleartext = packet.unseal(&NullHeaderKey, &NullKey, None).unwrap();
    assert_eq!(cleartext.packet_number.as_u64(), 5);
    assert_eq!(cleartext.payload, b"hello quic");
    assert_eq!(cleartext.key_phase, None);
}

#[test]
fn v2_type_rotation_test() {
    let mut buffer = vec![];
    build_long(
        long::Type::Handshake,
        VERSION_V2,
        None,
        1,
        b"crypto bytes",
        &mut buffer,
    );

    let (packet, _) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    let packet = match packet {
        Packet::Encrypted(packet) => packet,
        other => panic!("unexpected packet {other:?}"),
    };

    assert_eq!(packet.level(), Level::Handshake);
    assert_eq!(packet.version(), Some(VERSION_V2));
}

#[test]
fn coalesced_packets_test() {
    let mut buffer = vec![];
    build_long(
        long::Type::Initial,
        VERSION_V1,
        Some(b"t"),
        0,
        b"first",
        &mut buffer,
    );
    build_long(
        long::Type::Handshake,
        VERSION_V1,
        None,
        0,
        b"second",
        &mut buffer,
    );

    let (packet, remaining) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    assert!(matches!(packet, Packet::Encrypted(ref p) if p.level() == Level::Initial));
    assert!(!remaining.is_empty());

    let (packet, remaining) = Packet::decode(remaining, DCID.len()).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::Encrypted(packet) => packet,
        other => panic!("unexpected packet {other:?}"),
    };
    assert_eq!(packet.level(), Level::Handshake);
    let cleartext = packet.unseal(&NullHeaderKey, &NullKey, None).unwrap();
    assert_eq!(cleartext.payload, b"second");
}

#[test]
fn short_round_trip_test() {
    let space = PacketNumberSpace::ApplicationData;
    let pn = space.new_packet_number(VarInt::from_u32(42));
    let truncated = pn.truncate(space.new_packet_number(VarInt::ZERO)).unwrap();

    let mut buffer = vec![0u8; 1500];
    let (pn_offset, packet_len) = {
        let mut encoder = EncoderBuffer::new(&mut buffer);
        let pn_offset = short::encode_header(
            &mut encoder,
            false,
            crypto::KeyPhase::One,
            DCID,
            truncated,
        );
        encoder.write_slice(b"application data");
        encoder.write_repeated(TAG_LEN, 0);
        (pn_offset, encoder.len())
    };
    buffer.truncate(packet_len);

    seal(
        &NullHeaderKey,
        &NullKey,
        pn,
        &mut buffer,
        pn_offset,
        truncated.len(),
    )
    .unwrap();

    let (packet, remaining) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::Encrypted(packet) => packet,
        other => panic!("unexpected packet {other:?}"),
    };
    assert_eq!(packet.level(), Level::OneRtt);
    assert_eq!(packet.destination_connection_id(), DCID);

    let cleartext = packet.unseal(&NullHeaderKey, &NullKey, None).unwrap();
    assert_eq!(cleartext.packet_number.as_u64(), 42);
    assert_eq!(cleartext.payload, b"application data");
    assert_eq!(cleartext.key_phase, Some(crypto::KeyPhase::One));
}

#[test]
fn version_negotiation_round_trip_test() {
    let mut buffer = vec![0u8; 128];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut buffer);
        version_negotiation::encode(&mut encoder, DCID, SCID, SUPPORTED_VERSIONS, 0x2a);
        encoder.len()
    };
    buffer.truncate(len);

    let (packet, remaining) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    assert!(remaining.is_empty());

    match packet {
        Packet::VersionNegotiation(packet) => {
            assert_eq!(packet.destination_connection_id, DCID);
            assert_eq!(packet.source_connection_id, SCID);
            assert_eq!(packet.supported_versions, SUPPORTED_VERSIONS);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn retry_round_trip_test() {
    let mut buffer = vec![0u8; 128];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut buffer);
        retry::encode(&mut encoder, VERSION_V1, DCID, SCID, b"retry token");
        encoder.len()
    };
    buffer.truncate(len);

    let (packet, remaining) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    assert!(remaining.is_empty());

    match packet {
        Packet::Retry(packet) => {
            assert_eq!(packet.version, VERSION_V1);
            assert_eq!(packet.destination_connection_id, DCID);
            assert_eq!(packet.source_connection_id, SCID);
            assert_eq!(packet.token, b"retry token");
            assert_eq!(packet.integrity_tag, [0; retry::INTEGRITY_TAG_LEN]);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn unsupported_version_test() {
    let mut buffer = vec![];
    build_long(
        long::Type::Initial,
        0xdead_beef,
        Some(b"t"),
        0,
        b"payload",
        &mut buffer,
    );

    let (packet, remaining) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    assert!(remaining.is_empty());

    match packet {
        Packet::Unsupported(packet) => {
            assert_eq!(packet.version, 0xdead_beef);
            assert_eq!(packet.destination_connection_id(), DCID);
            assert_eq!(packet.source_connection_id(), SCID);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn tampered_packet_test() {
    let mut buffer = vec![];
    build_long(
        long::Type::Initial,
        VERSION_V1,
        Some(b"t"),
        3,
        b"payload",
        &mut buffer,
    );

    // flip a payload byte
    let index = buffer.len() - TAG_LEN - 1;
    buffer[index] ^= 0xff;

    let (packet, _) = Packet::decode(&mut buffer, DCID.len()).unwrap();
    let packet = match packet {
        Packet::Encrypted(packet) => packet,
        other => panic!("unexpected packet {other:?}"),
    };
    assert!(packet.unseal(&NullHeaderKey, &NullKey, None).is_err());
}
