// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{stream::StreamType, varint::VarInt};
use core::ops::RangeInclusive;
use hex_literal::hex;
use s2n_codec::{DecoderBufferMut, Encoder, EncoderBuffer, EncoderValue};

fn decode_one(bytes: &mut [u8]) -> Frame {
    let buffer = DecoderBufferMut::new(bytes);
    let (frame, remaining) = Frame::decode(buffer).expect("frame should decode");
    assert!(remaining.is_empty(), "frame should consume the buffer");
    frame
}

fn encode<F: EncoderValue>(frame: &F) -> Vec<u8> {
    let mut bytes = vec![0; 1500];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(frame);
        encoder.len()
    };
    bytes.truncate(len);
    bytes
}

macro_rules! round_trip {
    ($frame:expr, $variant:ident) => {{
        let frame = $frame;
        let mut bytes = encode(&frame);
        match decode_one(&mut bytes) {
            Frame::$variant(decoded) => assert_eq!(frame, decoded),
            other => panic!("decoded unexpected variant {other:?}"),
        }
    }};
}

#[test]
fn ping_round_trip_test() {
    round_trip!(Ping, Ping);
}

#[test]
fn handshake_done_round_trip_test() {
    round_trip!(HandshakeDone, HandshakeDone);
}

#[test]
fn padding_round_trip_test() {
    round_trip!(Padding { length: 1 }, Padding);
    round_trip!(Padding { length: 37 }, Padding);
}

#[test]
fn reset_stream_round_trip_test() {
    round_trip!(
        ResetStream {
            stream_id: VarInt::from_u8(4),
            application_error_code: VarInt::from_u32(77),
            final_size: VarInt::from_u32(12_345),
        },
        ResetStream
    );
}

#[test]
fn stop_sending_round_trip_test() {
    round_trip!(
        StopSending {
            stream_id: VarInt::from_u8(8),
            application_error_code: VarInt::from_u32(1 << 20),
        },
        StopSending
    );
}

#[test]
fn flow_control_round_trip_test() {
    round_trip!(
        MaxData {
            maximum_data: VarInt::from_u32(1 << 22)
        },
        MaxData
    );
    round_trip!(
        MaxStreamData {
            stream_id: VarInt::from_u8(0),
            maximum_stream_data: VarInt::from_u32(65_536),
        },
        MaxStreamData
    );
    round_trip!(
        DataBlocked {
            data_limit: VarInt::from_u32(4096)
        },
        DataBlocked
    );
    round_trip!(
        StreamDataBlocked {
            stream_id: VarInt::from_u8(12),
            stream_data_limit: VarInt::from_u32(99),
        },
        StreamDataBlocked
    );
}

#[test]
fn stream_limit_round_trip_test() {
    for stream_type in [StreamType::Bidirectional, StreamType::Unidirectional] {
        round_trip!(
            MaxStreams {
                stream_type,
                maximum_streams: VarInt::from_u32(128),
            },
            MaxStreams
        );
        round_trip!(
            StreamsBlocked {
                stream_type,
                stream_limit: VarInt::from_u32(100),
            },
            StreamsBlocked
        );
    }
}

#[test]
fn connection_id_round_trip_test() {
    round_trip!(
        NewConnectionId {
            sequence_number: VarInt::from_u8(3),
            retire_prior_to: VarInt::from_u8(1),
            connection_id: &hex!("0102030405060708"),
            stateless_reset_token: hex!("000102030405060708090a0b0c0d0e0f"),
        },
        NewConnectionId
    );
    round_trip!(
        RetireConnectionId {
            sequence_number: VarInt::from_u8(2)
        },
        RetireConnectionId
    );
}

#[test]
fn new_connection_id_validation_test() {
    // retire_prior_to must not exceed the sequence number
    let mut bytes = encode(&NewConnectionId {
        sequence_number: VarInt::from_u8(1),
        retire_prior_to: VarInt::from_u8(1),
        connection_id: &[1, 2, 3, 4],
        stateless_reset_token: [0; 16],
    });
    // patch retire_prior_to above sequence_number
    bytes[2] = 2;
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(Frame::decode(buffer).is_err());
}

#[test]
fn path_round_trip_test() {
    round_trip!(
        PathChallenge {
            data: [1, 2, 3, 4, 5, 6, 7, 8]
        },
        PathChallenge
    );
    round_trip!(
        PathResponse {
            data: [8, 7, 6, 5, 4, 3, 2, 1]
        },
        PathResponse
    );
}

#[test]
fn new_token_round_trip_test() {
    round_trip!(NewToken { token: &[0x42; 32] }, NewToken);

    // an empty token is a framing error
    let mut bytes = vec![new_token::TAG, 0x00];
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(Frame::decode(buffer).is_err());
}

#[test]
fn connection_close_round_trip_test() {
    round_trip!(
        ConnectionClose {
            error_code: VarInt::from_u8(0xA),
            frame_type: Some(VarInt::from_u8(0x08)),
            reason: b"stream state error",
        },
        ConnectionClose
    );
    round_trip!(
        ConnectionClose {
            error_code: VarInt::from_u32(42),
            frame_type: None,
            reason: b"",
        },
        ConnectionClose
    );
}

#[test]
fn crypto_round_trip_test() {
    round_trip!(
        Crypto {
            offset: VarInt::from_u32(1200),
            data: &b"client hello"[..],
        },
        Crypto
    );
}

#[test]
fn stream_round_trip_test() {
    for offset in [0u32, 500] {
        for is_fin in [false, true] {
            for is_last_frame in [false, true] {
                round_trip!(
                    Stream {
                        stream_id: VarInt::from_u8(4),
                        offset: VarInt::from_u32(offset),
                        is_last_frame,
                        is_fin,
                        data: &b"hello quic"[..],
                    },
                    Stream
                );
            }
        }
    }
}

#[test]
fn datagram_round_trip_test() {
    for is_last_frame in [false, true] {
        round_trip!(
            Datagram {
                is_last_frame,
                data: &b"unreliable"[..],
            },
            Datagram
        );
    }
}

#[derive(Debug)]
struct TestRanges(Vec<RangeInclusive<VarInt>>);

impl ack::AckRanges for TestRanges {
    type Iter = std::vec::IntoIter<RangeInclusive<VarInt>>;

    fn ack_ranges(&self) -> Self::Iter {
        self.0.clone().into_iter()
    }
}

#[test]
fn ack_round_trip_test() {
    let ranges = vec![
        VarInt::from_u32(90)..=VarInt::from_u32(100),
        VarInt::from_u32(50)..=VarInt::from_u32(60),
        VarInt::from_u32(10)..=VarInt::from_u32(10),
    ];

    for ecn_counts in [
        None,
        Some(ack::EcnCounts {
            ect_0_count: VarInt::from_u8(1),
            ect_1_count: VarInt::from_u8(0),
            ce_count: VarInt::from_u8(2),
        }),
    ] {
        let frame = Ack {
            ack_delay: VarInt::from_u32(1000),
            ack_ranges: TestRanges(ranges.clone()),
            ecn_counts,
        };

        let mut bytes = encode(&frame);
        match decode_one(&mut bytes) {
            Frame::Ack(decoded) => {
                assert_eq!(decoded.ack_delay, frame.ack_delay);
                assert_eq!(decoded.ecn_counts, frame.ecn_counts);
                let decoded_ranges: Vec<_> = decoded.ack_ranges().collect();
                assert_eq!(decoded_ranges, ranges);
                assert_eq!(
                    decoded.largest_acknowledged(),
                    VarInt::from_u32(100)
                );
            }
            other => panic!("decoded unexpected variant {other:?}"),
        }
    }
}

#[test]
fn decode_all_test() {
    let mut bytes = vec![];
    bytes.extend(encode(&Ping));
    bytes.extend(encode(&MaxData {
        maximum_data: VarInt::from_u32(77),
    }));
    bytes.extend(encode(&Padding { length: 4 }));

    let mut decoded = vec![];
    Frame::decode_all(&mut bytes, |frame| {
        decoded.push(frame.is_ack_eliciting());
        Ok(())
    })
    .unwrap();

    assert_eq!(decoded, vec![true, true, false]);
}

#[test]
fn unknown_frame_test() {
    // 0x40 requires a multi-byte encoding, which this endpoint rejects
    let mut bytes = vec![0x40, 0x00];
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(Frame::decode(buffer).is_err());

    // 0x1f is unassigned in the single-byte space
    let mut bytes = vec![0x1f];
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(Frame::decode(buffer).is_err());
}

#[test]
fn empty_payload_test() {
    let mut bytes = [];
    assert!(Frame::decode_all(&mut bytes, |_| Ok(())).is_err());
}
