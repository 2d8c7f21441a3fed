// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retry packets (RFC 9000 §17.2.5)
//!
//! The transport treats the integrity tag as opaque; computing and checking
//! it requires AEAD primitives that live behind the crypto seam.

use crate::packet::Packet;
use core::ops::Range;
use s2n_codec::{DecoderError, Encoder};

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The Retry Integrity Tag is a 128-bit field
pub const INTEGRITY_TAG_LEN: usize = 16;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5
//# Retry Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2) = 3,
//#   Unused (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Retry Token (..),
//#   Retry Integrity Tag (128),
//# }

#[derive(Debug)]
pub struct Retry<'a> {
    pub version: u32,
    pub destination_connection_id: &'a [u8],
    pub source_connection_id: &'a [u8],
    pub token: &'a [u8],
    pub integrity_tag: [u8; INTEGRITY_TAG_LEN],
}

pub(crate) fn decode(
    datagram: &mut [u8],
    dcid: Range<usize>,
    scid: Range<usize>,
    token_offset: usize,
) -> Result<(Packet, &mut [u8]), DecoderError> {
    let len = datagram.len();

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
    //# A client MUST discard a Retry packet with a zero-length Retry Token
    //# field.
    if len < token_offset + INTEGRITY_TAG_LEN + 1 {
        return Err(DecoderError::InvariantViolation("retry token is empty"));
    }

    let version = u32::from_be_bytes(datagram[1..5].try_into().expect("length checked above"));

    let (packet, remaining) = datagram.split_at_mut(len);
    let packet: &[u8] = packet;

    let mut integrity_tag = [0; INTEGRITY_TAG_LEN];
    integrity_tag.copy_from_slice(&packet[len - INTEGRITY_TAG_LEN..]);

    let retry = Retry {
        version,
        destination_connection_id: &packet[dcid],
        source_connection_id: &packet[scid],
        token: &packet[token_offset..len - INTEGRITY_TAG_LEN],
        integrity_tag,
    };

    Ok((Packet::Retry(retry), remaining))
}

/// Writes a Retry packet, leaving the integrity tag zeroed for the crypto
/// provider to fill.
pub fn encode<E: Encoder>(
    encoder: &mut E,
    version: u32,
    destination_connection_id: &[u8],
    source_connection_id: &[u8],
    token: &[u8],
) {
    use crate::packet::long;

    debug_assert!(!token.is_empty(), "retry tokens must not be empty");

    let mut first = 0x80u8 | 0x40;
    first |= long::Type::Retry.into_bits(version) << 4;
    encoder.encode(&first);
    encoder.encode(&version);
    encoder.encode(&(destination_connection_id.len() as u8));
    encoder.write_slice(destination_connection_id);
    encoder.encode(&(source_connection_id.len() as u8));
    encoder.write_slice(source_connection_id);
    encoder.write_slice(token);
    encoder.write_repeated(INTEGRITY_TAG_LEN, 0);
}
