// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Long header packets (RFC 9000 §17.2, RFC 9369 §3.2)

use crate::{
    connection::id,
    crypto::Level,
    packet::{
        number::TruncatedPacketNumber, retry, varint_usize, version_negotiation, Encrypted,
        Packet, VERSION_V2,
    },
    varint::VarInt,
};
use s2n_codec::{DecoderBuffer, DecoderError, Encoder};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Header Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2),
//#   Type-Specific Bits (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Type-Specific Payload (..),
//# }

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const TYPE_MASK: u8 = 0x30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl Type {
    //= https://www.rfc-editor.org/rfc/rfc9369#section-3.2
    //# Initial packets use a packet type field of 0b01.  0-RTT packets use a
    //# packet type field of 0b10.  Handshake packets use a packet type field
    //# of 0b11.  Retry packets use a packet type field of 0b00.
    #[inline]
    pub fn from_bits(version: u32, bits: u8) -> Self {
        debug_assert!(bits <= 0b11);
        match (version, bits) {
            (VERSION_V2, 0b00) => Self::Retry,
            (VERSION_V2, 0b01) => Self::Initial,
            (VERSION_V2, 0b10) => Self::ZeroRtt,
            (VERSION_V2, _) => Self::Handshake,
            (_, 0b00) => Self::Initial,
            (_, 0b01) => Self::ZeroRtt,
            (_, 0b10) => Self::Handshake,
            (_, _) => Self::Retry,
        }
    }

    #[inline]
    pub fn into_bits(self, version: u32) -> u8 {
        match (version, self) {
            (VERSION_V2, Self::Retry) => 0b00,
            (VERSION_V2, Self::Initial) => 0b01,
            (VERSION_V2, Self::ZeroRtt) => 0b10,
            (VERSION_V2, Self::Handshake) => 0b11,
            (_, Self::Initial) => 0b00,
            (_, Self::ZeroRtt) => 0b01,
            (_, Self::Handshake) => 0b10,
            (_, Self::Retry) => 0b11,
        }
    }

    #[inline]
    pub fn level(self) -> Option<Level> {
        match self {
            Self::Initial => Some(Level::Initial),
            Self::ZeroRtt => Some(Level::ZeroRtt),
            Self::Handshake => Some(Level::Handshake),
            Self::Retry => None,
        }
    }
}

pub(crate) fn decode(datagram: &mut [u8]) -> Result<(Packet, &mut [u8]), DecoderError> {
    let datagram_len = datagram.len();
    let offset = |remaining: usize| datagram_len - remaining;

    let buffer = DecoderBuffer::new(datagram);
    let (first, buffer) = buffer.decode::<u8>()?;
    let (version, buffer) = buffer.decode::<u32>()?;

    let (dcid_len, buffer) = buffer.decode::<u8>()?;
    if dcid_len as usize > id::MAX_LEN && version != 0 {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
        //# Endpoints that receive a version 1 long header with a value larger
        //# than 20 MUST drop the packet.
        return Err(DecoderError::InvariantViolation("destination id too long"));
    }
    let dcid_start = offset(buffer.len());
    let (_, buffer) = buffer.decode_slice(dcid_len as usize)?;
    let dcid = dcid_start..offset(buffer.len());

    let (scid_len, buffer) = buffer.decode::<u8>()?;
    if scid_len as usize > id::MAX_LEN && version != 0 {
        return Err(DecoderError::InvariantViolation("source id too long"));
    }
    let scid_start = offset(buffer.len());
    let (_, buffer) = buffer.decode_slice(scid_len as usize)?;
    let scid = scid_start..offset(buffer.len());

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
    //# A Version Negotiation packet is inherently not version specific.
    //# Upon receipt by a client, it will be identified as a Version
    //# Negotiation packet based on the Version field having a value of 0.
    if version == 0 {
        return version_negotiation::decode(datagram, dcid, scid, offset(buffer.len()));
    }

    if !crate::packet::is_supported_version(version) {
        let packet = version_negotiation::UnsupportedVersion {
            version,
            destination_connection_id: dcid,
            source_connection_id: scid,
        };
        return Ok(packet.split(datagram));
    }

    let packet_type = Type::from_bits(version, (first & TYPE_MASK) >> 4);

    if matches!(packet_type, Type::Retry) {
        return retry::decode(datagram, dcid, scid, offset(buffer.len()));
    }

    let (token, buffer) = if matches!(packet_type, Type::Initial) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.2
        //# Token Length:  A variable-length integer specifying the length of the
        //#    Token field, in bytes.
        let (token_len, buffer) = buffer.decode::<VarInt>()?;
        let token_len = varint_usize(token_len)?;
        let token_start = offset(buffer.len());
        let (_, buffer) = buffer.decode_slice(token_len)?;
        (token_start..offset(buffer.len()), buffer)
    } else {
        (0..0, buffer)
    };

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
    //# Length:  This is the length of the remainder of the packet (that is,
    //#    the Packet Number and Payload fields) in bytes, encoded as a
    //#    variable-length integer (Section 16).
    let (payload_len, buffer) = buffer.decode::<VarInt>()?;
    let payload_len = varint_usize(payload_len)?;

    let pn_offset = offset(buffer.len());
    let packet_len = pn_offset
        .checked_add(payload_len)
        .ok_or(DecoderError::LengthCapacityExceeded)?;
    if packet_len > datagram_len {
        return Err(DecoderError::UnexpectedEof(packet_len - datagram_len));
    }

    let level = packet_type.level().expect("retry handled above");

    let (packet, remaining) = datagram.split_at_mut(packet_len);

    let packet = Encrypted {
        level,
        version: Some(version),
        packet,
        destination_connection_id: dcid,
        source_connection_id: scid,
        token,
        pn_offset,
    };

    Ok((Packet::Encrypted(packet), remaining))
}

/// Writes a long header up to and including the truncated packet number.
///
/// `payload_len` counts every byte after the packet number, including the
/// AEAD tag. Returns the absolute encoder offset of the packet number.
#[allow(clippy::too_many_arguments)]
pub fn encode_header<E: Encoder>(
    encoder: &mut E,
    packet_type: Type,
    version: u32,
    destination_connection_id: &[u8],
    source_connection_id: &[u8],
    token: Option<&[u8]>,
    packet_number: TruncatedPacketNumber,
    payload_len: usize,
) -> usize {
    let pn_len = packet_number.len();

    let mut first = FORM_BIT | FIXED_BIT;
    first |= packet_type.into_bits(version) << 4;
    first |= pn_len.into_packet_tag_mask();
    encoder.encode(&first);

    encoder.encode(&version);

    encoder.encode(&(destination_connection_id.len() as u8));
    encoder.write_slice(destination_connection_id);
    encoder.encode(&(source_connection_id.len() as u8));
    encoder.write_slice(source_connection_id);

    if matches!(packet_type, Type::Initial) {
        let token = token.unwrap_or(&[]);
        encoder.encode_with_len_prefix::<VarInt, _>(&token);
    } else {
        debug_assert!(token.is_none(), "only initial packets carry tokens");
    }

    let length = VarInt::try_from(pn_len.bytesize() + payload_len)
        .expect("packet lengths are bounded by the mtu");
    encoder.encode(&length);

    let pn_offset = encoder.len();
    packet_number.encode(encoder);

    pn_offset
}
