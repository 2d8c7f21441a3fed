// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet encode/decode for QUIC v1 and v2
//!
//! Decoding happens in two phases: [`Packet::decode`] splits a datagram into
//! coalesced packets and records field offsets without touching key
//! material; [`Encrypted::unseal`] then removes header protection, expands
//! the packet number and opens the AEAD.

pub mod long;
pub mod number;
pub mod retry;
pub mod short;
pub mod version_negotiation;

use crate::{
    crypto::{self, CryptoError, HeaderKey, Key, KeyPhase, Level},
    packet::number::{PacketNumber, PacketNumberLen, PacketNumberSpace, TruncatedPacketNumber},
    varint::VarInt,
};
use core::ops::Range;
use s2n_codec::{DecoderBuffer, DecoderError};

//= https://www.rfc-editor.org/rfc/rfc9000#section-15
//# Version 0x00000001 of QUIC uses TLS as a cryptographic handshake
//# protocol, as described in [QUIC-TLS].
pub const VERSION_V1: u32 = 0x0000_0001;

//= https://www.rfc-editor.org/rfc/rfc9369#section-3.1
//# The version field of long headers is 0x6b3343cf.
pub const VERSION_V2: u32 = 0x6b33_43cf;

pub const SUPPORTED_VERSIONS: &[u32] = &[VERSION_V1, VERSION_V2];

#[inline]
pub fn is_supported_version(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
//# A client MUST expand the payload of all UDP datagrams carrying
//# Initial packets to at least the smallest allowed maximum datagram
//# size of 1200 bytes
pub const MIN_INITIAL_DATAGRAM_LEN: usize = 1200;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;

const LONG_PN_MASK: u8 = 0x0f;
const SHORT_PN_MASK: u8 = 0x1f;

/// A parsed but still protected packet
#[derive(Debug)]
pub enum Packet<'a> {
    VersionNegotiation(version_negotiation::VersionNegotiation<'a>),
    /// A long header packet with a version this endpoint does not speak
    Unsupported(version_negotiation::Unsupported<'a>),
    Retry(retry::Retry<'a>),
    Encrypted(Encrypted<'a>),
}

impl<'a> Packet<'a> {
    /// Splits the next packet off the front of `datagram`.
    ///
    /// Returns the parsed packet and the rest of the datagram (coalesced
    /// packets, or padding which subsequent parsing rejects).
    pub fn decode(
        datagram: &'a mut [u8],
        local_cid_len: usize,
    ) -> Result<(Packet<'a>, &'a mut [u8]), DecoderError> {
        let first = *datagram
            .first()
            .ok_or(DecoderError::UnexpectedEof(1))?;

        if first & FORM_BIT == 0 {
            return short::decode(datagram, local_cid_len);
        }

        long::decode(datagram)
    }

    /// The destination connection ID, used for demux before decryption
    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        match self {
            Packet::VersionNegotiation(packet) => packet.destination_connection_id,
            Packet::Unsupported(packet) => packet.destination_connection_id(),
            Packet::Retry(packet) => packet.destination_connection_id,
            Packet::Encrypted(packet) => packet.destination_connection_id(),
        }
    }
}

/// A protected Initial, Handshake, 0-RTT or 1-RTT packet
pub struct Encrypted<'a> {
    level: Level,
    version: Option<u32>,
    packet: &'a mut [u8],
    destination_connection_id: Range<usize>,
    source_connection_id: Range<usize>,
    token: Range<usize>,
    pn_offset: usize,
}

impl<'a> core::fmt::Debug for Encrypted<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Encrypted")
            .field("level", &self.level)
            .field("version", &self.version)
            .field("len", &self.packet.len())
            .finish()
    }
}

impl<'a> Encrypted<'a> {
    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    #[inline]
    pub fn packet_number_space(&self) -> PacketNumberSpace {
        match self.level {
            Level::Initial => PacketNumberSpace::Initial,
            Level::Handshake => PacketNumberSpace::Handshake,
            Level::ZeroRtt | Level::OneRtt => PacketNumberSpace::ApplicationData,
        }
    }

    #[inline]
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.destination_connection_id.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> Option<&[u8]> {
        if self.level.is_initial() || self.level.is_handshake() || self.level == Level::ZeroRtt {
            Some(&self.packet[self.source_connection_id.clone()])
        } else {
            None
        }
    }

    /// The address validation token of an Initial packet
    #[inline]
    pub fn token(&self) -> Option<&[u8]> {
        if self.level.is_initial() {
            Some(&self.packet[self.token.clone()])
        } else {
            None
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// The raw protected packet bytes, for parking until keys install
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.packet
    }

    /// The trailing bytes of the packet, compared against stored stateless
    /// reset tokens when a short packet fails to decrypt
    #[inline]
    pub fn stateless_reset_tail(&self) -> Option<&[u8]> {
        let len = self.packet.len();
        if self.level == Level::OneRtt && len > crate::stateless_reset::TOKEN_LEN {
            Some(&self.packet[len - crate::stateless_reset::TOKEN_LEN..])
        } else {
            None
        }
    }

    /// Removes header protection and opens the AEAD, consuming the packet
    pub fn unseal(
        self,
        header_key: &dyn HeaderKey,
        key: &dyn Key,
        largest_pn: Option<PacketNumber>,
    ) -> Result<Cleartext<'a>, DecoderError> {
        let space = self.packet_number_space();
        let Self {
            level,
            packet,
            pn_offset,
            ..
        } = self;

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
        //# in sampling packet ciphertext for header protection, the Packet Number field is
        //# assumed to be 4 bytes long
        let sample_offset = pn_offset + 4;
        let sample = packet
            .get(sample_offset..sample_offset + crypto::HEADER_PROTECTION_SAMPLE_LEN)
            .ok_or(DecoderError::UnexpectedEof(crypto::HEADER_PROTECTION_SAMPLE_LEN))?;
        let mask = header_key.mask(sample);

        let pn_mask = if level == Level::OneRtt {
            SHORT_PN_MASK
        } else {
            LONG_PN_MASK
        };
        packet[0] ^= mask[0] & pn_mask;

        let first = packet[0];
        let pn_len = PacketNumberLen::from_packet_tag(first);
        if packet.len() < pn_offset + pn_len.bytesize() {
            return Err(DecoderError::UnexpectedEof(pn_len.bytesize()));
        }
        for (index, byte) in packet[pn_offset..pn_offset + pn_len.bytesize()]
            .iter_mut()
            .enumerate()
        {
            *byte ^= mask[1 + index];
        }

        let key_phase = if level == Level::OneRtt {
            Some(if first & KEY_PHASE_BIT == KEY_PHASE_BIT {
                KeyPhase::One
            } else {
                KeyPhase::Zero
            })
        } else {
            None
        };

        let truncated = {
            let buffer = DecoderBuffer::new(&packet[pn_offset..]);
            let (bytes, _) = buffer.decode_slice(pn_len.bytesize())?;
            let bytes = bytes.into_less_safe_slice();
            let mut value = 0u32;
            for byte in bytes {
                value = (value << 8) | *byte as u32;
            }
            TruncatedPacketNumber::from_parts(space, value, pn_len)
        };
        let packet_number = truncated.expand(largest_pn)?;

        let header_len = pn_offset + pn_len.bytesize();
        let (header, payload) = packet.split_at_mut(header_len);

        let payload_len = key
            .open(packet_number.as_u64(), header, payload)
            .map_err(|_| DecoderError::InvariantViolation("packet failed authentication"))?;

        Ok(Cleartext {
            level,
            packet_number,
            key_phase,
            payload: &mut payload[..payload_len],
        })
    }
}

/// A decrypted packet ready for frame dispatch
pub struct Cleartext<'a> {
    pub level: Level,
    pub packet_number: PacketNumber,
    pub key_phase: Option<KeyPhase>,
    pub payload: &'a mut [u8],
}

/// Seals and protects a packet assembled in `packet`.
///
/// `packet` holds the cleartext header and payload with `tag_len` trailing
/// bytes reserved; `pn_offset`/`pn_len` locate the packet number field.
pub fn seal(
    header_key: &dyn HeaderKey,
    key: &dyn Key,
    packet_number: PacketNumber,
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: PacketNumberLen,
) -> Result<(), CryptoError> {
    let header_len = pn_offset + pn_len.bytesize();
    let (header, payload) = packet.split_at_mut(header_len);
    key.seal(packet_number.as_u64(), header, payload)?;

    let sample_offset = pn_offset + 4;
    let sample = packet
        .get(sample_offset..sample_offset + crypto::HEADER_PROTECTION_SAMPLE_LEN)
        .ok_or(CryptoError::INTERNAL_ERROR.with_reason("packet too short to sample"))?;
    let mask = header_key.mask(sample);

    let pn_mask = if packet[0] & FORM_BIT == FORM_BIT {
        LONG_PN_MASK
    } else {
        SHORT_PN_MASK
    };
    packet[0] ^= mask[0] & pn_mask;
    for (index, byte) in packet[pn_offset..pn_offset + pn_len.bytesize()]
        .iter_mut()
        .enumerate()
    {
        *byte ^= mask[1 + index];
    }

    Ok(())
}

pub(crate) fn varint_usize(value: VarInt) -> Result<usize, DecoderError> {
    value
        .as_u64()
        .try_into()
        .map_err(|_| DecoderError::LengthCapacityExceeded)
}

#[cfg(test)]
mod tests;
