// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The 1-RTT short header packet (RFC 9000 §17.3)

use crate::{
    crypto::{KeyPhase, Level},
    packet::{number::TruncatedPacketNumber, Encrypted, Packet},
};
use s2n_codec::{DecoderError, Encoder};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# 1-RTT Packet {
//#   Header Form (1) = 0,
//#   Fixed Bit (1) = 1,
//#   Spin Bit (1),
//#   Reserved Bits (2),
//#   Key Phase (1),
//#   Packet Number Length (2),
//#   Destination Connection ID (0..160),
//#   Packet Number (8..32),
//#   Packet Payload (8..),
//# }

const FIXED_BIT: u8 = 0x40;
const SPIN_BIT: u8 = 0x20;
const KEY_PHASE_BIT: u8 = 0x04;

pub(crate) fn decode(
    datagram: &mut [u8],
    local_cid_len: usize,
) -> Result<(Packet, &mut [u8]), DecoderError> {
    let pn_offset = 1 + local_cid_len;
    if datagram.len() <= pn_offset {
        return Err(DecoderError::UnexpectedEof(pn_offset));
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
    //# Packets containing a zero value for this bit are not valid packets in
    //# this version and MUST be discarded.
    //
    // The fixed bit is checked after decryption fails rather than here: a
    // missing fixed bit may indicate a stateless reset, which the caller
    // probes for with the packet tail.

    // a short header packet is never coalesced with anything after it
    let len = datagram.len();
    let (packet, remaining) = datagram.split_at_mut(len);

    let packet = Encrypted {
        level: Level::OneRtt,
        version: None,
        packet,
        destination_connection_id: 1..pn_offset,
        source_connection_id: 0..0,
        token: 0..0,
        pn_offset,
    };

    Ok((Packet::Encrypted(packet), remaining))
}

/// Writes a short header up to and including the truncated packet number.
///
/// Returns the absolute encoder offset of the packet number.
pub fn encode_header<E: Encoder>(
    encoder: &mut E,
    spin_bit: bool,
    key_phase: KeyPhase,
    destination_connection_id: &[u8],
    packet_number: TruncatedPacketNumber,
) -> usize {
    let mut first = FIXED_BIT;
    if spin_bit {
        first |= SPIN_BIT;
    }
    if matches!(key_phase, KeyPhase::One) {
        first |= KEY_PHASE_BIT;
    }
    first |= packet_number.len().into_packet_tag_mask();
    encoder.encode(&first);

    encoder.write_slice(destination_connection_id);

    let pn_offset = encoder.len();
    packet_number.encode(encoder);

    pn_offset
}
