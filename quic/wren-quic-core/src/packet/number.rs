// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet numbers, their spaces and the truncated wire encoding

use crate::varint::VarInt;
use core::{cmp::Ordering, fmt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, DecoderError, Encoder};

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# Packet numbers are divided into three spaces in QUIC:
//#
//# Initial space:  All Initial packets (Section 17.2.2) are in this
//#    space.
//#
//# Handshake space:  All Handshake packets (Section 17.2.4) are in this
//#    space.
//#
//# Application data space:  All 0-RTT (Section 17.2.3) and 1-RTT
//#    (Section 17.3) packets are in this space.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    pub const COUNT: usize = 3;

    #[inline]
    pub fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake)
    }

    #[inline]
    pub fn is_application_data(self) -> bool {
        matches!(self, Self::ApplicationData)
    }

    /// Creates a full packet number in this space
    #[inline]
    pub fn new_packet_number(self, value: VarInt) -> PacketNumber {
        PacketNumber { space: self, value }
    }

    #[inline]
    pub fn all() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::ApplicationData].into_iter()
    }
}

/// A full 62-bit packet number within a space
///
/// Packet numbers from different spaces never compare; mixing them is a
/// logic error caught by debug assertions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketNumber {
    space: PacketNumberSpace,
    value: VarInt,
}

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PacketNumber({:?}, {})", self.space, self.value)
    }
}

impl PacketNumber {
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.value.as_u64()
    }

    #[inline]
    pub fn as_varint(self) -> VarInt {
        self.value
    }

    #[inline]
    pub fn next(self) -> Option<Self> {
        Some(Self {
            space: self.space,
            value: self.value.checked_add(VarInt::from_u8(1))?,
        })
    }

    #[inline]
    pub fn checked_distance(self, rhs: Self) -> Option<u64> {
        self.space.assert_eq(rhs.space);
        self.as_u64().checked_sub(rhs.as_u64())
    }

    /// Truncates the packet number for the wire, given the largest packet
    /// number acknowledged by the peer.
    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
    //# The sender MUST use a packet number size able to represent more than
    //# twice as large a range as the difference between the largest
    //# acknowledged packet and the packet number being sent.
    #[inline]
    pub fn truncate(self, largest_acked: PacketNumber) -> Option<TruncatedPacketNumber> {
        self.space.assert_eq(largest_acked.space);

        let distance = self.as_u64().checked_sub(largest_acked.as_u64())?;
        let window = distance.checked_mul(2)?;

        let len = if window < (1 << 8) {
            PacketNumberLen::U8
        } else if window < (1 << 16) {
            PacketNumberLen::U16
        } else if window < (1 << 24) {
            PacketNumberLen::U24
        } else if window < (1 << 32) {
            PacketNumberLen::U32
        } else {
            return None;
        };

        Some(TruncatedPacketNumber {
            space: self.space,
            value: (self.as_u64() & (len.max_value())) as u32,
            len,
        })
    }

    /// Truncates with the full 4-byte encoding.
    ///
    /// Senders that want a fixed header size use this; the wider window
    /// also tolerates arbitrarily stale acknowledgment state.
    #[inline]
    pub fn truncate_fixed(self) -> TruncatedPacketNumber {
        TruncatedPacketNumber {
            space: self.space,
            value: (self.as_u64() & PacketNumberLen::U32.max_value()) as u32,
            len: PacketNumberLen::U32,
        }
    }
}

impl PartialOrd for PacketNumber {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PacketNumber {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.space.assert_eq(other.space);
        self.value.cmp(&other.value)
    }
}

impl PacketNumberSpace {
    #[inline]
    pub(crate) fn assert_eq(self, other: Self) {
        debug_assert_eq!(self, other, "packet numbers from different spaces");
    }
}

/// The encoded length of a truncated packet number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketNumberLen {
    U8,
    U16,
    U24,
    U32,
}

impl PacketNumberLen {
    /// Reconstructs the length from the low 2 bits of an unprotected first
    /// byte
    #[inline]
    pub fn from_packet_tag(tag: u8) -> Self {
        match tag & 0b11 {
            0 => Self::U8,
            1 => Self::U16,
            2 => Self::U24,
            _ => Self::U32,
        }
    }

    #[inline]
    pub fn bytesize(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U24 => 3,
            Self::U32 => 4,
        }
    }

    #[inline]
    pub fn bitsize(self) -> usize {
        self.bytesize() * 8
    }

    #[inline]
    fn max_value(self) -> u64 {
        (1u64 << self.bitsize()) - 1
    }

    /// The value stored in the low 2 bits of the first packet byte
    #[inline]
    pub fn into_packet_tag_mask(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::U16 => 1,
            Self::U24 => 2,
            Self::U32 => 3,
        }
    }
}

/// A packet number as it appears on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPacketNumber {
    space: PacketNumberSpace,
    value: u32,
    len: PacketNumberLen,
}

impl TruncatedPacketNumber {
    #[inline]
    pub(crate) fn from_parts(space: PacketNumberSpace, value: u32, len: PacketNumberLen) -> Self {
        Self { space, value, len }
    }

    #[cfg(test)]
    pub(crate) fn new(space: PacketNumberSpace, value: u32, len: PacketNumberLen) -> Self {
        Self::from_parts(space, value, len)
    }

    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn len(self) -> PacketNumberLen {
        self.len
    }

    #[inline]
    pub fn bitsize(self) -> usize {
        self.len.bitsize()
    }

    #[inline]
    pub(crate) fn decode(
        buffer: DecoderBufferMut,
        space: PacketNumberSpace,
        len: PacketNumberLen,
    ) -> DecoderBufferMutResult<Self> {
        let (bytes, buffer) = buffer.decode_slice(len.bytesize())?;
        let bytes = bytes.into_less_safe_slice();

        let mut value = 0u32;
        for byte in bytes.iter() {
            value = (value << 8) | *byte as u32;
        }

        Ok((Self { space, value, len }, buffer))
    }

    #[inline]
    pub fn encode<E: Encoder>(self, encoder: &mut E) {
        let bytes = self.value.to_be_bytes();
        encoder.write_slice(&bytes[4 - self.len.bytesize()..]);
    }

    /// Reconstructs the full packet number closest to one more than the
    /// largest successfully processed packet number.
    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //# if candidate_pn <= expected_pn - pn_hwin and
    //#    candidate_pn < (1 << 62) - pn_win:
    //#    return candidate_pn + pn_win
    //# if candidate_pn > expected_pn + pn_hwin and
    //#    candidate_pn >= pn_win:
    //#    return candidate_pn - pn_win
    //# return candidate_pn
    #[inline]
    pub fn expand(self, largest_pn: Option<PacketNumber>) -> Result<PacketNumber, DecoderError> {
        let expected_pn = match largest_pn {
            Some(largest) => {
                self.space.assert_eq(largest.space);
                largest.as_u64() + 1
            }
            None => 0,
        };

        let pn_win = 1u64 << self.bitsize();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let candidate = (expected_pn & !pn_mask) | self.value as u64;

        let value = if candidate
            .checked_add(pn_hwin)
            .map_or(false, |v| v <= expected_pn)
            && candidate < (1u64 << 62) - pn_win
        {
            candidate + pn_win
        } else if candidate > expected_pn + pn_hwin && candidate >= pn_win {
            candidate - pn_win
        } else {
            candidate
        };

        let value =
            VarInt::new(value).map_err(|_| DecoderError::InvariantViolation("invalid packet number"))?;

        Ok(self.space.new_packet_number(value))
    }
}

/// An inclusive range of packet numbers within one space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketNumberRange {
    start: PacketNumber,
    end: PacketNumber,
}

impl PacketNumberRange {
    #[inline]
    pub fn new(start: PacketNumber, end: PacketNumber) -> Self {
        start.space.assert_eq(end.space);
        debug_assert!(start <= end);
        Self { start, end }
    }

    #[inline]
    pub fn start(self) -> PacketNumber {
        self.start
    }

    #[inline]
    pub fn end(self) -> PacketNumber {
        self.end
    }

    #[inline]
    pub fn contains(self, pn: PacketNumber) -> bool {
        self.start <= pn && pn <= self.end
    }

    #[inline]
    pub fn iter(self) -> impl Iterator<Item = PacketNumber> {
        let space = self.start.space;
        (self.start.as_u64()..=self.end.as_u64()).map(move |value| {
            space.new_packet_number(unsafe { VarInt::new_unchecked(value) })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
    //= type=test
    //# For example, if an endpoint has received an acknowledgment for packet
    //# 0xabe8bc, sending a packet with a number of 0xac5c02 requires a
    //# packet number encoding with 16 bits or more; whereas the 24-bit
    //# packet number encoding is needed to send a packet with a number of
    //# 0xace8fe.
    #[test]
    fn truncation_example_test() {
        let largest_acked = pn(0x00ab_e8bc);

        assert_eq!(pn(0x00ac_5c02).truncate(largest_acked).unwrap().bitsize(), 16);
        assert_eq!(pn(0x00ac_e8fe).truncate(largest_acked).unwrap().bitsize(), 24);
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //= type=test
    //# For example, if the highest successfully
    //# authenticated packet had a packet number of 0xa82f30ea, then a packet
    //# containing a 16-bit value of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn expansion_example_test() {
        let largest = pn(0xa82f_30ea);
        let truncated = TruncatedPacketNumber::new(
            PacketNumberSpace::ApplicationData,
            0x9b32,
            PacketNumberLen::U16,
        );

        assert_eq!(truncated.expand(Some(largest)).unwrap(), pn(0xa82f_9b32));
    }

    #[test]
    fn truncate_expand_round_trip_test() {
        for (largest_acked, value) in [
            (0u32, 1u32),
            (0, 255),
            (100, 128),
            (0x00ab_e8bc, 0x00ac_5c02),
            (0xa82f_30ea, 0xa82f_9b32),
        ] {
            let largest_acked = pn(largest_acked);
            let value = pn(value);
            let truncated = value.truncate(largest_acked).unwrap();

            // encode + decode the truncated form
            let mut bytes = [0u8; 4];
            let len = {
                let mut encoder = s2n_codec::EncoderBuffer::new(&mut bytes);
                truncated.encode(&mut encoder);
                encoder.len()
            };
            assert_eq!(len, truncated.len().bytesize());

            let buffer = DecoderBufferMut::new(&mut bytes[..len]);
            let (decoded, _) = TruncatedPacketNumber::decode(
                buffer,
                PacketNumberSpace::ApplicationData,
                truncated.len(),
            )
            .unwrap();
            assert_eq!(decoded, truncated);

            // expansion around the receiver's largest recovers the value
            let expanded = decoded.expand(Some(largest_acked)).unwrap();
            assert_eq!(expanded, value);
        }
    }

    #[test]
    fn first_packet_expand_test() {
        let truncated = TruncatedPacketNumber::new(
            PacketNumberSpace::Initial,
            0,
            PacketNumberLen::U8,
        );
        let expanded = truncated.expand(None).unwrap();
        assert_eq!(expanded.as_u64(), 0);
    }

    #[test]
    fn range_test() {
        let range = PacketNumberRange::new(pn(3), pn(6));
        assert!(range.contains(pn(3)));
        assert!(range.contains(pn(6)));
        assert!(!range.contains(pn(7)));
        assert_eq!(range.iter().count(), 4);
    }
}
