// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! ACK aggregation state shared between the receive path and the ACK frame
//! codec

use crate::{
    frame::ack::AckRanges as AckRangesTrait,
    interval::IntervalSet,
    packet::number::{PacketNumber, PacketNumberSpace},
    varint::VarInt,
};
use core::{num::NonZeroUsize, ops::RangeInclusive, time::Duration};
use smallvec::SmallVec;

/// The number of ACK ranges kept per packet-number space before the lowest
/// ranges are evicted
pub const DEFAULT_ACK_RANGES_LIMIT: u8 = 16;

/// The number of ack-eliciting packets received before an immediate ACK
pub const DEFAULT_ACK_ELICITATION_INTERVAL: u8 = 2;

/// Settings for ACK frame generation
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// The maximum amount of time by which acknowledgments are delayed
    pub max_ack_delay: Duration,
    /// Decodes the ACK Delay field in ACK frames we receive
    pub ack_delay_exponent: u8,
    /// The number of ack-eliciting packets received before an ACK is sent
    /// without waiting for the delay timer
    pub ack_elicitation_interval: u8,
    /// The number of packet number intervals to store
    pub ack_ranges_limit: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self::RECOMMENDED
    }
}

impl Settings {
    pub const RECOMMENDED: Self = Self {
        max_ack_delay: Duration::from_millis(25),
        ack_delay_exponent: 3,
        ack_elicitation_interval: DEFAULT_ACK_ELICITATION_INTERVAL,
        ack_ranges_limit: DEFAULT_ACK_RANGES_LIMIT,
    };

    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
    //# An endpoint MUST acknowledge all ack-eliciting Initial and Handshake
    //# packets immediately
    pub const EARLY: Self = Self {
        max_ack_delay: Duration::ZERO,
        ack_delay_exponent: 0,
        ack_elicitation_interval: 1,
        ..Self::RECOMMENDED
    };

    /// Decodes the peer's ACK Delay field into a duration
    #[inline]
    pub fn decode_ack_delay(&self, delay: VarInt) -> Duration {
        // a hostile delay field must saturate rather than overflow
        let micros = delay
            .as_u64()
            .saturating_mul(1u64 << self.ack_delay_exponent.min(20));
        Duration::from_micros(micros)
    }

    /// Encodes a local delay for the ACK Delay field
    #[inline]
    pub fn encode_ack_delay(&self, delay: Duration) -> VarInt {
        let micros = delay.as_micros() as u64;
        VarInt::new(micros >> self.ack_delay_exponent).unwrap_or(VarInt::MAX)
    }
}

/// The set of received packet numbers pending acknowledgment
///
/// Bounded by `ack_ranges_limit`; when the bound is hit the lowest ranges
/// are evicted, and packet numbers below the evicted tail are treated as
/// already acknowledged.
#[derive(Clone, Debug, PartialEq)]
pub struct Ranges {
    space: PacketNumberSpace,
    set: IntervalSet,
}

impl Ranges {
    pub fn new(space: PacketNumberSpace, limit: u8) -> Self {
        let limit = NonZeroUsize::new(limit.max(1) as usize).expect("limit is at least 1");
        Self {
            space,
            set: IntervalSet::with_limit(limit),
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Inserts a received packet number; returns false for duplicates
    #[inline]
    pub fn insert(&mut self, packet_number: PacketNumber) -> bool {
        self.space.assert_eq(packet_number.space());
        self.set.insert_value(packet_number.as_u64())
    }

    #[inline]
    pub fn contains(&self, packet_number: PacketNumber) -> bool {
        self.set.contains(packet_number.as_u64())
    }

    /// The lowest packet number still tracked; anything below was either
    /// acknowledged long ago or evicted
    #[inline]
    pub fn min_value(&self) -> Option<PacketNumber> {
        self.set
            .min_value()
            .map(|value| self.space.new_packet_number(unsafe { VarInt::new_unchecked(value) }))
    }

    #[inline]
    pub fn max_value(&self) -> Option<PacketNumber> {
        self.set
            .max_value()
            .map(|value| self.space.new_packet_number(unsafe { VarInt::new_unchecked(value) }))
    }

    /// Forgets everything at or below `packet_number` (after those ranges
    /// were acknowledged by the peer in turn)
    #[inline]
    pub fn forget_up_to(&mut self, packet_number: PacketNumber) {
        self.space.assert_eq(packet_number.space());
        self.set.remove(0..=packet_number.as_u64());
    }

    #[inline]
    pub fn clear(&mut self) {
        self.set.clear();
    }

    #[inline]
    pub fn interval_len(&self) -> usize {
        self.set.interval_len()
    }
}

impl AckRangesTrait for Ranges {
    type Iter = Iter;

    fn ack_ranges(&self) -> Self::Iter {
        let ranges = self
            .set
            .intervals()
            .rev()
            .map(|interval| unsafe {
                // the set only stores values inserted as packet numbers,
                // which are valid varints
                (
                    VarInt::new_unchecked(interval.start()),
                    VarInt::new_unchecked(interval.end()),
                )
            })
            .collect();
        Iter { ranges, index: 0 }
    }
}

/// Iterates stored ranges in descending order
pub struct Iter {
    ranges: SmallVec<[(VarInt, VarInt); 4]>,
    index: usize,
}

impl Iterator for Iter {
    type Item = RangeInclusive<VarInt>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let (start, end) = *self.ranges.get(self.index)?;
        self.index += 1;
        Some(start..=end)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.ranges.len() - self.index;
        (len, Some(len))
    }
}

impl ExactSizeIterator for Iter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    #[test]
    fn ranges_test() {
        let mut ranges = Ranges::new(PacketNumberSpace::ApplicationData, 16);

        assert!(ranges.insert(pn(1)));
        assert!(ranges.insert(pn(2)));
        assert!(ranges.insert(pn(5)));
        assert!(!ranges.insert(pn(2)), "duplicates are rejected");

        let collected: Vec<_> = AckRangesTrait::ack_ranges(&ranges).collect();
        assert_eq!(
            collected,
            vec![
                VarInt::from_u8(5)..=VarInt::from_u8(5),
                VarInt::from_u8(1)..=VarInt::from_u8(2),
            ]
        );
        assert_eq!(AckRangesTrait::largest_acknowledged(&ranges), VarInt::from_u8(5));
    }

    #[test]
    fn eviction_test() {
        let mut ranges = Ranges::new(PacketNumberSpace::ApplicationData, 2);
        ranges.insert(pn(0));
        ranges.insert(pn(10));
        ranges.insert(pn(20));

        // the lowest range was evicted
        assert_eq!(ranges.min_value(), Some(pn(10)));
        assert_eq!(ranges.interval_len(), 2);
    }

    #[test]
    fn ack_delay_codec_test() {
        let settings = Settings::RECOMMENDED;

        let delay = Duration::from_millis(10);
        let encoded = settings.encode_ack_delay(delay);
        assert_eq!(encoded.as_u64(), 10_000 >> 3);
        assert_eq!(settings.decode_ack_delay(encoded), delay);

        // sub-granularity delays round down
        let encoded = settings.encode_ack_delay(Duration::from_micros(12));
        assert_eq!(encoded.as_u64(), 1);
        assert_eq!(settings.decode_ack_delay(encoded), Duration::from_micros(8));
    }
}
