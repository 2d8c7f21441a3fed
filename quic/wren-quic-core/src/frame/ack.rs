// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use core::{convert::TryInto, ops::RangeInclusive};
use s2n_codec::{
    decoder_value, DecoderBufferMut, DecoderBufferMutResult, DecoderError, Encoder, EncoderValue,
};
use smallvec::SmallVec;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.  The ACK frame contains one
//# or more ACK Ranges.  ACK Ranges identify acknowledged packets.  If
//# the frame type is 0x03, ACK frames also contain the cumulative count
//# of QUIC packets with associated ECN marks received on the connection
//# up until this point.

pub const TAG: Tag = 0x02;
pub const TAG_W_ECN: Tag = 0x03;

const ACK_RANGE_DECODING_ERROR: DecoderError =
    DecoderError::InvariantViolation("invalid ACK ranges");

/// A provider of acknowledged packet-number ranges, iterated in descending
/// order starting with the range containing the largest acknowledged value.
pub trait AckRanges {
    type Iter: Iterator<Item = RangeInclusive<VarInt>> + ExactSizeIterator;

    fn ack_ranges(&self) -> Self::Iter;

    fn largest_acknowledged(&self) -> VarInt {
        *self
            .ack_ranges()
            .next()
            .expect("at least one ack range is required")
            .end()
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//#   [ECN Counts (..)],
//# }

#[derive(Clone, PartialEq, Eq)]
pub struct Ack<A> {
    /// The encoded acknowledgment delay; scale with the peer's
    /// ack_delay_exponent to recover microseconds
    pub ack_delay: VarInt,

    /// Ranges of packets which are alternately not acknowledged (Gap) and
    /// acknowledged (ACK Range)
    pub ack_ranges: A,

    /// ECN counts, present for type 0x03
    pub ecn_counts: Option<EcnCounts>,
}

impl<A> Ack<A> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.ecn_counts.is_some() {
            TAG_W_ECN
        } else {
            TAG
        }
    }
}

impl<A: AckRanges> Ack<A> {
    #[inline]
    pub fn ack_ranges(&self) -> A::Iter {
        self.ack_ranges.ack_ranges()
    }

    #[inline]
    pub fn largest_acknowledged(&self) -> VarInt {
        self.ack_ranges.largest_acknowledged()
    }
}

impl<A: core::fmt::Debug> core::fmt::Debug for Ack<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Ack")
            .field("ack_delay", &self.ack_delay)
            .field("ack_ranges", &self.ack_ranges)
            .field("ecn_counts", &self.ecn_counts)
            .finish()
    }
}

impl<A: AckRanges> EncoderValue for Ack<A> {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());

        let mut iter = self.ack_ranges.ack_ranges();

        let first_ack_range = iter.next().expect("at least one ack range is required");
        let (mut smallest, largest_acknowledged) = first_ack_range.into_inner();
        let first_ack_range = largest_acknowledged - smallest;

        let ack_range_count: VarInt = iter
            .len()
            .try_into()
            .expect("ack range count cannot exceed VarInt::MAX");

        buffer.encode(&largest_acknowledged);
        buffer.encode(&self.ack_delay);
        buffer.encode(&ack_range_count);
        buffer.encode(&first_ack_range);

        for range in iter {
            let (start, end) = range.into_inner();

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
            //# Gap:  A variable-length integer indicating the number of contiguous
            //#    unacknowledged packets preceding the packet number one lower than
            //#    the smallest in the preceding ACK Range.
            let gap = smallest - end - VarInt::from_u8(2);
            let ack_range = end - start;

            buffer.encode(&gap);
            buffer.encode(&ack_range);

            smallest = start;
        }

        if let Some(ecn_counts) = self.ecn_counts.as_ref() {
            buffer.encode(ecn_counts);
        }
    }
}

/// The decoded ranges of an ACK frame
///
/// Ranges are materialized at decode time; an ACK frame rarely carries more
/// than a handful.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckRangesDecoder {
    /// (smallest, largest) pairs in descending order
    ranges: SmallVec<[(VarInt, VarInt); 4]>,
}

impl AckRanges for AckRangesDecoder {
    type Iter = AckRangesIter;

    fn ack_ranges(&self) -> Self::Iter {
        AckRangesIter {
            ranges: self.ranges.clone(),
            index: 0,
        }
    }
}

#[derive(Debug)]
pub struct AckRangesIter {
    ranges: SmallVec<[(VarInt, VarInt); 4]>,
    index: usize,
}

impl Iterator for AckRangesIter {
    type Item = RangeInclusive<VarInt>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let (smallest, largest) = *self.ranges.get(self.index)?;
        self.index += 1;
        Some(smallest..=largest)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.ranges.len() - self.index;
        (len, Some(len))
    }
}

impl ExactSizeIterator for AckRangesIter {}

impl Ack<AckRangesDecoder> {
    #[inline]
    pub(crate) fn decode<'a>(
        tag: Tag,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        let (largest_acknowledged, buffer) = buffer.decode::<VarInt>()?;
        let (ack_delay, buffer) = buffer.decode::<VarInt>()?;
        let (ack_range_count, buffer) = buffer.decode::<VarInt>()?;
        let (first_ack_range, buffer) = buffer.decode::<VarInt>()?;

        let mut smallest = largest_acknowledged
            .checked_sub(first_ack_range)
            .ok_or(ACK_RANGE_DECODING_ERROR)?;

        let mut ranges = SmallVec::new();
        ranges.push((smallest, largest_acknowledged));

        let mut buffer = buffer;
        for _ in 0..ack_range_count.as_u64() {
            let (gap, remaining) = buffer.decode::<VarInt>()?;
            let (ack_range, remaining) = remaining.decode::<VarInt>()?;
            buffer = remaining;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
            //# If any computed packet number is negative, an endpoint MUST generate
            //# a connection error of type FRAME_ENCODING_ERROR.
            let largest = smallest
                .checked_sub(gap)
                .and_then(|v| v.checked_sub(VarInt::from_u8(2)))
                .ok_or(ACK_RANGE_DECODING_ERROR)?;
            smallest = largest
                .checked_sub(ack_range)
                .ok_or(ACK_RANGE_DECODING_ERROR)?;

            ranges.push((smallest, largest));
        }

        let (ecn_counts, buffer) = if tag == TAG_W_ECN {
            let (ecn_counts, buffer) = buffer.decode()?;
            (Some(ecn_counts), buffer)
        } else {
            (None, buffer)
        };

        let frame = Ack {
            ack_delay,
            ack_ranges: AckRangesDecoder { ranges },
            ecn_counts,
        };

        Ok((frame, buffer))
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.2
//# ECN Counts {
//#   ECT0 Count (i),
//#   ECT1 Count (i),
//#   ECN-CE Count (i),
//# }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnCounts {
    /// The total number of packets received with the ECT(0) codepoint
    pub ect_0_count: VarInt,

    /// The total number of packets received with the ECT(1) codepoint
    pub ect_1_count: VarInt,

    /// The total number of packets received with the CE codepoint
    pub ce_count: VarInt,
}

decoder_value!(
    impl<'a> EcnCounts {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (ect_0_count, buffer) = buffer.decode()?;
            let (ect_1_count, buffer) = buffer.decode()?;
            let (ce_count, buffer) = buffer.decode()?;

            let ecn_counts = EcnCounts {
                ect_0_count,
                ect_1_count,
                ce_count,
            };

            Ok((ecn_counts, buffer))
        }
    }
);

impl EncoderValue for EcnCounts {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.ect_0_count);
        buffer.encode(&self.ect_1_count);
        buffer.encode(&self.ce_count);
    }
}
