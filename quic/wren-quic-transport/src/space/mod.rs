// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per packet-number-space state: the sent-packet ledger, loss detection
//! timers, ACK generation and the CRYPTO stream for the space's levels

pub mod ack_manager;

pub use ack_manager::{AckManager, DropReason};

use smallvec::SmallVec;
use wren_quic_core::{
    ack,
    frame,
    interval::IntervalSet,
    packet::number::{PacketNumber, PacketNumberRange, PacketNumberSpace},
    recovery::{self, Pto, RttEstimator, SentPacketInfo, SentPackets},
    stream::{StreamId, StreamType},
    time::{timer, Timer, Timestamp},
    transport,
    transport_error,
    varint::VarInt,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
//# Implementations MUST support buffering at least 4096 bytes of data
//# received in out-of-order CRYPTO frames.
const CRYPTO_BUFFER_LIMIT: u64 = 64 * 1024;

/// What a sent packet carried; enough to reconstruct every retransmittable
/// frame on loss
#[derive(Clone, Debug)]
pub enum Plan {
    Stream {
        id: StreamId,
        offset: u64,
        len: u16,
        is_fin: bool,
    },
    Crypto {
        offset: u64,
        len: u16,
    },
    /// ACKs are never retransmitted; the record drives ack-of-ack pruning
    Ack {
        largest: PacketNumber,
    },
    MaxData,
    MaxStreamData {
        id: StreamId,
    },
    MaxStreams {
        stream_type: StreamType,
    },
    DataBlocked,
    StreamDataBlocked {
        id: StreamId,
    },
    StreamsBlocked {
        stream_type: StreamType,
    },
    ResetStream {
        id: StreamId,
    },
    StopSending {
        id: StreamId,
    },
    HandshakeDone,
    NewToken,
    NewConnectionId {
        sequence: VarInt,
    },
    RetireConnectionId {
        sequence: VarInt,
    },
    /// A PMTU probe; loss narrows the search instead of reporting
    /// congestion
    MtuProbe {
        size: u16,
    },
    Ping,
    /// Path frames are never retransmitted; the path timer re-probes
    PathChallenge,
    PathResponse,
    /// Datagrams are fire-and-forget
    Datagram,
}

pub type PacketData = SmallVec<[Plan; 4]>;

/// The outcome of processing an ACK frame
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<(PacketNumber, SentPacketInfo<PacketData>)>,
    /// True if any newly acked packet was ack-eliciting
    pub includes_ack_eliciting: bool,
    /// Set when the largest acknowledged packet is newly acked, providing
    /// an RTT sample
    pub largest_newly_acked_time_sent: Option<Timestamp>,
}

/// The sending side of a CRYPTO stream
#[derive(Debug, Default)]
pub struct CryptoSender {
    buffer: Vec<u8>,
    pending: IntervalSet,
}

impl CryptoSender {
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(data);
        self.pending.insert(offset..=offset + data.len() as u64 - 1);
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn next_transmission(&self, max_len: usize) -> Option<(u64, usize)> {
        let interval = self.pending.intervals().next()?;
        let len = (interval.len() as usize).min(max_len);
        if len == 0 {
            return None;
        }
        Some((interval.start(), len))
    }

    #[inline]
    pub fn data(&self, offset: u64, len: usize) -> &[u8] {
        &self.buffer[offset as usize..offset as usize + len]
    }

    pub fn on_transmit(&mut self, offset: u64, len: usize) {
        if len > 0 {
            self.pending.remove(offset..=offset + len as u64 - 1);
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.3
    //# *  Data sent in CRYPTO frames is retransmitted according to the rules
    //#    in [QUIC-RECOVERY], until all data has been acknowledged.
    pub fn on_loss(&mut self, offset: u64, len: usize) {
        if len > 0 {
            self.pending.insert(offset..=offset + len as u64 - 1);
        }
    }

    /// Queues every written byte for (re)transmission, as after a Retry
    pub fn retransmit_all(&mut self) {
        if !self.buffer.is_empty() {
            self.pending.insert(0..=self.buffer.len() as u64 - 1);
        }
    }
}

/// The receiving side of a CRYPTO stream
#[derive(Debug, Default)]
pub struct CryptoReceiver {
    buffer: wren_quic_core::buffer::Reassembler,
}

impl CryptoReceiver {
    pub fn on_crypto_frame(
        &mut self,
        frame: &frame::Crypto<&[u8]>,
    ) -> Result<(), transport::Error> {
        let end = frame
            .offset
            .checked_add_usize(frame.data.len())
            .ok_or_else(|| transport_error!(CRYPTO_BUFFER_EXCEEDED, "crypto offset overflow"))?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
        //# If an endpoint's buffer is exceeded during the handshake, it can
        //# expand its buffer temporarily to complete the handshake.  If an
        //# endpoint does not expand its buffer, it MUST close the connection
        //# with a CRYPTO_BUFFER_EXCEEDED error code.
        if end.as_u64().saturating_sub(self.buffer.consumed_offset()) > CRYPTO_BUFFER_LIMIT {
            return Err(transport_error!(
                CRYPTO_BUFFER_EXCEEDED,
                "crypto buffer exceeded"
            ));
        }

        self.buffer
            .write_at(frame.offset.as_u64(), frame.data)
            .map_err(|_| {
                transport_error!(PROTOCOL_VIOLATION, "overlapping crypto data did not match")
            })?;
        Ok(())
    }

    /// Pops the next in-order chunk of handshake bytes
    pub fn pop(&mut self) -> Option<bytes::Bytes> {
        self.buffer.pop()
    }
}

pub struct Space {
    pn_space: PacketNumberSpace,
    next_pn: VarInt,
    largest_acked: Option<PacketNumber>,

    pub sent: SentPackets<PacketData>,
    pub ack_manager: AckManager,
    pub crypto_tx: CryptoSender,
    pub crypto_rx: CryptoReceiver,

    loss_timer: Timer,
    pub pto: Pto,
    /// Tracks a PING that keeps the space probing
    pub time_of_last_ack_eliciting: Option<Timestamp>,

    /// The largest ECN-CE count the peer has reported for this space
    ecn_ce_reported: VarInt,
}

impl Space {
    pub fn new(pn_space: PacketNumberSpace, ack_settings: ack::Settings) -> Self {
        Self {
            pn_space,
            next_pn: VarInt::ZERO,
            largest_acked: None,
            sent: SentPackets::new(pn_space),
            ack_manager: AckManager::new(pn_space, ack_settings),
            crypto_tx: CryptoSender::default(),
            crypto_rx: CryptoReceiver::default(),
            loss_timer: Timer::default(),
            pto: Pto::default(),
            time_of_last_ack_eliciting: None,
            ecn_ce_reported: VarInt::ZERO,
        }
    }

    #[inline]
    pub fn pn_space(&self) -> PacketNumberSpace {
        self.pn_space
    }

    #[inline]
    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    /// The packet number the next packet will use
    #[inline]
    pub fn next_packet_number(&self) -> PacketNumber {
        self.pn_space.new_packet_number(self.next_pn)
    }

    /// The reference for packet number truncation
    #[inline]
    pub fn truncation_base(&self) -> PacketNumber {
        self.largest_acked
            .unwrap_or_else(|| self.pn_space.new_packet_number(VarInt::ZERO))
    }

    /// Commits a sent packet to the ledger
    pub fn on_packet_sent(
        &mut self,
        info: SentPacketInfo<PacketData>,
    ) -> PacketNumber {
        let pn = self.next_packet_number();
        self.next_pn = self
            .next_pn
            .checked_add(VarInt::from_u8(1))
            .expect("packet numbers fit a varint");

        if info.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(info.time_sent);
        }
        self.sent.insert(pn, info);
        pn
    }

    /// Applies an ACK frame to the sent-packet ledger.
    ///
    /// The caller routes the returned records to their owning components
    /// and feeds the congestion controller.
    pub fn on_ack_frame<A: frame::ack::AckRanges>(
        &mut self,
        ack: &frame::Ack<A>,
    ) -> Result<AckOutcome, transport::Error> {
        let mut outcome = AckOutcome::default();

        let largest_acknowledged = self
            .pn_space
            .new_packet_number(ack.largest_acknowledged());

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.1
        //# An endpoint SHOULD treat receipt of an acknowledgment for a packet it
        //# did not send as a connection error of type PROTOCOL_VIOLATION
        if largest_acknowledged >= self.next_packet_number() {
            return Err(transport_error!(
                PROTOCOL_VIOLATION,
                "ack covers an unsent packet"
            ));
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-A.7
        //# largest_acked_packet[pn_space] =
        //#     max(largest_acked_packet[pn_space], ack.largest_acked)
        self.largest_acked = Some(match self.largest_acked {
            Some(largest) => largest.max(largest_acknowledged),
            None => largest_acknowledged,
        });

        for range in ack.ack_ranges() {
            let (start, end) = range.into_inner();
            let range = PacketNumberRange::new(
                self.pn_space.new_packet_number(start),
                self.pn_space.new_packet_number(end),
            );

            for (pn, info) in self.sent.remove_range(range) {
                if info.ack_eliciting {
                    outcome.includes_ack_eliciting = true;
                }
                if pn == largest_acknowledged {
                    //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
                    //# An endpoint generates an RTT sample on receiving an
                    //# ACK frame that meets the following two conditions:
                    //#
                    //# *  the largest acknowledged packet number is newly
                    //#    acknowledged, and
                    //#
                    //# *  at least one of the newly acknowledged packets was
                    //#    ack-eliciting.
                    outcome.largest_newly_acked_time_sent = Some(info.time_sent);
                }
                outcome.newly_acked.push((pn, info));
            }
        }

        if !outcome.includes_ack_eliciting {
            outcome.largest_newly_acked_time_sent = None;
        }

        Ok(outcome)
    }

    /// Declares lost packets and re-arms the loss timer.
    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1
    //# A packet is declared lost if it meets all of the following
    //# conditions:
    //#
    //# *  The packet is unacknowledged, in flight, and was sent prior to an
    //#    acknowledged packet.
    //#
    //# *  The packet was sent kPacketThreshold packets before an
    //#    acknowledged packet (Section 6.1.1), or it was sent long enough in
    //#    the past (Section 6.1.2).
    pub fn detect_lost(
        &mut self,
        now: Timestamp,
        rtt: &RttEstimator,
    ) -> Vec<(PacketNumber, SentPacketInfo<PacketData>)> {
        self.loss_timer.cancel();

        let Some(largest_acked) = self.largest_acked else {
            return Vec::new();
        };

        let loss_delay = recovery::time_threshold(rtt.smoothed_rtt().max(rtt.latest_rtt()));
        let mut lost_pns = Vec::new();
        let mut next_loss_time: Option<Timestamp> = None;

        for (pn, info) in self.sent.iter() {
            if pn > largest_acked {
                break;
            }

            let time_lost = info.time_sent + loss_delay;
            let threshold_lost = largest_acked
                .checked_distance(pn)
                .map_or(false, |distance| distance >= recovery::K_PACKET_THRESHOLD);

            if threshold_lost || time_lost.has_elapsed(now) {
                lost_pns.push(pn);
            } else {
                //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
                //# If packets sent prior to the largest acknowledged packet
                //# cannot yet be declared lost, then a timer SHOULD be set for
                //# the remaining time.
                next_loss_time = Some(match next_loss_time {
                    Some(existing) => existing.min(time_lost),
                    None => time_lost,
                });
            }
        }

        if let Some(loss_time) = next_loss_time {
            self.loss_timer.set(loss_time);
        }

        lost_pns
            .into_iter()
            .map(|pn| {
                let info = self.sent.remove(pn).expect("packet was just listed");
                (pn, info)
            })
            .collect()
    }

    /// Records the ECN counts the peer reported in an ACK frame.
    ///
    /// Returns true when the CE count increased; duplicate reports of the
    /// same count are not a new congestion signal.
    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.1
    //# If a path has been validated to support ECN [RFC3168] [RFC8311], QUIC
    //# treats a Congestion Experienced (CE) codepoint in the IP header as a
    //# signal of congestion.
    pub fn on_ecn_counts(&mut self, counts: &frame::ack::EcnCounts) -> bool {
        if counts.ce_count > self.ecn_ce_reported {
            self.ecn_ce_reported = counts.ce_count;
            return true;
        }
        false
    }

    #[inline]
    pub fn loss_timer(&self) -> &Timer {
        &self.loss_timer
    }

    /// True when the loss timer takes precedence over the PTO timer
    #[inline]
    pub fn has_loss_time(&self) -> bool {
        self.loss_timer.is_armed()
    }

    pub fn on_timeout(&mut self, now: Timestamp) -> SpaceTimeout {
        self.ack_manager.on_timeout(now);

        if self.loss_timer.is_armed() {
            if self.loss_timer.poll_expiration(now).is_ready() {
                return SpaceTimeout::LossDetection;
            }
        } else if self
            .pto
            .on_timeout(self.sent.has_ack_eliciting(), now)
            .is_ready()
        {
            return SpaceTimeout::Pto;
        }

        SpaceTimeout::None
    }

    /// Discards the space on key retirement; the returned records release
    /// their in-flight bytes without congestion feedback.
    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9
    //# The sender MUST discard all recovery state associated with
    //# those packets and MUST remove them from the count of bytes in flight.
    pub fn discard(&mut self) -> Vec<SentPacketInfo<PacketData>> {
        self.loss_timer.cancel();
        self.pto.cancel();
        self.sent.drain().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceTimeout {
    None,
    LossDetection,
    Pto,
}

impl timer::Provider for Space {
    #[inline]
    fn timers<Q: timer::Query>(&self, query: &mut Q) -> timer::Result {
        self.ack_manager.timers(query)?;
        self.loss_timer.timers(query)?;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# As with loss detection, the PTO is per packet number space.
        if !self.loss_timer.is_armed() {
            self.pto.timers(query)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use wren_quic_core::time::{Clock, NoopClock};

    fn info(now: Timestamp, ack_eliciting: bool) -> SentPacketInfo<PacketData> {
        SentPacketInfo {
            time_sent: now,
            sent_bytes: 1200,
            ack_eliciting,
            in_flight: true,
            data: PacketData::new(),
        }
    }

    struct TestRanges(Vec<core::ops::RangeInclusive<VarInt>>);

    impl frame::ack::AckRanges for TestRanges {
        type Iter = std::vec::IntoIter<core::ops::RangeInclusive<VarInt>>;

        fn ack_ranges(&self) -> Self::Iter {
            self.0.clone().into_iter()
        }
    }

    fn ack(ranges: Vec<core::ops::RangeInclusive<u32>>) -> frame::Ack<TestRanges> {
        frame::Ack {
            ack_delay: VarInt::ZERO,
            ack_ranges: TestRanges(
                ranges
                    .into_iter()
                    .map(|r| VarInt::from_u32(*r.start())..=VarInt::from_u32(*r.end()))
                    .collect(),
            ),
            ecn_counts: None,
        }
    }

    fn space() -> Space {
        Space::new(PacketNumberSpace::ApplicationData, ack::Settings::RECOMMENDED)
    }

    #[test]
    fn ack_processing_test() {
        let now = NoopClock.get_time();
        let mut space = space();

        for _ in 0..5 {
            space.on_packet_sent(info(now, true));
        }

        let outcome = space.on_ack_frame(&ack(vec![2..=4])).unwrap();
        assert_eq!(outcome.newly_acked.len(), 3);
        assert!(outcome.includes_ack_eliciting);
        assert_eq!(outcome.largest_newly_acked_time_sent, Some(now));
        assert_eq!(space.largest_acked().unwrap().as_u64(), 4);

        // applying the same ACK again has no further effect
        let outcome = space.on_ack_frame(&ack(vec![2..=4])).unwrap();
        assert!(outcome.newly_acked.is_empty());
        assert_eq!(outcome.largest_newly_acked_time_sent, None);
    }

    #[test]
    fn ack_of_unsent_packet_test() {
        let mut space = space();
        let error = space.on_ack_frame(&ack(vec![0..=0])).unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION);
    }

    #[test]
    fn packet_threshold_loss_test() {
        let now = NoopClock.get_time();
        let mut space = space();

        for _ in 0..5 {
            space.on_packet_sent(info(now, true));
        }

        // ack 4; packets 0 and 1 are 3+ behind and declared lost
        space.on_ack_frame(&ack(vec![4..=4])).unwrap();
        let rtt = RttEstimator::default();
        let lost = space.detect_lost(now + Duration::from_millis(1), &rtt);

        let lost_pns: Vec<u64> = lost.iter().map(|(pn, _)| pn.as_u64()).collect();
        assert_eq!(lost_pns, vec![0, 1]);

        // 2 and 3 wait on the time threshold
        assert!(space.loss_timer().is_armed());
    }

    #[test]
    fn time_threshold_loss_test() {
        let now = NoopClock.get_time();
        let mut space = space();
        let rtt = RttEstimator::new(Duration::from_millis(100));

        space.on_packet_sent(info(now, true));
        space.on_packet_sent(info(now, true));

        space.on_ack_frame(&ack(vec![1..=1])).unwrap();

        // packet 0 is not yet lost by time
        let lost = space.detect_lost(now + Duration::from_millis(10), &rtt);
        assert!(lost.is_empty());
        let deadline = space.loss_timer().expiration().unwrap();

        // 9/8 * 100ms
        assert_eq!(deadline - now, Duration::from_micros(112_500));

        let lost = space.detect_lost(deadline, &rtt);
        assert_eq!(lost.len(), 1);
        assert!(!space.loss_timer().is_armed());
    }

    #[test]
    fn ce_count_must_increase_test() {
        let mut space = space();

        let counts = |ce: u8| frame::ack::EcnCounts {
            ect_0_count: VarInt::from_u8(10),
            ect_1_count: VarInt::ZERO,
            ce_count: VarInt::from_u8(ce),
        };

        assert!(space.on_ecn_counts(&counts(2)));

        // the same report repeated in a later ACK is not a new signal
        assert!(!space.on_ecn_counts(&counts(2)));
        assert!(!space.on_ecn_counts(&counts(1)));

        assert!(space.on_ecn_counts(&counts(3)));
        assert!(!space.on_ecn_counts(&counts(3)));
    }

    #[test]
    fn crypto_sender_test() {
        let mut crypto = CryptoSender::default();
        crypto.write(b"client hello");

        let (offset, len) = crypto.next_transmission(5).unwrap();
        assert_eq!((offset, len), (0, 5));
        assert_eq!(crypto.data(offset, len), b"clien");
        crypto.on_transmit(offset, len);

        let (offset, len) = crypto.next_transmission(100).unwrap();
        assert_eq!((offset, len), (5, 7));
        crypto.on_transmit(offset, len);
        assert!(!crypto.has_pending());

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.3
        //= type=test
        //# *  Data sent in CRYPTO frames is retransmitted according to the
        //#    rules in [QUIC-RECOVERY], until all data has been acknowledged.
        crypto.on_loss(0, 5);
        assert_eq!(crypto.next_transmission(100).unwrap(), (0, 5));
    }

    #[test]
    fn crypto_receiver_limit_test() {
        let mut crypto = CryptoReceiver::default();

        let frame = frame::Crypto {
            offset: VarInt::from_u32(CRYPTO_BUFFER_LIMIT as u32 + 1),
            data: &b"x"[..],
        };
        let error = crypto.on_crypto_frame(&frame).unwrap_err();
        assert_eq!(error.code, transport::Error::CRYPTO_BUFFER_EXCEEDED);
    }
}
