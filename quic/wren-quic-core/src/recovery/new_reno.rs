// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counter::Counter,
    recovery::{CongestionController, RttEstimator},
    time::Timestamp,
};

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# Endpoints SHOULD use an initial congestion
//# window of ten times the maximum datagram size (max_datagram_size),
//# while limiting the window to the larger of 14,720 bytes or twice the
//# maximum datagram size.
const INITIAL_WINDOW_PACKETS: u32 = 10;
const INITIAL_WINDOW_LIMIT: u32 = 14_720;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# The RECOMMENDED
//# value is 2 * max_datagram_size.
const MINIMUM_WINDOW_PACKETS: u32 = 2;

/// The NewReno congestion controller (RFC 9002 appendix B)
#[derive(Clone, Debug)]
pub struct NewReno {
    congestion_window: Counter<u32>,
    bytes_in_flight: Counter<u32>,
    slow_start_threshold: u32,
    /// Packets sent before this time do not trigger a new recovery period
    recovery_start_time: Option<Timestamp>,
    max_datagram_size: u16,
    /// Acked bytes accumulated toward the next congestion-avoidance
    /// window increment
    bytes_acked_in_avoidance: u64,
}

impl NewReno {
    pub fn new(max_datagram_size: u16) -> Self {
        Self {
            congestion_window: Counter::new(Self::initial_window(max_datagram_size)),
            bytes_in_flight: Counter::new(0),
            slow_start_threshold: u32::MAX,
            recovery_start_time: None,
            max_datagram_size,
            bytes_acked_in_avoidance: 0,
        }
    }

    #[inline]
    fn initial_window(max_datagram_size: u16) -> u32 {
        (INITIAL_WINDOW_PACKETS * max_datagram_size as u32)
            .min(INITIAL_WINDOW_LIMIT.max(MINIMUM_WINDOW_PACKETS * max_datagram_size as u32))
    }

    #[inline]
    fn minimum_window(&self) -> u32 {
        MINIMUM_WINDOW_PACKETS * self.max_datagram_size as u32
    }

    /// Resets to the initial state, as after path migration
    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.4
    //# On confirming a peer's ownership of its new address, an endpoint MUST
    //# immediately reset the congestion controller and round-trip time
    //# estimator for the new path to initial values
    pub fn on_path_change(&mut self) {
        let in_flight: u32 = self.bytes_in_flight.into();
        *self = Self::new(self.max_datagram_size);
        self.bytes_in_flight = Counter::new(in_flight);
    }

    #[inline]
    fn in_recovery(&self, time_sent: Timestamp) -> bool {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# A recovery period ends and the sender enters congestion avoidance
        //# when a packet sent during the recovery period is acknowledged.
        match self.recovery_start_time {
            Some(start) => time_sent <= start,
            None => false,
        }
    }

    #[inline]
    fn on_congestion(&mut self, time_sent: Timestamp, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
        //# The sender MUST exit slow start and enter a recovery period when a
        //# packet is lost or when the ECN-CE count reported by its peer
        //# increases.
        if self.in_recovery(time_sent) {
            return;
        }

        self.recovery_start_time = Some(now);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# On entering a recovery period, a sender MUST set the slow start
        //# threshold to half the value of the congestion window when loss is
        //# detected.
        let window: u32 = self.congestion_window.into();
        self.slow_start_threshold = (window / 2).max(self.minimum_window());
        self.congestion_window = Counter::new(self.slow_start_threshold);
        self.bytes_acked_in_avoidance = 0;
    }
}

impl CongestionController for NewReno {
    #[inline]
    fn congestion_window(&self) -> u32 {
        self.congestion_window.into()
    }

    #[inline]
    fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight.into()
    }

    #[inline]
    fn is_congestion_limited(&self, max_datagram_size: u16) -> bool {
        let available = self
            .congestion_window()
            .saturating_sub(self.bytes_in_flight());
        available < max_datagram_size as u32
    }

    #[inline]
    fn is_slow_start(&self) -> bool {
        self.congestion_window() < self.slow_start_threshold
    }

    #[inline]
    fn on_packet_sent(&mut self, _time_sent: Timestamp, sent_bytes: usize, _rtt: &RttEstimator) {
        self.bytes_in_flight += sent_bytes as u32;
    }

    #[inline]
    fn on_ack(
        &mut self,
        newest_acked_time_sent: Timestamp,
        bytes_acknowledged: usize,
        _rtt: &RttEstimator,
        _now: Timestamp,
    ) {
        self.bytes_in_flight -= bytes_acknowledged as u32;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# While in a recovery period, the congestion window does not increase
        //# in response to acknowledgments.
        if self.in_recovery(newest_acked_time_sent) {
            return;
        }

        if self.is_slow_start() {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
            //# While a sender is in slow start, the congestion window increases by
            //# the number of bytes acknowledged
            self.congestion_window += bytes_acknowledged as u32;
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#appendix-B.5
        //# // Additive increase.
        //# congestion_window +=
        //#   max_datagram_size * acked_packet.sent_bytes
        //#   / congestion_window
        self.bytes_acked_in_avoidance += bytes_acknowledged as u64;
        let window = self.congestion_window() as u64;
        if self.bytes_acked_in_avoidance >= window {
            self.bytes_acked_in_avoidance -= window;
            self.congestion_window += self.max_datagram_size as u32;
        }
    }

    #[inline]
    fn on_packet_lost(
        &mut self,
        lost_bytes: u32,
        time_sent: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    ) {
        self.bytes_in_flight -= lost_bytes;
        self.on_congestion(time_sent, now);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
        //# When persistent congestion is declared, the sender's congestion
        //# window MUST be reduced to the minimum congestion window
        //# (kMinimumWindow)
        if persistent_congestion {
            self.congestion_window = Counter::new(self.minimum_window());
            self.recovery_start_time = None;
            self.slow_start_threshold = u32::MAX;
            self.bytes_acked_in_avoidance = 0;
        }
    }

    #[inline]
    fn on_congestion_event(&mut self, time_sent: Timestamp, now: Timestamp) {
        self.on_congestion(time_sent, now);
    }

    #[inline]
    fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight -= bytes as u32;
    }

    #[inline]
    fn on_mtu_update(&mut self, max_datagram_size: u16) {
        self.max_datagram_size = max_datagram_size;
    }

    #[inline]
    fn pacing_rate(&self, rtt: &RttEstimator) -> u64 {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
        //# rate = N * congestion_window / smoothed_rtt

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
        //# Using a value for "N" that is small, but at least 1 (for example,
        //# 1.25) ensures that variations in RTT do not result in
        //# underutilization of the congestion window.
        //
        // N is 2 while the window is still ramping up, 5/4 afterwards
        let (numerator, denominator) = if self.is_slow_start() {
            (2, 1)
        } else {
            (5, 4)
        };
        let window = self.congestion_window() as u64;
        let smoothed = rtt.smoothed_rtt().as_micros().max(1) as u64;
        window.saturating_mul(1_000_000) * numerator / denominator / smoothed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};
    use core::time::Duration;

    const MSS: u16 = 1200;

    fn controller() -> NewReno {
        NewReno::new(MSS)
    }

    #[test]
    fn initial_window_test() {
        assert_eq!(controller().congestion_window(), 12_000);
        assert_eq!(NewReno::new(9000).congestion_window(), 18_000);
    }

    #[test]
    fn slow_start_growth_test() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::default();
        let mut cc = controller();
        let initial = cc.congestion_window();

        cc.on_packet_sent(now, MSS as usize, &rtt);
        assert_eq!(cc.bytes_in_flight(), MSS as u32);

        cc.on_ack(now, MSS as usize, &rtt, now + Duration::from_millis(10));
        assert_eq!(cc.bytes_in_flight(), 0);

        // slow start grows by the bytes acked
        assert_eq!(cc.congestion_window(), initial + MSS as u32);
        assert!(cc.is_slow_start());
    }

    #[test]
    fn loss_halves_window_test() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::default();
        let mut cc = controller();
        let initial = cc.congestion_window();

        cc.on_packet_sent(now, MSS as usize, &rtt);
        cc.on_packet_lost(MSS as u32, now, false, now + Duration::from_millis(10));

        assert_eq!(cc.congestion_window(), initial / 2);
        assert!(!cc.is_slow_start());

        // a second loss within the same recovery period has no further effect
        let window = cc.congestion_window();
        cc.on_packet_sent(now, MSS as usize, &rtt);
        cc.on_packet_lost(MSS as u32, now, false, now + Duration::from_millis(20));
        assert_eq!(cc.congestion_window(), window);
    }

    #[test]
    fn persistent_congestion_collapses_window_test() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::default();
        let mut cc = controller();

        cc.on_packet_sent(now, MSS as usize, &rtt);
        cc.on_packet_lost(MSS as u32, now, true, now + Duration::from_millis(10));

        assert_eq!(cc.congestion_window(), 2 * MSS as u32);
        assert!(cc.is_slow_start());
    }

    #[test]
    fn congestion_avoidance_growth_test() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::default();
        let mut cc = controller();

        // force congestion avoidance
        cc.on_packet_sent(now, MSS as usize, &rtt);
        cc.on_packet_lost(MSS as u32, now, false, now + Duration::from_millis(1));
        let window = cc.congestion_window();

        let later = now + Duration::from_millis(5);

        // acking a full window of bytes grows the window by one MSS
        let mut acked = 0;
        while acked < window {
            cc.on_packet_sent(later, MSS as usize, &rtt);
            cc.on_ack(later, MSS as usize, &rtt, later + Duration::from_millis(1));
            acked += MSS as u32;
        }

        assert_eq!(cc.congestion_window(), window + MSS as u32);
    }

    #[test]
    fn pacing_rate_test() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let mut cc = controller();

        // slow start paces at 2 * cwnd / smoothed_rtt
        assert!(cc.is_slow_start());
        assert_eq!(cc.pacing_rate(&rtt), 2 * 12_000 * 1_000_000 / 100_000);

        // congestion avoidance backs off to 5/4 * cwnd / smoothed_rtt
        cc.on_packet_sent(now, MSS as usize, &rtt);
        cc.on_packet_lost(MSS as u32, now, false, now + Duration::from_millis(1));
        assert!(!cc.is_slow_start());
        assert_eq!(
            cc.pacing_rate(&rtt),
            cc.congestion_window() as u64 * 1_000_000 * 5 / 4 / 100_000
        );
    }

    #[test]
    fn congestion_limited_test() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::default();
        let mut cc = controller();

        assert!(!cc.is_congestion_limited(MSS));

        let window = cc.congestion_window();
        cc.on_packet_sent(now, window as usize, &rtt);
        assert!(cc.is_congestion_limited(MSS));

        cc.on_packet_discarded(window as usize);
        assert!(!cc.is_congestion_limited(MSS));
    }
}
