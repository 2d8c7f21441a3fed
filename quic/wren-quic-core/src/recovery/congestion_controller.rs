// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{recovery::RttEstimator, time::Timestamp};
use core::fmt::Debug;

/// The contract between loss recovery and a congestion control algorithm
///
/// The transport integrates a controller; it never invents one. NewReno is
/// the baseline implementation.
pub trait CongestionController: 'static + Send + Debug {
    /// The size of the current congestion window in bytes
    fn congestion_window(&self) -> u32;

    /// The bytes currently counted against the congestion window
    fn bytes_in_flight(&self) -> u32;

    /// True if the window has no room for another full-sized packet
    fn is_congestion_limited(&self, max_datagram_size: u16) -> bool;

    /// True while the controller is in slow start
    fn is_slow_start(&self) -> bool;

    /// Called for every packet counted in flight.
    ///
    /// Pure-ACK packets are not congestion controlled and never reach this
    /// method.
    fn on_packet_sent(&mut self, time_sent: Timestamp, sent_bytes: usize, rtt: &RttEstimator);

    /// Called once per ACK frame with the newly acknowledged in-flight bytes;
    /// `newest_acked_time_sent` is the send time of the newest of them.
    fn on_ack(
        &mut self,
        newest_acked_time_sent: Timestamp,
        bytes_acknowledged: usize,
        rtt: &RttEstimator,
        now: Timestamp,
    );

    /// Called for each packet declared lost
    fn on_packet_lost(
        &mut self,
        lost_bytes: u32,
        time_sent: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    );

    /// Called when the ECN-CE count reported by the peer increased
    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.1
    //# If a path has been validated to support Explicit Congestion
    //# Notification (ECN) [RFC3168] [RFC8311], QUIC treats a Congestion
    //# Experienced (CE) codepoint in the IP header as a signal of
    //# congestion.
    fn on_congestion_event(&mut self, time_sent: Timestamp, now: Timestamp);

    /// Called when an in-flight packet is discarded without being acked or
    /// declared lost (key discard, pn space teardown)
    fn on_packet_discarded(&mut self, bytes: usize);

    /// Called when the path MTU estimate changes
    fn on_mtu_update(&mut self, max_datagram_size: u16);

    /// The target pacing rate in bytes per second
    fn pacing_rate(&self, rtt: &RttEstimator) -> u64;
}
