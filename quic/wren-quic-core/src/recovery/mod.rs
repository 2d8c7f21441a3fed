// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss recovery and congestion control primitives (RFC 9002)

mod congestion_controller;
mod new_reno;
mod pacing;
mod pto;
mod rtt_estimator;
mod sent_packets;

pub use congestion_controller::CongestionController;
pub use new_reno::NewReno;
pub use pacing::Pacer;
pub use pto::Pto;
pub use rtt_estimator::{RttEstimator, DEFAULT_INITIAL_RTT, K_GRANULARITY};
pub use sent_packets::{SentPacketInfo, SentPackets};

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
//# The RECOMMENDED initial value for the packet reordering threshold
//# (kPacketThreshold) is 3, based on best practices for TCP loss
//# detection
pub const K_PACKET_THRESHOLD: u64 = 3;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED time threshold (kTimeThreshold), expressed as an
//# RTT multiplier, is 9/8.
pub const K_TIME_THRESHOLD_NUMERATOR: u32 = 9;
pub const K_TIME_THRESHOLD_DENOMINATOR: u32 = 8;

/// Applies the 9/8 time threshold to an RTT value
#[inline]
pub fn time_threshold(rtt: core::time::Duration) -> core::time::Duration {
    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
    //# The time threshold is:
    //#
    //# max(kTimeThreshold * max(smoothed_rtt, latest_rtt), kGranularity)
    (rtt * K_TIME_THRESHOLD_NUMERATOR / K_TIME_THRESHOLD_DENOMINATOR).max(K_GRANULARITY)
}
