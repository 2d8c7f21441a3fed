// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive-side packet number tracking and ACK scheduling for one space

use wren_quic_core::{
    ack,
    frame::ack::EcnCounts,
    inet::ExplicitCongestionNotification,
    packet::number::PacketNumber,
    time::{timer, Timer, Timestamp},
    transmission,
    varint::VarInt,
};

/// Why a received packet was not accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The packet number was already processed
    Duplicate,
    /// The packet number is below the tracked window
    TooOld,
}

#[derive(Debug)]
pub struct AckManager {
    settings: ack::Settings,
    ranges: ack::Ranges,

    /// Receive time of the largest packet, for the ACK Delay field
    largest_received_time: Option<Timestamp>,

    /// Ack-eliciting packets received since the last ACK left
    ack_eliciting_unacked: u8,
    /// An ACK must go out at the next transmission opportunity
    immediate: bool,
    /// New packets arrived since the last ACK was sent
    ack_pending: bool,
    ack_timer: Timer,

    /// Cumulative ECN counts over accepted packets
    ecn_counts: EcnCounts,
    /// ECN counts are only reported once validation succeeded
    ecn_validated: bool,
}

impl AckManager {
    pub fn new(space: wren_quic_core::packet::number::PacketNumberSpace, settings: ack::Settings) -> Self {
        Self {
            ranges: ack::Ranges::new(space, settings.ack_ranges_limit),
            settings,
            largest_received_time: None,
            ack_eliciting_unacked: 0,
            immediate: false,
            ack_pending: false,
            ack_timer: Timer::default(),
            ecn_counts: EcnCounts::default(),
            ecn_validated: true,
        }
    }

    #[inline]
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.ranges.max_value()
    }

    /// Admits a packet number, or reports why it must be dropped
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        ack_eliciting: bool,
        ecn: ExplicitCongestionNotification,
        now: Timestamp,
    ) -> Result<(), DropReason> {
        if let Some(min) = self.ranges.min_value() {
            if packet_number < min && !self.ranges.contains(packet_number) {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.3
                //# Receivers SHOULD thus track and discard duplicate packets.
                return Err(DropReason::TooOld);
            }
        }

        let out_of_order = self
            .largest_received()
            .map_or(false, |largest| packet_number < largest);

        if !self.ranges.insert(packet_number) {
            return Err(DropReason::Duplicate);
        }

        if !out_of_order {
            self.largest_received_time = Some(now);
        }
        self.ack_pending = true;

        match ecn {
            ExplicitCongestionNotification::Ect0 => {
                self.ecn_counts.ect_0_count = self.ecn_counts.ect_0_count.saturating_add(VarInt::from_u8(1));
            }
            ExplicitCongestionNotification::Ect1 => {
                self.ecn_counts.ect_1_count = self.ecn_counts.ect_1_count.saturating_add(VarInt::from_u8(1));
            }
            ExplicitCongestionNotification::Ce => {
                self.ecn_counts.ce_count = self.ecn_counts.ce_count.saturating_add(VarInt::from_u8(1));
            }
            ExplicitCongestionNotification::NotEct => {}
        }

        if ack_eliciting {
            self.ack_eliciting_unacked = self.ack_eliciting_unacked.saturating_add(1);

            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
            //# In order to assist loss detection at the sender, an endpoint SHOULD
            //# generate an acknowledgment immediately on receiving an ack-eliciting
            //# packet that is out of order
            if out_of_order
                || ecn.is_ce()
                || self.ack_eliciting_unacked >= self.settings.ack_elicitation_interval
                || self.settings.max_ack_delay.is_zero()
            {
                self.immediate = true;
            } else if !self.ack_timer.is_armed() {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
                //# An endpoint MUST NOT excessively delay acknowledgments of ack-
                //# eliciting packets.
                self.ack_timer.set(now + self.settings.max_ack_delay);
            }
        }

        Ok(())
    }

    /// Forces an immediate ACK covering whatever was actually received
    pub fn force_ack(&mut self) {
        if !self.ranges.is_empty() {
            self.immediate = true;
            self.ack_pending = true;
        }
    }

    pub fn on_timeout(&mut self, now: Timestamp) {
        if self.ack_timer.poll_expiration(now).is_ready() {
            self.immediate = true;
        }
    }

    /// True if an ACK frame should be written now
    pub fn should_transmit(&self, now: Timestamp) -> bool {
        self.ack_pending && !self.ranges.is_empty() && (self.immediate || self.ack_timer.is_expired(now))
    }

    /// The frame contents for an ACK transmission
    pub fn transmission(&self, now: Timestamp) -> Option<wren_quic_core::frame::Ack<ack::Ranges>> {
        if self.ranges.is_empty() {
            return None;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.5
        //# Since the receiver doesn't use the ACK Delay for Initial and Handshake
        //# packets, a receiver SHOULD send a value of 0.
        let delay = self
            .largest_received_time
            .map(|received| now.saturating_duration_since(received))
            .unwrap_or_default();

        Some(wren_quic_core::frame::Ack {
            ack_delay: self.settings.encode_ack_delay(delay),
            ack_ranges: self.ranges.clone(),
            ecn_counts: self.ecn_validated_counts(),
        })
    }

    fn ecn_validated_counts(&self) -> Option<EcnCounts> {
        let any = self.ecn_counts.ect_0_count > VarInt::ZERO
            || self.ecn_counts.ect_1_count > VarInt::ZERO
            || self.ecn_counts.ce_count > VarInt::ZERO;
        (self.ecn_validated && any).then_some(self.ecn_counts)
    }

    /// Called after an ACK frame was written into a packet
    pub fn on_transmit(&mut self) {
        self.immediate = false;
        self.ack_pending = false;
        self.ack_eliciting_unacked = 0;
        self.ack_timer.cancel();
    }

    /// Called when the peer acknowledged a packet that carried an ACK up to
    /// `largest`; ranges below it need no further reporting.
    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.4
    //# an endpoint SHOULD stop tracking those acknowledged ACK Ranges which
    //# have been acknowledged by the peer.
    pub fn on_ack_of_ack(&mut self, largest: PacketNumber) {
        self.ranges.forget_up_to(largest);
    }

    /// Duplicate reception is a no-op by construction; expose the check for
    /// the inbound pipeline.
    #[inline]
    pub fn is_duplicate(&self, packet_number: PacketNumber) -> bool {
        self.ranges.contains(packet_number)
    }
}

impl timer::Provider for AckManager {
    #[inline]
    fn timers<Q: timer::Query>(&self, query: &mut Q) -> timer::Result {
        self.ack_timer.timers(query)?;
        Ok(())
    }
}

impl AckManager {
    pub fn transmission_interest(&self, now: Timestamp, interest: &mut transmission::Interest) {
        if self.should_transmit(now) {
            interest.merge(transmission::Interest::NewData);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use wren_quic_core::{
        packet::number::PacketNumberSpace,
        time::{Clock, NoopClock},
    };

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    fn manager() -> AckManager {
        AckManager::new(PacketNumberSpace::ApplicationData, ack::Settings::RECOMMENDED)
    }

    #[test]
    fn duplicate_detection_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();
        let ecn = ExplicitCongestionNotification::NotEct;

        assert!(manager.on_packet_received(pn(1), true, ecn, now).is_ok());
        assert_eq!(
            manager.on_packet_received(pn(1), true, ecn, now),
            Err(DropReason::Duplicate)
        );
    }

    #[test]
    fn delayed_then_forced_ack_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();
        let ecn = ExplicitCongestionNotification::NotEct;

        manager.on_packet_received(pn(1), true, ecn, now).unwrap();
        assert!(!manager.should_transmit(now), "first packet is delayed");

        // the delay timer fires
        let later = now + Duration::from_millis(25);
        manager.on_timeout(later);
        assert!(manager.should_transmit(later));

        manager.on_transmit();
        assert!(!manager.should_transmit(later));
    }

    #[test]
    fn two_ack_eliciting_packets_ack_immediately_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();
        let ecn = ExplicitCongestionNotification::NotEct;

        manager.on_packet_received(pn(1), true, ecn, now).unwrap();
        manager.on_packet_received(pn(2), true, ecn, now).unwrap();
        assert!(manager.should_transmit(now));
    }

    #[test]
    fn out_of_order_acks_immediately_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();
        let ecn = ExplicitCongestionNotification::NotEct;

        manager.on_packet_received(pn(5), true, ecn, now).unwrap();
        manager.on_transmit();

        manager.on_packet_received(pn(3), true, ecn, now).unwrap();
        assert!(manager.should_transmit(now));
    }

    #[test]
    fn ce_acks_immediately_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();

        manager
            .on_packet_received(pn(1), true, ExplicitCongestionNotification::Ce, now)
            .unwrap();
        assert!(manager.should_transmit(now));

        let frame = manager.transmission(now).unwrap();
        let counts = frame.ecn_counts.unwrap();
        assert_eq!(counts.ce_count, VarInt::from_u8(1));
    }

    #[test]
    fn non_eliciting_packets_do_not_arm_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();
        let ecn = ExplicitCongestionNotification::NotEct;

        manager.on_packet_received(pn(1), false, ecn, now).unwrap();
        manager.on_packet_received(pn(2), false, ecn, now).unwrap();
        assert!(!manager.should_transmit(now + Duration::from_secs(1)));
    }

    #[test]
    fn ack_of_ack_forgets_ranges_test() {
        let now = NoopClock.get_time();
        let mut manager = manager();
        let ecn = ExplicitCongestionNotification::NotEct;

        for value in [1, 2, 5] {
            manager.on_packet_received(pn(value), true, ecn, now).unwrap();
        }
        manager.on_ack_of_ack(pn(2));

        let frame = manager.transmission(now).unwrap();
        use wren_quic_core::frame::ack::AckRanges as _;
        let ranges: Vec<_> = frame.ack_ranges.ack_ranges().collect();
        assert_eq!(ranges, vec![VarInt::from_u8(5)..=VarInt::from_u8(5)]);
    }
}
