// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Delivery tracking for state that is synchronized to the peer through
//! individual frames
//!
//! A component requests delivery of its latest value; the packet builder
//! writes the frame and records which packet carried it; acknowledgment
//! completes the sync and loss re-requests it. A newer value always
//! replaces an in-flight one.

use wren_quic_core::{
    packet::number::PacketNumber,
    transmission,
    transport,
    transport_error,
    varint::VarInt,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum Delivery {
    #[default]
    Idle,
    Requested,
    InFlight {
        packet_number: PacketNumber,
        /// A newer value was requested while this one was in flight
        superseded: bool,
    },
    Delivered,
}

/// Synchronizes a monotone `VarInt` value (MAX_DATA, MAX_STREAM_DATA,
/// MAX_STREAMS)
#[derive(Clone, Debug, Default)]
pub struct ValueSync {
    value: VarInt,
    delivery: Delivery,
}

impl ValueSync {
    pub fn new(value: VarInt) -> Self {
        Self {
            value,
            delivery: Delivery::Delivered,
        }
    }

    /// The current local value, whether or not the peer has seen it
    #[inline]
    pub fn value(&self) -> VarInt {
        self.value
    }

    /// Requests delivery of a new value; values never move backwards
    pub fn request_delivery(&mut self, value: VarInt) {
        if value <= self.value && !matches!(self.delivery, Delivery::Idle) {
            return;
        }
        self.value = self.value.max(value);
        self.delivery = match self.delivery {
            Delivery::InFlight { packet_number, .. } => Delivery::InFlight {
                packet_number,
                superseded: true,
            },
            _ => Delivery::Requested,
        };
    }

    /// The value to write, if a transmission is due
    #[inline]
    pub fn transmission_value(&self) -> Option<VarInt> {
        match self.delivery {
            Delivery::Requested => Some(self.value),
            Delivery::InFlight {
                superseded: true, ..
            } => Some(self.value),
            _ => None,
        }
    }

    pub fn on_transmit(&mut self, packet_number: PacketNumber) {
        self.delivery = Delivery::InFlight {
            packet_number,
            superseded: false,
        };
    }

    pub fn on_packet_ack(&mut self, packet_number: PacketNumber) {
        if let Delivery::InFlight {
            packet_number: sent,
            superseded,
        } = self.delivery
        {
            if sent == packet_number {
                self.delivery = if superseded {
                    Delivery::Requested
                } else {
                    Delivery::Delivered
                };
            }
        }
    }

    pub fn on_packet_loss(&mut self, packet_number: PacketNumber) {
        if let Delivery::InFlight {
            packet_number: sent,
            ..
        } = self.delivery
        {
            if sent == packet_number {
                self.delivery = Delivery::Requested;
            }
        }
    }

    #[inline]
    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        if self.transmission_value().is_some() {
            interest.merge(transmission::Interest::NewData);
        }
    }
}

/// Synchronizes a one-shot frame (HANDSHAKE_DONE, a pending PING)
#[derive(Clone, Debug, Default)]
pub struct Flag {
    delivery: Delivery,
}

impl Flag {
    /// Requests (re)delivery of the flag
    pub fn request_delivery(&mut self) {
        if !matches!(self.delivery, Delivery::Delivered) {
            self.delivery = Delivery::Requested;
        }
    }

    #[inline]
    pub fn needs_transmission(&self) -> bool {
        matches!(self.delivery, Delivery::Requested)
    }

    #[inline]
    pub fn is_delivered(&self) -> bool {
        matches!(self.delivery, Delivery::Delivered)
    }

    pub fn on_transmit(&mut self, packet_number: PacketNumber) {
        self.delivery = Delivery::InFlight {
            packet_number,
            superseded: false,
        };
    }

    pub fn on_packet_ack(&mut self, packet_number: PacketNumber) {
        if let Delivery::InFlight {
            packet_number: sent,
            ..
        } = self.delivery
        {
            if sent == packet_number {
                self.delivery = Delivery::Delivered;
            }
        }
    }

    pub fn on_packet_loss(&mut self, packet_number: PacketNumber) {
        if let Delivery::InFlight {
            packet_number: sent,
            ..
        } = self.delivery
        {
            if sent == packet_number {
                self.delivery = Delivery::Requested;
            }
        }
    }

    #[inline]
    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        if self.needs_transmission() {
            interest.merge(transmission::Interest::NewData);
        }
    }
}

/// The connection-level send credit granted by the peer
//= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
//# A sender MUST NOT send data in excess of either limit.
#[derive(Debug)]
pub struct OutgoingFlowController {
    /// Latest MAX_DATA from the peer
    maximum_data: VarInt,
    /// Total stream bytes sent on the connection
    bytes_sent: VarInt,
    /// Delivery state of a DATA_BLOCKED report
    blocked_sync: ValueSync,
}

impl OutgoingFlowController {
    pub fn new(initial_max_data: VarInt) -> Self {
        Self {
            maximum_data: initial_max_data,
            bytes_sent: VarInt::ZERO,
            blocked_sync: ValueSync::new(VarInt::ZERO),
        }
    }

    #[inline]
    pub fn available(&self) -> u64 {
        self.maximum_data.as_u64() - self.bytes_sent.as_u64()
    }

    #[inline]
    pub fn bytes_sent(&self) -> VarInt {
        self.bytes_sent
    }

    /// Claims up to `len` bytes of connection credit
    pub fn acquire(&mut self, len: usize) -> usize {
        let granted = (len as u64).min(self.available()) as usize;
        self.bytes_sent = self
            .bytes_sent
            .checked_add_usize(granted)
            .expect("credit is bounded by a varint");
        granted
    }

    pub fn on_max_data(&mut self, maximum_data: VarInt) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.9
        //# A receiver MUST NOT renege on an advertisement; that is, once a
        //# receiver advertises an offset via a MAX_DATA frame, advertising a
        //# smaller offset has no effect.
        self.maximum_data = self.maximum_data.max(maximum_data);
    }

    /// Records that the sender is blocked, scheduling a DATA_BLOCKED frame
    pub fn on_blocked(&mut self) {
        if self.available() == 0 {
            self.blocked_sync.request_delivery(self.maximum_data);
        }
    }

    #[inline]
    pub fn blocked_sync(&mut self) -> &mut ValueSync {
        &mut self.blocked_sync
    }
}

/// The connection-level receive credit granted to the peer
#[derive(Debug)]
pub struct IncomingFlowController {
    /// The highest offset sum the peer may reach
    max_data_sync: ValueSync,
    /// Sum of the highest received offsets over all streams
    bytes_received: VarInt,
    /// Bytes handed to the application
    bytes_consumed: VarInt,
    /// The credit window beyond consumed data
    window: VarInt,
}

impl IncomingFlowController {
    pub fn new(initial_max_data: VarInt) -> Self {
        Self {
            max_data_sync: ValueSync::new(initial_max_data),
            bytes_received: VarInt::ZERO,
            bytes_consumed: VarInt::ZERO,
            window: initial_max_data,
        }
    }

    /// Accounts newly received stream bytes (growth of a stream's highest
    /// received offset)
    pub fn on_data_received(&mut self, len: VarInt) -> Result<(), transport::Error> {
        let received = self
            .bytes_received
            .checked_add(len)
            .ok_or_else(|| transport_error!(FLOW_CONTROL_ERROR, "connection data overflow"))?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised connection
        //# or stream data limits
        if received > self.max_data_sync.value() {
            return Err(transport_error!(
                FLOW_CONTROL_ERROR,
                "peer exceeded connection data limit"
            ));
        }

        self.bytes_received = received;
        Ok(())
    }

    /// Releases credit after the application consumed `len` bytes
    pub fn on_data_consumed(&mut self, len: VarInt) {
        self.bytes_consumed = self.bytes_consumed.saturating_add(len);

        // replenish once half the window is used up
        let target = self.bytes_consumed.saturating_add(self.window);
        let unannounced = target.saturating_sub(self.max_data_sync.value());
        if unannounced.as_u64() * 2 >= self.window.as_u64() {
            self.max_data_sync.request_delivery(target);
        }
    }

    #[inline]
    pub fn sync(&mut self) -> &mut ValueSync {
        &mut self.max_data_sync
    }

    #[inline]
    pub fn bytes_received(&self) -> VarInt {
        self.bytes_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::packet::number::PacketNumberSpace;

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    #[test]
    fn value_sync_lifecycle_test() {
        let mut sync = ValueSync::new(VarInt::from_u32(100));
        assert_eq!(sync.transmission_value(), None);

        sync.request_delivery(VarInt::from_u32(200));
        assert_eq!(sync.transmission_value(), Some(VarInt::from_u32(200)));

        sync.on_transmit(pn(1));
        assert_eq!(sync.transmission_value(), None);

        sync.on_packet_ack(pn(1));
        assert_eq!(sync.transmission_value(), None);
        assert_eq!(sync.value(), VarInt::from_u32(200));
    }

    #[test]
    fn value_sync_loss_test() {
        let mut sync = ValueSync::new(VarInt::from_u32(100));
        sync.request_delivery(VarInt::from_u32(200));
        sync.on_transmit(pn(1));

        sync.on_packet_loss(pn(1));
        assert_eq!(sync.transmission_value(), Some(VarInt::from_u32(200)));
    }

    #[test]
    fn value_sync_supersede_test() {
        let mut sync = ValueSync::new(VarInt::from_u32(100));
        sync.request_delivery(VarInt::from_u32(200));
        sync.on_transmit(pn(1));

        // a newer value arrives while the old one is in flight
        sync.request_delivery(VarInt::from_u32(300));
        assert_eq!(sync.transmission_value(), Some(VarInt::from_u32(300)));

        // the ack of the stale value does not complete the newer one
        sync.on_packet_ack(pn(1));
        assert_eq!(sync.transmission_value(), Some(VarInt::from_u32(300)));
    }

    #[test]
    fn incoming_flow_controller_test() {
        let mut fc = IncomingFlowController::new(VarInt::from_u32(1000));

        fc.on_data_received(VarInt::from_u32(600)).unwrap();
        assert!(fc.on_data_received(VarInt::from_u32(500)).is_err());

        // consuming over half the window schedules a MAX_DATA update
        fc.on_data_consumed(VarInt::from_u32(600));
        let value = fc.sync().transmission_value().unwrap();
        assert_eq!(value, VarInt::from_u32(1600));
    }

    #[test]
    fn outgoing_flow_controller_test() {
        let mut fc = OutgoingFlowController::new(VarInt::from_u32(1200));

        assert_eq!(fc.acquire(3000), 1200);
        assert_eq!(fc.acquire(1), 0);

        fc.on_blocked();
        assert!(fc.blocked_sync().transmission_value().is_some());

        fc.on_max_data(VarInt::from_u32(2000));
        assert_eq!(fc.available(), 800);

        // reneging is ignored
        fc.on_max_data(VarInt::from_u32(100));
        assert_eq!(fc.available(), 800);
    }
}
