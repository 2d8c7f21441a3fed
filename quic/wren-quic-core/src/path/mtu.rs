// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Path MTU discovery (RFC 8899 applied to QUIC, RFC 9000 §14.3)
//!
//! Binary searches the usable datagram size between the base PMTU and the
//! peer's max_udp_payload_size. Probes are PING+PADDING packets that do not
//! count toward bytes in flight; a lost probe only narrows the search.

use crate::packet::number::PacketNumber;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14
//# QUIC MUST NOT be used if the network path cannot support a
//# maximum datagram size of at least 1200 bytes.
pub const BASE_PLPMTU: u16 = 1200;

/// Stop searching once the window narrows below this
const SEARCH_THRESHOLD: u16 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Searching is paused until the handshake confirms
    Disabled,
    /// A probe should be transmitted
    SearchRequested,
    /// A probe is in flight
    Probing {
        packet_number: PacketNumber,
        size: u16,
    },
    SearchComplete,
}

#[derive(Clone, Debug)]
pub struct Controller {
    state: State,
    /// The highest confirmed usable datagram size
    plpmtu: u16,
    /// The lowest size known (or assumed) not to fit
    max_probe_size: u16,
}

impl Controller {
    /// `max_udp_payload_size` is the peer's transport parameter capped by
    /// the local interface MTU.
    pub fn new(max_udp_payload_size: u16) -> Self {
        Self {
            state: State::Disabled,
            plpmtu: BASE_PLPMTU,
            max_probe_size: max_udp_payload_size.max(BASE_PLPMTU),
        }
    }

    /// The confirmed maximum datagram size for the path
    #[inline]
    pub fn mtu(&self) -> u16 {
        self.plpmtu
    }

    /// Starts probing; a no-op when the search window is already closed
    //= https://www.rfc-editor.org/rfc/rfc9000#section-14.3
    //# Endpoints SHOULD NOT send DPLPMTUD probe packets with a size larger
    //# than they are willing to receive.
    pub fn on_handshake_confirmed(&mut self) {
        if self.search_window() < SEARCH_THRESHOLD {
            self.state = State::SearchComplete;
        } else {
            self.state = State::SearchRequested;
        }
    }

    /// The probe size to transmit, if one is requested
    #[inline]
    pub fn probe_size(&self) -> Option<u16> {
        match self.state {
            State::SearchRequested => Some(self.next_probe_size()),
            _ => None,
        }
    }

    /// Called when a probe packet of `size` bytes was sent as `packet_number`
    pub fn on_probe_sent(&mut self, packet_number: PacketNumber, size: u16) {
        debug_assert_eq!(self.state, State::SearchRequested);
        self.state = State::Probing {
            packet_number,
            size,
        };
    }

    /// Called for every acknowledged packet
    pub fn on_packet_ack(&mut self, packet_number: PacketNumber) {
        if let State::Probing {
            packet_number: probe_pn,
            size,
        } = self.state
        {
            if probe_pn == packet_number {
                self.plpmtu = size;
                self.advance();
            }
        }
    }

    /// Called for every packet declared lost
    pub fn on_packet_loss(&mut self, packet_number: PacketNumber) {
        if let State::Probing {
            packet_number: probe_pn,
            size,
        } = self.state
        {
            if probe_pn == packet_number {
                // the probe did not fit; narrow the window
                self.max_probe_size = size - 1;
                self.advance();
            }
        }
    }

    #[inline]
    fn search_window(&self) -> u16 {
        self.max_probe_size.saturating_sub(self.plpmtu)
    }

    #[inline]
    fn next_probe_size(&self) -> u16 {
        self.plpmtu + self.search_window() / 2 + self.search_window() % 2
    }

    #[inline]
    fn advance(&mut self) {
        if self.search_window() < SEARCH_THRESHOLD {
            self.state = State::SearchComplete;
        } else {
            self.state = State::SearchRequested;
        }
    }

    #[inline]
    pub fn is_search_complete(&self) -> bool {
        matches!(self.state, State::SearchComplete | State::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{packet::number::PacketNumberSpace, varint::VarInt};

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    #[test]
    fn search_converges_test() {
        // the path supports 4000 bytes; the peer advertises 9000
        let path_limit = 4000;
        let mut controller = Controller::new(9000);
        assert_eq!(controller.mtu(), BASE_PLPMTU);

        controller.on_handshake_confirmed();

        let mut next_pn = 0;
        while let Some(size) = controller.probe_size() {
            let packet_number = pn(next_pn);
            next_pn += 1;

            controller.on_probe_sent(packet_number, size);
            if size <= path_limit {
                controller.on_packet_ack(packet_number);
            } else {
                controller.on_packet_loss(packet_number);
            }
        }

        assert!(controller.is_search_complete());
        assert!(controller.mtu() <= path_limit);
        assert!(path_limit - controller.mtu() < SEARCH_THRESHOLD + 1);
        assert!(next_pn < 20, "binary search should converge quickly");
    }

    #[test]
    fn small_peer_limit_disables_search_test() {
        let mut controller = Controller::new(1200);
        controller.on_handshake_confirmed();
        assert!(controller.is_search_complete());
        assert_eq!(controller.probe_size(), None);
        assert_eq!(controller.mtu(), BASE_PLPMTU);
    }
}
