// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ensure,
    time::{timer, Timer, Timestamp},
};
use core::{task::Poll, time::Duration};

/// The probe timeout state for one packet-number space
#[derive(Debug, Default)]
pub struct Pto {
    timer: Timer,
    /// Probe packets that still need to be transmitted
    transmissions: u8,
}

impl Pto {
    /// Called when a timeout has occurred. Returns `Ready` if the PTO timer
    /// had expired.
    #[inline]
    pub fn on_timeout(&mut self, packets_in_flight: bool, timestamp: Timestamp) -> Poll<()> {
        ensure!(
            self.timer.poll_expiration(timestamp).is_ready(),
            Poll::Pending
        );

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
        //# When a PTO timer expires, a sender MUST send at least one ack-
        //# eliciting packet in the packet number space as a probe.

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
        //# An endpoint
        //# MAY send up to two full-sized datagrams containing ack-eliciting
        //# packets to avoid an expensive consecutive PTO expiration due to a
        //# single lost datagram or to transmit data from multiple packet
        //# number spaces.
        self.transmissions = if packets_in_flight { 2 } else { 1 };

        Poll::Ready(())
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# A sender SHOULD restart its PTO timer every time an ack-eliciting
    //# packet is sent or acknowledged, or when Initial or Handshake keys are
    //# discarded (Section 4.9 of [QUIC-TLS]).
    #[inline]
    pub fn update(&mut self, base_timestamp: Timestamp, pto_period: Duration) {
        self.timer.set(base_timestamp + pto_period);
    }

    #[inline]
    pub fn cancel(&mut self) {
        self.timer.cancel();
    }

    /// The number of pending probe transmissions
    #[inline]
    pub fn transmissions(&self) -> u8 {
        self.transmissions
    }

    #[inline]
    pub fn on_transmit_once(&mut self) {
        debug_assert!(self.transmissions > 0, "transmitted a probe while idle");
        self.transmissions = self.transmissions.saturating_sub(1);
    }

    /// Forces a probe on the next transmission opportunity
    #[inline]
    pub fn force_transmit(&mut self) {
        ensure!(self.transmissions == 0);
        self.transmissions = 1;
    }
}

impl timer::Provider for Pto {
    #[inline]
    fn timers<Q: timer::Query>(&self, query: &mut Q) -> timer::Result {
        self.timer.timers(query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{timer::Provider as _, Clock, NoopClock};

    #[test]
    fn pto_lifecycle_test() {
        let now = NoopClock.get_time();
        let mut pto = Pto::default();

        // nothing armed, nothing expires
        assert_eq!(pto.on_timeout(true, now), Poll::Pending);

        pto.update(now, Duration::from_millis(100));
        assert!(pto.next_expiration().is_some());
        assert_eq!(pto.on_timeout(true, now), Poll::Pending);

        let later = now + Duration::from_millis(100);
        assert_eq!(pto.on_timeout(true, later), Poll::Ready(()));

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
        //= type=test
        //# An endpoint
        //# MAY send up to two full-sized datagrams containing ack-eliciting
        //# packets
        assert_eq!(pto.transmissions(), 2);

        pto.on_transmit_once();
        pto.on_transmit_once();
        assert_eq!(pto.transmissions(), 0);
    }

    #[test]
    fn no_packets_in_flight_sends_one_probe_test() {
        let now = NoopClock.get_time();
        let mut pto = Pto::default();

        pto.update(now, Duration::ZERO);
        assert_eq!(pto.on_timeout(false, now), Poll::Ready(()));
        assert_eq!(pto.transmissions(), 1);
    }

    #[test]
    fn cancel_test() {
        let now = NoopClock.get_time();
        let mut pto = Pto::default();

        pto.update(now, Duration::from_millis(10));
        pto.cancel();
        assert!(pto.next_expiration().is_none());
        assert_eq!(
            pto.on_timeout(true, now + Duration::from_millis(20)),
            Poll::Pending
        );
    }
}
