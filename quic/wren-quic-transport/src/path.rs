// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Path state and migration
//!
//! At most two paths exist at a time: the active one and an alternate
//! under validation. Amplification limits apply to server paths until the
//! peer's address is validated.

use crate::runtime::Runtime;
use core::time::Duration;
use wren_quic_core::{
    connection,
    inet::SocketAddress,
    path::{challenge, Challenge, MtuController, CHALLENGE_PTO_MULTIPLIER},
    time::{timer, Timestamp},
    transmission,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
//# Prior to validating the client address, servers MUST NOT send more
//# than three times as many bytes as the number of bytes they have
//# received.
const AMPLIFICATION_FACTOR: u64 = 3;

#[derive(Debug)]
pub struct Path {
    pub local: SocketAddress,
    pub peer: SocketAddress,
    pub challenge: Challenge,
    pub mtu: MtuController,
    validated: bool,
    rx_bytes: u64,
    tx_bytes: u64,
}

impl Path {
    pub fn new(local: SocketAddress, peer: SocketAddress, max_udp_payload: u16, validated: bool) -> Self {
        Self {
            local,
            peer,
            challenge: Challenge::default(),
            mtu: MtuController::new(max_udp_payload),
            validated,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    #[inline]
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    #[inline]
    pub fn on_validated(&mut self) {
        self.validated = true;
    }

    #[inline]
    pub fn on_bytes_received(&mut self, len: usize) {
        self.rx_bytes = self.rx_bytes.saturating_add(len as u64);
    }

    #[inline]
    pub fn on_bytes_transmitted(&mut self, len: usize) {
        self.tx_bytes = self.tx_bytes.saturating_add(len as u64);
    }

    /// Bytes that may still be sent under the anti-amplification limit
    #[inline]
    pub fn amplification_allowance(&self) -> u64 {
        if self.validated {
            return u64::MAX;
        }
        (self.rx_bytes * AMPLIFICATION_FACTOR).saturating_sub(self.tx_bytes)
    }

    #[inline]
    pub fn is_amplification_limited(&self) -> bool {
        self.amplification_allowance() == 0
    }

    #[inline]
    pub fn same_pair(&self, local: &SocketAddress, peer: &SocketAddress) -> bool {
        self.local == *local && self.peer == *peer
    }
}

/// Index of a path in the manager; 0 is always the active path
pub type Id = usize;

pub const ACTIVE: Id = 0;
pub const ALTERNATE: Id = 1;

#[derive(Debug)]
pub struct Manager {
    paths: Vec<Path>,
    /// A PATH_RESPONSE owed to the peer, and the path to send it on
    pending_response: Option<(challenge::Data, Id)>,
    max_udp_payload: u16,
    /// Set when the alternate path was validated and promotion happened;
    /// the connection resets congestion state when it observes this
    migrated: bool,
}

impl Manager {
    pub fn new(local: SocketAddress, peer: SocketAddress, max_udp_payload: u16, validated: bool) -> Self {
        Self {
            paths: vec![Path::new(local, peer, max_udp_payload, validated)],
            pending_response: None,
            max_udp_payload,
            migrated: false,
        }
    }

    #[inline]
    pub fn active(&self) -> &Path {
        &self.paths[ACTIVE]
    }

    #[inline]
    pub fn active_mut(&mut self) -> &mut Path {
        &mut self.paths[ACTIVE]
    }

    #[inline]
    pub fn get(&self, id: Id) -> Option<&Path> {
        self.paths.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: Id) -> Option<&mut Path> {
        self.paths.get_mut(id)
    }

    #[inline]
    pub fn alternate_mut(&mut self) -> Option<&mut Path> {
        self.paths.get_mut(ALTERNATE)
    }

    /// Looks up (or creates) the path a datagram arrived on.
    ///
    /// A new peer address creates an alternate path which is challenged
    /// before it can become active.
    pub fn on_datagram_received(
        &mut self,
        local: &SocketAddress,
        peer: &SocketAddress,
        len: usize,
        handshake_confirmed: bool,
        runtime: &Runtime,
    ) -> Id {
        if let Some(id) = self
            .paths
            .iter()
            .position(|path| path.same_pair(local, peer))
        {
            self.paths[id].on_bytes_received(len);
            return id;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-9.3
        //# An endpoint only changes the address to which it sends packets in
        //# response to the highest-numbered non-probing packet.
        let mut path = Path::new(*local, *peer, self.max_udp_payload, false);
        path.on_bytes_received(len);

        if handshake_confirmed {
            // probe the unvalidated address before trusting it
            let mut data = [0u8; 8];
            runtime.public_random(&mut data);
            path.challenge = Challenge::new(data);
        }

        self.paths.truncate(1);
        self.paths.push(path);
        ALTERNATE
    }

    /// Starts an application-requested migration to a new local address
    pub fn migrate(
        &mut self,
        new_local: SocketAddress,
        peer_disabled_migration: bool,
        runtime: &Runtime,
    ) -> Result<(), connection::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-9
        //# An endpoint MUST NOT initiate connection migration before the
        //# handshake is confirmed, as defined in Section 4.1.2 of [QUIC-TLS].
        if peer_disabled_migration {
            return Err(connection::Error::Unsupported);
        }
        if self.active().same_pair(&new_local, &self.active().peer) {
            return Err(connection::Error::InvalidArgument);
        }

        let peer = self.active().peer;
        // the peer's address was validated long ago; only reachability of
        // the new local address is in question, so no amplification limit
        let mut path = Path::new(new_local, peer, self.max_udp_payload, true);

        let mut data = [0u8; 8];
        runtime.public_random(&mut data);
        path.challenge = Challenge::new(data);

        self.paths.truncate(1);
        self.paths.push(path);
        Ok(())
    }

    /// Stores a PATH_CHALLENGE to answer on the path it arrived on
    pub fn on_path_challenge(&mut self, data: challenge::Data, path_id: Id) {
        self.pending_response = Some((data, path_id));
    }

    /// The PATH_RESPONSE owed to the peer, if any
    #[inline]
    pub fn pending_response(&self) -> Option<(challenge::Data, Id)> {
        self.pending_response
    }

    pub fn on_response_transmitted(&mut self) {
        self.pending_response = None;
    }

    /// Processes PATH_RESPONSE; on success the alternate path is promoted.
    ///
    /// Returns true when the active path changed.
    pub fn on_path_response(&mut self, data: &[u8]) -> bool {
        // the response may validate the active path (server-side probing)
        if self.paths[ACTIVE].challenge.on_response(data) {
            self.paths[ACTIVE].on_validated();
            return false;
        }

        let Some(alternate) = self.paths.get_mut(ALTERNATE) else {
            return false;
        };
        if !alternate.challenge.on_response(data) {
            return false;
        }
        alternate.on_validated();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-9.4
        //# On confirming a peer's ownership of its new address, an endpoint
        //# MUST immediately reset the congestion controller and round-trip
        //# time estimator for the new path to initial values
        self.paths.swap(ACTIVE, ALTERNATE);
        self.paths.truncate(1);
        self.migrated = true;
        true
    }

    /// Consumes the migration marker
    pub fn take_migrated(&mut self) -> bool {
        core::mem::take(&mut self.migrated)
    }

    /// Drives challenge retransmission; a failed alternate reverts to the
    /// previous path.
    pub fn on_timeout(&mut self, now: Timestamp) {
        for path in &mut self.paths {
            path.challenge.on_timeout(now);
        }

        if self
            .paths
            .get(ALTERNATE)
            .map_or(false, |path| path.challenge.is_failed())
        {
            self.paths.truncate(1);
        }
    }

    /// The retransmit period for challenges
    #[inline]
    pub fn challenge_period(&self, pto_period: Duration) -> Duration {
        pto_period * CHALLENGE_PTO_MULTIPLIER
    }

    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        if self.pending_response.is_some() {
            interest.merge(transmission::Interest::NewData);
        }
        for path in &self.paths {
            if path.challenge.transmission_data().is_some() {
                interest.merge(transmission::Interest::NewData);
            }
        }
    }
}

impl timer::Provider for Manager {
    #[inline]
    fn timers<Q: timer::Query>(&self, query: &mut Q) -> timer::Result {
        for path in &self.paths {
            path.challenge.timers(query)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing;
    use wren_quic_core::time::{self, Clock as _};

    fn addr(port: u16) -> SocketAddress {
        SocketAddress::V4 {
            ip: [127, 0, 0, 1],
            port,
        }
    }

    #[test]
    fn amplification_limit_test() {
        let mut path = Path::new(addr(1), addr(2), 1500, false);
        assert!(path.is_amplification_limited());

        path.on_bytes_received(100);
        assert_eq!(path.amplification_allowance(), 300);

        path.on_bytes_transmitted(300);
        assert!(path.is_amplification_limited());

        path.on_validated();
        assert!(!path.is_amplification_limited());
    }

    #[test]
    fn migration_round_trip_test() {
        let clock = time::testing::Clock::default();
        let runtime = testing::runtime(clock.clone());
        let mut manager = Manager::new(addr(1), addr(2), 1500, true);

        manager.migrate(addr(3), false, &runtime).unwrap();
        let data = manager
            .alternate_mut()
            .unwrap()
            .challenge
            .transmission_data()
            .unwrap();

        manager
            .alternate_mut()
            .unwrap()
            .challenge
            .on_transmit(clock.get_time(), Duration::from_millis(300));

        // a bogus response changes nothing
        assert!(!manager.on_path_response(&[0; 8]));

        assert!(manager.on_path_response(&data));
        assert_eq!(manager.active().local, addr(3));
        assert!(manager.active().is_validated());
        assert!(manager.take_migrated());
        assert!(!manager.take_migrated());
    }

    #[test]
    fn migration_refused_test() {
        let clock = time::testing::Clock::default();
        let runtime = testing::runtime(clock.clone());
        let mut manager = Manager::new(addr(1), addr(2), 1500, true);

        assert_eq!(
            manager.migrate(addr(3), true, &runtime),
            Err(connection::Error::Unsupported)
        );
    }

    #[test]
    fn failed_migration_reverts_test() {
        let clock = time::testing::Clock::default();
        let runtime = testing::runtime(clock.clone());
        let mut manager = Manager::new(addr(1), addr(2), 1500, true);

        manager.migrate(addr(3), false, &runtime).unwrap();

        // exhaust every challenge attempt
        let mut now = clock.get_time();
        let period = Duration::from_millis(100);
        for _ in 0..=wren_quic_core::path::MAX_CHALLENGE_ATTEMPTS {
            if let Some(path) = manager.alternate_mut() {
                if path.challenge.transmission_data().is_some() {
                    path.challenge.on_transmit(now, period);
                }
            }
            now = now + period;
            manager.on_timeout(now);
        }

        assert!(manager.alternate_mut().is_none());
        assert_eq!(manager.active().local, addr(1));
    }

    #[test]
    fn new_peer_address_creates_alternate_test() {
        let clock = time::testing::Clock::default();
        let runtime = testing::runtime(clock.clone());
        let mut manager = Manager::new(addr(1), addr(2), 1500, true);

        let id = manager.on_datagram_received(&addr(1), &addr(2), 100, true, &runtime);
        assert_eq!(id, ACTIVE);

        let id = manager.on_datagram_received(&addr(1), &addr(9), 100, true, &runtime);
        assert_eq!(id, ALTERNATE);
        assert!(manager
            .alternate_mut()
            .unwrap()
            .challenge
            .transmission_data()
            .is_some());
    }
}
