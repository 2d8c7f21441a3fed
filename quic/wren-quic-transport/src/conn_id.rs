// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection ID registries
//!
//! [`LocalRegistry`] tracks the IDs this endpoint issued to the peer (what
//! the peer puts in destination fields); [`PeerRegistry`] tracks the IDs
//! the peer issued to us (what we put in destination fields). Sequence
//! numbers are never reused and the active ID is always a member.

use crate::runtime::Runtime;
use wren_quic_core::{
    connection::ConnectionId,
    frame,
    packet::number::PacketNumber,
    stateless_reset,
    transmission,
    transport,
    transport_error,
    varint::VarInt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Requested,
    InFlight { packet_number: PacketNumber },
    Delivered,
}

#[derive(Debug)]
struct LocalId {
    sequence: VarInt,
    id: ConnectionId,
    reset_token: stateless_reset::Token,
    delivery: Delivery,
}

/// IDs issued to the peer
#[derive(Debug)]
pub struct LocalRegistry {
    entries: Vec<LocalId>,
    next_sequence: VarInt,
    retire_prior_to: VarInt,
    /// The number of active IDs the peer is willing to hold
    peer_limit: VarInt,
}

impl LocalRegistry {
    /// Registers the handshake-time source connection ID as sequence 0
    pub fn new(initial_id: ConnectionId, runtime: &Runtime) -> Self {
        let reset_token = runtime.reset_signer().sign(&initial_id);
        Self {
            entries: vec![LocalId {
                sequence: VarInt::ZERO,
                id: initial_id,
                reset_token,
                // the handshake ID was delivered through the long header
                delivery: Delivery::Delivered,
            }],
            next_sequence: VarInt::from_u8(1),
            retire_prior_to: VarInt::ZERO,
            peer_limit: VarInt::from_u8(2),
        }
    }

    /// Called once the peer's active_connection_id_limit is known; issues
    /// IDs up to the limit.
    //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
    //# An endpoint SHOULD ensure that its peer has a sufficient number of
    //# available and unused connection IDs.
    pub fn on_peer_limit(&mut self, limit: VarInt, runtime: &Runtime) {
        // stay a little below generous peers
        self.peer_limit = limit.min(VarInt::from_u8(7));
        self.replenish(runtime);
    }

    fn replenish(&mut self, runtime: &Runtime) {
        while (self.entries.len() as u64) < self.peer_limit.as_u64() {
            let id = {
                let mut bytes = [0u8; wren_quic_core::connection::id::LOCAL_LEN];
                runtime.public_random(&mut bytes);
                ConnectionId::try_from_slice(&bytes).expect("local id length is valid")
            };
            let reset_token = runtime.reset_signer().sign(&id);

            self.entries.push(LocalId {
                sequence: self.next_sequence,
                id,
                reset_token,
                delivery: Delivery::Requested,
            });
            self.next_sequence = self
                .next_sequence
                .checked_add(VarInt::from_u8(1))
                .expect("sequence numbers fit a varint");
        }
    }

    /// True if `id` routes to this connection
    pub fn owns(&self, id: &[u8]) -> bool {
        self.entries.iter().any(|entry| entry.id.as_bytes() == id)
    }

    /// Every ID the demux table should map to this connection
    pub fn ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.entries.iter().map(|entry| &entry.id)
    }

    /// The NEW_CONNECTION_ID frame to transmit, if one is due
    pub fn next_transmission(&self) -> Option<(VarInt, &ConnectionId, stateless_reset::Token)> {
        self.entries
            .iter()
            .find(|entry| entry.delivery == Delivery::Requested)
            .map(|entry| (entry.sequence, &entry.id, entry.reset_token))
    }

    #[inline]
    pub fn retire_prior_to(&self) -> VarInt {
        self.retire_prior_to
    }

    pub fn on_transmit(&mut self, sequence: VarInt, packet_number: PacketNumber) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.delivery = Delivery::InFlight { packet_number };
        }
    }

    pub fn on_packet_ack(&mut self, sequence: VarInt, packet_number: PacketNumber) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            if entry.delivery == (Delivery::InFlight { packet_number }) {
                entry.delivery = Delivery::Delivered;
            }
        }
    }

    pub fn on_packet_loss(&mut self, sequence: VarInt, packet_number: PacketNumber) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            if entry.delivery == (Delivery::InFlight { packet_number }) {
                entry.delivery = Delivery::Requested;
            }
        }
    }

    /// Handles RETIRE_CONNECTION_ID; returns the retired ID so the demux
    /// table can unhash it.
    pub fn on_retire_connection_id(
        &mut self,
        frame: &frame::RetireConnectionId,
        packet_dcid: &[u8],
        runtime: &Runtime,
    ) -> Result<Option<ConnectionId>, transport::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence number
        //# greater than any previously sent to the peer MUST be treated as a
        //# connection error of type PROTOCOL_VIOLATION.
        if frame.sequence_number >= self.next_sequence {
            return Err(transport_error!(
                PROTOCOL_VIOLATION,
                "retired an unissued connection id"
            ));
        }

        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.sequence == frame.sequence_number)
        else {
            // already retired
            return Ok(None);
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# The sequence number specified in a RETIRE_CONNECTION_ID frame MUST
        //# NOT refer to the Destination Connection ID field of the packet in
        //# which the frame is contained.
        if self.entries[index].id.as_bytes() == packet_dcid {
            return Err(transport_error!(
                PROTOCOL_VIOLATION,
                "retired the connection id carrying the frame"
            ));
        }

        let retired = self.entries.remove(index);
        self.replenish(runtime);
        Ok(Some(retired.id))
    }

    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        if self.next_transmission().is_some() {
            interest.merge(transmission::Interest::NewData);
        }
    }
}

#[derive(Debug)]
struct PeerId {
    sequence: VarInt,
    id: ConnectionId,
    reset_token: Option<stateless_reset::Token>,
    /// Set when a RETIRE_CONNECTION_ID must be (re)sent
    retirement: Option<Delivery>,
}

/// IDs the peer issued to us
#[derive(Debug)]
pub struct PeerRegistry {
    entries: Vec<PeerId>,
    /// The sequence of the ID used on the active path
    active_sequence: VarInt,
    /// The highest retire_prior_to processed
    retire_prior_to: VarInt,
    /// How many active IDs we are willing to hold
    local_limit: VarInt,
}

impl PeerRegistry {
    /// Registers the peer's handshake-time source connection ID
    pub fn new(initial_id: ConnectionId, local_limit: VarInt) -> Self {
        Self {
            entries: vec![PeerId {
                sequence: VarInt::ZERO,
                id: initial_id,
                reset_token: None,
                retirement: None,
            }],
            active_sequence: VarInt::ZERO,
            retire_prior_to: VarInt::ZERO,
            local_limit,
        }
    }

    /// Attaches the stateless reset token from the peer's transport
    /// parameters to the handshake ID
    pub fn on_peer_params_token(&mut self, token: stateless_reset::Token) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == VarInt::ZERO) {
            entry.reset_token = Some(token);
        }
    }

    /// The ID to put in short headers on the active path
    pub fn active(&self) -> &ConnectionId {
        self.entries
            .iter()
            .find(|entry| entry.sequence == self.active_sequence)
            .map(|entry| &entry.id)
            .expect("the active id is always a member")
    }

    /// Switches the active path to an unused ID, if one is available
    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.5
    //# An endpoint MUST NOT reuse a connection ID when sending from more
    //# than one local address
    pub fn rotate_active(&mut self) -> Option<&ConnectionId> {
        let next = self
            .entries
            .iter()
            .filter(|entry| entry.retirement.is_none() && entry.sequence > self.active_sequence)
            .map(|entry| entry.sequence)
            .min()?;

        // the previous id is retired so the old path cannot be linked
        self.retire(self.active_sequence);
        self.active_sequence = next;
        Some(self.active())
    }

    fn retire(&mut self, sequence: VarInt) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            if entry.retirement.is_none() {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
                //# An endpoint MUST NOT check for any stateless reset tokens
                //# associated with connection IDs it has not used or for
                //# connection IDs that have been retired.
                entry.reset_token = None;
                entry.retirement = Some(Delivery::Requested);
            }
        }
    }

    /// Processes NEW_CONNECTION_ID
    pub fn on_new_connection_id(
        &mut self,
        frame: &frame::NewConnectionId,
    ) -> Result<(), transport::Error> {
        let id = ConnectionId::try_from_slice(frame.connection_id)
            .map_err(|_| transport_error!(PROTOCOL_VIOLATION, "invalid connection id length"))?;
        let token = stateless_reset::Token::new(frame.stateless_reset_token);

        if let Some(existing) = self
            .entries
            .iter()
            .find(|entry| entry.sequence == frame.sequence_number)
        {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# If an endpoint receives a NEW_CONNECTION_ID frame that repeats a
            //# previously issued connection ID with a different Stateless Reset
            //# Token field value or a different Sequence Number field value, or
            //# if a sequence number is used for different connection IDs, the
            //# endpoint MAY treat that receipt as a connection error of type
            //# PROTOCOL_VIOLATION.
            if existing.id != id {
                return Err(transport_error!(
                    PROTOCOL_VIOLATION,
                    "sequence number reused for a different connection id"
                ));
            }
            return Ok(());
        }

        let retired_on_arrival = frame.sequence_number < self.retire_prior_to.max(frame.retire_prior_to);

        self.entries.push(PeerId {
            sequence: frame.sequence_number,
            id,
            reset_token: (!retired_on_arrival).then_some(token),
            retirement: None,
        });

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.2
        //# Upon receipt of an increased Retire Prior To field, the peer MUST
        //# stop using the corresponding connection IDs and retire them with
        //# RETIRE_CONNECTION_ID frames before adding the newly provided
        //# connection ID to the set of active connection IDs.
        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let sequences: Vec<VarInt> = self
                .entries
                .iter()
                .filter(|e| e.sequence < frame.retire_prior_to && e.retirement.is_none())
                .map(|e| e.sequence)
                .collect();
            for sequence in sequences {
                self.retire(sequence);
            }

            if self.active_sequence < frame.retire_prior_to {
                let next = self
                    .entries
                    .iter()
                    .filter(|e| e.retirement.is_none())
                    .map(|e| e.sequence)
                    .min()
                    .ok_or_else(|| {
                        transport_error!(PROTOCOL_VIOLATION, "no usable connection id remains")
                    })?;
                self.active_sequence = next;
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and
        //# adding and retiring active connection IDs, if the number of active
        //# connection IDs exceeds the value advertised in its
        //# active_connection_id_limit transport parameter, an endpoint MUST
        //# close the connection with an error of type CONNECTION_ID_LIMIT_ERROR.
        let active = self
            .entries
            .iter()
            .filter(|e| e.retirement.is_none())
            .count() as u64;
        if active > self.local_limit.as_u64() {
            return Err(transport_error!(
                CONNECTION_ID_LIMIT_ERROR,
                "peer exceeded active_connection_id_limit"
            ));
        }

        Ok(())
    }

    /// The RETIRE_CONNECTION_ID frame to transmit, if one is due
    pub fn next_retirement(&self) -> Option<VarInt> {
        self.entries
            .iter()
            .find(|entry| entry.retirement == Some(Delivery::Requested))
            .map(|entry| entry.sequence)
    }

    pub fn on_transmit(&mut self, sequence: VarInt, packet_number: PacketNumber) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            if entry.retirement == Some(Delivery::Requested) {
                entry.retirement = Some(Delivery::InFlight { packet_number });
            }
        }
    }

    pub fn on_packet_ack(&mut self, sequence: VarInt, packet_number: PacketNumber) {
        let Some(index) = self.entries.iter().position(|e| {
            e.sequence == sequence && e.retirement == Some(Delivery::InFlight { packet_number })
        }) else {
            return;
        };
        // the retirement round-tripped; drop the entry entirely
        self.entries.remove(index);
    }

    pub fn on_packet_loss(&mut self, sequence: VarInt, packet_number: PacketNumber) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            if entry.retirement == Some(Delivery::InFlight { packet_number }) {
                entry.retirement = Some(Delivery::Requested);
            }
        }
    }

    /// Compares a suspicious packet tail against every stored reset token
    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
    //# An endpoint detects a potential stateless reset using the trailing 16
    //# bytes of the UDP datagram.
    pub fn is_stateless_reset(&self, tail: &[u8]) -> bool {
        let Ok(tail) = <[u8; stateless_reset::TOKEN_LEN]>::try_from(tail) else {
            return false;
        };
        let candidate = stateless_reset::Token::new(tail);
        self.entries
            .iter()
            .filter_map(|entry| entry.reset_token.as_ref())
            .any(|token| *token == candidate)
    }

    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        if self.next_retirement().is_some() {
            interest.merge(transmission::Interest::NewData);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing;
    use wren_quic_core::{packet::number::PacketNumberSpace, time};

    fn runtime() -> std::sync::Arc<Runtime> {
        testing::runtime(time::testing::Clock::default())
    }

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_slice(bytes).unwrap()
    }

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    fn new_cid_frame(seq: u8, retire_prior_to: u8, id: &[u8]) -> frame::NewConnectionId<'_> {
        frame::NewConnectionId {
            sequence_number: VarInt::from_u8(seq),
            retire_prior_to: VarInt::from_u8(retire_prior_to),
            connection_id: id,
            stateless_reset_token: [seq; 16],
        }
    }

    #[test]
    fn local_registry_issues_to_limit_test() {
        let runtime = runtime();
        let mut registry = LocalRegistry::new(cid(&[1; 8]), &runtime);

        registry.on_peer_limit(VarInt::from_u8(4), &runtime);

        // three fresh ids pending on top of the handshake id
        let mut issued: u32 = 0;
        while let Some((sequence, _, _)) = registry.next_transmission() {
            registry.on_transmit(sequence, pn(issued));
            registry.on_packet_ack(sequence, pn(issued));
            issued += 1;
        }
        assert_eq!(issued, 3);
        assert_eq!(registry.ids().count(), 4);
    }

    #[test]
    fn local_registry_retirement_test() {
        let runtime = runtime();
        let mut registry = LocalRegistry::new(cid(&[1; 8]), &runtime);
        registry.on_peer_limit(VarInt::from_u8(3), &runtime);

        // retiring an unissued sequence is a protocol violation
        let frame = frame::RetireConnectionId {
            sequence_number: VarInt::from_u8(9),
        };
        assert!(registry
            .on_retire_connection_id(&frame, &[9; 8], &runtime)
            .is_err());

        // retiring the id that carried the frame is a violation
        let frame = frame::RetireConnectionId {
            sequence_number: VarInt::ZERO,
        };
        assert!(registry
            .on_retire_connection_id(&frame, cid(&[1; 8]).as_bytes(), &runtime)
            .is_err());

        // a proper retirement replaces the id
        let retired = registry
            .on_retire_connection_id(&frame, &[9; 8], &runtime)
            .unwrap();
        assert_eq!(retired, Some(cid(&[1; 8])));
        assert_eq!(registry.ids().count(), 3);
        assert!(!registry.owns(cid(&[1; 8]).as_bytes()));
    }

    #[test]
    fn peer_registry_rotation_test() {
        let mut registry = PeerRegistry::new(cid(&[1; 4]), VarInt::from_u8(7));
        assert_eq!(registry.active(), &cid(&[1; 4]));

        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[2; 4]))
            .unwrap();

        let next = registry.rotate_active().unwrap();
        assert_eq!(next, &cid(&[2; 4]));

        // the old id is now pending retirement
        assert_eq!(registry.next_retirement(), Some(VarInt::ZERO));
        registry.on_transmit(VarInt::ZERO, pn(1));
        registry.on_packet_ack(VarInt::ZERO, pn(1));
        assert_eq!(registry.next_retirement(), None);
    }

    #[test]
    fn peer_registry_retire_prior_to_test() {
        let mut registry = PeerRegistry::new(cid(&[1; 4]), VarInt::from_u8(7));

        registry
            .on_new_connection_id(&new_cid_frame(1, 1, &[2; 4]))
            .unwrap();

        // sequence 0 was retired and the active id moved forward
        assert_eq!(registry.active(), &cid(&[2; 4]));
        assert_eq!(registry.next_retirement(), Some(VarInt::ZERO));
    }

    #[test]
    fn peer_registry_limit_test() {
        let mut registry = PeerRegistry::new(cid(&[1; 4]), VarInt::from_u8(2));

        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[2; 4]))
            .unwrap();
        let error = registry
            .on_new_connection_id(&new_cid_frame(2, 0, &[3; 4]))
            .unwrap_err();
        assert_eq!(error.code, transport::Error::CONNECTION_ID_LIMIT_ERROR);
    }

    #[test]
    fn sequence_reuse_test() {
        let mut registry = PeerRegistry::new(cid(&[1; 4]), VarInt::from_u8(7));

        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[2; 4]))
            .unwrap();

        // benign duplicate
        assert!(registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[2; 4]))
            .is_ok());

        // same sequence, different id
        let error = registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[9; 4]))
            .unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION);
    }

    #[test]
    fn stateless_reset_detection_test() {
        let mut registry = PeerRegistry::new(cid(&[1; 4]), VarInt::from_u8(7));
        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[2; 4]))
            .unwrap();

        assert!(registry.is_stateless_reset(&[1; 16]));
        assert!(!registry.is_stateless_reset(&[9; 16]));
        assert!(!registry.is_stateless_reset(&[1; 15]));
    }
}
