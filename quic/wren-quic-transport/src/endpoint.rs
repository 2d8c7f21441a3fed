// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The endpoint: connection demux, server accept path, version
//! negotiation and stateless resets for connections it no longer knows

use crate::{
    connection::{self, Connection, Datagram, Handle},
    runtime::Runtime,
    tls,
};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use wren_quic_core::{
    connection::ConnectionId, endpoint, inet::SocketAddress, packet, transport,
};

/// Creates a TLS session per connection
pub trait SessionFactory: Send {
    fn new_session(
        &mut self,
        endpoint: endpoint::Type,
        local_params: Vec<u8>,
    ) -> Box<dyn tls::Session>;
}

pub struct Endpoint {
    endpoint_type: endpoint::Type,
    local_addr: SocketAddress,
    cfg: connection::Config,
    runtime: Arc<Runtime>,
    sessions: Box<dyn SessionFactory>,

    connections: Vec<Handle>,
    /// Connection-id bytes to connection index; lookups happen before any
    /// decryption
    demux: HashMap<Vec<u8>, usize>,
    accept_queue: VecDeque<Handle>,
    /// Datagrams owed by the endpoint itself (version negotiation,
    /// stateless resets)
    responses: VecDeque<Datagram>,
}

impl Endpoint {
    pub fn new(
        endpoint_type: endpoint::Type,
        local_addr: SocketAddress,
        cfg: connection::Config,
        sessions: Box<dyn SessionFactory>,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            endpoint_type,
            local_addr,
            cfg,
            runtime,
            sessions,
            connections: Vec::new(),
            demux: HashMap::new(),
            accept_queue: VecDeque::new(),
            responses: VecDeque::new(),
        }
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddress {
        self.local_addr
    }

    fn encoded_local_params(&self) -> Vec<u8> {
        use s2n_codec::EncoderValue;
        self.cfg.local_params.encode_to_vec()
    }

    /// Dials a peer, returning the connection handle; the first flight
    /// leaves on the next [`Endpoint::poll_transmit`]
    pub fn connect(&mut self, peer: SocketAddress) -> Result<Handle, transport::Error> {
        debug_assert!(self.endpoint_type.is_client());

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
        //# When an Initial packet is sent by a client that has not previously
        //# received an Initial or Retry packet from the server, the client
        //# populates the Destination Connection ID field with an unpredictable
        //# value.
        let mut dcid_bytes = [0u8; 8];
        self.runtime.public_random(&mut dcid_bytes);
        let peer_cid = ConnectionId::try_from_slice(&dcid_bytes).expect("length is valid");

        let tls = self
            .sessions
            .new_session(endpoint::Type::Client, self.encoded_local_params());

        let connection = Connection::connect(
            self.cfg.clone(),
            self.local_addr,
            peer,
            peer_cid,
            tls,
            self.runtime.clone(),
        )?;

        let handle = Handle::new(connection);
        let index = self.connections.len();
        self.connections.push(handle.clone());
        self.sync_demux(index);
        Ok(handle)
    }

    /// Pops the next accepted server connection
    pub fn accept(&mut self) -> Option<Handle> {
        self.accept_queue.pop_front()
    }

    /// Routes one received datagram
    pub fn handle_datagram(&mut self, datagram: Datagram) {
        let Some(dcid) = Self::peek_dcid(&datagram.payload) else {
            return;
        };

        if let Some(index) = self.demux.get(&dcid).copied() {
            let handle = self.connections[index].clone();
            handle.handle_datagram(datagram);
            self.sync_demux(index);
            return;
        }

        if self.endpoint_type.is_server() {
            self.on_unknown_datagram(datagram, dcid);
        }
    }

    fn on_unknown_datagram(&mut self, datagram: Datagram, dcid: Vec<u8>) {
        let payload = &datagram.payload;

        // only long headers can start a connection
        if payload.first().map_or(false, |first| first & 0x80 == 0x80) {
            let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);

            if !packet::is_supported_version(version) && payload.len() >= packet::MIN_INITIAL_DATAGRAM_LEN {
                self.queue_version_negotiation(&datagram, &dcid);
                return;
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
            //# A server MUST discard an Initial packet that is carried in a UDP
            //# datagram with a payload that is smaller than the smallest allowed
            //# maximum datagram size of 1200 bytes.
            if payload.len() < packet::MIN_INITIAL_DATAGRAM_LEN {
                return;
            }

            self.accept_new_connection(datagram, dcid);
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
        //# An endpoint that receives packets that it cannot process sends a
        //# packet in the following layout
        self.queue_stateless_reset(&datagram, &dcid);
    }

    fn accept_new_connection(&mut self, datagram: Datagram, original_dcid: Vec<u8>) {
        let Ok(client_cid) = Self::peek_long_scid(&datagram.payload) else {
            return;
        };

        let tls = self
            .sessions
            .new_session(endpoint::Type::Server, self.encoded_local_params());

        // the connection speaks whichever supported version the client
        // offered
        let payload = &datagram.payload;
        let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let mut cfg = self.cfg.clone();
        cfg.version = version;

        let Ok(connection) = Connection::accept(
            cfg,
            datagram.local,
            datagram.peer,
            client_cid,
            tls,
            self.runtime.clone(),
        ) else {
            return;
        };

        let handle = Handle::new(connection);
        let index = self.connections.len();
        self.connections.push(handle.clone());

        // the client keeps addressing us by its original destination id
        // until it learns our chosen one
        self.demux.insert(original_dcid, index);
        self.sync_demux(index);

        handle.handle_datagram(datagram);
        self.sync_demux(index);
        self.accept_queue.push_back(handle);
    }

    fn queue_version_negotiation(&mut self, datagram: &Datagram, dcid: &[u8]) {
        let Ok(scid) = Self::peek_long_scid(&datagram.payload) else {
            return;
        };

        let mut random = [0u8; 1];
        self.runtime.public_random(&mut random);

        let mut buffer = vec![0u8; 128];
        let len = {
            use s2n_codec::{Encoder as _, EncoderBuffer};
            let mut encoder = EncoderBuffer::new(&mut buffer);
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
            //# The server MUST include the value from the Source Connection ID
            //# field of the packet it receives in the Destination Connection ID
            //# field.
            packet::version_negotiation::encode(
                &mut encoder,
                scid.as_bytes(),
                dcid,
                packet::SUPPORTED_VERSIONS,
                random[0] & 0x3f,
            );
            encoder.len()
        };
        buffer.truncate(len);

        self.responses.push_back(Datagram {
            local: datagram.local,
            peer: datagram.peer,
            ecn: Default::default(),
            payload: buffer,
        });
    }

    fn queue_stateless_reset(&mut self, datagram: &Datagram, dcid: &[u8]) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
        //# An endpoint MUST NOT send a Stateless Reset in response to a
        //# packet that is smaller than 39 bytes
        if datagram.payload.len() < 39 {
            return;
        }
        let Ok(id) = ConnectionId::try_from_slice(dcid) else {
            return;
        };
        let token = self.runtime.reset_signer().sign(&id);

        let reset_len = datagram.payload.len().saturating_sub(17).clamp(22, 1200);
        let mut payload = vec![0u8; reset_len];
        self.runtime.public_random(&mut payload);
        payload[0] = 0x40 | (payload[0] & 0x3f);
        let tail = payload.len() - wren_quic_core::stateless_reset::TOKEN_LEN;
        payload[tail..].copy_from_slice(token.as_bytes());

        self.responses.push_back(Datagram {
            local: datagram.local,
            peer: datagram.peer,
            ecn: Default::default(),
            payload,
        });
    }

    /// Produces the next outbound datagram across the endpoint
    pub fn poll_transmit(&mut self) -> Option<Datagram> {
        if let Some(response) = self.responses.pop_front() {
            return Some(response);
        }

        for index in 0..self.connections.len() {
            let handle = self.connections[index].clone();
            if let Some(datagram) = handle.transmit() {
                self.sync_demux(index);
                return Some(datagram);
            }
            self.sync_demux(index);
        }
        None
    }

    /// Fires timer processing on every connection; the I/O loop calls this
    /// when the earliest [`Handle::next_timer`] elapses
    pub fn handle_timeouts(&mut self) {
        for index in 0..self.connections.len() {
            let handle = self.connections[index].clone();
            handle.handle_timeout();
            self.sync_demux(index);
        }
    }

    /// Applies pending connection-id table changes for a connection
    fn sync_demux(&mut self, index: usize) {
        let (added, removed) = self.connections[index].with(Connection::take_demux_changes);
        for id in removed {
            self.demux.remove(id.as_bytes());
        }
        for id in added {
            self.demux.insert(id.as_bytes().to_vec(), index);
        }
    }

    /// Extracts the destination connection id without decrypting
    fn peek_dcid(payload: &[u8]) -> Option<Vec<u8>> {
        let first = *payload.first()?;
        if first & 0x80 == 0x80 {
            let len = *payload.get(5)? as usize;
            Some(payload.get(6..6 + len)?.to_vec())
        } else {
            Some(
                payload
                    .get(1..1 + wren_quic_core::connection::id::LOCAL_LEN)?
                    .to_vec(),
            )
        }
    }

    fn peek_long_scid(payload: &[u8]) -> Result<ConnectionId, ()> {
        let dcid_len = *payload.get(5).ok_or(())? as usize;
        let scid_len_at = 6 + dcid_len;
        let scid_len = *payload.get(scid_len_at).ok_or(())? as usize;
        let scid = payload
            .get(scid_len_at + 1..scid_len_at + 1 + scid_len)
            .ok_or(())?;
        ConnectionId::try_from_slice(scid).map_err(|_| ())
    }
}
