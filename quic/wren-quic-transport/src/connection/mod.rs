// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection state engine
//!
//! A connection is a single-threaded actor: the endpoint, timers and the
//! application all funnel through the lock in [`handle`]. This module owns
//! the inbound pipeline and lifecycle; packet assembly lives in
//! [`transmit`].

pub mod handle;
pub mod transmit;

pub use handle::Handle;

use crate::{
    conn_id::{LocalRegistry, PeerRegistry},
    path,
    runtime::Runtime,
    space::{AckOutcome, DropReason, Plan, Space},
    stream,
    sync::{Flag, IncomingFlowController, OutgoingFlowController},
    tls,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use wren_quic_core::{
    ack,
    connection::{self, ConnectionId},
    crypto::{KeyGate, Level},
    endpoint,
    event::{self, Event, StreamUpdateKind},
    frame::{self, Frame},
    inet::{ExplicitCongestionNotification, SocketAddress},
    packet::{self, number::PacketNumberSpace, Packet},
    recovery::{CongestionController as _, NewReno, Pacer, RttEstimator},
    stream::StreamId,
    time::{timer, Timer, Timestamp},
    token::{AddressToken, SessionTicket},
    transport::{self, parameters::TransportParameters},
    transport_error,
    varint::VarInt,
};

/// Parked packets waiting for keys, per space
const EARLY_PACKET_LIMIT: usize = 8;

/// Consecutive undecodable packets tolerated before the connection closes
const DECODE_VIOLATION_LIMIT: u64 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Establishing,
    Established,
    /// A CONNECTION_CLOSE was sent; the close frame is re-armed at most
    /// once per PTO while packets keep arriving
    Closing,
    /// The peer sent CONNECTION_CLOSE; nothing is sent back
    Draining,
    Closed,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub endpoint_type: endpoint::Type,
    pub local_params: TransportParameters,
    pub ack_settings: ack::Settings,
    pub event_mask: event::Mask,
    pub version: u32,
}

/// A datagram handed to or produced by the connection
#[derive(Clone, Debug)]
pub struct Datagram {
    pub local: SocketAddress,
    pub peer: SocketAddress,
    pub ecn: ExplicitCongestionNotification,
    pub payload: Vec<u8>,
}

pub struct Connection {
    pub(crate) cfg: Config,
    pub(crate) state: State,
    pub(crate) runtime: Arc<Runtime>,

    tls: Option<Box<dyn tls::Session>>,
    pub(crate) keys: KeyGate,
    pub(crate) spaces: [Option<Space>; PacketNumberSpace::COUNT],
    /// Packets for levels whose receive keys are not installed yet
    early_packets: [Vec<Datagram>; PacketNumberSpace::COUNT],

    pub(crate) streams: stream::Manager,
    pub(crate) peer_params: Option<TransportParameters>,

    pub(crate) local_cids: LocalRegistry,
    pub(crate) peer_cids: PeerRegistry,
    /// Local IDs issued/retired since the endpoint last synced its demux
    pub(crate) demux_added: Vec<ConnectionId>,
    pub(crate) demux_removed: Vec<ConnectionId>,

    pub(crate) paths: path::Manager,
    pub(crate) cc: NewReno,
    pub(crate) rtt: RttEstimator,
    pub(crate) pacer: Pacer,
    pub(crate) pto_backoff: u32,

    pub(crate) out_flow: OutgoingFlowController,
    pub(crate) in_flow: IncomingFlowController,

    /// Server only: signals handshake confirmation to the client
    pub(crate) handshake_done_sync: Flag,
    handshake_complete: bool,
    pub(crate) handshake_confirmed: bool,

    pub(crate) datagram_tx: VecDeque<Bytes>,
    datagram_rx: VecDeque<Bytes>,

    events: VecDeque<Event>,
    /// The sticky error reported to every waiter once closed
    pub(crate) error: Option<connection::Error>,
    /// The close frame to (re)send while Closing
    pub(crate) close_error: Option<transport::Error>,
    pub(crate) close_needed: bool,
    close_rearm_timer: Timer,
    drain_timer: Timer,
    idle_timer: Timer,
    idle_timeout: Option<core::time::Duration>,

    pub(crate) alpn: Option<Vec<u8>>,
    pub(crate) session_ticket: Option<SessionTicket>,
    /// Token to echo in future Initials (client) or to issue (server)
    pub(crate) address_token: Option<AddressToken>,
    pub(crate) new_token_to_send: Option<AddressToken>,
    new_token_sync: Flag,

    /// Counts silently dropped packets; excessive garbage escalates
    drop_count: u64,
    decode_violations: u64,

    pub(crate) recv_waker: Option<core::task::Waker>,
    pub(crate) send_waker: Option<core::task::Waker>,

    /// The stream implicit sends target when no id is given
    pub(crate) active_stream: Option<StreamId>,

    /// Clients adopt the server's source id from its first Initial packet
    peer_cid_adopted: bool,
}

impl Connection {
    /// Creates a client connection and produces its first flight on the
    /// next transmit call.
    pub fn connect(
        cfg: Config,
        local: SocketAddress,
        peer: SocketAddress,
        peer_initial_cid: ConnectionId,
        tls: Box<dyn tls::Session>,
        runtime: Arc<Runtime>,
    ) -> Result<Self, transport::Error> {
        let mut conn = Self::new(cfg, local, peer, peer_initial_cid, tls, runtime, true)?;
        conn.start_tls()?;
        Ok(conn)
    }

    /// Creates a server connection accepting a validated Initial
    pub fn accept(
        cfg: Config,
        local: SocketAddress,
        peer: SocketAddress,
        client_cid: ConnectionId,
        tls: Box<dyn tls::Session>,
        runtime: Arc<Runtime>,
    ) -> Result<Self, transport::Error> {
        let mut conn = Self::new(cfg, local, peer, client_cid, tls, runtime, false)?;
        conn.start_tls()?;
        Ok(conn)
    }

    fn new(
        cfg: Config,
        local: SocketAddress,
        peer: SocketAddress,
        peer_initial_cid: ConnectionId,
        tls: Box<dyn tls::Session>,
        runtime: Arc<Runtime>,
        is_client: bool,
    ) -> Result<Self, transport::Error> {
        let mut initial_cid_bytes = [0u8; wren_quic_core::connection::id::LOCAL_LEN];
        runtime.public_random(&mut initial_cid_bytes);
        let local_cid = ConnectionId::try_from_slice(&initial_cid_bytes)
            .expect("local id length is valid");

        let local_limits = stream::Limits::from_params(&cfg.local_params);
        // until the peer's parameters arrive nothing may be sent beyond the
        // handshake, so the peer limits start at zero
        let zero = stream::Limits {
            max_stream_data_bidi_local: VarInt::ZERO,
            max_stream_data_bidi_remote: VarInt::ZERO,
            max_stream_data_uni: VarInt::ZERO,
            max_streams_bidi: VarInt::ZERO,
            max_streams_uni: VarInt::ZERO,
        };

        let ack_settings = cfg.ack_settings;
        let local_cids = LocalRegistry::new(local_cid, &runtime);
        let demux_added = local_cids.ids().cloned().collect();

        let max_udp = cfg.local_params.max_udp_payload_size.as_u64().min(65527) as u16;

        let mut conn = Self {
            streams: stream::Manager::new(cfg.endpoint_type, local_limits, zero),
            state: State::Establishing,
            runtime: runtime.clone(),
            tls: Some(tls),
            keys: KeyGate::default(),
            spaces: [
                Some(Space::new(PacketNumberSpace::Initial, ack::Settings::EARLY)),
                Some(Space::new(PacketNumberSpace::Handshake, ack::Settings::EARLY)),
                Some(Space::new(PacketNumberSpace::ApplicationData, ack_settings)),
            ],
            early_packets: Default::default(),
            peer_params: None,
            local_cids,
            peer_cids: PeerRegistry::new(
                peer_initial_cid,
                cfg.local_params.active_connection_id_limit,
            ),
            demux_added,
            demux_removed: Vec::new(),
            // the client validated the server's address by dialing it; a
            // server is amplification-limited until the handshake proceeds
            paths: path::Manager::new(local, peer, max_udp, is_client),
            cc: NewReno::new(1200),
            rtt: RttEstimator::new(transport::parameters::DEFAULT_INITIAL_RTT),
            pacer: Pacer::default(),
            pto_backoff: 1,
            out_flow: OutgoingFlowController::new(VarInt::ZERO),
            in_flow: IncomingFlowController::new(cfg.local_params.initial_max_data),
            handshake_done_sync: Flag::default(),
            handshake_complete: false,
            handshake_confirmed: false,
            datagram_tx: VecDeque::new(),
            datagram_rx: VecDeque::new(),
            events: VecDeque::new(),
            error: None,
            close_error: None,
            close_needed: false,
            close_rearm_timer: Timer::default(),
            drain_timer: Timer::default(),
            idle_timer: Timer::default(),
            idle_timeout: Some(cfg.local_params.max_idle_timeout),
            alpn: None,
            session_ticket: None,
            address_token: None,
            new_token_to_send: None,
            new_token_sync: Flag::default(),
            drop_count: 0,
            decode_violations: 0,
            recv_waker: None,
            send_waker: None,
            active_stream: None,
            peer_cid_adopted: !is_client,
            cfg,
        };

        conn.restart_idle_timer(runtime.now());
        Ok(conn)
    }

    fn start_tls(&mut self) -> Result<(), transport::Error> {
        let mut tls = self.tls.take().expect("tls session present");
        let result = tls.start(&mut TlsContext { conn: self });
        self.tls = Some(tls);
        result?;
        self.after_tls_progress();
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Establishing | State::Established)
    }

    #[inline]
    pub(crate) fn space_index(level: Level) -> usize {
        match level {
            Level::Initial => 0,
            Level::Handshake => 1,
            Level::ZeroRtt | Level::OneRtt => 2,
        }
    }

    #[inline]
    pub(crate) fn space_mut(&mut self, level: Level) -> Option<&mut Space> {
        self.spaces[Self::space_index(level)].as_mut()
    }

    /// The events and stream data queue, drained by the API layer
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn pop_datagram(&mut self) -> Option<Bytes> {
        let datagram = self.datagram_rx.pop_front()?;
        self.runtime.memory().release(datagram.len());
        Some(datagram)
    }

    pub(crate) fn emit_event(&mut self, event: Event) {
        if self.cfg.event_mask.contains(event.mask_bit()) {
            self.events.push_back(event);
            self.wake_recv();
        }
    }

    pub(crate) fn wake_recv(&mut self) {
        if let Some(waker) = self.recv_waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn wake_send(&mut self) {
        if let Some(waker) = self.send_waker.take() {
            waker.wake();
        }
    }

    fn restart_idle_timer(&mut self, now: Timestamp) {
        if let Some(timeout) = self.idle_timeout {
            if !timeout.is_zero() {
                self.idle_timer.set(now + timeout);
            }
        }
    }

    // === inbound pipeline ===

    /// Feeds one received datagram through the parser and dispatcher
    pub fn on_datagram(&mut self, mut datagram: Datagram) {
        let now = self.runtime.now();

        match self.state {
            State::Closed => return,
            State::Draining => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.2
                //# An endpoint that receives a CONNECTION_CLOSE frame MAY send
                //# a single packet containing a CONNECTION_CLOSE frame before
                //# entering the draining state
                self.drop_count += 1;
                return;
            }
            State::Closing => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.1
                //# An endpoint SHOULD limit the rate at which it generates
                //# packets in the closing state.
                if !self.close_rearm_timer.is_armed() || self.close_rearm_timer.is_expired(now) {
                    self.close_needed = true;
                    let period = self.rtt.pto_period(self.pto_backoff, PacketNumberSpace::ApplicationData);
                    self.close_rearm_timer.set(now + period);
                }
                return;
            }
            State::Establishing | State::Established => {}
        }

        let path_id = self.paths.on_datagram_received(
            &datagram.local,
            &datagram.peer,
            datagram.payload.len(),
            self.handshake_confirmed,
            &self.runtime.clone(),
        );

        let mut remaining = datagram.payload.as_mut_slice();
        let mut progressed = false;

        while !remaining.is_empty() {
            let parsed = Packet::decode(remaining, wren_quic_core::connection::id::LOCAL_LEN);
            let (packet, rest) = match parsed {
                Ok(split) => split,
                Err(_) => {
                    self.drop_count += 1;
                    self.on_decode_violation();
                    break;
                }
            };

            match packet {
                Packet::VersionNegotiation(vn) => {
                    let versions = vn.supported_versions.clone();
                    self.on_version_negotiation(&versions);
                    break;
                }
                Packet::Unsupported(_) => {
                    // the endpoint answers with a Version Negotiation packet
                    self.drop_count += 1;
                    break;
                }
                Packet::Retry(retry) => {
                    self.on_retry_packet(
                        retry.source_connection_id,
                        retry.token,
                    );
                    break;
                }
                Packet::Encrypted(encrypted) => {
                    let level = encrypted.level();
                    if !self.keys.recv_ready(level) {
                        // park the tail of the datagram for this level; it
                        // replays once the keys install
                        let parked = &self.early_packets[Self::space_index(level)];
                        if parked.len() < EARLY_PACKET_LIMIT {
                            let mut copy = Vec::new();
                            copy.extend_from_slice(encrypted.as_slice());
                            self.early_packets[Self::space_index(level)].push(Datagram {
                                local: datagram.local,
                                peer: datagram.peer,
                                ecn: datagram.ecn,
                                payload: copy,
                            });
                        } else {
                            self.drop_count += 1;
                        }
                    } else if self.process_packet(encrypted, datagram.ecn, path_id, now) {
                        progressed = true;
                    }
                }
            }

            remaining = rest;
        }

        if progressed {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
            //# An endpoint restarts its idle timer when a packet from its peer is
            //# received and processed successfully.
            self.restart_idle_timer(now);
        }
    }

    fn on_decode_violation(&mut self) {
        self.decode_violations += 1;
        if self.decode_violations >= DECODE_VIOLATION_LIMIT {
            self.close_with(transport_error!(
                PROTOCOL_VIOLATION,
                "repeated undecodable packets"
            ));
        }
    }

    /// Decrypts and dispatches a single coalesced packet; true on success
    fn process_packet(
        &mut self,
        encrypted: packet::Encrypted,
        ecn: ExplicitCongestionNotification,
        path_id: path::Id,
        now: Timestamp,
    ) -> bool {
        let level = encrypted.level();
        let space_index = Self::space_index(level);

        let Some(space) = self.spaces[space_index].as_ref() else {
            // keys and space were discarded; stale flight
            self.drop_count += 1;
            return false;
        };
        let largest = space.ack_manager.largest_received();

        let reset_tail: Option<Vec<u8>> = encrypted.stateless_reset_tail().map(|t| t.to_vec());
        let packet_dcid: Vec<u8> = encrypted.destination_connection_id().to_vec();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
        //# Upon first receiving an Initial or Retry packet from the server, the
        //# client uses the Source Connection ID supplied by the server as the
        //# Destination Connection ID for subsequent packets
        if !self.peer_cid_adopted && level == Level::Initial {
            if let Some(scid) = encrypted.source_connection_id() {
                if let Ok(id) = ConnectionId::try_from_slice(scid) {
                    self.peer_cids =
                        PeerRegistry::new(id, self.cfg.local_params.active_connection_id_limit);
                    self.peer_cid_adopted = true;
                }
            }
        }

        let keys = self
            .keys
            .recv_keys(level)
            .expect("caller checked recv_ready");

        let cleartext = match encrypted.unseal(&*keys.header_key, &*keys.key, largest) {
            Ok(cleartext) => cleartext,
            Err(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
                //# An endpoint MAY skip this check if any packet from a datagram is
                //# successfully processed.
                if let Some(tail) = reset_tail {
                    if self.peer_cids.is_stateless_reset(&tail) {
                        self.enter_draining(transport_error!(
                            NO_ERROR,
                            "peer sent a stateless reset"
                        ));
                        return false;
                    }
                }
                self.drop_count += 1;
                self.on_decode_violation();
                return false;
            }
        };

        self.decode_violations = 0;
        let packet_number = cleartext.packet_number;
        let key_phase = cleartext.key_phase;

        {
            let space = self.spaces[space_index].as_ref().expect("checked above");
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.3
            //# A receiver that tracks received packets discards duplicates.
            if space.ack_manager.is_duplicate(packet_number) {
                self.drop_count += 1;
                return false;
            }
        }

        // dispatch every frame; an error closes the connection
        let mut ack_eliciting = false;
        let payload: &mut [u8] = cleartext.payload;
        let mut dispatch_error: Option<transport::Error> = None;

        let result = Frame::decode_all(payload, |frame| {
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(error) = self.on_frame(frame, level, &packet_dcid, path_id, now) {
                dispatch_error = Some(error);
                return Err(s2n_codec::DecoderError::InvariantViolation("fatal frame"));
            }
            Ok(())
        });

        if let Some(error) = dispatch_error {
            self.close_with(error);
            return false;
        }
        if result.is_err() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat the receipt of a frame of unknown type as a
            //# connection error of type FRAME_ENCODING_ERROR.
            self.close_with(transport_error!(FRAME_ENCODING_ERROR, "malformed frame"));
            return false;
        }

        if !self.is_open() {
            return true;
        }

        if let Some(space) = self.spaces[space_index].as_mut() {
            match space.ack_manager.on_packet_received(packet_number, ack_eliciting, ecn, now) {
                Ok(()) => {}
                Err(DropReason::Duplicate | DropReason::TooOld) => {
                    // frames were already applied; duplicate application is
                    // idempotent by construction
                    self.drop_count += 1;
                }
            }
        }

        // a 1-RTT packet in the next key phase commits the update
        if let (Some(phase), true) = (key_phase, self.handshake_confirmed) {
            if phase != self.keys.key_phase() && self.keys.can_update_keys() {
                if let Some(new_phase) = self.keys.update_keys() {
                    self.emit_event(Event::KeyUpdate { phase: new_phase });
                }
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a server MUST discard Initial keys when it first successfully
        //# processes a Handshake packet.
        if level == Level::Handshake && self.cfg.endpoint_type.is_server() {
            self.paths.active_mut().on_validated();
            self.discard_space(Level::Initial);
        }

        true
    }

    /// Routes one frame to its owner
    fn on_frame(
        &mut self,
        frame: Frame,
        level: Level,
        packet_dcid: &[u8],
        path_id: path::Id,
        now: Timestamp,
    ) -> Result<(), transport::Error> {
        // handshake and initial packets carry a restricted frame set
        let app_only = matches!(
            frame,
            Frame::Stream(_)
                | Frame::MaxData(_)
                | Frame::MaxStreamData(_)
                | Frame::MaxStreams(_)
                | Frame::DataBlocked(_)
                | Frame::StreamDataBlocked(_)
                | Frame::StreamsBlocked(_)
                | Frame::NewConnectionId(_)
                | Frame::RetireConnectionId(_)
                | Frame::NewToken(_)
                | Frame::PathChallenge(_)
                | Frame::PathResponse(_)
                | Frame::HandshakeDone(_)
                | Frame::ResetStream(_)
                | Frame::StopSending(_)
                | Frame::Datagram(_)
        );
        if app_only && level != Level::OneRtt && level != Level::ZeroRtt {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.5
            //# An endpoint MUST treat receipt of a frame in a packet type that is
            //# not permitted as a connection error of type PROTOCOL_VIOLATION.
            return Err(transport_error!(
                PROTOCOL_VIOLATION,
                "frame not allowed at this encryption level"
            ));
        }

        match frame {
            Frame::Padding(_) | Frame::Ping(_) => {}

            Frame::Ack(ack) => self.on_ack_frame(level, &ack, now)?,

            Frame::Crypto(crypto) => {
                let space = self
                    .space_mut(level)
                    .ok_or_else(|| transport_error!(INTERNAL_ERROR, "space discarded"))?;
                space.crypto_rx.on_crypto_frame(&crypto)?;
                self.pump_crypto(level)?;
            }

            Frame::Stream(stream) => {
                let outcome = self.streams.on_stream_frame(&stream, &mut self.in_flow)?;
                self.apply_stream_outcome(outcome);
            }

            Frame::ResetStream(reset) => {
                let outcome = self
                    .streams
                    .on_reset_stream_frame(&reset, &mut self.in_flow)?;
                self.apply_stream_outcome(outcome);
            }

            Frame::StopSending(stop) => {
                self.streams.on_stop_sending_frame(&stop)?;
                self.emit_event(Event::StreamUpdate {
                    id: StreamId::from_varint(stop.stream_id),
                    kind: StreamUpdateKind::StopSendingReceived {
                        error_code: stop.application_error_code,
                    },
                });
            }

            Frame::MaxData(frame) => {
                self.out_flow.on_max_data(frame.maximum_data);
                self.wake_send();
            }

            Frame::MaxStreamData(frame) => {
                self.streams.on_max_stream_data_frame(&frame)?;
                self.wake_send();
            }

            Frame::MaxStreams(frame) => {
                if let Some(event) = self.streams.on_max_streams_frame(&frame) {
                    self.emit_event(event);
                }
                self.wake_send();
            }

            Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) => {
                // informational; our MAX_DATA machinery already replenishes
                // on consumption
            }

            Frame::StreamsBlocked(frame) => {
                self.streams.on_streams_blocked_frame(&frame);
            }

            Frame::NewToken(frame) => {
                if self.cfg.endpoint_type.is_server() {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                    //# A server MUST treat receipt of a NEW_TOKEN frame as a
                    //# connection error of type PROTOCOL_VIOLATION.
                    return Err(transport_error!(
                        PROTOCOL_VIOLATION,
                        "client sent NEW_TOKEN"
                    ));
                }
                if let Ok(token) = AddressToken::try_from_slice(frame.token) {
                    self.address_token = Some(token.clone());
                    self.emit_event(Event::NewToken { token });
                }
            }

            Frame::NewConnectionId(frame) => {
                self.peer_cids.on_new_connection_id(&frame)?;
            }

            Frame::RetireConnectionId(frame) => {
                let retired = self.local_cids.on_retire_connection_id(
                    &frame,
                    packet_dcid,
                    &self.runtime.clone(),
                )?;
                if let Some(id) = retired {
                    self.demux_removed.push(id);
                }
                self.demux_added
                    .extend(self.local_cids.ids().cloned().filter(|id| {
                        !self.demux_removed.contains(id)
                    }));
            }

            Frame::PathChallenge(challenge) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.2
                //# On receiving a PATH_CHALLENGE frame, an endpoint MUST respond by
                //# echoing the data contained in the PATH_CHALLENGE frame in a
                //# PATH_RESPONSE frame.
                self.paths.on_path_challenge(challenge.data, path_id);
            }

            Frame::PathResponse(response) => {
                if self.paths.on_path_response(&response.data) {
                    self.on_migration_complete();
                }
            }

            Frame::ConnectionClose(close) => {
                let error = transport::Error {
                    code: close.error_code,
                    frame_type: close.frame_type,
                    reason: "",
                };
                self.emit_event(Event::ConnectionClose {
                    error_code: close.error_code,
                    frame_type: close.frame_type,
                    reason: close.reason.to_vec(),
                });
                self.enter_draining(error);
            }

            Frame::HandshakeDone(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST treat receipt of a HANDSHAKE_DONE frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.cfg.endpoint_type.is_server() {
                    return Err(transport_error!(
                        PROTOCOL_VIOLATION,
                        "client sent HANDSHAKE_DONE"
                    ));
                }
                self.on_handshake_confirmed();
            }

            Frame::Datagram(datagram) => {
                if self.runtime.memory().reserve(datagram.data.len()) {
                    self.datagram_rx.push_back(Bytes::copy_from_slice(datagram.data));
                    self.wake_recv();
                } else {
                    // memory pressure drops are silent
                    self.drop_count += 1;
                }
            }
        }

        Ok(())
    }

    fn apply_stream_outcome(&mut self, outcome: stream::recv::Outcome) {
        for event in outcome.events {
            self.emit_event(event);
        }
        if outcome.readable {
            self.wake_recv();
        }
    }

    /// Applies an ACK frame: ledger, RTT, congestion, loss detection
    fn on_ack_frame<A: frame::ack::AckRanges>(
        &mut self,
        level: Level,
        ack: &frame::Ack<A>,
        now: Timestamp,
    ) -> Result<(), transport::Error> {
        let space_index = Self::space_index(level);
        let Some(space) = self.spaces[space_index].as_mut() else {
            return Ok(());
        };
        let pn_space = space.pn_space();

        let AckOutcome {
            newly_acked,
            includes_ack_eliciting,
            largest_newly_acked_time_sent,
        } = space.on_ack_frame(ack)?;

        if newly_acked.is_empty() {
            return Ok(());
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
        //# An endpoint generates an RTT sample on receiving an ACK frame that
        //# meets the following two conditions
        if let Some(time_sent) = largest_newly_acked_time_sent {
            // the ACK Delay field scales by the exponent the peer advertised
            let peer_settings = ack::Settings {
                ack_delay_exponent: self
                    .peer_params
                    .as_ref()
                    .map_or(3, |params| params.ack_delay_exponent),
                ..ack::Settings::RECOMMENDED
            };
            let ack_delay = peer_settings.decode_ack_delay(ack.ack_delay);
            self.rtt.update_rtt(
                ack_delay,
                now.saturating_duration_since(time_sent),
                now,
                self.handshake_confirmed,
                pn_space,
            );
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# The PTO backoff factor is reset when an acknowledgment is received
        self.pto_backoff = 1;

        let mut acked_in_flight_bytes = 0usize;
        let mut newest_time_sent = None;

        for (pn, info) in &newly_acked {
            if info.in_flight {
                acked_in_flight_bytes += info.sent_bytes as usize;
            }
            newest_time_sent = Some(match newest_time_sent {
                Some(existing) => info.time_sent.max(existing),
                None => info.time_sent,
            });

            if let Some(path) = self.paths.get_mut(path::ACTIVE) {
                path.mtu.on_packet_ack(*pn);
            }

            for plan in &info.data {
                self.on_plan_ack(level, *pn, plan);
            }
        }

        if includes_ack_eliciting {
            if let Some(time_sent) = newest_time_sent {
                self.cc.on_ack(time_sent, acked_in_flight_bytes, &self.rtt, now);
            }
        } else if acked_in_flight_bytes > 0 {
            self.cc.on_packet_discarded(acked_in_flight_bytes);
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#appendix-A.7
        //# // If the ECN-CE counter reported by the peer has increased,
        //# // this could be a new congestion event.
        if let (Some(counts), Some(time_sent)) = (&ack.ecn_counts, newest_time_sent) {
            let ce_increased = self.spaces[space_index]
                .as_mut()
                .map_or(false, |space| space.on_ecn_counts(counts));
            if ce_increased {
                self.cc.on_congestion_event(time_sent, now);
            }
        }

        self.detect_and_handle_loss(level, now);
        self.rearm_pto(level, now);
        self.wake_send();
        Ok(())
    }

    pub(crate) fn detect_and_handle_loss(&mut self, level: Level, now: Timestamp) {
        let space_index = Self::space_index(level);
        let Some(space) = self.spaces[space_index].as_mut() else {
            return;
        };

        let lost = space.detect_lost(now, &self.rtt);
        if lost.is_empty() {
            return;
        }
        tracing::trace!(count = lost.len(), ?level, "declared packets lost");

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6
        //# When persistent congestion is declared, the sender's congestion
        //# window MUST be reduced to the minimum congestion window
        let first_sent = lost.iter().map(|(_, i)| i.time_sent).min();
        let last_sent = lost.iter().map(|(_, i)| i.time_sent).max();
        let persistent = match (first_sent, last_sent) {
            (Some(first), Some(last)) => {
                last.saturating_duration_since(first) > self.rtt.persistent_congestion_threshold()
            }
            _ => false,
        };

        for (index, (pn, info)) in lost.iter().enumerate() {
            let is_last = index == lost.len() - 1;
            if info.in_flight {
                self.cc.on_packet_lost(
                    info.sent_bytes as u32,
                    info.time_sent,
                    persistent && is_last,
                    now,
                );
            }
            if let Some(path) = self.paths.get_mut(path::ACTIVE) {
                path.mtu.on_packet_loss(*pn);
            }
            for plan in &info.data {
                self.on_plan_loss(level, *pn, plan);
            }
        }
    }

    fn on_plan_ack(&mut self, level: Level, pn: wren_quic_core::packet::number::PacketNumber, plan: &Plan) {
        match plan {
            Plan::Stream { id, offset, len, is_fin } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.on_frame_ack(*offset, *len as usize, *is_fin);
                        if send.is_terminal() {
                            let id = *id;
                            self.emit_event(Event::StreamUpdate {
                                id,
                                kind: StreamUpdateKind::DataAcknowledged,
                            });
                            self.streams.cleanup(id);
                        }
                    }
                }
            }
            Plan::Crypto { .. } => {
                // retransmission state was already cleared on transmit;
                // nothing to do on ack
            }
            Plan::Ack { largest } => {
                if let Some(space) = self.space_mut(level) {
                    space.ack_manager.on_ack_of_ack(*largest);
                }
            }
            Plan::MaxData => self.in_flow.sync().on_packet_ack(pn),
            Plan::MaxStreamData { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(recv) = &mut stream.recv {
                        recv.max_stream_data_sync().on_packet_ack(pn);
                    }
                }
            }
            Plan::MaxStreams { stream_type } => {
                self.streams.max_streams_sync(*stream_type).on_packet_ack(pn);
            }
            Plan::DataBlocked => self.out_flow.blocked_sync().on_packet_ack(pn),
            Plan::StreamDataBlocked { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.blocked_sync().on_packet_ack(pn);
                    }
                }
            }
            Plan::StreamsBlocked { stream_type } => {
                self.streams.blocked_sync(*stream_type).on_packet_ack(pn);
            }
            Plan::ResetStream { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.reset_sync().on_packet_ack(pn);
                        send.on_reset_ack();
                        self.streams.cleanup(*id);
                    }
                }
            }
            Plan::StopSending { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(recv) = &mut stream.recv {
                        recv.stop_sending_sync().on_packet_ack(pn);
                    }
                }
            }
            Plan::HandshakeDone => self.handshake_done_sync.on_packet_ack(pn),
            Plan::NewToken => self.new_token_sync.on_packet_ack(pn),
            Plan::NewConnectionId { sequence } => {
                self.local_cids.on_packet_ack(*sequence, pn);
            }
            Plan::RetireConnectionId { sequence } => {
                self.peer_cids.on_packet_ack(*sequence, pn);
            }
            Plan::MtuProbe { .. } | Plan::Ping | Plan::PathChallenge | Plan::PathResponse
            | Plan::Datagram => {}
        }
    }

    fn on_plan_loss(&mut self, level: Level, pn: wren_quic_core::packet::number::PacketNumber, plan: &Plan) {
        match plan {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2
            //# loss-declared frames are re-queued as logically new frames
            Plan::Stream { id, offset, len, is_fin } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.on_frame_loss(*offset, *len as usize, *is_fin);
                    }
                }
            }
            Plan::Crypto { offset, len } => {
                if let Some(space) = self.space_mut(level) {
                    space.crypto_tx.on_loss(*offset, *len as usize);
                }
            }
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.3
            //# *  ACK frames are not retransmitted; a fresher ACK replaces them
            Plan::Ack { .. } => {}
            Plan::MaxData => self.in_flow.sync().on_packet_loss(pn),
            Plan::MaxStreamData { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(recv) = &mut stream.recv {
                        recv.max_stream_data_sync().on_packet_loss(pn);
                    }
                }
            }
            Plan::MaxStreams { stream_type } => {
                self.streams.max_streams_sync(*stream_type).on_packet_loss(pn);
            }
            Plan::DataBlocked => self.out_flow.blocked_sync().on_packet_loss(pn),
            Plan::StreamDataBlocked { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.blocked_sync().on_packet_loss(pn);
                    }
                }
            }
            Plan::StreamsBlocked { stream_type } => {
                self.streams.blocked_sync(*stream_type).on_packet_loss(pn);
            }
            Plan::ResetStream { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.reset_sync().on_packet_loss(pn);
                    }
                }
            }
            Plan::StopSending { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(recv) = &mut stream.recv {
                        recv.stop_sending_sync().on_packet_loss(pn);
                    }
                }
            }
            Plan::HandshakeDone => self.handshake_done_sync.on_packet_loss(pn),
            Plan::NewToken => self.new_token_sync.on_packet_loss(pn),
            Plan::NewConnectionId { sequence } => {
                self.local_cids.on_packet_loss(*sequence, pn);
            }
            Plan::RetireConnectionId { sequence } => {
                self.peer_cids.on_packet_loss(*sequence, pn);
            }
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.3
            //# *  PATH_CHALLENGE and PATH_RESPONSE frames are not retransmitted;
            //#    a new PATH_CHALLENGE is sent by the path validation timer
            Plan::MtuProbe { .. } | Plan::Ping | Plan::PathChallenge | Plan::PathResponse
            | Plan::Datagram => {}
        }
    }

    /// Drains in-order crypto bytes into the TLS session
    fn pump_crypto(&mut self, level: Level) -> Result<(), transport::Error> {
        loop {
            let chunk = match self.space_mut(level) {
                Some(space) => space.crypto_rx.pop(),
                None => None,
            };
            let Some(chunk) = chunk else { break };

            let mut tls = self.tls.take().expect("tls session present");
            let result = tls.on_crypto_data(level, &chunk, &mut TlsContext { conn: self });
            self.tls = Some(tls);
            result?;
        }
        self.after_tls_progress();
        Ok(())
    }

    /// Post-TLS bookkeeping: key-dependent state transitions and replay of
    /// parked packets
    fn after_tls_progress(&mut self) {
        if self.handshake_complete && self.cfg.endpoint_type.is_server() && !self.handshake_confirmed
        {
            //= https://www.rfc-editor.org/rfc/rfc9001#section-4.1.2
            //# the TLS handshake is considered confirmed at the server when the
            //# handshake completes.
            self.handshake_done_sync.request_delivery();
            self.on_handshake_confirmed();

            // compensate peers that wait for handshake acks before
            // progressing; only covers genuinely received packets
            if let Some(space) = self.spaces[Self::space_index(Level::Handshake)].as_mut() {
                space.ack_manager.force_ack();
            }

            // hand the client a token for a future connection
            if let Ok(token) = AddressToken::try_from_slice(b"wren-address-token-v1") {
                self.new_token_to_send = Some(token);
                self.new_token_sync.request_delivery();
            }
        }

        for level in [Level::Initial, Level::Handshake, Level::OneRtt] {
            if self.keys.recv_ready(level) {
                let parked =
                    core::mem::take(&mut self.early_packets[Self::space_index(level)]);
                for datagram in parked {
                    self.on_datagram(datagram);
                }
            }
        }
    }

    fn on_handshake_confirmed(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        tracing::debug!(endpoint = %self.cfg.endpoint_type, "handshake confirmed");
        self.handshake_confirmed = true;
        self.state = State::Established;

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.2
        //# An endpoint MUST discard its Handshake keys when the TLS handshake
        //# is confirmed
        self.discard_space(Level::Initial);
        self.discard_space(Level::Handshake);

        if let Some(path) = self.paths.get_mut(path::ACTIVE) {
            path.mtu.on_handshake_confirmed();
        }

        // pre-issue connection ids up to the peer's limit
        if let Some(params) = &self.peer_params {
            let limit = params.active_connection_id_limit;
            let runtime = self.runtime.clone();
            self.local_cids.on_peer_limit(limit, &runtime);
            self.demux_added = self.local_cids.ids().cloned().collect();
        }

        self.wake_send();
    }

    pub(crate) fn discard_space(&mut self, level: Level) {
        let index = Self::space_index(level);
        if matches!(level, Level::OneRtt | Level::ZeroRtt) {
            debug_assert!(false, "the application space is never discarded early");
            return;
        }
        if let Some(mut space) = self.spaces[index].take() {
            for info in space.discard() {
                if info.in_flight {
                    self.cc.on_packet_discarded(info.sent_bytes as usize);
                }
            }
        }
        self.keys.discard(level);
        self.early_packets[index].clear();
    }

    fn on_migration_complete(&mut self) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-9.4
        //# On confirming a peer's ownership of its new address, an endpoint
        //# MUST immediately reset the congestion controller and round-trip
        //# time estimator for the new path to initial values
        if self.paths.take_migrated() {
            tracing::debug!(local = %self.paths.active().local, "path migration validated");
            self.cc.on_path_change();
            self.rtt = self
                .rtt
                .for_new_path(transport::parameters::DEFAULT_INITIAL_RTT);

            let local = self.paths.active().local;
            let peer = self.paths.active().peer;
            self.emit_event(Event::ConnectionMigration { local, peer });
        }
    }

    fn on_version_negotiation(&mut self, versions: &[u32]) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
        //# A client MUST discard a Version Negotiation packet that lists the
        //# QUIC version selected by the client.
        if !self.cfg.endpoint_type.is_client()
            || self.state != State::Establishing
            || versions.contains(&self.cfg.version)
        {
            self.drop_count += 1;
            return;
        }

        let Some(version) = versions
            .iter()
            .find(|version| packet::is_supported_version(**version))
        else {
            self.close_locally(transport_error!(NO_ERROR, "no common version"));
            return;
        };

        // restart the handshake under the new version
        self.cfg.version = *version;
        self.keys = KeyGate::default();
        self.spaces = [
            Some(Space::new(PacketNumberSpace::Initial, ack::Settings::EARLY)),
            Some(Space::new(PacketNumberSpace::Handshake, ack::Settings::EARLY)),
            Some(Space::new(
                PacketNumberSpace::ApplicationData,
                self.cfg.ack_settings,
            )),
        ];
        let _ = self.start_tls();
    }

    fn on_retry_packet(&mut self, new_server_cid: &[u8], token: &[u8]) {
        if !self.cfg.endpoint_type.is_client() || self.state != State::Establishing {
            self.drop_count += 1;
            return;
        }
        let Ok(id) = ConnectionId::try_from_slice(new_server_cid) else {
            return;
        };
        let Ok(token) = AddressToken::try_from_slice(token) else {
            return;
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# The client responds to a Retry packet with an Initial packet that
        //# includes the provided Retry token to continue connection
        //# establishment.
        self.peer_cids = PeerRegistry::new(id, self.cfg.local_params.active_connection_id_limit);
        self.address_token = Some(token);

        // retransmit the first flight with the token attached
        if let Some(space) = self.space_mut(Level::Initial) {
            while space.crypto_rx.pop().is_some() {}
            space.crypto_tx.retransmit_all();
        }
    }

    // === lifecycle ===

    /// Closes with an application error code and phrase
    pub fn close(&mut self, error_code: VarInt, _phrase: &[u8]) {
        let error = transport::Error::application_error(error_code, "closed by application");
        self.close_locally(error);
    }

    /// Raises a transport error and transitions to Closing
    pub(crate) fn close_with(&mut self, error: transport::Error) {
        self.close_locally(error);
    }

    fn close_locally(&mut self, error: transport::Error) {
        if !self.is_open() {
            return;
        }
        let now = self.runtime.now();

        tracing::debug!(code = %error.code, reason = error.reason, "closing connection");
        self.state = State::Closing;
        self.error = Some(connection::Error::Closed { error });
        self.close_error = Some(error);
        self.close_needed = true;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
        //# The closing and draining connection states exist to ensure that
        //# connections close cleanly and that delayed or reordered packets are
        //# properly discarded.  These states SHOULD persist for at least three
        //# times the current PTO interval
        let pto = self.rtt.pto_period(self.pto_backoff, PacketNumberSpace::ApplicationData);
        self.drain_timer.set(now + pto * 3);
        self.cancel_data_timers();
        self.streams.on_close();
        self.wake_recv();
        self.wake_send();
    }

    pub(crate) fn enter_draining(&mut self, error: transport::Error) {
        if matches!(self.state, State::Draining | State::Closed) {
            return;
        }
        let now = self.runtime.now();

        tracing::debug!(code = %error.code, "peer closed connection; draining");
        self.state = State::Draining;
        self.error = Some(connection::Error::Closed { error });
        let pto = self.rtt.pto_period(self.pto_backoff, PacketNumberSpace::ApplicationData);
        self.drain_timer.set(now + pto * 3);
        self.cancel_data_timers();
        self.streams.on_close();
        self.wake_recv();
        self.wake_send();
    }

    fn cancel_data_timers(&mut self) {
        self.idle_timer.cancel();
        for space in self.spaces.iter_mut().flatten() {
            space.pto.cancel();
        }
    }

    /// Tears the connection down; every queue purged, every timer dead
    pub fn destroy(&mut self) {
        self.state = State::Closed;
        self.error.get_or_insert(connection::Error::NotConnected);
        self.cancel_data_timers();
        self.drain_timer.cancel();
        self.close_rearm_timer.cancel();
        while self.pop_datagram().is_some() {}
        self.datagram_tx.clear();
        self.events.clear();
        self.streams.on_close();
        self.demux_removed = self.local_cids.ids().cloned().collect();
        self.wake_recv();
        self.wake_send();
    }

    // === timers ===

    pub fn on_timeout(&mut self, now: Timestamp) {
        if self.drain_timer.poll_expiration(now).is_ready() {
            self.destroy();
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# If a max_idle_timeout is specified by either endpoint in its
        //# transport parameters (Section 18.2), the connection is silently
        //# closed and its state is discarded when it remains idle
        if self.idle_timer.poll_expiration(now).is_ready() {
            self.error = Some(connection::Error::IdleTimeout);
            self.destroy();
            return;
        }

        for index in 0..self.spaces.len() {
            let Some(space) = self.spaces[index].as_mut() else {
                continue;
            };
            let level = match index {
                0 => Level::Initial,
                1 => Level::Handshake,
                _ => Level::OneRtt,
            };
            match space.on_timeout(now) {
                crate::space::SpaceTimeout::LossDetection => {
                    self.detect_and_handle_loss(level, now);
                }
                crate::space::SpaceTimeout::Pto => {
                    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
                    //# A PTO timer expiration event does not indicate packet
                    //# loss and MUST NOT cause prior unacknowledged packets to
                    //# be marked as lost.
                    self.pto_backoff = self.pto_backoff.saturating_mul(2);
                }
                crate::space::SpaceTimeout::None => {}
            }
        }

        self.paths.on_timeout(now);
    }

    pub(crate) fn rearm_pto(&mut self, level: Level, now: Timestamp) {
        let backoff = self.pto_backoff;
        let period = self.rtt.pto_period(backoff, match level {
            Level::Initial => PacketNumberSpace::Initial,
            Level::Handshake => PacketNumberSpace::Handshake,
            _ => PacketNumberSpace::ApplicationData,
        });
        if let Some(space) = self.space_mut(level) {
            if space.sent.has_ack_eliciting() {
                space.pto.update(now, period);
            } else {
                space.pto.cancel();
            }
        }
    }

    /// The earliest armed timer over every component
    pub fn next_timer_expiration(&self) -> Option<Timestamp> {
        use timer::Provider as _;
        let mut earliest: Option<Timestamp> = None;
        let mut merge = |candidate: Option<Timestamp>| {
            earliest = match (earliest, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };

        merge(self.idle_timer.expiration());
        merge(self.drain_timer.expiration());
        merge(self.close_rearm_timer.expiration());
        for space in self.spaces.iter().flatten() {
            merge(space.next_expiration());
        }
        merge(self.paths.next_expiration());
        merge(self.pacer.earliest_departure_time());
        earliest
    }
}

/// The [`tls::Context`] view over a connection
struct TlsContext<'a> {
    conn: &'a mut Connection,
}

impl tls::Context for TlsContext<'_> {
    fn send_crypto(&mut self, level: Level, data: &[u8]) {
        if let Some(space) = self.conn.space_mut(level) {
            space.crypto_tx.write(data);
        }
    }

    fn install_keys(
        &mut self,
        level: Level,
        send: wren_quic_core::crypto::LevelKeys,
        recv: wren_quic_core::crypto::LevelKeys,
    ) {
        self.conn.keys.install_send(level, send);
        self.conn.keys.install_recv(level, recv);

        // some peers stall until their handshake flight is acknowledged, so
        // a server schedules one as soon as application keys exist; it only
        // ever covers packets actually received
        if level == Level::OneRtt && self.conn.cfg.endpoint_type.is_server() {
            if let Some(space) = self.conn.space_mut(Level::Handshake) {
                space.ack_manager.force_ack();
            }
        }
    }

    fn on_peer_params(&mut self, params: &[u8]) -> Result<(), transport::Error> {
        let params = TransportParameters::decode(s2n_codec::DecoderBuffer::new(params))?;
        self.conn.apply_peer_params(params)
    }

    fn on_handshake_complete(&mut self) {
        self.conn.handshake_complete = true;
    }

    fn on_alpn(&mut self, alpn: &[u8]) {
        self.conn.alpn = Some(alpn.to_vec());
    }

    fn on_session_ticket(&mut self, ticket: &[u8]) {
        if let Ok(ticket) = SessionTicket::try_from_slice(ticket) {
            self.conn.session_ticket = Some(ticket.clone());
            self.conn.emit_event(Event::NewSessionTicket { ticket });
        }
    }
}

impl Connection {
    fn apply_peer_params(&mut self, params: TransportParameters) -> Result<(), transport::Error> {
        self.out_flow.on_max_data(params.initial_max_data);
        self.rtt.on_max_ack_delay(params.max_ack_delay);
        self.streams.on_peer_limits(stream::Limits {
            max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: params.initial_max_stream_data_uni,
            max_streams_bidi: params.initial_max_streams_bidi,
            max_streams_uni: params.initial_max_streams_uni,
        });

        if let Some(token) = params.stateless_reset_token {
            self.peer_cids.on_peer_params_token(token);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# Each endpoint advertises a max_idle_timeout, but the effective
        //# value at an endpoint is computed as the minimum of the two
        //# advertised values.
        self.idle_timeout = self.cfg.local_params.merged_idle_timeout(&params);
        self.restart_idle_timer(self.runtime.now());

        self.peer_params = Some(params);
        self.wake_send();
        Ok(())
    }

    /// The negotiated application protocol, if the handshake chose one
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    /// The id changes the endpoint must apply to its demux table
    pub fn take_demux_changes(&mut self) -> (Vec<ConnectionId>, Vec<ConnectionId>) {
        (
            core::mem::take(&mut self.demux_added),
            core::mem::take(&mut self.demux_removed),
        )
    }
}

impl timer::Provider for Connection {
    fn timers<Q: timer::Query>(&self, query: &mut Q) -> timer::Result {
        if let Some(expiration) = self.next_timer_expiration() {
            query.on_timer(expiration)?;
        }
        Ok(())
    }
}
