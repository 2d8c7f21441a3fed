// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet assembly: pulls frames by class (control > stream > datagram)
//! under congestion, pacing, amplification and flow-control budgets, then
//! seals and protects each coalesced packet.

use super::{Connection, Datagram, State};
use crate::{path, space::Plan};
use s2n_codec::{Encoder as _, EncoderBuffer, EncoderValue};
use wren_quic_core::{
    crypto::Level,
    frame,
    inet::ExplicitCongestionNotification,
    packet::{self, number::PacketNumberSpace},
    recovery::{CongestionController as _, SentPacketInfo},
    stream::StreamType,
    time::Timestamp,
    varint::VarInt,
};

const TAG_LEN: usize = 16;

/// Header bytes for a level; exact because the packet number always uses
/// the fixed 4-byte encoding and the length field two bytes
fn header_overhead(level: Level, dcid_len: usize, scid_len: usize, token_len: usize) -> usize {
    match level {
        Level::OneRtt => 1 + dcid_len + 4,
        Level::Initial => {
            let token_prefix = VarInt::try_from(token_len)
                .expect("token lengths are bounded")
                .encoding_size();
            // tag + version + cid lengths + cids + token + length + packet
            // number
            1 + 4 + 1 + dcid_len + 1 + scid_len + token_prefix + token_len + 2 + 4
        }
        _ => 1 + 4 + 1 + dcid_len + 1 + scid_len + 2 + 4,
    }
}

/// One packet staged for a datagram
struct StagedPacket {
    level: Level,
    payload: Vec<u8>,
    plans: smallvec::SmallVec<[Plan; 4]>,
    ack_eliciting: bool,
    in_flight: bool,
}

impl Connection {
    /// Builds the next outbound datagram, if anything is sendable
    pub fn transmit(&mut self) -> Option<Datagram> {
        let now = self.runtime.now();

        match self.state {
            State::Closed | State::Draining => None,
            State::Closing => self.transmit_close(),
            State::Establishing | State::Established => {
                if let Some(datagram) = self.transmit_path_response(now) {
                    return Some(datagram);
                }
                if let Some(datagram) = self.transmit_path_challenge(now) {
                    return Some(datagram);
                }
                if let Some(datagram) = self.transmit_mtu_probe(now) {
                    return Some(datagram);
                }
                self.transmit_data(now)
            }
        }
    }

    fn mss(&self) -> usize {
        let path_mtu = self.paths.active().mtu.mtu() as usize;
        let peer_limit = self
            .peer_params
            .as_ref()
            .map(|params| params.max_udp_payload_size.as_u64() as usize)
            .unwrap_or(usize::MAX);
        path_mtu.min(peer_limit)
    }

    /// The CONNECTION_CLOSE datagram, re-armed at most once per PTO
    fn transmit_close(&mut self) -> Option<Datagram> {
        if !self.close_needed {
            return None;
        }
        let error = self.close_error?;

        // use the highest level with send keys so the peer can read it
        let level = [Level::OneRtt, Level::Handshake, Level::Initial]
            .into_iter()
            .find(|level| {
                self.keys.send_ready(*level)
                    && self.spaces[Self::space_index(*level)].is_some()
            })?;

        let close_frame = frame::ConnectionClose::from(error);
        let mut payload = vec![0u8; 256];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut payload);
            encoder.encode(&close_frame);
            encoder.len()
        };
        payload.truncate(len);

        let staged = StagedPacket {
            level,
            payload,
            plans: smallvec::SmallVec::new(),
            ack_eliciting: false,
            in_flight: false,
        };

        self.close_needed = false;
        self.seal_datagram(vec![staged], path::ACTIVE, false)
    }

    /// Answers a pending PATH_CHALLENGE on the path it arrived on
    fn transmit_path_response(&mut self, _now: Timestamp) -> Option<Datagram> {
        let (data, path_id) = self.paths.pending_response()?;
        if !self.keys.send_ready(Level::OneRtt) {
            return None;
        }

        let mut payload = vec![0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut payload);
            encoder.encode(&frame::PathResponse { data });
            encoder.len()
        };
        payload.truncate(len);

        let staged = StagedPacket {
            level: Level::OneRtt,
            payload,
            plans: smallvec::smallvec![Plan::PathResponse],
            ack_eliciting: true,
            in_flight: true,
        };

        self.paths.on_response_transmitted();
        //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.2
        //# A PATH_RESPONSE frame MUST be sent on the network path where the
        //# PATH_CHALLENGE was received.
        self.seal_datagram(vec![staged], path_id, false)
    }

    /// Probes the alternate (or a challenged active) path
    fn transmit_path_challenge(&mut self, now: Timestamp) -> Option<Datagram> {
        if !self.keys.send_ready(Level::OneRtt) {
            return None;
        }

        let pto = self
            .rtt
            .pto_period(self.pto_backoff, PacketNumberSpace::ApplicationData);
        let period = self.paths.challenge_period(pto);

        for path_id in [path::ALTERNATE, path::ACTIVE] {
            let Some(path) = self.paths.get_mut(path_id) else {
                continue;
            };
            let Some(data) = path.challenge.transmission_data() else {
                continue;
            };
            path.challenge.on_transmit(now, period);

            let mut payload = vec![0u8; 64];
            let len = {
                let mut encoder = EncoderBuffer::new(&mut payload);
                encoder.encode(&frame::PathChallenge { data });
                encoder.len()
            };
            payload.truncate(len);

            let staged = StagedPacket {
                level: Level::OneRtt,
                payload,
                plans: smallvec::smallvec![Plan::PathChallenge],
                ack_eliciting: true,
                in_flight: true,
            };

            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.1
            //# An endpoint MUST expand datagrams that contain a PATH_CHALLENGE
            //# frame to at least the smallest allowed maximum datagram size of
            //# 1200 bytes
            return self.seal_datagram(vec![staged], path_id, true);
        }
        None
    }

    /// Emits a PMTU probe sized exactly to the candidate MTU
    fn transmit_mtu_probe(&mut self, _now: Timestamp) -> Option<Datagram> {
        if !self.keys.send_ready(Level::OneRtt) {
            return None;
        }
        let probe_size = self.paths.active().mtu.probe_size()?;

        let overhead = header_overhead(
            Level::OneRtt,
            self.peer_cids.active().len(),
            0,
            0,
        ) + TAG_LEN;
        let padding = (probe_size as usize).saturating_sub(overhead + 1);

        let mut payload = vec![0u8; probe_size as usize];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut payload);
            encoder.encode(&frame::Ping);
            encoder.encode(&frame::Padding { length: padding });
            encoder.len()
        };
        payload.truncate(len);

        let staged = StagedPacket {
            level: Level::OneRtt,
            payload,
            plans: smallvec::smallvec![Plan::MtuProbe { size: probe_size }],
            ack_eliciting: true,
            // probe loss narrows the search rather than signalling
            // congestion, so the bytes stay outside the window
            in_flight: false,
        };

        let probe_pn = self.spaces[Self::space_index(Level::OneRtt)]
            .as_ref()?
            .next_packet_number();
        let datagram = self.seal_datagram(vec![staged], path::ACTIVE, false)?;
        debug_assert_eq!(datagram.payload.len(), probe_size as usize);

        self.paths
            .active_mut()
            .mtu
            .on_probe_sent(probe_pn, probe_size);

        Some(datagram)
    }

    /// The regular build cycle: control > stream > datagram frames across
    /// every level with sendable content
    fn transmit_data(&mut self, now: Timestamp) -> Option<Datagram> {
        let mut forced = self
            .spaces
            .iter()
            .flatten()
            .any(|space| space.pto.transmissions() > 0);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
        //# Senders SHOULD pace sending of all in-flight packets based on
        //# input from the congestion controller.
        if !forced && !self.pacer.can_send(now) {
            return None;
        }

        let mss = self.mss();
        let congestion_budget = if forced {
            usize::MAX
        } else {
            self.cc
                .congestion_window()
                .saturating_sub(self.cc.bytes_in_flight()) as usize
        };

        let mut staged: Vec<StagedPacket> = Vec::new();
        let mut datagram_budget = mss;

        for level in [Level::Initial, Level::Handshake, Level::OneRtt] {
            if datagram_budget < 64 {
                break;
            }
            if !self.keys.send_ready(level) {
                continue;
            }
            if self.spaces[Self::space_index(level)].is_none() {
                continue;
            }

            let overhead = header_overhead(
                level,
                self.peer_cids.active().len(),
                wren_quic_core::connection::id::LOCAL_LEN,
                self.address_token.as_ref().map_or(0, |t| t.len()),
            ) + TAG_LEN;
            let capacity = datagram_budget.saturating_sub(overhead);
            if capacity < 16 {
                continue;
            }

            if let Some(packet) = self.build_packet(level, capacity, congestion_budget, now) {
                let size = overhead + packet.payload.len();
                datagram_budget = datagram_budget.saturating_sub(size);
                forced = false;
                staged.push(packet);
            }
        }

        if staged.is_empty() {
            return None;
        }

        let pad_initial = staged.iter().any(|packet| packet.level == Level::Initial);
        self.seal_datagram(staged, path::ACTIVE, pad_initial)
    }

    /// Assembles one packet's payload for `level`
    fn build_packet(
        &mut self,
        level: Level,
        capacity: usize,
        congestion_budget: usize,
        now: Timestamp,
    ) -> Option<StagedPacket> {
        let space_index = Self::space_index(level);

        let mut scratch = vec![0u8; capacity];
        let mut plans: smallvec::SmallVec<[Plan; 4]> = smallvec::SmallVec::new();
        let mut ack_eliciting = false;
        let mut congestion_bytes = 0usize;

        let amplification_limited = self.paths.active().is_amplification_limited();
        if amplification_limited {
            return None;
        }

        {
            let mut encoder = EncoderBuffer::new(&mut scratch);

            // ACKs head the packet and are always eligible
            {
                let space = self.spaces[space_index].as_mut()?;
                if space.ack_manager.should_transmit(now) {
                    if let Some(ack) = space.ack_manager.transmission(now) {
                        if ack.encoding_size() <= encoder.remaining_capacity() {
                            let largest = space
                                .ack_manager
                                .largest_received()
                                .expect("a transmittable ack covers something");
                            encoder.encode(&ack);
                            space.ack_manager.on_transmit();
                            plans.push(Plan::Ack { largest });
                        }
                    }
                }
            }

            let probing = self.spaces[space_index]
                .as_ref()
                .map_or(0, |space| space.pto.transmissions());
            let congestion_open = congestion_budget > congestion_bytes || probing > 0;

            // CRYPTO frames
            if congestion_open {
                loop {
                    let space = self.spaces[space_index].as_mut()?;
                    let room = encoder.remaining_capacity();
                    if room < 8 || !space.crypto_tx.has_pending() {
                        break;
                    }
                    let Some((offset, len)) = space.crypto_tx.next_transmission(room - 8) else {
                        break;
                    };
                    let frame = frame::Crypto {
                        offset: VarInt::new(offset).expect("crypto offsets are bounded"),
                        data: space.crypto_tx.data(offset, len),
                    };
                    encoder.encode(&frame);
                    space.crypto_tx.on_transmit(offset, len);
                    plans.push(Plan::Crypto {
                        offset,
                        len: len as u16,
                    });
                    ack_eliciting = true;
                    congestion_bytes += len;
                }
            }

            // application-space control, stream and datagram frames
            if matches!(level, Level::OneRtt | Level::ZeroRtt) && congestion_open {
                self.build_app_frames(&mut encoder, &mut plans, &mut ack_eliciting);
            }

            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
            //# When there is no data to send, the sender SHOULD send a PING or
            //# other ack-eliciting frame in a single packet, re-arming the PTO
            //# timer.
            if probing > 0 && !ack_eliciting && encoder.remaining_capacity() >= 1 {
                encoder.encode(&frame::Ping);
                plans.push(Plan::Ping);
                ack_eliciting = true;
            }
            if probing > 0 {
                if let Some(space) = self.spaces[space_index].as_mut() {
                    space.pto.on_transmit_once();
                }
            }

            // header protection needs at least 4 bytes beyond the packet
            // number to sample
            if encoder.len() > 0 && encoder.len() < 4 {
                let padding = 4 - encoder.len();
                encoder.encode(&frame::Padding { length: padding });
            }

            let len = encoder.len();
            if len == 0 {
                return None;
            }
            scratch.truncate(len);
        }

        let in_flight = ack_eliciting || congestion_bytes > 0;

        Some(StagedPacket {
            level,
            payload: scratch,
            plans,
            ack_eliciting,
            in_flight,
        })
    }

    /// Control > stream > datagram frames for the application space
    fn build_app_frames(
        &mut self,
        encoder: &mut EncoderBuffer,
        plans: &mut smallvec::SmallVec<[Plan; 4]>,
        ack_eliciting: &mut bool,
    ) {
        macro_rules! write_frame {
            ($frame:expr, $plan:expr) => {{
                let frame = $frame;
                if frame.encoding_size() <= encoder.remaining_capacity() {
                    encoder.encode(&frame);
                    plans.push($plan);
                    *ack_eliciting = true;
                    true
                } else {
                    false
                }
            }};
        }

        // HANDSHAKE_DONE
        if self.handshake_done_sync.needs_transmission() {
            write_frame!(frame::HandshakeDone, Plan::HandshakeDone);
        }

        // NEW_TOKEN
        if self.new_token_sync.needs_transmission() {
            if let Some(token) = self.new_token_to_send.clone() {
                write_frame!(
                    frame::NewToken {
                        token: token.as_bytes(),
                    },
                    Plan::NewToken
                );
            }
        }

        // MAX_DATA
        if let Some(value) = self.in_flow.sync().transmission_value() {
            write_frame!(
                frame::MaxData {
                    maximum_data: value
                },
                Plan::MaxData
            );
        }

        // MAX_STREAMS / STREAMS_BLOCKED
        for stream_type in [StreamType::Bidirectional, StreamType::Unidirectional] {
            if let Some(value) = self.streams.max_streams_sync(stream_type).transmission_value() {
                write_frame!(
                    frame::MaxStreams {
                        stream_type,
                        maximum_streams: value,
                    },
                    Plan::MaxStreams { stream_type }
                );
            }
            if let Some(value) = self.streams.blocked_sync(stream_type).transmission_value() {
                write_frame!(
                    frame::StreamsBlocked {
                        stream_type,
                        stream_limit: value,
                    },
                    Plan::StreamsBlocked { stream_type }
                );
            }
        }

        // DATA_BLOCKED
        if let Some(value) = self.out_flow.blocked_sync().transmission_value() {
            write_frame!(
                frame::DataBlocked { data_limit: value },
                Plan::DataBlocked
            );
        }

        // NEW_CONNECTION_ID / RETIRE_CONNECTION_ID
        while let Some((sequence, id, token)) = self.local_cids.next_transmission() {
            let frame = frame::NewConnectionId {
                sequence_number: sequence,
                retire_prior_to: self.local_cids.retire_prior_to(),
                connection_id: id.as_bytes(),
                stateless_reset_token: token.into_inner(),
            };
            if frame.encoding_size() > encoder.remaining_capacity() {
                break;
            }
            encoder.encode(&frame);
            plans.push(Plan::NewConnectionId { sequence });
            *ack_eliciting = true;
            // mark in flight at commit time once the packet number exists;
            // avoid re-selecting it within this packet
            self.local_cids
                .on_transmit(sequence, PacketNumberSpace::ApplicationData.new_packet_number(VarInt::MAX));
        }
        while let Some(sequence) = self.peer_cids.next_retirement() {
            let frame = frame::RetireConnectionId {
                sequence_number: sequence,
            };
            if frame.encoding_size() > encoder.remaining_capacity() {
                break;
            }
            encoder.encode(&frame);
            plans.push(Plan::RetireConnectionId { sequence });
            *ack_eliciting = true;
            self.peer_cids
                .on_transmit(sequence, PacketNumberSpace::ApplicationData.new_packet_number(VarInt::MAX));
        }

        // per-stream control frames, then stream data in id order
        let ids = self.streams.ids();
        for id in ids.iter().copied() {
            let Some(stream) = self.streams.get(id) else {
                continue;
            };

            if let Some(recv) = &mut stream.recv {
                if let Some(value) = recv.max_stream_data_sync().transmission_value() {
                    write_frame!(
                        frame::MaxStreamData {
                            stream_id: id.as_varint(),
                            maximum_stream_data: value,
                        },
                        Plan::MaxStreamData { id }
                    );
                }
                if let Some(code) = recv.stop_sending_transmission() {
                    write_frame!(
                        frame::StopSending {
                            stream_id: id.as_varint(),
                            application_error_code: code,
                        },
                        Plan::StopSending { id }
                    );
                }
            }

            let Some(stream) = self.streams.get(id) else {
                continue;
            };
            if let Some(send) = &mut stream.send {
                if let Some((code, final_size)) = send.reset_transmission() {
                    write_frame!(
                        frame::ResetStream {
                            stream_id: id.as_varint(),
                            application_error_code: code,
                            final_size: VarInt::new(final_size)
                                .expect("stream offsets are bounded"),
                        },
                        Plan::ResetStream { id }
                    );
                }
                if let Some(value) = send.blocked_sync().transmission_value() {
                    write_frame!(
                        frame::StreamDataBlocked {
                            stream_id: id.as_varint(),
                            stream_data_limit: value,
                        },
                        Plan::StreamDataBlocked { id }
                    );
                }
            }
        }

        // stream data
        for id in ids.iter().copied() {
            loop {
                let connection_credit = self.out_flow.available();
                let room = encoder.remaining_capacity();
                if room < 8 {
                    return;
                }

                let Some(stream) = self.streams.get(id) else {
                    break;
                };
                let Some(send) = &mut stream.send else {
                    break;
                };
                let Some(mut transmission) = send.next_transmission(room - 8, connection_credit)
                else {
                    break;
                };

                let mut frame = frame::Stream {
                    stream_id: id.as_varint(),
                    offset: VarInt::new(transmission.offset).expect("offsets are bounded"),
                    is_last_frame: false,
                    is_fin: transmission.is_fin,
                    data: send.data(transmission.offset, transmission.len),
                };

                if let Ok(len) = frame.try_fit(encoder.remaining_capacity()) {
                    if len < transmission.len {
                        transmission.len = len;
                        transmission.is_fin = false;
                        frame.is_fin = false;
                    }
                    frame.data = send.data(transmission.offset, transmission.len);
                    // always carry a length so more frames can follow
                    frame.is_last_frame = false;
                    if frame.encoding_size() > encoder.remaining_capacity() {
                        break;
                    }
                    encoder.encode(&frame);

                    let new_bytes = send.on_transmit(transmission);
                    self.out_flow.acquire(new_bytes as usize);

                    plans.push(Plan::Stream {
                        id,
                        offset: transmission.offset,
                        len: transmission.len as u16,
                        is_fin: transmission.is_fin,
                    });
                    *ack_eliciting = true;
                } else {
                    break;
                }
            }
        }

        if self.out_flow.available() == 0 {
            self.out_flow.on_blocked();
        }

        // DATAGRAM frames are never split; skip any that don't fit now
        while let Some(payload) = self.datagram_tx.front() {
            let frame = frame::Datagram {
                is_last_frame: false,
                data: &payload[..],
            };
            if frame.encoding_size() > encoder.remaining_capacity() {
                break;
            }
            encoder.encode(&frame);
            plans.push(Plan::Datagram);
            *ack_eliciting = true;
            self.datagram_tx.pop_front();
        }
    }

    /// Encodes headers, seals and protects every staged packet into one
    /// datagram on `path_id`
    fn seal_datagram(
        &mut self,
        mut staged: Vec<StagedPacket>,
        path_id: path::Id,
        pad_to_initial: bool,
    ) -> Option<Datagram> {
        if staged.is_empty() {
            return None;
        }
        let now = self.runtime.now();

        let path = self.paths.get(path_id)?;
        let local = path.local;
        let peer = path.peer;
        let allowance = path.amplification_allowance();
        let mss = self.mss();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
        //# Prior to validating the client address, servers MUST NOT send
        //# more than three times as many bytes as the number of bytes they
        //# have received.
        let estimated: usize = staged
            .iter()
            .map(|packet| self.packet_overhead(packet.level) + packet.payload.len() + TAG_LEN)
            .sum();
        if (estimated as u64) > allowance {
            return None;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# A client MUST expand the payload of all UDP datagrams carrying
        //# Initial packets to at least the smallest allowed maximum datagram
        //# size of 1200 bytes
        if pad_to_initial || staged.iter().any(|packet| packet.level == Level::Initial) {
            let mut total = 0;
            for packet in &staged {
                total += self.packet_overhead(packet.level) + packet.payload.len() + TAG_LEN;
            }
            let minimum = packet::MIN_INITIAL_DATAGRAM_LEN.min(mss);
            if total < minimum {
                let missing = minimum - total;
                let last = staged.last_mut().expect("staged is non-empty");
                // PADDING frames are zero bytes; extending the payload is
                // the padding
                last.payload.resize(last.payload.len() + missing, 0);
            }
        }

        // MTU probes intentionally exceed the confirmed path MTU
        let mut buffer = vec![0u8; mss.max(estimated)];
        let mut encoder = EncoderBuffer::new(&mut buffer);
        let mut sent_any_ack_eliciting = false;
        let mut levels = Vec::new();

        for packet in staged {
            let space_index = Self::space_index(packet.level);
            let packet_start = encoder.len();

            let (pn, truncated) = {
                let space = self.spaces[space_index].as_ref()?;
                let pn = space.next_packet_number();
                (pn, pn.truncate_fixed())
            };

            let payload_len = packet.payload.len() + TAG_LEN;
            let dcid = *self.peer_cids.active();

            let pn_offset = match packet.level {
                Level::OneRtt => packet::short::encode_header(
                    &mut encoder,
                    false,
                    self.keys.key_phase(),
                    dcid.as_bytes(),
                    truncated,
                ),
                level => {
                    let packet_type = match level {
                        Level::Initial => packet::long::Type::Initial,
                        Level::Handshake => packet::long::Type::Handshake,
                        _ => packet::long::Type::ZeroRtt,
                    };
                    let token = if matches!(level, Level::Initial) {
                        self.address_token.as_ref().map(|token| token.as_bytes().to_vec())
                    } else {
                        None
                    };
                    let scid_bytes: Vec<u8> = self
                        .local_cids
                        .ids()
                        .next()
                        .expect("at least the handshake id exists")
                        .as_bytes()
                        .to_vec();
                    packet::long::encode_header(
                        &mut encoder,
                        packet_type,
                        self.cfg.version,
                        dcid.as_bytes(),
                        &scid_bytes,
                        token.as_deref(),
                        truncated,
                        payload_len,
                    )
                }
            };

            encoder.write_slice(&packet.payload);
            encoder.write_repeated(TAG_LEN, 0);
            let packet_end = encoder.len();

            {
                let keys = self
                    .keys
                    .send_keys(packet.level)
                    .expect("caller checked send readiness");
                packet::seal(
                    &*keys.header_key,
                    &*keys.key,
                    pn,
                    &mut encoder.as_mut_slice()[packet_start..packet_end],
                    pn_offset - packet_start,
                    truncated.len(),
                )
                .ok()?;
            }

            // commit the packet to the ledger and its plans to their owners
            let info = SentPacketInfo {
                time_sent: now,
                sent_bytes: (packet_end - packet_start) as u16,
                ack_eliciting: packet.ack_eliciting,
                in_flight: packet.in_flight,
                data: packet.plans.clone(),
            };
            {
                let space = self.spaces[space_index].as_mut()?;
                let committed = space.on_packet_sent(info);
                debug_assert_eq!(committed, pn);
            }
            for plan in &packet.plans {
                self.commit_plan(packet.level, pn, plan);
            }

            if packet.in_flight {
                self.cc
                    .on_packet_sent(now, packet_end - packet_start, &self.rtt);
            }
            if packet.ack_eliciting {
                sent_any_ack_eliciting = true;
            }
            levels.push(packet.level);
        }

        let total = encoder.len();
        buffer.truncate(total);

        let rate = self.cc.pacing_rate(&self.rtt);
        self.pacer
            .on_packet_sent(now, total, rate, self.mss() as u16);

        if let Some(path) = self.paths.get_mut(path_id) {
            path.on_bytes_transmitted(total);
        }

        for level in levels {
            if sent_any_ack_eliciting {
                self.rearm_pto(level, now);
            }

            //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
            //# Thus, a client MUST discard Initial keys when it first sends a
            //# Handshake packet
            if level == Level::Handshake && self.cfg.endpoint_type.is_client() {
                self.discard_space(Level::Initial);
            }
        }

        Some(Datagram {
            local,
            peer,
            ecn: ExplicitCongestionNotification::NotEct,
            payload: buffer,
        })
    }

    fn packet_overhead(&self, level: Level) -> usize {
        header_overhead(
            level,
            self.peer_cids.active().len(),
            wren_quic_core::connection::id::LOCAL_LEN,
            self.address_token.as_ref().map_or(0, |t| t.len()),
        )
    }

    /// Records the committed packet number with plan owners that track
    /// delivery per packet
    fn commit_plan(&mut self, level: Level, pn: wren_quic_core::packet::number::PacketNumber, plan: &Plan) {
        match plan {
            Plan::MaxData => self.in_flow.sync().on_transmit(pn),
            Plan::MaxStreamData { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(recv) = &mut stream.recv {
                        recv.max_stream_data_sync().on_transmit(pn);
                    }
                }
            }
            Plan::MaxStreams { stream_type } => {
                self.streams.max_streams_sync(*stream_type).on_transmit(pn);
            }
            Plan::DataBlocked => self.out_flow.blocked_sync().on_transmit(pn),
            Plan::StreamDataBlocked { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.blocked_sync().on_transmit(pn);
                    }
                }
            }
            Plan::StreamsBlocked { stream_type } => {
                self.streams.blocked_sync(*stream_type).on_transmit(pn);
            }
            Plan::ResetStream { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = &mut stream.send {
                        send.reset_sync().on_transmit(pn);
                    }
                }
            }
            Plan::StopSending { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(recv) = &mut stream.recv {
                        recv.stop_sending_sync().on_transmit(pn);
                    }
                }
            }
            Plan::HandshakeDone => self.handshake_done_sync.on_transmit(pn),
            Plan::NewToken => self.new_token_sync.on_transmit(pn),
            Plan::NewConnectionId { sequence } => {
                self.local_cids.on_transmit(*sequence, pn);
            }
            Plan::RetireConnectionId { sequence } => {
                self.peer_cids.on_transmit(*sequence, pn);
            }
            Plan::Stream { .. }
            | Plan::Crypto { .. }
            | Plan::Ack { .. }
            | Plan::MtuProbe { .. }
            | Plan::Ping
            | Plan::PathChallenge
            | Plan::PathResponse
            | Plan::Datagram => {
                let _ = level;
            }
        }
    }
}
