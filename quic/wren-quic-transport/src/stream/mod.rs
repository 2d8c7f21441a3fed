// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The stream table: id allocation, implicit opens, per-stream machines
//! and the stream-count limits

pub mod recv;
pub mod send;

pub use recv::ReceiveStream;
pub use send::SendStream;

use crate::sync::{IncomingFlowController, ValueSync};
use std::collections::BTreeMap;
use wren_quic_core::{
    connection, endpoint,
    event::Event,
    frame,
    stream::{StreamId, StreamType},
    transmission,
    transport,
    transport_error,
    varint::VarInt,
};

/// The per-direction limits taken from transport parameters
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_stream_data_bidi_local: VarInt,
    pub max_stream_data_bidi_remote: VarInt,
    pub max_stream_data_uni: VarInt,
    pub max_streams_bidi: VarInt,
    pub max_streams_uni: VarInt,
}

impl Limits {
    pub fn from_params(params: &transport::parameters::TransportParameters) -> Self {
        Self {
            max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: params.initial_max_stream_data_uni,
            max_streams_bidi: params.initial_max_streams_bidi,
            max_streams_uni: params.initial_max_streams_uni,
        }
    }
}

pub struct Stream {
    pub send: Option<SendStream>,
    pub recv: Option<ReceiveStream>,
}

impl Stream {
    fn is_closed(&self) -> bool {
        self.send.as_ref().map_or(true, SendStream::is_terminal)
            && self.recv.as_ref().map_or(true, ReceiveStream::is_terminal)
    }
}

pub struct Manager {
    local: endpoint::Type,
    /// Limits we advertised (govern receiving)
    local_limits: Limits,
    /// Limits the peer advertised (govern sending)
    peer_limits: Limits,

    streams: BTreeMap<u64, Stream>,

    /// Next ordinal to allocate per local stream type
    next_ordinal: Allocator,
    /// Highest ordinal the peer has opened, per type
    peer_opened: Allocator,
    /// Streams of the peer's types that were fully closed; drives the
    /// MAX_STREAMS window forward
    peer_closed: Allocator,

    /// MAX_STREAMS grants to the peer
    max_streams_sync: [ValueSync; 2],
    /// STREAMS_BLOCKED reports toward the peer
    blocked_sync: [ValueSync; 2],
}

#[derive(Debug, Default)]
struct Allocator {
    bidi: u64,
    uni: u64,
}

impl Allocator {
    fn get(&self, stream_type: StreamType) -> u64 {
        match stream_type {
            StreamType::Bidirectional => self.bidi,
            StreamType::Unidirectional => self.uni,
        }
    }

    fn get_mut(&mut self, stream_type: StreamType) -> &mut u64 {
        match stream_type {
            StreamType::Bidirectional => &mut self.bidi,
            StreamType::Unidirectional => &mut self.uni,
        }
    }
}

fn type_index(stream_type: StreamType) -> usize {
    match stream_type {
        StreamType::Bidirectional => 0,
        StreamType::Unidirectional => 1,
    }
}

impl Manager {
    pub fn new(local: endpoint::Type, local_limits: Limits, peer_limits: Limits) -> Self {
        Self {
            local,
            local_limits,
            peer_limits,
            streams: BTreeMap::new(),
            next_ordinal: Allocator::default(),
            peer_opened: Allocator::default(),
            peer_closed: Allocator::default(),
            max_streams_sync: [
                ValueSync::new(local_limits.max_streams_bidi),
                ValueSync::new(local_limits.max_streams_uni),
            ],
            blocked_sync: [ValueSync::default(), ValueSync::default()],
        }
    }

    /// Updates the send-side limits once the peer's transport parameters
    /// arrive
    pub fn on_peer_limits(&mut self, peer_limits: Limits) {
        self.peer_limits = peer_limits;
        for stream in self.streams.values_mut() {
            if let Some(send) = &mut stream.send {
                let limit = match (send.id().stream_type(), send.id().initiator() == self.local) {
                    (StreamType::Unidirectional, _) => peer_limits.max_stream_data_uni,
                    // our sending half of a bidi stream is the peer's
                    // "remote" direction when we initiated it
                    (StreamType::Bidirectional, true) => peer_limits.max_stream_data_bidi_remote,
                    (StreamType::Bidirectional, false) => peer_limits.max_stream_data_bidi_local,
                };
                send.on_max_stream_data(limit);
            }
        }
    }

    /// Opens a locally initiated stream
    pub fn open(&mut self, stream_type: StreamType) -> Result<StreamId, connection::Error> {
        let ordinal = self.next_ordinal.get(stream_type);
        let limit = match stream_type {
            StreamType::Bidirectional => self.peer_limits.max_streams_bidi,
            StreamType::Unidirectional => self.peer_limits.max_streams_uni,
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint that is unable to open a new stream due to the peer's
        //# limits SHOULD send a STREAMS_BLOCKED frame (Section 19.14).
        if ordinal >= limit.as_u64() {
            self.blocked_sync[type_index(stream_type)].request_delivery(limit);
            return Err(connection::Error::WouldBlock);
        }

        let id = StreamId::nth(self.local, stream_type, ordinal)
            .ok_or(connection::Error::InvalidArgument)?;
        *self.next_ordinal.get_mut(stream_type) = ordinal + 1;

        let send_limit = match stream_type {
            StreamType::Bidirectional => self.peer_limits.max_stream_data_bidi_remote,
            StreamType::Unidirectional => self.peer_limits.max_stream_data_uni,
        };

        let recv = match stream_type {
            StreamType::Bidirectional => Some(ReceiveStream::new(
                id,
                self.local_limits.max_stream_data_bidi_local,
            )),
            StreamType::Unidirectional => None,
        };

        self.streams.insert(
            id.as_varint().as_u64(),
            Stream {
                send: Some(SendStream::new(id, send_limit)),
                recv,
            },
        );

        Ok(id)
    }

    /// Looks up a stream for a peer frame, implicitly opening peer streams
    /// within the advertised limits.
    ///
    /// `Ok(None)` means the stream lived and was already closed; frames for
    /// it (retransmissions, late duplicates) are silently ignored.
    pub fn get_or_open(
        &mut self,
        id: StreamId,
        for_receive: bool,
    ) -> Result<Option<&mut Stream>, transport::Error> {
        let key = id.as_varint().as_u64();

        if for_receive && !id.is_receivable(self.local) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
            //# An endpoint MUST terminate the connection with error
            //# STREAM_STATE_ERROR if it receives a STREAM frame for a locally
            //# initiated stream that has not yet been created, or for a send-only
            //# stream.
            return Err(transport_error!(
                STREAM_STATE_ERROR,
                "stream frame on a send-only stream"
            ));
        }

        if id.initiator() == self.local {
            // a frame for a local stream we never opened is a protocol error
            if id.ordinal() >= self.next_ordinal.get(id.stream_type()) {
                return Err(transport_error!(
                    STREAM_STATE_ERROR,
                    "frame for an unopened local stream"
                ));
            }
            if !self.streams.contains_key(&key) {
                // opened once, fully closed since
                return Ok(None);
            }
        } else {
            let granted = self.max_streams_sync[type_index(id.stream_type())].value();

            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
            //# An endpoint
            //# that receives a frame with a stream ID exceeding the limit it has
            //# sent MUST treat this as a connection error of type
            //# STREAM_LIMIT_ERROR
            if id.ordinal() >= granted.as_u64() {
                return Err(transport_error!(
                    STREAM_LIMIT_ERROR,
                    "peer exceeded the stream limit"
                ));
            }

            let opened = self.peer_opened.get(id.stream_type());
            if id.ordinal() < opened {
                if !self.streams.contains_key(&key) {
                    // the peer already opened and closed this stream; late
                    // retransmissions are dropped
                    return Ok(None);
                }
            } else {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
                //# A stream ID that is used out of order results in all
                //# streams of that type with lower-numbered stream IDs also
                //# being opened.
                for ordinal in opened..=id.ordinal() {
                    let implicit = StreamId::nth(id.initiator(), id.stream_type(), ordinal)
                        .expect("ordinals below the limit are representable");
                    self.insert_peer_stream(implicit);
                }
                *self.peer_opened.get_mut(id.stream_type()) = id.ordinal() + 1;
            }
        }

        Ok(self.streams.get_mut(&key))
    }

    fn insert_peer_stream(&mut self, id: StreamId) {
        let local = self.local;
        let local_limits = self.local_limits;
        let peer_limits = self.peer_limits;

        self.streams.entry(id.as_varint().as_u64()).or_insert_with(|| {
            let recv = id.is_receivable(local).then(|| {
                let limit = match id.stream_type() {
                    StreamType::Unidirectional => local_limits.max_stream_data_uni,
                    StreamType::Bidirectional => local_limits.max_stream_data_bidi_remote,
                };
                ReceiveStream::new(id, limit)
            });
            let send = id.is_sendable(local).then(|| {
                let limit = match id.stream_type() {
                    StreamType::Unidirectional => peer_limits.max_stream_data_uni,
                    StreamType::Bidirectional => peer_limits.max_stream_data_bidi_local,
                };
                SendStream::new(id, limit)
            });
            Stream { send, recv }
        });
    }

    #[inline]
    pub fn get(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id.as_varint().as_u64())
    }

    /// Processes a STREAM frame, producing events for the application
    pub fn on_stream_frame(
        &mut self,
        frame: &frame::Stream<&[u8]>,
        connection_flow: &mut IncomingFlowController,
    ) -> Result<recv::Outcome, transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        let Some(stream) = self.get_or_open(id, true)? else {
            return Ok(recv::Outcome::default());
        };
        let recv = stream.recv.as_mut().expect("receivable checked above");
        let outcome = recv.on_stream_frame(frame, connection_flow)?;
        self.cleanup(id);
        Ok(outcome)
    }

    pub fn on_reset_stream_frame(
        &mut self,
        frame: &frame::ResetStream,
        connection_flow: &mut IncomingFlowController,
    ) -> Result<recv::Outcome, transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        let Some(stream) = self.get_or_open(id, true)? else {
            return Ok(recv::Outcome::default());
        };
        let recv = stream.recv.as_mut().expect("receivable checked above");
        let outcome = recv.on_reset(frame, connection_flow)?;
        Ok(outcome)
    }

    pub fn on_stop_sending_frame(
        &mut self,
        frame: &frame::StopSending,
    ) -> Result<(), transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        if !id.is_sendable(self.local) {
            return Err(transport_error!(
                STREAM_STATE_ERROR,
                "stop_sending on a receive-only stream"
            ));
        }
        let Some(stream) = self.get_or_open(id, false)? else {
            return Ok(());
        };
        if let Some(send) = &mut stream.send {
            send.on_stop_sending(frame.application_error_code);
        }
        Ok(())
    }

    pub fn on_max_stream_data_frame(
        &mut self,
        frame: &frame::MaxStreamData,
    ) -> Result<(), transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        if !id.is_sendable(self.local) {
            return Err(transport_error!(
                STREAM_STATE_ERROR,
                "max_stream_data for a receive-only stream"
            ));
        }
        let Some(stream) = self.get_or_open(id, false)? else {
            return Ok(());
        };
        if let Some(send) = &mut stream.send {
            send.on_max_stream_data(frame.maximum_stream_data);
        }
        Ok(())
    }

    /// Processes MAX_STREAMS, returning an event when the limit moved
    pub fn on_max_streams_frame(&mut self, frame: &frame::MaxStreams) -> Option<Event> {
        let limit = match frame.stream_type {
            StreamType::Bidirectional => &mut self.peer_limits.max_streams_bidi,
            StreamType::Unidirectional => &mut self.peer_limits.max_streams_uni,
        };
        if frame.maximum_streams <= *limit {
            return None;
        }
        *limit = frame.maximum_streams;

        Some(Event::MaxStreams {
            stream_type: frame.stream_type,
            maximum: frame.maximum_streams,
        })
    }

    /// A STREAMS_BLOCKED report from the peer; the limit sync re-announces
    /// the current value so a lost MAX_STREAMS is recovered promptly
    pub fn on_streams_blocked_frame(&mut self, frame: &frame::StreamsBlocked) {
        let index = type_index(frame.stream_type);
        let current = self.max_streams_sync[index].value();
        if frame.stream_limit < current {
            self.max_streams_sync[index].request_delivery(current);
        }
    }

    /// Removes fully closed streams and advances the peer's stream-count
    /// window
    pub fn cleanup(&mut self, id: StreamId) {
        let key = id.as_varint().as_u64();
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        if !stream.is_closed() {
            return;
        }
        self.streams.remove(&key);

        if id.initiator() != self.local {
            let closed = self.peer_closed.get_mut(id.stream_type());
            *closed += 1;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
            //# Endpoints that want to
            //# continue accepting streams SHOULD update the limit as streams are
            //# closed
            let index = type_index(id.stream_type());
            let initial = match id.stream_type() {
                StreamType::Bidirectional => self.local_limits.max_streams_bidi,
                StreamType::Unidirectional => self.local_limits.max_streams_uni,
            };
            let target = initial.saturating_add(
                VarInt::new(*closed).expect("closed count is bounded by the stream space"),
            );
            self.max_streams_sync[index].request_delivery(target);
        }
    }

    #[inline]
    pub fn max_streams_sync(&mut self, stream_type: StreamType) -> &mut ValueSync {
        &mut self.max_streams_sync[type_index(stream_type)]
    }

    #[inline]
    pub fn blocked_sync(&mut self, stream_type: StreamType) -> &mut ValueSync {
        &mut self.blocked_sync[type_index(stream_type)]
    }

    /// The lowest-id stream with readable data, a FIN or a reset
    pub fn next_readable(&self) -> Option<StreamId> {
        self.streams.iter().find_map(|(key, stream)| {
            let recv = stream.recv.as_ref()?;
            recv.is_readable()
                .then(|| StreamId::from_varint(unsafe { VarInt::new_unchecked(*key) }))
        })
    }

    /// Iterates streams in id order for the packet builder
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams
            .keys()
            .map(|key| StreamId::from_varint(unsafe { VarInt::new_unchecked(*key) }))
            .collect()
    }

    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        for sync in &self.max_streams_sync {
            sync.transmission_interest(interest);
        }
        for sync in &self.blocked_sync {
            sync.transmission_interest(interest);
        }
        for stream in self.streams.values() {
            if let Some(send) = &stream.send {
                send.transmission_interest(interest);
            }
            if let Some(recv) = &stream.recv {
                recv.transmission_interest(interest);
            }
        }
    }

    /// Wakes every stream with the sticky connection error by dropping all
    /// state; callers report the error to the application
    pub fn on_close(&mut self) {
        self.streams.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_streams: u32) -> Limits {
        Limits {
            max_stream_data_bidi_local: VarInt::from_u32(10_000),
            max_stream_data_bidi_remote: VarInt::from_u32(10_000),
            max_stream_data_uni: VarInt::from_u32(10_000),
            max_streams_bidi: VarInt::from_u32(max_streams),
            max_streams_uni: VarInt::from_u32(max_streams),
        }
    }

    fn manager() -> Manager {
        Manager::new(endpoint::Type::Client, limits(100), limits(2))
    }

    #[test]
    fn open_allocates_in_order_test() {
        let mut manager = manager();

        let a = manager.open(StreamType::Bidirectional).unwrap();
        let b = manager.open(StreamType::Bidirectional).unwrap();
        assert_eq!(a.as_varint().as_u64(), 0);
        assert_eq!(b.as_varint().as_u64(), 4);

        let uni = manager.open(StreamType::Unidirectional).unwrap();
        assert_eq!(uni.as_varint().as_u64(), 2);
    }

    #[test]
    fn open_respects_peer_limit_test() {
        let mut manager = manager();

        manager.open(StreamType::Bidirectional).unwrap();
        manager.open(StreamType::Bidirectional).unwrap();

        // the peer only allowed two
        let error = manager.open(StreamType::Bidirectional).unwrap_err();
        assert_eq!(error, connection::Error::WouldBlock);
        assert!(manager
            .blocked_sync(StreamType::Bidirectional)
            .transmission_value()
            .is_some());

        // a MAX_STREAMS grant unblocks
        let event = manager.on_max_streams_frame(&frame::MaxStreams {
            stream_type: StreamType::Bidirectional,
            maximum_streams: VarInt::from_u32(3),
        });
        assert!(event.is_some());
        assert!(manager.open(StreamType::Bidirectional).is_ok());
    }

    #[test]
    fn peer_stream_limit_test() {
        let mut manager = manager();
        let mut fc = IncomingFlowController::new(VarInt::from_u32(100_000));

        // the peer may open up to 100 streams; stream id 1 is server bidi 0
        let frame = frame::Stream {
            stream_id: VarInt::from_u8(1),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: false,
            data: &b"hi"[..],
        };
        manager.on_stream_frame(&frame, &mut fc).unwrap();
        assert_eq!(manager.len(), 1);

        // ordinal 100 (id 401) exceeds the grant
        let frame = frame::Stream {
            stream_id: VarInt::from_u32(401),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: false,
            data: &b"hi"[..],
        };
        let error = manager.on_stream_frame(&frame, &mut fc).unwrap_err();
        assert_eq!(error.code, transport::Error::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn send_only_stream_rejects_data_test() {
        let mut manager = manager();
        let mut fc = IncomingFlowController::new(VarInt::from_u32(100_000));

        // stream id 2 is a client (local) unidirectional stream
        let frame = frame::Stream {
            stream_id: VarInt::from_u8(2),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: false,
            data: &b"hi"[..],
        };
        let error = manager.on_stream_frame(&frame, &mut fc).unwrap_err();
        assert_eq!(error.code, transport::Error::STREAM_STATE_ERROR);
    }

    #[test]
    fn closed_peer_stream_raises_limit_test() {
        let mut manager = manager();
        let mut fc = IncomingFlowController::new(VarInt::from_u32(100_000));

        // peer uni stream 3 delivers everything and is read to completion
        let frame = frame::Stream {
            stream_id: VarInt::from_u8(3),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: true,
            data: &b"bye"[..],
        };
        manager.on_stream_frame(&frame, &mut fc).unwrap();

        let id = StreamId::from_varint(VarInt::from_u8(3));
        let stream = manager.get(id).unwrap();
        let mut buf = [0u8; 8];
        let (len, fin) = stream
            .recv
            .as_mut()
            .unwrap()
            .read(&mut buf, &mut fc)
            .unwrap();
        assert_eq!((len, fin), (3, true));

        manager.cleanup(id);
        assert!(manager.is_empty());

        // the window moved by one
        let value = manager
            .max_streams_sync(StreamType::Unidirectional)
            .transmission_value()
            .unwrap();
        assert_eq!(value, VarInt::from_u32(101));
    }
}
