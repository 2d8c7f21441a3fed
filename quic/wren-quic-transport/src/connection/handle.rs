// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The application-facing connection handle
//!
//! A connection is guarded by one mutex. Ingress that observes the lock
//! contended appends the datagram to a backlog; timer callbacks set a
//! deferred bit; whoever holds the lock drains both before releasing it.
//! Application operations are poll-style: `Ready` or `Pending` with a
//! registered waker, which cancellation simply never wakes.

use super::{Connection, Datagram};
use bytes::Bytes;
use core::task::{Poll, Waker};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::collections::VecDeque;
use wren_quic_core::{
    connection::{self, ConnectionId},
    event::Event,
    inet::SocketAddress,
    stream::{StreamId, StreamType},
    time::Timestamp,
    varint::VarInt,
};

/// Flags for [`Handle::poll_send`], mirroring the socket-option contract
#[derive(Clone, Copy, Debug, Default)]
pub struct SendFlags {
    /// Close the stream after this write
    pub fin: bool,
    /// Open a unidirectional stream when creating implicitly
    pub uni: bool,
}

/// What a receive operation yielded
#[derive(Debug)]
pub enum Received {
    /// Stream bytes; `is_fin` marks the end of the stream (EOR)
    Data {
        id: StreamId,
        len: usize,
        is_fin: bool,
    },
    /// The peer reset the stream
    Reset { id: StreamId, error_code: VarInt },
    Event(Event),
    Datagram(Bytes),
}

struct Shared {
    inner: Mutex<Connection>,
    backlog: Mutex<VecDeque<Datagram>>,
    deferred_timeout: AtomicBool,
}

/// A cloneable handle serializing every actor through the connection lock
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub fn new(connection: Connection) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(connection),
                backlog: Mutex::new(VecDeque::new()),
                deferred_timeout: AtomicBool::new(false),
            }),
        }
    }

    /// Runs `f` under the connection lock, draining the backlog and any
    /// deferred timeout before the lock is released.
    pub fn with<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let mut guard = self.shared.inner.lock().expect("connection lock poisoned");
        let result = f(&mut guard);
        self.drain_locked(&mut guard);
        result
    }

    fn drain_locked(&self, conn: &mut Connection) {
        loop {
            let datagrams: Vec<Datagram> = {
                let mut backlog = self.shared.backlog.lock().expect("backlog lock poisoned");
                backlog.drain(..).collect()
            };
            let deferred = self.shared.deferred_timeout.swap(false, Ordering::AcqRel);

            if datagrams.is_empty() && !deferred {
                return;
            }
            for datagram in datagrams {
                conn.on_datagram(datagram);
            }
            if deferred {
                let now = conn.runtime.now();
                conn.on_timeout(now);
            }
        }
    }

    // === data plane entry points ===

    /// Ingress path: processes the datagram, or backlogs it when the
    /// connection is application-busy
    pub fn handle_datagram(&self, datagram: Datagram) {
        match self.shared.inner.try_lock() {
            Ok(mut guard) => {
                guard.on_datagram(datagram);
                self.drain_locked(&mut guard);
            }
            Err(_) => {
                self.shared
                    .backlog
                    .lock()
                    .expect("backlog lock poisoned")
                    .push_back(datagram);
            }
        }
    }

    /// Timer path: fires the timeout, or defers it to the lock holder
    pub fn handle_timeout(&self) {
        match self.shared.inner.try_lock() {
            Ok(mut guard) => {
                let now = guard.runtime.now();
                guard.on_timeout(now);
                self.drain_locked(&mut guard);
            }
            Err(_) => {
                self.shared.deferred_timeout.store(true, Ordering::Release);
            }
        }
    }

    /// Builds the next outbound datagram
    pub fn transmit(&self) -> Option<Datagram> {
        self.with(Connection::transmit)
    }

    /// The earliest armed timer, for the I/O loop
    pub fn next_timer(&self) -> Option<Timestamp> {
        self.with(|conn| conn.next_timer_expiration())
    }

    // === application operations ===

    /// Opens a stream explicitly
    pub fn poll_open_stream(
        &self,
        stream_type: StreamType,
        waker: Option<&Waker>,
    ) -> Poll<Result<StreamId, connection::Error>> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Poll::Ready(Err(error));
            }
            if !conn.keys_ready_for_streams() {
                return Poll::Ready(Err(connection::Error::NotReady));
            }
            match conn.streams.open(stream_type) {
                Ok(id) => {
                    conn.active_stream = Some(id);
                    Poll::Ready(Ok(id))
                }
                Err(connection::Error::WouldBlock) => {
                    if let Some(waker) = waker {
                        conn.send_waker = Some(waker.clone());
                    }
                    Poll::Pending
                }
                Err(error) => Poll::Ready(Err(error)),
            }
        })
    }

    /// Writes stream data; `id: None` targets the active stream, opening
    /// one implicitly when necessary
    pub fn poll_send(
        &self,
        id: Option<StreamId>,
        data: &[u8],
        flags: SendFlags,
        waker: Option<&Waker>,
    ) -> Poll<Result<usize, connection::Error>> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Poll::Ready(Err(error));
            }

            // an explicit id must name a live stream; the implicit target
            // falls back to a fresh stream once the previous one finished
            let resolved = match id {
                Some(id) => Some(id),
                None => conn.active_stream.filter(|id| {
                    conn.streams
                        .get(*id)
                        .and_then(|s| s.send.as_ref())
                        .map_or(false, |send| send.is_writable())
                }),
            };

            let id = match resolved {
                Some(id) => id,
                None => {
                    if !conn.keys_ready_for_streams() {
                        return Poll::Ready(Err(connection::Error::NotReady));
                    }
                    let stream_type = if flags.uni {
                        StreamType::Unidirectional
                    } else {
                        StreamType::Bidirectional
                    };
                    match conn.streams.open(stream_type) {
                        Ok(id) => {
                            conn.active_stream = Some(id);
                            id
                        }
                        Err(connection::Error::WouldBlock) => {
                            if let Some(waker) = waker {
                                conn.send_waker = Some(waker.clone());
                            }
                            return Poll::Pending;
                        }
                        Err(error) => return Poll::Ready(Err(error)),
                    }
                }
            };

            let Some(stream) = conn.streams.get(id) else {
                return Poll::Ready(Err(connection::Error::InvalidArgument));
            };
            let Some(send) = &mut stream.send else {
                return Poll::Ready(Err(connection::Error::InvalidArgument));
            };

            match send.write(data, flags.fin) {
                Ok(accepted) => {
                    if id.stream_type().is_bidirectional() || !flags.fin {
                        conn.active_stream = Some(id);
                    }
                    Poll::Ready(Ok(accepted))
                }
                Err(connection::Error::WouldBlock) => {
                    if let Some(waker) = waker {
                        conn.send_waker = Some(waker.clone());
                    }
                    Poll::Pending
                }
                Err(error) => Poll::Ready(Err(error)),
            }
        })
    }

    /// Queues an unreliable datagram
    //= https://www.rfc-editor.org/rfc/rfc9221#section-5
    //# DATAGRAM frames cannot be fragmented; therefore, application
    //# protocols need to handle cases where the maximum datagram size is
    //# limited by other factors.
    pub fn send_datagram(&self, data: Bytes) -> Result<(), connection::Error> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Err(error);
            }
            let limit = conn
                .peer_params
                .as_ref()
                .map(|params| params.max_datagram_frame_size.as_u64())
                .unwrap_or(0);
            if limit == 0 {
                return Err(connection::Error::Unsupported);
            }
            // frame overhead: tag + length prefix
            if data.len() as u64 + 5 > limit {
                return Err(connection::Error::InvalidArgument);
            }
            conn.datagram_tx.push_back(data);
            Ok(())
        })
    }

    /// Receives the next event, stream chunk or datagram, in that order
    pub fn poll_recv(
        &self,
        buf: &mut [u8],
        waker: Option<&Waker>,
    ) -> Poll<Result<Received, connection::Error>> {
        self.with(|conn| {
            // events are delivered ahead of data
            if let Some(event) = conn.pop_event() {
                return Poll::Ready(Ok(Received::Event(event)));
            }

            if let Some(id) = conn.streams.next_readable() {
                let result = {
                    let stream = conn.streams.get(id).expect("readable stream exists");
                    let recv = stream.recv.as_mut().expect("readable implies receive half");
                    recv.read(buf, &mut conn.in_flow)
                };
                conn.streams.cleanup(id);
                return match result {
                    Ok((len, is_fin)) => Poll::Ready(Ok(Received::Data { id, len, is_fin })),
                    Err(connection::Error::StreamReset(error_code)) => {
                        Poll::Ready(Ok(Received::Reset { id, error_code }))
                    }
                    Err(error) => Poll::Ready(Err(error)),
                };
            }

            if let Some(datagram) = conn.pop_datagram() {
                return Poll::Ready(Ok(Received::Datagram(datagram)));
            }

            if let Some(error) = conn.error {
                return Poll::Ready(Err(error));
            }

            if let Some(waker) = waker {
                conn.recv_waker = Some(waker.clone());
            }
            Poll::Pending
        })
    }

    // === options (the enumerated socket-option surface) ===

    pub fn close(&self, error_code: VarInt, phrase: &[u8]) {
        self.with(|conn| conn.close(error_code, phrase));
    }

    pub fn reset_stream(&self, id: StreamId, error_code: VarInt) -> Result<(), connection::Error> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Err(error);
            }
            let stream = conn
                .streams
                .get(id)
                .ok_or(connection::Error::InvalidArgument)?;
            let send = stream
                .send
                .as_mut()
                .ok_or(connection::Error::InvalidArgument)?;
            send.reset(error_code);
            Ok(())
        })
    }

    pub fn stop_sending(&self, id: StreamId, error_code: VarInt) -> Result<(), connection::Error> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Err(error);
            }
            let stream = conn
                .streams
                .get(id)
                .ok_or(connection::Error::InvalidArgument)?;
            let recv = stream
                .recv
                .as_mut()
                .ok_or(connection::Error::InvalidArgument)?;
            recv.stop_sending(error_code);
            Ok(())
        })
    }

    /// Migrates to a new local address (client side)
    pub fn migrate(&self, new_local: SocketAddress) -> Result<(), connection::Error> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Err(error);
            }
            if !conn.handshake_confirmed {
                return Err(connection::Error::NotReady);
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-9
            //# An endpoint MUST NOT initiate connection migration if the peer
            //# sent the disable_active_migration transport parameter
            let peer_disabled = conn
                .peer_params
                .as_ref()
                .map_or(false, |params| params.disable_active_migration);

            let runtime = conn.runtime.clone();
            conn.paths.migrate(new_local, peer_disabled, &runtime)?;

            // a fresh destination id keeps the new path unlinkable
            let _ = conn.peer_cids.rotate_active();
            Ok(())
        })
    }

    /// Rotates to a fresh destination connection id, retiring the current
    /// one
    pub fn retire_connection_id(&self) -> Result<(), connection::Error> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Err(error);
            }
            conn.peer_cids
                .rotate_active()
                .map(|_| ())
                .ok_or(connection::Error::NotReady)
        })
    }

    /// Initiates a 1-RTT key update
    pub fn key_update(&self) -> Result<(), connection::Error> {
        self.with(|conn| {
            if let Some(error) = conn.error {
                return Err(error);
            }
            if !conn.handshake_confirmed || !conn.keys.can_update_keys() {
                return Err(connection::Error::NotReady);
            }
            let phase = conn.keys.update_keys().expect("staged keys were checked");
            conn.emit_event(Event::KeyUpdate { phase });
            Ok(())
        })
    }

    pub fn set_event_mask(&self, mask: wren_quic_core::event::Mask) {
        self.with(|conn| conn.cfg.event_mask = mask);
    }

    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.with(|conn| conn.alpn.clone())
    }

    pub fn session_ticket(&self) -> Option<wren_quic_core::token::SessionTicket> {
        self.with(|conn| conn.session_ticket.clone())
    }

    pub fn address_token(&self) -> Option<wren_quic_core::token::AddressToken> {
        self.with(|conn| conn.address_token.clone())
    }

    pub fn local_params(&self) -> wren_quic_core::transport::parameters::TransportParameters {
        self.with(|conn| conn.cfg.local_params.clone())
    }

    pub fn peer_params(
        &self,
    ) -> Option<wren_quic_core::transport::parameters::TransportParameters> {
        self.with(|conn| conn.peer_params.clone())
    }

    /// The destination connection id in use on the active path
    pub fn active_connection_id(&self) -> ConnectionId {
        self.with(|conn| *conn.peer_cids.active())
    }

    pub fn is_open(&self) -> bool {
        self.with(|conn| conn.is_open())
    }

    pub fn state(&self) -> super::State {
        self.with(|conn| conn.state())
    }
}

impl Connection {
    /// Stream opens require 1-RTT send keys, or 0-RTT when resuming
    //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
    //# An endpoint cannot send data on streams before the handshake
    //# provides keys for the level the data is sent at.
    pub(crate) fn keys_ready_for_streams(&self) -> bool {
        self.keys.send_ready(wren_quic_core::crypto::Level::OneRtt)
            || self.keys.send_ready(wren_quic_core::crypto::Level::ZeroRtt)
    }
}
