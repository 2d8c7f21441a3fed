// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios over an in-memory network with the null crypto
//! suite and the toy handshake

use crate::{
    connection::{handle::Received, handle::SendFlags, Datagram, Handle, State},
    endpoint::{Endpoint, SessionFactory},
    runtime, tls,
};
use core::time::Duration;
use wren_quic_core::{
    ack,
    connection::Error,
    endpoint,
    event::{Event, Mask, StreamUpdateKind},
    inet::SocketAddress,
    packet,
    recovery::CongestionController as _,
    time,
    varint::VarInt,
};

struct TestSessions;

impl SessionFactory for TestSessions {
    fn new_session(
        &mut self,
        endpoint: endpoint::Type,
        local_params: Vec<u8>,
    ) -> Box<dyn tls::Session> {
        Box::new(tls::testing::Session::new(endpoint, local_params))
    }
}

fn addr(port: u16) -> SocketAddress {
    SocketAddress::V4 {
        ip: [10, 0, 0, 1],
        port,
    }
}

fn config(initial_max_data: u64) -> crate::connection::Config {
    let mut local_params =
        wren_quic_core::transport::parameters::TransportParameters::default();
    local_params.initial_max_data = VarInt::new(initial_max_data).unwrap();
    local_params.max_datagram_frame_size = VarInt::new(65535).unwrap();
    let stream_window = VarInt::new(initial_max_data.min(1 << 20)).unwrap();
    local_params.initial_max_stream_data_bidi_local = stream_window;
    local_params.initial_max_stream_data_bidi_remote = stream_window;
    local_params.initial_max_stream_data_uni = stream_window;

    crate::connection::Config {
        endpoint_type: endpoint::Type::Client,
        local_params,
        ack_settings: ack::Settings::RECOMMENDED,
        event_mask: Mask::ALL,
        version: packet::VERSION_V1,
    }
}

struct Pair {
    clock: time::testing::Clock,
    client_ep: Endpoint,
    server_ep: Endpoint,
    client: Handle,
    server: Option<Handle>,
    /// Drops client->server datagrams while set
    drop_client_tx: bool,
}

impl Pair {
    fn new() -> Self {
        Self::with_limits(u64::MAX / 8, u64::MAX / 8)
    }

    fn with_limits(client_max_data: u64, server_max_data: u64) -> Self {
        let clock = time::testing::Clock::default();

        let mut client_cfg = config(client_max_data);
        client_cfg.endpoint_type = endpoint::Type::Client;
        let mut server_cfg = config(server_max_data);
        server_cfg.endpoint_type = endpoint::Type::Server;

        let mut client_ep = Endpoint::new(
            endpoint::Type::Client,
            addr(1000),
            client_cfg,
            Box::new(TestSessions),
            runtime::testing::runtime(clock.clone()),
        );
        let server_ep = Endpoint::new(
            endpoint::Type::Server,
            addr(443),
            server_cfg,
            Box::new(TestSessions),
            runtime::testing::runtime(clock.clone()),
        );

        let client = client_ep.connect(addr(443)).unwrap();

        Self {
            clock,
            client_ep,
            server_ep,
            client,
            server: None,
            drop_client_tx: false,
        }
    }

    /// A datagram leaves the sender addressed (local, peer) and arrives at
    /// the receiver with the pair flipped
    fn deliver(datagram: Datagram) -> Datagram {
        Datagram {
            local: datagram.peer,
            peer: datagram.local,
            ecn: datagram.ecn,
            payload: datagram.payload,
        }
    }

    /// Exchanges datagrams until the network is quiet, advancing the clock
    /// between rounds so delayed ACK and pacing timers fire.
    fn drive(&mut self, rounds: usize) {
        for _ in 0..rounds {
            let mut progressed = false;

            while let Some(datagram) = self.client_ep.poll_transmit() {
                progressed = true;
                if !self.drop_client_tx {
                    self.server_ep.handle_datagram(Self::deliver(datagram));
                }
            }
            if self.server.is_none() {
                self.server = self.server_ep.accept();
            }
            while let Some(datagram) = self.server_ep.poll_transmit() {
                progressed = true;
                self.client_ep.handle_datagram(Self::deliver(datagram));
            }

            self.clock.inc_by(Duration::from_millis(5));
            self.client_ep.handle_timeouts();
            self.server_ep.handle_timeouts();

            if !progressed {
                // let delayed timers produce more work before giving up
                self.clock.inc_by(Duration::from_millis(10));
            }
        }
    }

    fn handshake(&mut self) -> Handle {
        self.drive(40);
        let server = self.server.clone().expect("server accepted a connection");
        assert_eq!(self.client.state(), State::Established);
        assert_eq!(server.state(), State::Established);
        server
    }
}

/// Drains everything readable, separating events from data
fn drain(handle: &Handle) -> (Vec<Event>, Vec<u8>, bool) {
    let mut events = vec![];
    let mut data = vec![];
    let mut saw_fin = false;
    let mut buf = [0u8; 4096];

    loop {
        match handle.poll_recv(&mut buf, None) {
            core::task::Poll::Ready(Ok(Received::Event(event))) => events.push(event),
            core::task::Poll::Ready(Ok(Received::Data { len, is_fin, .. })) => {
                data.extend_from_slice(&buf[..len]);
                saw_fin |= is_fin;
                if is_fin {
                    break;
                }
            }
            core::task::Poll::Ready(Ok(Received::Datagram(_))) => {}
            core::task::Poll::Ready(Ok(Received::Reset { .. })) => break,
            core::task::Poll::Ready(Err(_)) | core::task::Poll::Pending => break,
        }
    }
    (events, data, saw_fin)
}

#[test]
fn handshake_and_echo_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    assert_eq!(pair.client.alpn().as_deref(), Some(&b"wren-test"[..]));
    assert_eq!(server.alpn().as_deref(), Some(&b"wren-test"[..]));

    // client writes "hello" with FIN
    let sent = pair
        .client
        .poll_send(None, b"hello", SendFlags { fin: true, uni: false }, None);
    assert!(matches!(sent, core::task::Poll::Ready(Ok(5))));
    pair.drive(20);

    // server reads "hello" + EOR and echoes it back on the same stream
    let (events, data, saw_fin) = drain(&server);
    assert_eq!(data, b"hello");
    assert!(saw_fin);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::StreamUpdate {
            kind: StreamUpdateKind::SizeKnown,
            ..
        }
    )));

    let id = events
        .iter()
        .find_map(|event| match event {
            Event::StreamUpdate { id, .. } => Some(*id),
            _ => None,
        })
        .expect("stream events carry the id");

    let echoed = server.poll_send(
        Some(id),
        b"hello",
        SendFlags { fin: true, uni: false },
        None,
    );
    assert!(matches!(echoed, core::task::Poll::Ready(Ok(5))));
    pair.drive(20);

    let (client_events, data, saw_fin) = drain(&pair.client);
    assert_eq!(data, b"hello");
    assert!(saw_fin);

    // both sides observed full acknowledgment of their send
    assert!(client_events.iter().chain(events.iter()).any(|event| matches!(
        event,
        Event::StreamUpdate {
            kind: StreamUpdateKind::DataAcknowledged,
            ..
        }
    )) || {
        let (more, _, _) = drain(&server);
        more.iter().any(|event| matches!(
            event,
            Event::StreamUpdate {
                kind: StreamUpdateKind::DataAcknowledged,
                ..
            }
        ))
    });
}

#[test]
fn idle_timeout_closes_silently_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    // no activity for longer than the 30s idle timeout
    pair.clock.inc_by(Duration::from_secs(31));
    pair.client_ep.handle_timeouts();
    pair.server_ep.handle_timeouts();

    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(server.state(), State::Closed);

    let mut buf = [0u8; 16];
    let result = pair.client.poll_recv(&mut buf, None);
    assert!(matches!(
        result,
        core::task::Poll::Ready(Err(Error::IdleTimeout))
    ));
}

#[test]
fn loss_and_pto_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    // the client's flight disappears for a while
    pair.drop_client_tx = true;
    let sent = pair
        .client
        .poll_send(None, b"lost data", SendFlags { fin: true, uni: false }, None);
    assert!(matches!(sent, core::task::Poll::Ready(Ok(9))));
    pair.drive(5);

    let (_, data, _) = drain(&server);
    assert!(data.is_empty(), "the flight was dropped");

    // the PTO fires and the client probes; once the network heals the
    // retransmission completes the stream
    pair.clock.inc_by(Duration::from_secs(2));
    pair.client_ep.handle_timeouts();
    pair.drop_client_tx = false;
    pair.drive(30);

    let (_, data, saw_fin) = drain(&server);
    assert_eq!(data, b"lost data");
    assert!(saw_fin);
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
//= type=test
//# A sender MUST NOT send data in excess of either limit.
#[test]
fn flow_control_backpressure_test() {
    // the server only grants 1200 bytes of connection credit
    let mut pair = Pair::with_limits(u64::MAX / 8, 1200);
    let server = pair.handshake();

    let payload = vec![0x61u8; 3000];
    let sent = pair.client.poll_send(
        None,
        &payload,
        SendFlags { fin: true, uni: false },
        None,
    );
    assert!(matches!(sent, core::task::Poll::Ready(Ok(3000))));
    pair.drive(20);

    // exactly the credited bytes crossed the wire
    let mut buf = [0u8; 4096];
    let mut received = vec![];
    loop {
        match server.poll_recv(&mut buf, None) {
            core::task::Poll::Ready(Ok(Received::Data { len, .. })) => {
                received.extend_from_slice(&buf[..len]);
            }
            core::task::Poll::Ready(Ok(_)) => {}
            _ => break,
        }
    }
    assert_eq!(received.len(), 1200);

    // consuming the data replenishes the window and the sender finishes
    for _ in 0..100 {
        if received.len() == 3000 {
            break;
        }
        pair.drive(10);
        match server.poll_recv(&mut buf, None) {
            core::task::Poll::Ready(Ok(Received::Data { len, .. })) => {
                received.extend_from_slice(&buf[..len]);
            }
            core::task::Poll::Ready(Ok(_)) => {}
            _ => {}
        }
    }
    assert_eq!(received.len(), 3000);
    assert!(received.iter().all(|byte| *byte == 0x61));
}

#[test]
fn migration_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    // grow the congestion window well past its initial value first
    let bulk = vec![0x42u8; 64 * 1024];
    let sent = pair
        .client
        .poll_send(None, &bulk, SendFlags { fin: true, uni: false }, None);
    assert!(matches!(sent, core::task::Poll::Ready(Ok(_))));
    pair.drive(60);
    let (_, data, _) = drain(&server);
    assert_eq!(data.len(), bulk.len());

    let cwnd_before = pair.client.with(|conn| conn.cc.congestion_window());
    assert!(cwnd_before > 40_000, "slow start grew the window");

    pair.client.migrate(addr(2000)).unwrap();
    pair.drive(30);

    // the client swapped to the new path after the response
    let migrated = pair.client.with(|conn| {
        (
            conn.paths.active().local,
            conn.cc.congestion_window(),
        )
    });
    assert_eq!(migrated.0, addr(2000));

    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.4
    //= type=test
    //# On confirming a peer's ownership of its new address, an endpoint MUST
    //# immediately reset the congestion controller and round-trip time
    //# estimator for the new path to initial values
    assert!(
        migrated.1 < cwnd_before / 2,
        "the window reset to its initial value on migration"
    );

    let (events, _, _) = drain(&pair.client);
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::ConnectionMigration { .. })));

    // the connection still works on the new path
    let sent = pair
        .client
        .poll_send(None, b"after move", SendFlags { fin: true, uni: false }, None);
    assert!(matches!(sent, core::task::Poll::Ready(Ok(10))));
    pair.drive(20);
    let (_, data, _) = drain(&server);
    assert_eq!(data, b"after move");
}

#[test]
fn migration_refused_when_peer_disables_test() {
    let mut pair = Pair::new();
    // patch the peer params the client saw
    pair.handshake();
    pair.client.with(|conn| {
        if let Some(params) = &mut conn.peer_params {
            params.disable_active_migration = true;
        }
    });

    assert_eq!(
        pair.client.migrate(addr(2000)),
        Err(Error::Unsupported)
    );
}

#[test]
fn version_negotiation_test() {
    let mut pair = Pair::new();

    // pretend the server only speaks v2: hand the client a version
    // negotiation packet listing v2 alone
    let first_flight = pair.client_ep.poll_transmit().expect("client first flight");
    let (dcid, scid) = {
        let payload = &first_flight.payload;
        let dcid_len = payload[5] as usize;
        let dcid = payload[6..6 + dcid_len].to_vec();
        let scid_len = payload[6 + dcid_len] as usize;
        let scid = payload[7 + dcid_len..7 + dcid_len + scid_len].to_vec();
        (dcid, scid)
    };

    let mut buffer = vec![0u8; 64];
    let len = {
        use s2n_codec::{Encoder as _, EncoderBuffer};
        let mut encoder = EncoderBuffer::new(&mut buffer);
        packet::version_negotiation::encode(
            &mut encoder,
            &scid,
            &dcid,
            &[packet::VERSION_V2],
            0x15,
        );
        encoder.len()
    };
    buffer.truncate(len);

    pair.client.handle_datagram(Datagram {
        local: addr(1000),
        peer: addr(443),
        ecn: Default::default(),
        payload: buffer,
    });

    //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
    //= type=test
    //# the client MUST use the same value in subsequent packets that it sends
    let version = pair.client.with(|conn| conn.cfg.version);
    assert_eq!(version, packet::VERSION_V2);

    // the handshake restarts under v2 and completes
    let server = pair.handshake();
    assert_eq!(server.state(), State::Established);
}

#[test]
fn datagram_round_trip_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    pair.client
        .send_datagram(bytes::Bytes::from_static(b"unreliable ping"))
        .unwrap();
    pair.drive(10);

    let mut buf = [0u8; 64];
    let mut found = None;
    loop {
        match server.poll_recv(&mut buf, None) {
            core::task::Poll::Ready(Ok(Received::Datagram(data))) => {
                found = Some(data);
                break;
            }
            core::task::Poll::Ready(Ok(_)) => {}
            _ => break,
        }
    }
    assert_eq!(found.as_deref(), Some(&b"unreliable ping"[..]));

    // oversized datagrams are refused, never split
    let huge = bytes::Bytes::from(vec![0u8; 100_000]);
    assert_eq!(
        pair.client.send_datagram(huge),
        Err(Error::InvalidArgument)
    );
}

#[test]
fn application_close_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    pair.client.close(VarInt::from_u32(42), b"done");
    assert_eq!(pair.client.state(), State::Closing);
    pair.drive(10);

    // the peer drains and surfaces the close event
    assert_eq!(server.state(), State::Draining);
    let mut buf = [0u8; 16];
    let mut saw_close_event = false;
    loop {
        match server.poll_recv(&mut buf, None) {
            core::task::Poll::Ready(Ok(Received::Event(Event::ConnectionClose {
                error_code,
                ..
            }))) => {
                assert_eq!(error_code, VarInt::from_u32(42));
                saw_close_event = true;
            }
            core::task::Poll::Ready(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_close_event);

    // later operations report the sticky error
    let result = server.poll_send(None, b"x", SendFlags::default(), None);
    assert!(matches!(
        result,
        core::task::Poll::Ready(Err(Error::Closed { .. }))
    ));
}

#[test]
fn stream_reset_round_trip_test() {
    let mut pair = Pair::new();
    let server = pair.handshake();

    let sent = pair
        .client
        .poll_send(None, b"partial", SendFlags::default(), None);
    assert!(matches!(sent, core::task::Poll::Ready(Ok(7))));
    pair.drive(10);

    let (events, _, _) = drain(&server);
    let id = events
        .iter()
        .find_map(|event| match event {
            Event::StreamUpdate { id, .. } => Some(*id),
            _ => None,
        })
        .expect("the server saw the stream");

    // the client abandons the stream
    pair.client.reset_stream(id, VarInt::from_u32(7)).unwrap();
    pair.drive(10);

    let mut buf = [0u8; 16];
    let mut saw_reset = false;
    loop {
        match server.poll_recv(&mut buf, None) {
            core::task::Poll::Ready(Ok(Received::Reset { error_code, .. })) => {
                assert_eq!(error_code, VarInt::from_u32(7));
                saw_reset = true;
                break;
            }
            core::task::Poll::Ready(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_reset);
}

#[test]
fn new_token_and_session_ticket_test() {
    let mut pair = Pair::new();
    let _server = pair.handshake();
    pair.drive(10);

    // the toy handshake issues both on confirmation
    assert!(pair.client.address_token().is_some());
    assert!(pair.client.session_ticket().is_some());
}
