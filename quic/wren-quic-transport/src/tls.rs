// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam to the TLS 1.3 handshake machinery
//!
//! The transport feeds in-order CRYPTO bytes to a [`Session`] and receives
//! outbound CRYPTO bytes, key installs, transport parameters and handshake
//! signals through the [`Context`]. No TLS lives in this crate; the
//! testing session below fakes the message flow with null keys.

use wren_quic_core::{
    crypto::{Level, LevelKeys},
    transport,
};

/// Callbacks a session uses to act on the connection
pub trait Context {
    /// Queues handshake bytes at the given level
    fn send_crypto(&mut self, level: Level, data: &[u8]);

    /// Installs packet protection keys for a level
    fn install_keys(&mut self, level: Level, send: LevelKeys, recv: LevelKeys);

    /// Delivers the peer's raw transport parameter extension
    fn on_peer_params(&mut self, params: &[u8]) -> Result<(), transport::Error>;

    /// The handshake completed; 1-RTT keys are available in both
    /// directions
    fn on_handshake_complete(&mut self);

    /// The negotiated application protocol
    fn on_alpn(&mut self, alpn: &[u8]);

    /// A session ticket for resumption arrived
    fn on_session_ticket(&mut self, ticket: &[u8]);
}

/// A TLS handshake instance bound to one connection
pub trait Session: Send {
    /// Starts the handshake: installs Initial keys and, for clients,
    /// produces the first flight.
    fn start(&mut self, ctx: &mut dyn Context) -> Result<(), transport::Error>;

    /// Feeds in-order handshake bytes received at `level`
    fn on_crypto_data(
        &mut self,
        level: Level,
        data: &[u8],
        ctx: &mut dyn Context,
    ) -> Result<(), transport::Error>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A toy handshake exercising the transport's key gating without TLS
    //!
    //! Message flow (each message is `[tag][u16 len][body]`):
    //!   Initial:   ClientHello(params) -> / <- ServerHello(params)
    //!   Handshake: <- ServerFinished / ClientFinished ->
    //!
    //! Handshake keys install after the hellos, 1-RTT keys after the
    //! finished messages, mirroring where TLS 1.3 installs its secrets.

    use super::*;
    use wren_quic_core::{crypto::testing::null_keys, endpoint};

    const CLIENT_HELLO: u8 = 1;
    const SERVER_HELLO: u8 = 2;
    const SERVER_FINISHED: u8 = 3;
    const CLIENT_FINISHED: u8 = 4;

    const TEST_ALPN: &[u8] = b"wren-test";

    pub struct Session {
        endpoint: endpoint::Type,
        local_params: Vec<u8>,
        /// Reassembled message bytes per level
        buffers: [Vec<u8>; 2],
        complete: bool,
    }

    impl Session {
        pub fn new(endpoint: endpoint::Type, local_params: Vec<u8>) -> Self {
            Self {
                endpoint,
                local_params,
                buffers: [Vec::new(), Vec::new()],
                complete: false,
            }
        }

        fn message(tag: u8, body: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(3 + body.len());
            out.push(tag);
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(body);
            out
        }

        fn buffer_index(level: Level) -> usize {
            match level {
                Level::Initial => 0,
                _ => 1,
            }
        }

        fn on_message(
            &mut self,
            tag: u8,
            body: &[u8],
            ctx: &mut dyn Context,
        ) -> Result<(), transport::Error> {
            match (self.endpoint, tag) {
                (endpoint::Type::Server, CLIENT_HELLO) => {
                    ctx.on_peer_params(body)?;
                    ctx.on_alpn(TEST_ALPN);
                    let hello = Self::message(SERVER_HELLO, &self.local_params.clone());
                    ctx.send_crypto(Level::Initial, &hello);
                    ctx.install_keys(Level::Handshake, null_keys(), null_keys());
                    let finished = Self::message(SERVER_FINISHED, b"");
                    ctx.send_crypto(Level::Handshake, &finished);
                    ctx.install_keys(Level::OneRtt, null_keys(), null_keys());
                }
                (endpoint::Type::Client, SERVER_HELLO) => {
                    ctx.on_peer_params(body)?;
                    ctx.on_alpn(TEST_ALPN);
                    ctx.install_keys(Level::Handshake, null_keys(), null_keys());
                }
                (endpoint::Type::Client, SERVER_FINISHED) => {
                    ctx.install_keys(Level::OneRtt, null_keys(), null_keys());
                    let finished = Self::message(CLIENT_FINISHED, b"");
                    ctx.send_crypto(Level::Handshake, &finished);
                    self.complete = true;
                    ctx.on_handshake_complete();
                    // a NewSessionTicket would follow the finished flight
                    ctx.on_session_ticket(b"wren-test-session-ticket");
                }
                (endpoint::Type::Server, CLIENT_FINISHED) => {
                    self.complete = true;
                    ctx.on_handshake_complete();
                }
                _ => {
                    return Err(transport::Error::crypto_error(
                        10, // unexpected_message
                        "unexpected handshake message",
                    ));
                }
            }
            Ok(())
        }
    }

    impl super::Session for Session {
        fn start(&mut self, ctx: &mut dyn Context) -> Result<(), transport::Error> {
            ctx.install_keys(Level::Initial, null_keys(), null_keys());
            if self.endpoint.is_client() {
                let hello = Self::message(CLIENT_HELLO, &self.local_params.clone());
                ctx.send_crypto(Level::Initial, &hello);
            }
            Ok(())
        }

        fn on_crypto_data(
            &mut self,
            level: Level,
            data: &[u8],
            ctx: &mut dyn Context,
        ) -> Result<(), transport::Error> {
            let index = Self::buffer_index(level);
            self.buffers[index].extend_from_slice(data);

            loop {
                let buffer = &self.buffers[index];
                if buffer.len() < 3 {
                    return Ok(());
                }
                let tag = buffer[0];
                let len = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
                if buffer.len() < 3 + len {
                    return Ok(());
                }

                let body: Vec<u8> = buffer[3..3 + len].to_vec();
                self.buffers[index].drain(..3 + len);
                self.on_message(tag, &body, ctx)?;
            }
        }
    }
}
