// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The wren-quic per-connection state engine
//!
//! Converts datagrams handed in by the I/O layer into ordered streams,
//! unreliable datagrams and events, and drives the symmetric outbound
//! path. UDP sockets, TLS and AEAD primitives stay outside; see
//! [`tls::Session`] and the crypto traits in `wren_quic_core`.

pub mod conn_id;
pub mod connection;
pub mod endpoint;
pub mod path;
pub mod runtime;
pub mod space;
pub mod stream;
pub mod sync;
pub mod tls;

#[cfg(test)]
mod tests;

pub use connection::Connection;
pub use endpoint::Endpoint;
