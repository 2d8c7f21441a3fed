// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire-level types and protocol machines for the wren-quic endpoint core.
//!
//! This crate is free of I/O: sockets, TLS and AEAD primitives live behind
//! the traits in [`crypto`] and the callbacks the transport crate exposes.

#[macro_use]
pub mod state;

pub mod ack;
pub mod buffer;
pub mod connection;
pub mod counter;
pub mod crypto;
pub mod endpoint;
pub mod event;
pub mod frame;
pub mod inet;
pub mod interval;
pub mod packet;
pub mod path;
pub mod random;
pub mod recovery;
pub mod stateless_reset;
pub mod stream;
pub mod token;
pub mod transmission;
pub mod transport;
pub mod varint;

pub mod time;

/// Asserts that a boolean expression is true at runtime, only if debug_assertions are enabled.
///
/// Otherwise, the macro returns early with the provided value.
#[macro_export]
macro_rules! ensure {
    ($cond:expr) => {
        $crate::ensure!($cond, ());
    };
    ($cond:expr, $otherwise:expr) => {
        if !($cond) {
            return $otherwise;
        }
    };
}
