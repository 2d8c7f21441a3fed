// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod id;

pub use id::ConnectionId;

use crate::{transport, varint::VarInt};
use core::fmt;

/// Errors surfaced at the connection API
///
/// Transport errors become [`Error::Closed`] once the connection enters the
/// closing or draining state; everything else is a local condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The operation requires keys or a handshake state that is not ready yet
    NotReady,
    /// The operation would block; retry after the registered waker fires
    WouldBlock,
    InvalidArgument,
    NoMemory,
    NoBufferSpace,
    NotConnected,
    Unsupported,
    /// The waiter was cancelled; no state was lost
    Cancelled,
    /// The idle timer expired and the connection was silently discarded
    IdleTimeout,
    /// The peer reset the stream with the given application error code
    StreamReset(VarInt),
    /// The connection was closed locally or by the peer
    Closed { error: transport::Error },
}

impl Error {
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "operation not ready"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::NoBufferSpace => write!(f, "no buffer space available"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Unsupported => write!(f, "operation not supported"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::IdleTimeout => write!(f, "connection idle timeout"),
            Self::StreamReset(code) => write!(f, "stream reset with code {code}"),
            Self::Closed { error } => write!(f, "connection closed: {error}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    #[inline]
    fn from(error: transport::Error) -> Self {
        Self::Closed { error }
    }
}
