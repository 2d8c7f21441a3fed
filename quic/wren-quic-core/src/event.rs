// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Application-visible connection events
//!
//! Events are queued ahead of stream data on the receive path and delivered
//! in generation order. The application subscribes per kind through a
//! bitmask; unsubscribed events are discarded at generation time.

use crate::{
    crypto::KeyPhase,
    inet::SocketAddress,
    stream::{StreamId, StreamType},
    token::{AddressToken, SessionTicket},
    varint::VarInt,
};

/// The observable state of a stream carried in a `StreamUpdate` event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamUpdateKind {
    /// First data arrived on a peer-opened stream
    Opened,
    /// The final size is known (FIN received)
    SizeKnown,
    /// All data up to the final size has arrived
    DataReceived,
    /// The peer reset the stream
    ResetReceived { error_code: VarInt },
    /// The peer asked us to stop sending
    StopSendingReceived { error_code: VarInt },
    /// Every byte we sent (including FIN) was acknowledged
    DataAcknowledged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    StreamUpdate {
        id: StreamId,
        kind: StreamUpdateKind,
    },
    /// The peer raised our stream limit
    MaxStreams {
        stream_type: StreamType,
        maximum: VarInt,
    },
    ConnectionClose {
        error_code: VarInt,
        frame_type: Option<VarInt>,
        reason: Vec<u8>,
    },
    KeyUpdate {
        phase: KeyPhase,
    },
    ConnectionMigration {
        local: SocketAddress,
        peer: SocketAddress,
    },
    NewToken {
        token: AddressToken,
    },
    NewSessionTicket {
        ticket: SessionTicket,
    },
}

impl Event {
    /// The subscription bit controlling delivery of this event
    #[inline]
    pub fn mask_bit(&self) -> Mask {
        match self {
            Self::StreamUpdate { .. } => Mask::STREAM_UPDATE,
            Self::MaxStreams { .. } => Mask::MAX_STREAMS,
            Self::ConnectionClose { .. } => Mask::CONNECTION_CLOSE,
            Self::KeyUpdate { .. } => Mask::KEY_UPDATE,
            Self::ConnectionMigration { .. } => Mask::CONNECTION_MIGRATION,
            Self::NewToken { .. } => Mask::NEW_TOKEN,
            Self::NewSessionTicket { .. } => Mask::NEW_SESSION_TICKET,
        }
    }
}

/// A subscription bitmask over event kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mask(u32);

impl Mask {
    pub const NONE: Self = Self(0);
    pub const STREAM_UPDATE: Self = Self(1 << 0);
    pub const MAX_STREAMS: Self = Self(1 << 1);
    pub const CONNECTION_CLOSE: Self = Self(1 << 2);
    pub const KEY_UPDATE: Self = Self(1 << 3);
    pub const CONNECTION_MIGRATION: Self = Self(1 << 4);
    pub const NEW_TOKEN: Self = Self(1 << 5);
    pub const NEW_SESSION_TICKET: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7f);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for Mask {
    /// Connection close events are always of interest; everything else is
    /// opt-in, matching the socket-option contract.
    fn default() -> Self {
        Self::CONNECTION_CLOSE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_test() {
        let mask = Mask::NONE.with(Mask::STREAM_UPDATE).with(Mask::NEW_TOKEN);
        assert!(mask.contains(Mask::STREAM_UPDATE));
        assert!(mask.contains(Mask::NEW_TOKEN));
        assert!(!mask.contains(Mask::KEY_UPDATE));

        let mask = mask.without(Mask::NEW_TOKEN);
        assert!(!mask.contains(Mask::NEW_TOKEN));

        assert!(Mask::ALL.contains(Mask::NEW_SESSION_TICKET));
        assert!(Mask::default().contains(Mask::CONNECTION_CLOSE));
    }
}
