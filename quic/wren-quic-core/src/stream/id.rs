// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint, varint::VarInt};
use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The least significant bit (0x01) of the stream ID identifies the
//# initiator of the stream.  Client-initiated streams have even-numbered
//# stream IDs (with the bit set to 0), and server-initiated streams have
//# odd-numbered stream IDs (with the bit set to 1).

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The second least significant bit (0x02) of the stream ID
//# distinguishes between bidirectional streams (with the bit set to 0)
//# and unidirectional streams (with the bit set to 1).

/// The directionality of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Bidirectional,
    Unidirectional,
}

impl StreamType {
    #[inline]
    pub fn is_bidirectional(self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

/// A 62-bit stream identifier; the two low bits encode the initiator role
/// and the directionality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(VarInt);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamId")
            .field("id", &self.0.as_u64())
            .field("initiator", &self.initiator())
            .field("stream_type", &self.stream_type())
            .finish()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StreamId {
    /// Creates a `StreamId` from a raw varint
    #[inline]
    pub const fn from_varint(id: VarInt) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    /// The first stream id for the given initiator and type
    #[inline]
    pub fn initial(initiator: endpoint::Type, stream_type: StreamType) -> Self {
        let mut id = 0;
        if matches!(initiator, endpoint::Type::Server) {
            id |= 0x1;
        }
        if matches!(stream_type, StreamType::Unidirectional) {
            id |= 0x2;
        }
        Self(VarInt::from_u8(id))
    }

    /// The `n`th stream id for the given initiator and type, if representable
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<Self> {
        let base = Self::initial(initiator, stream_type).0;
        let id = VarInt::new(n.checked_mul(4)?).ok()?.checked_add(base)?;
        Some(Self(id))
    }

    /// The ordinal of this stream among streams of the same initiator and
    /// type; the `n` that produced it in [`StreamId::nth`].
    #[inline]
    pub fn ordinal(self) -> u64 {
        self.0.as_u64() >> 2
    }

    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        if self.0.as_u64() & 0x1 == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0.as_u64() & 0x2 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    /// Returns the id of the next stream with the same initiator and type
    #[inline]
    pub fn next_of_type(self) -> Option<Self> {
        self.0.checked_add(VarInt::from_u8(4)).map(Self)
    }

    /// Returns true if the local endpoint is allowed to send on this stream
    #[inline]
    pub fn is_sendable(self, local: endpoint::Type) -> bool {
        match self.stream_type() {
            StreamType::Bidirectional => true,
            StreamType::Unidirectional => self.initiator() == local,
        }
    }

    /// Returns true if the local endpoint is allowed to receive on this stream
    #[inline]
    pub fn is_receivable(self, local: endpoint::Type) -> bool {
        match self.stream_type() {
            StreamType::Bidirectional => true,
            StreamType::Unidirectional => self.initiator() != local,
        }
    }
}

impl From<StreamId> for VarInt {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint::Type::{Client, Server};

    #[test]
    fn low_bits_test() {
        for (initiator, stream_type, expected) in [
            (Client, StreamType::Bidirectional, 0),
            (Server, StreamType::Bidirectional, 1),
            (Client, StreamType::Unidirectional, 2),
            (Server, StreamType::Unidirectional, 3),
        ] {
            let id = StreamId::initial(initiator, stream_type);
            assert_eq!(id.as_varint().as_u64(), expected);
            assert_eq!(id.initiator(), initiator);
            assert_eq!(id.stream_type(), stream_type);
        }
    }

    #[test]
    fn nth_test() {
        let id = StreamId::nth(Client, StreamType::Bidirectional, 3).unwrap();
        assert_eq!(id.as_varint().as_u64(), 12);
        assert_eq!(id.ordinal(), 3);

        let id = StreamId::nth(Server, StreamType::Unidirectional, 2).unwrap();
        assert_eq!(id.as_varint().as_u64(), 11);
        assert_eq!(id.next_of_type().unwrap().as_varint().as_u64(), 15);

        assert!(StreamId::nth(Client, StreamType::Bidirectional, u64::MAX).is_none());
    }

    #[test]
    fn directionality_test() {
        let client_uni = StreamId::initial(Client, StreamType::Unidirectional);
        assert!(client_uni.is_sendable(Client));
        assert!(!client_uni.is_sendable(Server));
        assert!(client_uni.is_receivable(Server));
        assert!(!client_uni.is_receivable(Client));

        let bidi = StreamId::initial(Server, StreamType::Bidirectional);
        assert!(bidi.is_sendable(Client));
        assert!(bidi.is_sendable(Server));
    }
}
