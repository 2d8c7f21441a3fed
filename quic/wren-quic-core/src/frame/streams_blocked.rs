// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, stream::StreamType, varint::VarInt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.14
//# A sender SHOULD send a STREAMS_BLOCKED frame (type=0x16 or 0x17) when
//# it wishes to open a stream but is unable to do so due to the maximum
//# stream limit set by its peer.

pub const TAG_BIDI: Tag = 0x16;
pub const TAG_UNI: Tag = 0x17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamsBlocked {
    pub stream_type: StreamType,
    /// The maximum stream count at which blocking occurred
    pub stream_limit: VarInt,
}

impl StreamsBlocked {
    #[inline]
    pub fn tag(&self) -> Tag {
        match self.stream_type {
            StreamType::Bidirectional => TAG_BIDI,
            StreamType::Unidirectional => TAG_UNI,
        }
    }

    #[inline]
    pub(crate) fn decode(tag: Tag, buffer: DecoderBufferMut) -> DecoderBufferMutResult<Self> {
        let stream_type = if tag == TAG_BIDI {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        };

        let (stream_limit, buffer) = buffer.decode()?;

        let frame = StreamsBlocked {
            stream_type,
            stream_limit,
        };

        Ok((frame, buffer))
    }
}

impl EncoderValue for StreamsBlocked {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.stream_limit);
    }
}
