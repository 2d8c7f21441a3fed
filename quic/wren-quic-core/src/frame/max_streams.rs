// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, stream::StreamType, varint::VarInt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
//# A MAX_STREAMS frame (type=0x12 or 0x13) informs the peer of the
//# cumulative number of streams of a given type it is permitted to open.

pub const TAG_BIDI: Tag = 0x12;
pub const TAG_UNI: Tag = 0x13;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreams {
    pub stream_type: StreamType,
    /// A cumulative count of streams of the corresponding type that may be
    /// opened over the lifetime of the connection
    pub maximum_streams: VarInt,
}

impl MaxStreams {
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

        let (maximum_streams, buffer) = buffer.decode()?;

        let frame = MaxStreams {
            stream_type,
            maximum_streams,
        };

        Ok((frame, buffer))
    }
}

impl EncoderValue for MaxStreams {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.maximum_streams);
    }
}
