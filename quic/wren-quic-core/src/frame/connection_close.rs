// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, transport, varint::VarInt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE frame with a type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

pub const TAG: Tag = 0x1c;
pub const TAG_APPLICATION: Tag = 0x1d;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub error_code: VarInt,

    /// The type of the frame that triggered the error; `None` for
    /// application-initiated closes (type 0x1d)
    pub frame_type: Option<VarInt>,

    /// Human-readable diagnostic bytes; not guaranteed to be UTF-8
    pub reason: &'a [u8],
}

impl<'a> ConnectionClose<'a> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.frame_type.is_some() {
            TAG
        } else {
            TAG_APPLICATION
        }
    }

    #[inline]
    pub(crate) fn decode(
        tag: Tag,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        let (error_code, buffer) = buffer.decode::<VarInt>()?;

        let (frame_type, buffer) = if tag == TAG {
            let (frame_type, buffer) = buffer.decode::<VarInt>()?;
            (Some(frame_type), buffer)
        } else {
            (None, buffer)
        };

        let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
        let reason = &*reason.into_less_safe_slice();

        let frame = ConnectionClose {
            error_code,
            frame_type,
            reason,
        };

        Ok((frame, buffer))
    }
}

impl<'a> EncoderValue for ConnectionClose<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.error_code);
        if let Some(frame_type) = self.frame_type {
            buffer.encode(&frame_type);
        }
        buffer.encode_with_len_prefix::<VarInt, _>(&self.reason);
    }
}

impl<'a> From<transport::Error> for ConnectionClose<'a> {
    #[inline]
    fn from(error: transport::Error) -> Self {
        Self {
            error_code: error.code,
            frame_type: error.frame_type,
            reason: error.reason.as_bytes(),
        }
    }
}
