// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, DecoderError, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
//# A server sends a NEW_TOKEN frame (type=0x07) to provide the client
//# with a token to send in the header of an Initial packet for a future
//# connection.

pub const TAG: Tag = 0x07;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewToken<'a> {
    /// An opaque blob the client may present on a future connection
    pub token: &'a [u8],
}

impl<'a> NewToken<'a> {
    #[inline]
    pub(crate) fn decode(
        tag: Tag,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        debug_assert_eq!(tag, TAG);

        let (token, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
        //# A client MUST treat receipt of a NEW_TOKEN frame with an empty Token
        //# field as a connection error of type FRAME_ENCODING_ERROR.
        if token.is_empty() {
            return Err(DecoderError::InvariantViolation("empty token"));
        }

        let token = &*token.into_less_safe_slice();

        Ok((NewToken { token }, buffer))
    }
}

impl<'a> EncoderValue for NewToken<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&TAG);
        buffer.encode_with_len_prefix::<VarInt, _>(&self.token);
    }
}
