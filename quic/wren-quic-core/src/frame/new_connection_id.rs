// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::id, frame::Tag, stateless_reset, varint::VarInt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, DecoderError, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

pub const TAG: Tag = 0x18;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId<'a> {
    /// The sequence number assigned to the connection ID by the sender
    pub sequence_number: VarInt,

    /// The sequence number below which connection IDs are retired
    pub retire_prior_to: VarInt,

    /// The new connection ID (1..=20 bytes)
    pub connection_id: &'a [u8],

    /// A token to use when the peer needs to detect a stateless reset
    pub stateless_reset_token: [u8; stateless_reset::TOKEN_LEN],
}

impl<'a> NewConnectionId<'a> {
    #[inline]
    pub(crate) fn decode(
        tag: Tag,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        debug_assert_eq!(tag, TAG);

        let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
        let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
        //# Receipt of the same frame multiple times MUST NOT be treated as a
        //# connection error.  A receiver can use the sequence number supplied in
        //# the NEW_CONNECTION_ID frame to handle receiving the same
        //# NEW_CONNECTION_ID frame multiple times.
        if retire_prior_to > sequence_number {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# The value in the Retire Prior To field MUST be less than or equal to
            //# the value in the Sequence Number field.  Receiving a value in the
            //# Retire Prior To field that is greater than that in the Sequence Number
            //# field MUST be treated as a connection error of type
            //# FRAME_ENCODING_ERROR.
            return Err(DecoderError::InvariantViolation(
                "retire_prior_to exceeds sequence_number",
            ));
        }

        let (len, buffer) = buffer.decode::<u8>()?;
        if !(1..=id::MAX_LEN as u8).contains(&len) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Values less than 1 and greater than 20 are invalid and MUST be
            //# treated as a connection error of type FRAME_ENCODING_ERROR.
            return Err(DecoderError::InvariantViolation("invalid connection id"));
        }

        let (connection_id, buffer) = buffer.decode_slice(len as usize)?;
        let connection_id = &*connection_id.into_less_safe_slice();

        let (token, buffer) = buffer.decode_slice(stateless_reset::TOKEN_LEN)?;
        let mut stateless_reset_token = [0; stateless_reset::TOKEN_LEN];
        stateless_reset_token.copy_from_slice(token.into_less_safe_slice());

        let frame = NewConnectionId {
            sequence_number,
            retire_prior_to,
            connection_id,
            stateless_reset_token,
        };

        Ok((frame, buffer))
    }
}

impl<'a> EncoderValue for NewConnectionId<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&TAG);
        buffer.encode(&self.sequence_number);
        buffer.encode(&self.retire_prior_to);
        buffer.encode(&(self.connection_id.len() as u8));
        buffer.write_slice(self.connection_id);
        buffer.write_slice(&self.stateless_reset_token);
    }
}
