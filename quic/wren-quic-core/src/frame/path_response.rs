// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::{path_challenge::DATA_LEN, Tag};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.18
//# A PATH_RESPONSE frame (type=0x1b) is sent in response to a
//# PATH_CHALLENGE frame.

pub const TAG: Tag = 0x1b;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathResponse {
    /// The data carried by the PATH_CHALLENGE being answered
    pub data: [u8; DATA_LEN],
}

impl PathResponse {
    #[inline]
    pub(crate) fn decode(tag: Tag, buffer: DecoderBufferMut) -> DecoderBufferMutResult<Self> {
        debug_assert_eq!(tag, TAG);

        let (slice, buffer) = buffer.decode_slice(DATA_LEN)?;
        let mut data = [0; DATA_LEN];
        data.copy_from_slice(slice.into_less_safe_slice());

        Ok((PathResponse { data }, buffer))
    }
}

impl EncoderValue for PathResponse {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&TAG);
        buffer.write_slice(&self.data);
    }
}
