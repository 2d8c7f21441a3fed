// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.1
//# A PADDING frame (type=0x00) has no semantic value.  PADDING frames
//# can be used to increase the size of a packet.

pub const TAG: Tag = 0x00;

/// A run of padding bytes
///
/// Consecutive PADDING frames are decoded as a single run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    #[inline]
    pub(crate) fn decode(tag: Tag, buffer: DecoderBufferMut) -> DecoderBufferMutResult<Self> {
        debug_assert_eq!(tag, TAG);

        let mut length = 1;
        let mut buffer = buffer;
        while matches!(buffer.peek_byte(0), Ok(0)) {
            buffer = buffer.skip(1)?;
            length += 1;
        }

        Ok((Padding { length }, buffer))
    }
}

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_repeated(self.length, 0);
    }
}
