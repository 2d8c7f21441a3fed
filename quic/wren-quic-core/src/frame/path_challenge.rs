// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.17
//# Endpoints can use PATH_CHALLENGE frames (type=0x1a) to check
//# reachability to the peer and for path validation during connection
//# migration.

pub const TAG: Tag = 0x1a;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.17
//# Data:  This 8-byte field contains arbitrary data.
pub const DATA_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    pub data: [u8; DATA_LEN],
}

impl PathChallenge {
    #[inline]
    pub(crate) fn decode(tag: Tag, buffer: DecoderBufferMut) -> DecoderBufferMutResult<Self> {
        debug_assert_eq!(tag, TAG);

        let (slice, buffer) = buffer.decode_slice(DATA_LEN)?;
        let mut data = [0; DATA_LEN];
        data.copy_from_slice(slice.into_less_safe_slice());

        Ok((PathChallenge { data }, buffer))
    }
}

impl EncoderValue for PathChallenge {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&TAG);
        buffer.write_slice(&self.data);
    }
}
