// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::{convert::TryFrom, mem::size_of};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# A CRYPTO frame (type=0x06) is used to transmit cryptographic
//# handshake messages.

pub const TAG: Tag = 0x06;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crypto<Data> {
    /// The byte offset in the cryptographic handshake stream
    pub offset: VarInt,

    /// The cryptographic message data
    pub data: Data,
}

impl<Data> Crypto<Data> {
    /// Converts the data from one type to another
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> Crypto<Out> {
        Crypto {
            offset: self.offset,
            data: map(self.data),
        }
    }
}

impl<Data: EncoderValue> Crypto<Data> {
    /// Tries to fit the frame into the provided capacity, returning the new
    /// payload length on success
    #[inline]
    pub fn try_fit(&self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = 0;
        fixed_len += size_of::<Tag>();
        fixed_len += self.offset.encoding_size();

        let remaining = capacity.checked_sub(fixed_len).ok_or(FitError)?;
        let data_len = self.data.encoding_size();

        let max_data_len = remaining.min(data_len);
        let len_prefix = VarInt::try_from(max_data_len)
            .map_err(|_| FitError)?
            .encoding_size();
        let data_len = remaining.checked_sub(len_prefix).ok_or(FitError)?.min(data_len);

        if data_len == 0 && self.data.encoding_size() != 0 {
            return Err(FitError);
        }

        Ok(data_len)
    }
}

impl<'a> Crypto<&'a [u8]> {
    #[inline]
    pub(crate) fn decode(
        tag: Tag,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        debug_assert_eq!(tag, TAG);

        let (offset, buffer) = buffer.decode()?;
        let (data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
        let data = &*data.into_less_safe_slice();

        Ok((Crypto { offset, data }, buffer))
    }
}

impl<Data: EncoderValue> EncoderValue for Crypto<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&TAG);
        buffer.encode(&self.offset);
        buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_fit_test() {
        let frame = Crypto {
            offset: VarInt::from_u32(0),
            data: &[0u8; 100][..],
        };

        // everything fits
        assert_eq!(frame.try_fit(200), Ok(100));

        // tag + offset + 2-byte len prefix = 4 bytes of overhead
        assert_eq!(frame.try_fit(104), Ok(100));
        assert_eq!(frame.try_fit(103), Ok(99));

        // no room for any payload
        assert!(frame.try_fit(3).is_err());
        assert!(frame.try_fit(0).is_err());
    }
}
