// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9221#section-4
//# DATAGRAM frames are used to transmit application data in an
//# unreliable manner.  The Type field in the DATAGRAM frame takes the
//# form 0b0011000X (or the values 0x30 and 0x31).

pub const TAG: Tag = 0x30;
pub const TAG_W_LEN: Tag = 0x31;

const LEN_BIT: Tag = 0x01;

/// An unreliable, unordered payload delivered as a unit
///
/// DATAGRAM frames are never split; a datagram that does not fit the
/// remaining packet capacity waits for the next packet, and one that cannot
/// fit any packet is refused at the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datagram<Data> {
    /// If true, the frame extends to the end of the packet and omits its
    /// length field
    pub is_last_frame: bool,

    pub data: Data,
}

impl<Data> Datagram<Data> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.is_last_frame {
            TAG
        } else {
            TAG_W_LEN
        }
    }

    /// Converts the datagram data from one type to another
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> Datagram<Out> {
        Datagram {
            is_last_frame: self.is_last_frame,
            data: map(self.data),
        }
    }
}

impl<'a> Datagram<&'a [u8]> {
    #[inline]
    pub(crate) fn decode(
        tag: Tag,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        let is_last_frame = tag & LEN_BIT != LEN_BIT;

        let (data, buffer) = if is_last_frame {
            let len = buffer.len();
            buffer.decode_slice(len)?
        } else {
            buffer.decode_slice_with_len_prefix::<VarInt>()?
        };
        let data = &*data.into_less_safe_slice();

        let frame = Datagram {
            is_last_frame,
            data,
        };

        Ok((frame, buffer))
    }
}

impl<Data: EncoderValue> EncoderValue for Datagram<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());

        if self.is_last_frame {
            buffer.encode(&self.data);
        } else {
            buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}
