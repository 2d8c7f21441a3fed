// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC frame codecs
//!
//! Each frame type owns its wire format and implements `EncoderValue`; the
//! [`Frame`] enum is the decode-side view over a packet payload. Encoders
//! write concrete frame values directly, so only decoding needs the enum.

use core::fmt;
use s2n_codec::{DecoderBufferMut, DecoderBufferMutResult, DecoderError};

pub(crate) type Tag = u8;

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
//# The Frame Type field uses a variable-length integer encoding with one
//# exception.  To ensure simple and efficient implementations of frame
//# parsing, a frame type MUST use the shortest possible encoding.

/// Implements the codec for a frame whose fields don't vary with the tag
macro_rules! simple_frame_codec {
    ($name:ident {
        $(
            $field:ident
        ),* $(,)?
    }, $tag:expr) => {
        impl $name {
            #[inline]
            pub(crate) fn decode(
                tag: $crate::frame::Tag,
                buffer: s2n_codec::DecoderBufferMut,
            ) -> s2n_codec::DecoderBufferMutResult<Self> {
                debug_assert_eq!(tag, $tag);
                $(
                    let ($field, buffer) = buffer.decode()?;
                )*

                let frame = $name { $($field),* };

                Ok((frame, buffer))
            }
        }

        impl s2n_codec::EncoderValue for $name {
            #[inline]
            fn encode<E: s2n_codec::Encoder>(&self, buffer: &mut E) {
                buffer.encode(&$tag);
                $(
                    buffer.encode(&self.$field);
                )*
            }
        }
    };
}

pub(crate) use simple_frame_codec;

pub mod ack;
pub mod connection_close;
pub mod crypto;
pub mod data_blocked;
pub mod datagram;
pub mod handshake_done;
pub mod max_data;
pub mod max_stream_data;
pub mod max_streams;
pub mod new_connection_id;
pub mod new_token;
pub mod padding;
pub mod path_challenge;
pub mod path_response;
pub mod ping;
pub mod reset_stream;
pub mod retire_connection_id;
pub mod stop_sending;
pub mod stream;
pub mod streams_blocked;
pub mod stream_data_blocked;

pub use ack::Ack;
pub use connection_close::ConnectionClose;
pub use crypto::Crypto;
pub use data_blocked::DataBlocked;
pub use datagram::Datagram;
pub use handshake_done::HandshakeDone;
pub use max_data::MaxData;
pub use max_stream_data::MaxStreamData;
pub use max_streams::MaxStreams;
pub use new_connection_id::NewConnectionId;
pub use new_token::NewToken;
pub use padding::Padding;
pub use path_challenge::PathChallenge;
pub use path_response::PathResponse;
pub use ping::Ping;
pub use reset_stream::ResetStream;
pub use retire_connection_id::RetireConnectionId;
pub use stop_sending::StopSending;
pub use stream::Stream;
pub use streams_blocked::StreamsBlocked;
pub use stream_data_blocked::StreamDataBlocked;

/// Returned by `try_fit` implementations when a frame cannot fit the
/// remaining packet capacity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitError;

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame does not fit in the remaining capacity")
    }
}

/// A decoded frame borrowing the packet payload
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack<ack::AckRangesDecoder>),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto<&'a [u8]>),
    NewToken(NewToken<'a>),
    Stream(Stream<&'a [u8]>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId<'a>),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
    ConnectionClose(ConnectionClose<'a>),
    HandshakeDone(HandshakeDone),
    Datagram(Datagram<&'a [u8]>),
}

impl<'a> Frame<'a> {
    //= https://www.rfc-editor.org/rfc/rfc9002#section-2
    //# Packets that contain ack-eliciting frames elicit an ACK from the
    //# receiver within the maximum acknowledgment delay and are called
    //# ack-eliciting packets.
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Self::Padding(_) | Self::Ack(_) | Self::ConnectionClose(_)
        )
    }

    /// Returns true if the frame counts against the path's congestion window
    #[inline]
    pub fn is_congestion_controlled(&self) -> bool {
        !matches!(self, Self::Ack(_) | Self::ConnectionClose(_))
    }

    /// Returns true if the frame may appear in a probing packet
    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.1
    //# PATH_CHALLENGE, PATH_RESPONSE, NEW_CONNECTION_ID, and PADDING frames
    //# are "probing frames", and all other frames are "non-probing frames".
    #[inline]
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Self::Padding(_)
                | Self::PathChallenge(_)
                | Self::PathResponse(_)
                | Self::NewConnectionId(_)
        )
    }

    /// Decodes every frame of a payload, invoking `on_frame` for each
    pub fn decode_all<F>(
        payload: &'a mut [u8],
        mut on_frame: F,
    ) -> Result<(), DecoderError>
    where
        F: FnMut(Frame<'a>) -> Result<(), DecoderError>,
    {
        let mut buffer = DecoderBufferMut::new(payload);
        if buffer.is_empty() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat receipt of a packet containing no frames as a
            //# connection error of type PROTOCOL_VIOLATION.
            return Err(DecoderError::InvariantViolation("packet contains no frames"));
        }
        while !buffer.is_empty() {
            let (frame, remaining) = Self::decode(buffer)?;
            on_frame(frame)?;
            buffer = remaining;
        }
        Ok(())
    }

    /// Decodes a single frame from the front of the buffer
    pub fn decode(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Frame<'a>> {
        let tag = buffer.peek_byte(0)?;

        // single-byte frame types only; anything encoded on more bytes is an
        // extension this endpoint does not speak
        if tag >= 0b0100_0000 {
            return Err(DecoderError::InvariantViolation("unknown frame type"));
        }

        let buffer = buffer.skip(core::mem::size_of::<Tag>())?;

        macro_rules! frame {
            ($module:ident, $ty:ident) => {{
                let (frame, buffer) = $module::$ty::decode(tag, buffer)?;
                Ok((Frame::$ty(frame), buffer))
            }};
        }

        match tag {
            padding::TAG => frame!(padding, Padding),
            ping::TAG => frame!(ping, Ping),
            ack::TAG..=ack::TAG_W_ECN => frame!(ack, Ack),
            reset_stream::TAG => frame!(reset_stream, ResetStream),
            stop_sending::TAG => frame!(stop_sending, StopSending),
            crypto::TAG => frame!(crypto, Crypto),
            new_token::TAG => frame!(new_token, NewToken),
            stream::TAG..=stream::TAG_MAX => frame!(stream, Stream),
            max_data::TAG => frame!(max_data, MaxData),
            max_stream_data::TAG => frame!(max_stream_data, MaxStreamData),
            max_streams::TAG_BIDI..=max_streams::TAG_UNI => frame!(max_streams, MaxStreams),
            data_blocked::TAG => frame!(data_blocked, DataBlocked),
            stream_data_blocked::TAG => frame!(stream_data_blocked, StreamDataBlocked),
            streams_blocked::TAG_BIDI..=streams_blocked::TAG_UNI => {
                frame!(streams_blocked, StreamsBlocked)
            }
            new_connection_id::TAG => frame!(new_connection_id, NewConnectionId),
            retire_connection_id::TAG => frame!(retire_connection_id, RetireConnectionId),
            path_challenge::TAG => frame!(path_challenge, PathChallenge),
            path_response::TAG => frame!(path_response, PathResponse),
            connection_close::TAG..=connection_close::TAG_APPLICATION => {
                frame!(connection_close, ConnectionClose)
            }
            handshake_done::TAG => frame!(handshake_done, HandshakeDone),
            datagram::TAG..=datagram::TAG_W_LEN => frame!(datagram, Datagram),
            _ => Err(DecoderError::InvariantViolation("unknown frame type")),
        }
    }
}

#[cfg(test)]
mod tests;
