// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameters (RFC 9000 §18)
//!
//! Parameters are exchanged as varint-tagged TLVs inside a TLS extension.
//! Unknown parameters are ignored; duplicates and out-of-range values are
//! TRANSPORT_PARAMETER_ERRORs.

use crate::{connection::ConnectionId, stateless_reset, transport::Error, transport_error, varint::VarInt};
use core::time::Duration;
use s2n_codec::{DecoderBuffer, Encoder, EncoderValue};

macro_rules! ids {
    ($($name:ident = $value:expr;)*) => {
        $(const $name: u64 = $value;)*
    };
}

ids! {
    ORIGINAL_DESTINATION_CONNECTION_ID = 0x00;
    MAX_IDLE_TIMEOUT = 0x01;
    STATELESS_RESET_TOKEN = 0x02;
    MAX_UDP_PAYLOAD_SIZE = 0x03;
    INITIAL_MAX_DATA = 0x04;
    INITIAL_MAX_STREAM_DATA_BIDI_LOCAL = 0x05;
    INITIAL_MAX_STREAM_DATA_BIDI_REMOTE = 0x06;
    INITIAL_MAX_STREAM_DATA_UNI = 0x07;
    INITIAL_MAX_STREAMS_BIDI = 0x08;
    INITIAL_MAX_STREAMS_UNI = 0x09;
    ACK_DELAY_EXPONENT = 0x0a;
    MAX_ACK_DELAY = 0x0b;
    DISABLE_ACTIVE_MIGRATION = 0x0c;
    PREFERRED_ADDRESS = 0x0d;
    ACTIVE_CONNECTION_ID_LIMIT = 0x0e;
    INITIAL_SOURCE_CONNECTION_ID = 0x0f;
    RETRY_SOURCE_CONNECTION_ID = 0x10;
    MAX_DATAGRAM_FRAME_SIZE = 0x20;
    GREASE_QUIC_BIT = 0x2ab2;
}

/// The payload size every path is assumed to support
//= https://www.rfc-editor.org/rfc/rfc9000#section-14
//# QUIC MUST NOT be used if the network path cannot support a
//# maximum datagram size of at least 1200 bytes.
pub const BASE_PMTU: u64 = 1200;

const DEFAULT_MAX_UDP_PAYLOAD_SIZE: u64 = 65527;
const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);
const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 7;
const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_MAX_DATA: u64 = 4 * BASE_PMTU * 32;
const DEFAULT_INITIAL_MAX_STREAM_DATA: u64 = 4 * BASE_PMTU * 4;
const DEFAULT_INITIAL_MAX_STREAMS: u64 = 100;

/// The assumed round trip time before any sample is taken
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_micros(333_000);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    pub stateless_reset_token: Option<stateless_reset::Token>,

    pub max_idle_timeout: Duration,
    pub max_udp_payload_size: VarInt,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: VarInt,
    pub max_datagram_frame_size: VarInt,
    pub grease_quic_bit: bool,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            stateless_reset_token: None,
            max_idle_timeout: DEFAULT_MAX_IDLE_TIMEOUT,
            max_udp_payload_size: VarInt::new(DEFAULT_MAX_UDP_PAYLOAD_SIZE).unwrap(),
            initial_max_data: VarInt::new(DEFAULT_INITIAL_MAX_DATA).unwrap(),
            initial_max_stream_data_bidi_local: VarInt::new(DEFAULT_INITIAL_MAX_STREAM_DATA)
                .unwrap(),
            initial_max_stream_data_bidi_remote: VarInt::new(DEFAULT_INITIAL_MAX_STREAM_DATA)
                .unwrap(),
            initial_max_stream_data_uni: VarInt::new(DEFAULT_INITIAL_MAX_STREAM_DATA).unwrap(),
            initial_max_streams_bidi: VarInt::new(DEFAULT_INITIAL_MAX_STREAMS).unwrap(),
            initial_max_streams_uni: VarInt::new(DEFAULT_INITIAL_MAX_STREAMS).unwrap(),
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            disable_active_migration: false,
            active_connection_id_limit: VarInt::new(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT).unwrap(),
            max_datagram_frame_size: VarInt::ZERO,
            grease_quic_bit: false,
        }
    }
}

fn param_error(reason: &'static str) -> Error {
    transport_error!(TRANSPORT_PARAMETER_ERROR).with_reason(reason)
}

impl TransportParameters {
    /// Validates bounds the RFC attaches to individual parameters
    pub fn validate(&self) -> Result<(), Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# Values above 20 are invalid.
        if self.ack_delay_exponent > 20 {
            return Err(param_error("ack_delay_exponent above 20"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# Values below 1200 are invalid.
        if self.max_udp_payload_size < VarInt::new(1200).unwrap() {
            return Err(param_error("max_udp_payload_size below 1200"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# Values of 2^14 or greater are invalid.
        if self.max_ack_delay >= Duration::from_millis(1 << 14) {
            return Err(param_error("max_ack_delay too large"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# The value of the active_connection_id_limit parameter MUST be at
        //# least 2.
        if self.active_connection_id_limit < VarInt::from_u8(2) {
            return Err(param_error("active_connection_id_limit below 2"));
        }

        if self.initial_max_streams_bidi > VarInt::new(1 << 60).unwrap()
            || self.initial_max_streams_uni > VarInt::new(1 << 60).unwrap()
        {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
            //# Endpoints MUST NOT exceed the limit set by their peer.  An endpoint
            //# that receives a frame with a stream ID exceeding the limit it has
            //# sent MUST treat this as a connection error of type
            //# STREAM_LIMIT_ERROR
            return Err(param_error("stream limit above 2^60"));
        }

        Ok(())
    }

    /// The idle timeout to apply, merging local and peer values
    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
    //# Each endpoint advertises a max_idle_timeout, but the effective value
    //# at an endpoint is computed as the minimum of the two advertised
    //# values.
    pub fn merged_idle_timeout(&self, peer: &Self) -> Option<Duration> {
        match (self.max_idle_timeout, peer.max_idle_timeout) {
            (Duration::ZERO, Duration::ZERO) => None,
            (Duration::ZERO, peer) => Some(peer),
            (local, Duration::ZERO) => Some(local),
            (local, peer) => Some(local.min(peer)),
        }
    }

    pub fn decode(buffer: DecoderBuffer) -> Result<Self, Error> {
        let mut params = Self {
            // wire absence means "no limit"/"off" rather than the local
            // policy defaults
            max_idle_timeout: Duration::ZERO,
            initial_max_data: VarInt::ZERO,
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            active_connection_id_limit: VarInt::from_u8(2),
            ..Self::default()
        };

        let mut seen = std::collections::HashSet::new();
        let mut buffer = buffer;

        while !buffer.is_empty() {
            let (id, remaining) = buffer.decode::<VarInt>().map_err(Error::from)?;
            let (value, remaining) = remaining
                .decode_slice_with_len_prefix::<VarInt>()
                .map_err(Error::from)?;
            buffer = remaining;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
            //# An endpoint MUST treat receipt of duplicate transport parameters as
            //# a connection error of type TRANSPORT_PARAMETER_ERROR.
            if !seen.insert(id.as_u64()) {
                return Err(param_error("duplicate transport parameter"));
            }

            macro_rules! varint {
                () => {{
                    let (value, remaining) = value.decode::<VarInt>().map_err(Error::from)?;
                    remaining.ensure_empty().map_err(Error::from)?;
                    value
                }};
            }

            macro_rules! connection_id {
                () => {{
                    ConnectionId::try_from_slice(value.into_less_safe_slice())
                        .map_err(|_| param_error("invalid connection id"))?
                }};
            }

            macro_rules! empty {
                () => {{
                    value
                        .ensure_empty()
                        .map_err(|_| param_error("flag parameter carries a value"))?;
                }};
            }

            match id.as_u64() {
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(connection_id!());
                }
                INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(connection_id!());
                }
                RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(connection_id!());
                }
                STATELESS_RESET_TOKEN => {
                    let bytes: [u8; stateless_reset::TOKEN_LEN] = value
                        .into_less_safe_slice()
                        .try_into()
                        .map_err(|_| param_error("invalid stateless reset token"))?;
                    params.stateless_reset_token = Some(bytes.into());
                }
                MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = Duration::from_millis(varint!().as_u64());
                }
                MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = varint!(),
                INITIAL_MAX_DATA => params.initial_max_data = varint!(),
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = varint!()
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = varint!()
                }
                INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = varint!(),
                INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = varint!(),
                INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = varint!(),
                ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = varint!()
                        .as_u64()
                        .try_into()
                        .map_err(|_| param_error("ack_delay_exponent out of range"))?;
                }
                MAX_ACK_DELAY => {
                    params.max_ack_delay = Duration::from_millis(varint!().as_u64());
                }
                DISABLE_ACTIVE_MIGRATION => {
                    empty!();
                    params.disable_active_migration = true;
                }
                ACTIVE_CONNECTION_ID_LIMIT => params.active_connection_id_limit = varint!(),
                MAX_DATAGRAM_FRAME_SIZE => params.max_datagram_frame_size = varint!(),
                GREASE_QUIC_BIT => {
                    empty!();
                    params.grease_quic_bit = true;
                }
                PREFERRED_ADDRESS => {
                    // parsed but unused; this endpoint never migrates to a
                    // server preferred address
                }
                _ => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                    //# An endpoint MUST ignore transport parameters that it does
                    //# not support.
                }
            }
        }

        params.validate()?;

        Ok(params)
    }
}

impl EncoderValue for TransportParameters {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        #[inline]
        fn entry<E: Encoder, V: EncoderValue>(encoder: &mut E, id: u64, value: &V) {
            encoder.encode(&VarInt::new(id).expect("parameter ids fit a varint"));
            encoder.encode_with_len_prefix::<VarInt, _>(value);
        }

        #[inline]
        fn varint_entry<E: Encoder>(encoder: &mut E, id: u64, value: VarInt) {
            entry(encoder, id, &value);
        }

        if let Some(cid) = &self.original_destination_connection_id {
            entry(encoder, ORIGINAL_DESTINATION_CONNECTION_ID, cid);
        }
        if let Some(cid) = &self.initial_source_connection_id {
            entry(encoder, INITIAL_SOURCE_CONNECTION_ID, cid);
        }
        if let Some(cid) = &self.retry_source_connection_id {
            entry(encoder, RETRY_SOURCE_CONNECTION_ID, cid);
        }
        if let Some(token) = &self.stateless_reset_token {
            entry(encoder, STATELESS_RESET_TOKEN, &token.as_bytes());
        }

        if !self.max_idle_timeout.is_zero() {
            varint_entry(
                encoder,
                MAX_IDLE_TIMEOUT,
                VarInt::new(self.max_idle_timeout.as_millis() as u64)
                    .expect("idle timeout is bounded"),
            );
        }
        varint_entry(encoder, MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        varint_entry(encoder, INITIAL_MAX_DATA, self.initial_max_data);
        varint_entry(
            encoder,
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        varint_entry(
            encoder,
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        varint_entry(
            encoder,
            INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        varint_entry(encoder, INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        varint_entry(encoder, INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        varint_entry(
            encoder,
            ACK_DELAY_EXPONENT,
            VarInt::from_u8(self.ack_delay_exponent),
        );
        varint_entry(
            encoder,
            MAX_ACK_DELAY,
            VarInt::new(self.max_ack_delay.as_millis() as u64).expect("max_ack_delay is bounded"),
        );
        if self.disable_active_migration {
            entry(encoder, DISABLE_ACTIVE_MIGRATION, &());
        }
        varint_entry(
            encoder,
            ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if self.max_datagram_frame_size > VarInt::ZERO {
            varint_entry(encoder, MAX_DATAGRAM_FRAME_SIZE, self.max_datagram_frame_size);
        }
        if self.grease_quic_bit {
            entry(encoder, GREASE_QUIC_BIT, &());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::EncoderBuffer;

    fn round_trip(params: &TransportParameters) -> TransportParameters {
        let mut bytes = vec![0u8; 1024];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(params);
            encoder.len()
        };
        TransportParameters::decode(DecoderBuffer::new(&bytes[..len])).unwrap()
    }

    #[test]
    fn round_trip_test() {
        let mut params = TransportParameters {
            original_destination_connection_id: Some(
                ConnectionId::try_from_slice(&[1, 2, 3, 4]).unwrap(),
            ),
            initial_source_connection_id: Some(
                ConnectionId::try_from_slice(&[5, 6, 7, 8]).unwrap(),
            ),
            stateless_reset_token: Some([0x5a; 16].into()),
            disable_active_migration: true,
            grease_quic_bit: true,
            max_datagram_frame_size: VarInt::new(65535).unwrap(),
            ..Default::default()
        };
        params.initial_max_data = VarInt::new(1_000_000).unwrap();

        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn default_round_trip_test() {
        let params = TransportParameters::default();
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn duplicate_parameter_test() {
        let mut bytes = vec![0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            for _ in 0..2 {
                encoder.encode(&VarInt::new(INITIAL_MAX_DATA).unwrap());
                encoder.encode_with_len_prefix::<VarInt, _>(&VarInt::from_u32(1200));
            }
            encoder.len()
        };

        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes[..len])).is_err());
    }

    #[test]
    fn validation_test() {
        let mut bytes = vec![0u8; 64];
        // ack_delay_exponent of 21 is invalid
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(&VarInt::new(ACK_DELAY_EXPONENT).unwrap());
            encoder.encode_with_len_prefix::<VarInt, _>(&VarInt::from_u8(21));
            encoder.len()
        };

        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes[..len])).is_err());
    }

    #[test]
    fn unknown_parameter_ignored_test() {
        let mut bytes = vec![0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            // a grease-style unknown parameter
            encoder.encode(&VarInt::new(31 * 7 + 27).unwrap());
            encoder.encode_with_len_prefix::<VarInt, _>(&VarInt::from_u8(1));
            encoder.len()
        };

        let params = TransportParameters::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
        assert_eq!(params.initial_max_data, VarInt::ZERO);
    }

    #[test]
    fn merged_idle_timeout_test() {
        let mut local = TransportParameters::default();
        let mut peer = TransportParameters::default();

        local.max_idle_timeout = Duration::from_secs(30);
        peer.max_idle_timeout = Duration::from_secs(10);
        assert_eq!(
            local.merged_idle_timeout(&peer),
            Some(Duration::from_secs(10))
        );

        peer.max_idle_timeout = Duration::ZERO;
        assert_eq!(
            local.merged_idle_timeout(&peer),
            Some(Duration::from_secs(30))
        );

        local.max_idle_timeout = Duration::ZERO;
        assert_eq!(local.merged_idle_timeout(&peer), None);
    }
}
