// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Version Negotiation packets (RFC 9000 §17.2.1)

use crate::packet::Packet;
use core::ops::Range;
use s2n_codec::{DecoderBuffer, DecoderError, Encoder};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
//# Version Negotiation Packet {
//#   Header Form (1) = 1,
//#   Unused (7),
//#   Version (32) = 0,
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..2040),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..2040),
//#   Supported Version (32) ...,
//# }

#[derive(Debug)]
pub struct VersionNegotiation<'a> {
    pub destination_connection_id: &'a [u8],
    pub source_connection_id: &'a [u8],
    pub supported_versions: Vec<u32>,
}

/// A long header packet whose version this endpoint does not speak; retains
/// just enough to answer with a Version Negotiation packet.
#[derive(Debug)]
pub struct UnsupportedVersion {
    pub version: u32,
    pub(crate) destination_connection_id: Range<usize>,
    pub(crate) source_connection_id: Range<usize>,
}

impl UnsupportedVersion {
    pub(crate) fn split(self, datagram: &mut [u8]) -> (Packet, &mut [u8]) {
        // a packet of an unknown version cannot be parsed past the source
        // connection id, so it consumes the entire datagram
        let len = datagram.len();
        let (packet, remaining) = datagram.split_at_mut(len);
        (
            Packet::Unsupported(Unsupported {
                version: self.version,
                packet,
                destination_connection_id: self.destination_connection_id,
                source_connection_id: self.source_connection_id,
            }),
            remaining,
        )
    }
}

#[derive(Debug)]
pub struct Unsupported<'a> {
    pub version: u32,
    packet: &'a mut [u8],
    destination_connection_id: Range<usize>,
    source_connection_id: Range<usize>,
}

impl<'a> Unsupported<'a> {
    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.destination_connection_id.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.packet[self.source_connection_id.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }
}

pub(crate) fn decode(
    datagram: &mut [u8],
    dcid: Range<usize>,
    scid: Range<usize>,
    versions_offset: usize,
) -> Result<(Packet, &mut [u8]), DecoderError> {
    let mut supported_versions = Vec::new();
    {
        let mut buffer = DecoderBuffer::new(&datagram[versions_offset..]);
        while !buffer.is_empty() {
            let (version, remaining) = buffer.decode::<u32>()?;
            supported_versions.push(version);
            buffer = remaining;
        }
    }

    let len = datagram.len();
    let (packet, remaining) = datagram.split_at_mut(len);
    let packet: &[u8] = packet;

    let destination_connection_id = &packet[dcid];
    let source_connection_id = &packet[scid];

    Ok((
        Packet::VersionNegotiation(VersionNegotiation {
            destination_connection_id,
            source_connection_id,
            supported_versions,
        }),
        remaining,
    ))
}

/// Encodes a Version Negotiation packet answering `scid`/`dcid` from the
/// triggering packet (fields echoed with roles swapped).
pub fn encode<E: Encoder>(
    encoder: &mut E,
    destination_connection_id: &[u8],
    source_connection_id: &[u8],
    supported_versions: &[u32],
    random_first_byte: u8,
) {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
    //# The value in the Unused field is set to an arbitrary value by the
    //# server.  Clients MUST ignore the value of this field.
    encoder.encode(&(0x80u8 | random_first_byte));
    encoder.encode(&0u32);
    encoder.encode(&(destination_connection_id.len() as u8));
    encoder.write_slice(destination_connection_id);
    encoder.encode(&(source_connection_id.len() as u8));
    encoder.write_slice(source_connection_id);
    for version in supported_versions {
        encoder.encode(version);
    }
}
