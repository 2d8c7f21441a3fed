// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Null crypto suite for exercising the transport without a TLS provider
//!
//! The null key reserves a real-sized tag so packet sizing behaves like a
//! production suite, but the "tag" is a checksum of the payload and the
//! packet number rather than an AEAD output.

use super::{CryptoError, HeaderKey, Key, LevelKeys, HEADER_PROTECTION_MASK_LEN};

const TAG_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Default)]
pub struct NullKey;

impl NullKey {
    fn tag(packet_number: u64, payload: &[u8]) -> [u8; TAG_LEN] {
        let mut acc = 0xcafe_f00d_u64 ^ packet_number;
        for (index, byte) in payload.iter().enumerate() {
            acc = acc
                .rotate_left(7)
                .wrapping_add((*byte as u64) << (index % 8));
        }
        let mut tag = [0; TAG_LEN];
        tag[..8].copy_from_slice(&acc.to_be_bytes());
        tag[8..].copy_from_slice(&acc.rotate_left(32).to_be_bytes());
        tag
    }
}

impl Key for NullKey {
    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn seal(
        &self,
        packet_number: u64,
        _header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), CryptoError> {
        if payload.len() < TAG_LEN {
            return Err(CryptoError::INTERNAL_ERROR.with_reason("payload too short for tag"));
        }
        let split = payload.len() - TAG_LEN;
        let tag = Self::tag(packet_number, &payload[..split]);
        payload[split..].copy_from_slice(&tag);
        Ok(())
    }

    fn open(
        &self,
        packet_number: u64,
        _header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError> {
        if payload.len() < TAG_LEN {
            return Err(CryptoError::DECRYPT_ERROR);
        }
        let split = payload.len() - TAG_LEN;
        let expected = Self::tag(packet_number, &payload[..split]);
        if payload[split..] != expected {
            return Err(CryptoError::DECRYPT_ERROR);
        }
        Ok(split)
    }
}

/// A header "protection" key applying an all-zero mask
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHeaderKey;

impl HeaderKey for NullHeaderKey {
    fn mask(&self, _sample: &[u8]) -> [u8; HEADER_PROTECTION_MASK_LEN] {
        [0; HEADER_PROTECTION_MASK_LEN]
    }
}

/// Creates a null key pair for one level and direction
pub fn null_keys() -> LevelKeys {
    LevelKeys {
        key: Box::new(NullKey),
        header_key: Box::new(NullHeaderKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_test() {
        let key = NullKey;
        let mut payload = vec![1, 2, 3];
        payload.extend_from_slice(&[0; TAG_LEN]);

        key.seal(7, &[], &mut payload).unwrap();
        assert_eq!(key.open(7, &[], &mut payload), Ok(3));

        // a different packet number fails authentication
        assert_eq!(key.open(8, &[], &mut payload), Err(CryptoError::DECRYPT_ERROR));

        // tampering fails authentication
        payload[0] ^= 1;
        assert_eq!(key.open(7, &[], &mut payload), Err(CryptoError::DECRYPT_ERROR));
    }
}
