// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stateless reset tokens
//!
//! Tokens are derived from a per-endpoint secret and the connection ID they
//! are bound to, so an endpoint which lost all connection state can still
//! produce the token a peer expects.

use crate::connection::ConnectionId;
use subtle::ConstantTimeEq;

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
//# Stateless Reset {
//#   Fixed Bits (2) = 01,
//#   Unpredictable Bits (38..),
//#   Stateless Reset Token (128),
//# }
pub const TOKEN_LEN: usize = 16;

/// A 16-byte stateless reset token
///
/// Comparison is constant time; a forged token must not be distinguishable
/// through timing.
#[derive(Clone, Copy, Debug)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub const ZEROED: Self = Self([0; TOKEN_LEN]);

    #[inline]
    pub const fn new(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn into_inner(self) -> [u8; TOKEN_LEN] {
        self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Token {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Token {}

impl From<[u8; TOKEN_LEN]> for Token {
    #[inline]
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

/// Derives stateless reset tokens from an endpoint-wide secret
#[derive(Clone, Debug)]
pub struct Signer {
    secret: [u8; 32],
}

impl Signer {
    pub const fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Derives the token for a locally issued connection ID.
    ///
    /// This is a keyed pseudo-random function over the ID bytes. It is not a
    /// standardized construction; both sides of the derivation live in this
    /// endpoint so only collision resistance against outsiders matters.
    pub fn sign(&self, id: &ConnectionId) -> Token {
        let mut state = [0u64; 4];
        for (index, chunk) in self.secret.chunks(8).enumerate() {
            state[index] = u64::from_be_bytes(chunk.try_into().expect("secret is 32 bytes"));
        }

        for (index, byte) in id.as_bytes().iter().enumerate() {
            let lane = index % 4;
            state[lane] = state[lane]
                .rotate_left(11)
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                ^ ((*byte as u64) << (8 * (index % 8)));
        }

        let mut token = [0; TOKEN_LEN];
        token[..8].copy_from_slice(&(state[0] ^ state[2]).to_be_bytes());
        token[8..].copy_from_slice(&(state[1] ^ state[3]).to_be_bytes());
        Token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable_test() {
        let signer = Signer::new([7; 32]);
        let id = ConnectionId::try_from_slice(&[1, 2, 3, 4]).unwrap();

        assert_eq!(signer.sign(&id), signer.sign(&id));

        let other = ConnectionId::try_from_slice(&[1, 2, 3, 5]).unwrap();
        assert_ne!(signer.sign(&id), signer.sign(&other));

        let other_signer = Signer::new([8; 32]);
        assert_ne!(signer.sign(&id), other_signer.sign(&id));
    }
}
