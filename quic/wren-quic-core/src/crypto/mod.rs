// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seams to the AEAD and header-protection primitives
//!
//! The TLS layer installs keys per encryption level through these traits;
//! the transport never sees key material, only seal/open capabilities.

use core::fmt;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// The length of the ciphertext sample used for header protection
//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
//# in sampling packet ciphertext for header protection, the Packet Number field is
//# assumed to be 4 bytes long
pub const HEADER_PROTECTION_SAMPLE_LEN: usize = 16;

/// The number of bytes the header protection mask covers
pub const HEADER_PROTECTION_MASK_LEN: usize = 5;

/// An error returned by the AEAD or the TLS layer
///
/// `code` is a TLS alert value; it maps into the 0x0100-0x01ff transport
/// error range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoError {
    pub code: u8,
    pub reason: &'static str,
}

impl CryptoError {
    //= https://www.rfc-editor.org/rfc/rfc8446#section-6
    //# enum { ... decrypt_error(51), ... } AlertDescription;
    pub const DECRYPT_ERROR: Self = Self {
        code: 51,
        reason: "",
    };

    pub const INTERNAL_ERROR: Self = Self {
        code: 80,
        reason: "",
    };

    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "CryptoError({})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

/// An encryption level
///
/// 0-RTT and 1-RTT share the application packet-number space but use
/// distinct keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl Level {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake)
    }

    #[inline]
    pub fn is_application(self) -> bool {
        matches!(self, Self::ZeroRtt | Self::OneRtt)
    }
}

/// The 1-RTT key phase bit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyPhase {
    #[default]
    Zero,
    One,
}

impl KeyPhase {
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }
}

/// A packet protection key for one level and direction
pub trait Key: 'static + Send {
    /// The length of the AEAD authentication tag
    fn tag_len(&self) -> usize;

    /// Seals `payload` in place; the final `tag_len` bytes of `payload` are
    /// reserved for the tag. The full packet number forms the nonce.
    fn seal(&self, packet_number: u64, header: &[u8], payload: &mut [u8])
        -> Result<(), CryptoError>;

    /// Opens `payload` in place, returning the plaintext length
    fn open(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError>;
}

/// A header protection key for one level and direction
pub trait HeaderKey: 'static + Send {
    /// Derives the header protection mask from a ciphertext sample
    fn mask(&self, sample: &[u8]) -> [u8; HEADER_PROTECTION_MASK_LEN];
}

/// The keys for a single level and direction
pub struct LevelKeys {
    pub key: Box<dyn Key>,
    pub header_key: Box<dyn HeaderKey>,
}

impl fmt::Debug for LevelKeys {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LevelKeys").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Slot {
    send: Option<LevelKeys>,
    recv: Option<LevelKeys>,
}

/// Tracks per-level key readiness for both directions
///
/// This is the gate deciding which packets may be built and which received
/// packets can be opened; packets for a level without receive keys are
/// parked by the inbound pipeline until the TLS layer installs them.
#[derive(Debug, Default)]
pub struct KeyGate {
    slots: [Slot; Level::COUNT],
    /// Pending 1-RTT keys for the next key phase
    next_one_rtt: Option<(LevelKeys, LevelKeys)>,
    key_phase: KeyPhase,
}

impl KeyGate {
    #[inline]
    pub fn install_send(&mut self, level: Level, keys: LevelKeys) {
        self.slots[level as usize].send = Some(keys);
    }

    #[inline]
    pub fn install_recv(&mut self, level: Level, keys: LevelKeys) {
        self.slots[level as usize].recv = Some(keys);
    }

    /// Installs the key material for the next 1-RTT key phase
    #[inline]
    pub fn install_next_one_rtt(&mut self, send: LevelKeys, recv: LevelKeys) {
        self.next_one_rtt = Some((send, recv));
    }

    #[inline]
    pub fn send_ready(&self, level: Level) -> bool {
        self.slots[level as usize].send.is_some()
    }

    #[inline]
    pub fn recv_ready(&self, level: Level) -> bool {
        self.slots[level as usize].recv.is_some()
    }

    #[inline]
    pub fn send_keys(&self, level: Level) -> Option<&LevelKeys> {
        self.slots[level as usize].send.as_ref()
    }

    #[inline]
    pub fn recv_keys(&self, level: Level) -> Option<&LevelKeys> {
        self.slots[level as usize].recv.as_ref()
    }

    #[inline]
    pub fn key_phase(&self) -> KeyPhase {
        self.key_phase
    }

    /// Returns true if the next 1-RTT keys are staged
    #[inline]
    pub fn can_update_keys(&self) -> bool {
        self.next_one_rtt.is_some()
    }

    /// Rotates to the next 1-RTT key phase.
    ///
    /// Returns the new phase, or `None` when no next keys were staged.
    pub fn update_keys(&mut self) -> Option<KeyPhase> {
        let (send, recv) = self.next_one_rtt.take()?;
        self.slots[Level::OneRtt as usize] = Slot {
            send: Some(send),
            recv: Some(recv),
        };
        self.key_phase = self.key_phase.next();
        Some(self.key_phase)
    }

    /// Discards both directions of a level (handshake progression)
    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9
    //# An endpoint MUST discard its Handshake keys when the TLS handshake is
    //# confirmed
    #[inline]
    pub fn discard(&mut self, level: Level) {
        self.slots[level as usize] = Slot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::null_keys;

    #[test]
    fn gate_test() {
        let mut gate = KeyGate::default();
        assert!(!gate.send_ready(Level::Initial));

        gate.install_send(Level::Initial, null_keys());
        assert!(gate.send_ready(Level::Initial));
        assert!(!gate.recv_ready(Level::Initial));

        gate.install_recv(Level::Initial, null_keys());
        assert!(gate.recv_ready(Level::Initial));

        gate.discard(Level::Initial);
        assert!(!gate.send_ready(Level::Initial));
        assert!(!gate.recv_ready(Level::Initial));
    }

    #[test]
    fn key_update_test() {
        let mut gate = KeyGate::default();
        gate.install_send(Level::OneRtt, null_keys());
        gate.install_recv(Level::OneRtt, null_keys());

        assert_eq!(gate.update_keys(), None);

        gate.install_next_one_rtt(null_keys(), null_keys());
        assert!(gate.can_update_keys());
        assert_eq!(gate.update_keys(), Some(KeyPhase::One));
        assert_eq!(gate.key_phase(), KeyPhase::One);
        assert!(!gate.can_update_keys());
    }
}
