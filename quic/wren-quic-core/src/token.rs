// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Opaque blobs exchanged with the peer: address validation tokens and TLS
//! session tickets.
//!
//! Both are produced by external layers and echoed back verbatim; the
//! transport only enforces size bounds and hands them to the application.

use bytes::Bytes;
use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-8.1.3
//# A token SHOULD be constructed for the server to easily distinguish it from
//# tokens that are sent in Retry packets, as these are carried in the same field.

/// The largest address validation token accepted or produced
pub const MAX_ADDRESS_TOKEN_LEN: usize = 120;

/// The largest session ticket stored for the application
pub const MAX_SESSION_TICKET_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceedsMaxLen;

macro_rules! blob {
    ($name:ident, $max:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Default, PartialEq, Eq)]
        pub struct $name(Bytes);

        impl $name {
            #[inline]
            pub fn try_from_slice(slice: &[u8]) -> Result<Self, ExceedsMaxLen> {
                if slice.len() > $max {
                    return Err(ExceedsMaxLen);
                }
                Ok(Self(Bytes::copy_from_slice(slice)))
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            #[inline]
            pub fn len(&self) -> usize {
                self.0.len()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({} bytes)", stringify!($name), self.0.len())
            }
        }

        impl AsRef<[u8]> for $name {
            #[inline]
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

blob!(
    AddressToken,
    MAX_ADDRESS_TOKEN_LEN,
    "An address validation token (NEW_TOKEN / Initial token field)"
);
blob!(
    SessionTicket,
    MAX_SESSION_TICKET_LEN,
    "A TLS session ticket stored for resumption"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_test() {
        assert!(AddressToken::try_from_slice(&[0; MAX_ADDRESS_TOKEN_LEN]).is_ok());
        assert!(AddressToken::try_from_slice(&[0; MAX_ADDRESS_TOKEN_LEN + 1]).is_err());
        assert!(SessionTicket::try_from_slice(&[0; MAX_SESSION_TICKET_LEN]).is_ok());
        assert!(SessionTicket::try_from_slice(&[0; MAX_SESSION_TICKET_LEN + 1]).is_err());
    }
}
