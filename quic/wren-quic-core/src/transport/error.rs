// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::{VarInt, VarIntError};
use core::fmt;
use s2n_codec::DecoderError;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A QUIC transport-level error
///
/// Errors are sticky: the first error raised on a connection is the one
/// reported in the CONNECTION_CLOSE frame and to every pending waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl Error {
    /// Creates a new `Error` with the specified information
    pub const fn new(code: VarInt, reason: &'static str, frame_type: Option<VarInt>) -> Self {
        Self {
            code,
            reason,
            frame_type,
        }
    }

    /// Updates the `Error` with the specified `frame_type`
    #[must_use]
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    /// Updates the `Error` with the specified `reason`
    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    /// Returns true if the error was raised by the application rather than
    /// the transport (CONNECTION_CLOSE frame type 0x1d carries no frame type)
    #[inline]
    pub fn is_application_error(&self) -> bool {
        self.frame_type.is_none()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            let code: u64 = self.code.into();
            write!(f, "TransportError({code})")
        } else {
            f.write_str(self.reason)
        }
    }
}

impl std::error::Error for Error {}

/// Internal convenience macro for defining standard error codes
macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: VarInt = VarInt::from_u32($code);
        }
    };
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# NO_ERROR (0x00):  An endpoint uses this with CONNECTION_CLOSE to
//#    signal that the connection is being closed abruptly in the absence
//#    of any error.
def_error!(
    "The connection is being closed abruptly in the absence of any error.",
    NO_ERROR,
    0x0
);

def_error!(
    "The endpoint encountered an internal error and cannot continue with the connection.",
    INTERNAL_ERROR,
    0x1
);

def_error!(
    "The server refused to accept a new connection.",
    CONNECTION_REFUSED,
    0x2
);

def_error!(
    "An endpoint received more data than it permitted in its advertised data limits.",
    FLOW_CONTROL_ERROR,
    0x3
);

def_error!(
    "An endpoint received a frame for a stream identifier that exceeded its advertised stream limit for the corresponding stream type.",
    STREAM_LIMIT_ERROR,
    0x4
);

def_error!(
    "An endpoint received a frame for a stream that was not in a state that permitted that frame.",
    STREAM_STATE_ERROR,
    0x5
);

def_error!(
    "An endpoint received a STREAM or RESET_STREAM frame violating the previously established final size.",
    FINAL_SIZE_ERROR,
    0x6
);

def_error!(
    "An endpoint received a frame that was badly formatted.",
    FRAME_ENCODING_ERROR,
    0x7
);

def_error!(
    "An endpoint received transport parameters that were badly formatted.",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);

def_error!(
    "An endpoint received more connection IDs than its advertised active_connection_id_limit.",
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);

def_error!(
    "An endpoint detected an error with protocol compliance that was not covered by more specific error codes.",
    PROTOCOL_VIOLATION,
    0xA
);

def_error!(
    "A server received a client Initial that contained an invalid Token field.",
    INVALID_TOKEN,
    0xB
);

def_error!(
    "The application or application protocol caused the connection to be closed.",
    APPLICATION_ERROR,
    0xC
);

def_error!(
    "An endpoint has received more data in CRYPTO frames than it can buffer.",
    CRYPTO_BUFFER_EXCEEDED,
    0xD
);

def_error!(
    "An endpoint detected errors in performing key updates.",
    KEY_UPDATE_ERROR,
    0xE
);

def_error!(
    "An endpoint has reached the confidentiality or integrity limit for the AEAD algorithm.",
    AEAD_LIMIT_REACHED,
    0xF
);

def_error!(
    "An endpoint has determined that the network path is incapable of supporting QUIC.",
    NO_VIABLE_PATH,
    0x10
);

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# CRYPTO_ERROR (0x0100-0x01ff):  The cryptographic handshake failed.  A
//#    range of 256 values is reserved for carrying error codes specific
//#    to the cryptographic handshake that is used.
impl Error {
    /// Creates a crypto-level `Error` from a TLS alert code.
    #[inline]
    pub fn crypto_error(code: u8, reason: &'static str) -> Self {
        Self {
            code: VarInt::from_u32(0x100 | u32::from(code)),
            reason,
            frame_type: None,
        }
    }

    /// Creates an application-level `Error`
    #[inline]
    pub const fn application_error(code: VarInt, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            frame_type: None,
        }
    }
}

/// Creates a transport `Error` with variable arguments
#[macro_export]
macro_rules! transport_error {
    ($error:ident) => {
        $crate::transport::Error::new($crate::transport::Error::$error, "", Some($crate::varint::VarInt::ZERO))
    };
    ($error:ident, $reason:expr) => {
        $crate::transport::Error::new(
            $crate::transport::Error::$error,
            $reason,
            Some($crate::varint::VarInt::ZERO),
        )
    };
    ($error:ident, $reason:expr, $frame:expr) => {
        $crate::transport::Error::new(
            $crate::transport::Error::$error,
            $reason,
            Some($frame.into()),
        )
    };
}

impl From<DecoderError> for Error {
    fn from(decoder_error: DecoderError) -> Self {
        match decoder_error {
            DecoderError::InvariantViolation(reason) => {
                transport_error!(FRAME_ENCODING_ERROR).with_reason(reason)
            }
            _ => transport_error!(FRAME_ENCODING_ERROR, "malformed payload"),
        }
    }
}

impl From<VarIntError> for Error {
    fn from(_: VarIntError) -> Self {
        transport_error!(INTERNAL_ERROR, "varint encoding limit exceeded")
    }
}

impl From<crate::crypto::CryptoError> for Error {
    fn from(error: crate::crypto::CryptoError) -> Self {
        Self::crypto_error(error.code, error.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_test() {
        let error = transport_error!(PROTOCOL_VIOLATION, "bad packet");
        assert_eq!(error.to_string(), "bad packet");

        let error = Error::new(Error::FLOW_CONTROL_ERROR, "", None);
        assert_eq!(error.to_string(), "TransportError(3)");
    }

    #[test]
    fn crypto_error_test() {
        // TLS handshake_failure alert
        let error = Error::crypto_error(40, "handshake failure");
        assert_eq!(error.code, VarInt::from_u32(0x128));
    }
}
