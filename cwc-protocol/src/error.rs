use std::fmt;

use cwc_crypto::CryptoError;

/// Failures decoding or building a single wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame header plus payload would not fit in the 240-byte limit.
    MessageTooLong,
    /// A decrypted frame is shorter than the 12-byte header.
    FrameTooShort,
    /// The frame failed to decrypt.
    Crypto(CryptoError),
    /// A higher-level message body (card data, ECM reply) had an
    /// inconsistent or truncated layout.
    Malformed(&'static str),
}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        ProtocolError::Crypto(e)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MessageTooLong => write!(f, "message exceeds the 240-byte frame limit"),
            ProtocolError::FrameTooShort => write!(f, "frame shorter than the 12-byte header"),
            ProtocolError::Crypto(e) => write!(f, "crypto error: {e}"),
            ProtocolError::Malformed(what) => write!(f, "malformed message: {what}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Crypto(e) => Some(e),
            _ => None,
        }
    }
}
