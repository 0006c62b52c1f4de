use std::fmt;

/// Failure modes for message encryption/decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The padded, checksummed frame would exceed the protocol's 240-byte cap.
    FrameTooLong,
    /// A frame presented for decryption is shorter than the minimum
    /// header + one block + trailing IV, or not block-aligned.
    FrameTooShort,
    /// The XOR checksum recovered after decryption did not clear to zero.
    ChecksumMismatch,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::FrameTooLong => write!(f, "message grew past the 240-byte frame limit"),
            CryptoError::FrameTooShort => write!(f, "message too short or not block-aligned to decrypt"),
            CryptoError::ChecksumMismatch => write!(f, "message checksum did not verify"),
        }
    }
}

impl std::error::Error for CryptoError {}
