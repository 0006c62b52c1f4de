//! Cryptographic primitives for the CWC card-server wire protocol.
//!
//! This crate has no notion of sockets, servers, or sessions; it only
//! knows how to turn a 14-byte configured key plus some key material
//! into a usable 16-byte DES key, and how to encrypt or decrypt a
//! single message buffer with it.

mod error;
mod key;
mod message;

pub use error::CryptoError;
pub use key::{derive_login_key, derive_session_key, key_spread, parity_adjust};
pub use message::{decrypt_message, encrypt_message};
