//! Server configuration: the externally supplied fields, the partial
//! update an admin call may apply, and the read-only snapshot handed
//! back to callers.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Everything needed to dial and authenticate against one card server.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerConfig {
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub des_key: [u8; 14],
    pub emm: bool,
    pub comment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            enabled: false,
            hostname: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            des_key: [0u8; 14],
            emm: false,
            comment: String::new(),
        }
    }
}

/// A partial patch to a [`ServerConfig`]; unset fields are left alone.
/// Mirrors the admin API's field-at-a-time update semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub des_key: Option<String>,
    pub emm: Option<bool>,
    pub comment: Option<String>,
}

/// The read-only view returned by the registry: everything in
/// [`ServerConfig`] except the things nobody outside the session
/// should see (password is included since the original admin API
/// exposes it too; the derived session key and sequence counter never
/// leave the session).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerSnapshot {
    pub id: String,
    pub enabled: bool,
    pub connected: bool,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub des_key: String,
    pub emm: bool,
    pub comment: String,
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse a human-edited hex string into a 14-byte DES key, skipping
/// any non-hex separators (`:`, spaces, ...). Bytes not covered by a
/// full pair in the input are left zeroed, matching the original
/// admin form's tolerant parsing.
pub fn parse_des_key(s: &str) -> [u8; 14] {
    let mut key = [0u8; 14];
    let bytes = s.as_bytes();
    let mut pos = 0;

    for slot in key.iter_mut() {
        let Some(hi) = next_hex_digit(bytes, &mut pos) else { break };
        let Some(lo) = next_hex_digit(bytes, &mut pos) else { break };
        *slot = (hi << 4) | lo;
    }

    key
}

fn next_hex_digit(bytes: &[u8], pos: &mut usize) -> Option<u8> {
    while *pos < bytes.len() {
        let c = bytes[*pos];
        *pos += 1;
        if let Some(d) = nibble(c) {
            return Some(d);
        }
    }
    None
}

/// Render a 14-byte DES key the way the admin snapshot displays it:
/// colon-separated lowercase hex.
pub fn format_des_key(key: &[u8; 14]) -> String {
    key.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
