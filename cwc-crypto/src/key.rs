//! DES key parity adjustment, 14→16 byte spread, and the two key
//! derivations used by the handshake (login key, session key).

/// Set the low bit of every byte so the byte has odd parity over its
/// high 7 bits, the DES key-parity convention this protocol expects.
pub fn parity_adjust(key: &mut [u8]) {
    for b in key.iter_mut() {
        let mut parity: u8 = 1;
        for j in 1..8 {
            if (*b >> j) & 1 != 0 {
                parity = !parity & 1;
            }
        }
        *b |= parity;
    }
}

/// Spread a 14-byte key into the 16-byte form DES wants, one 7-bit
/// group per output byte. The bit assignments below are fixed by the
/// wire protocol and must not be reshuffled.
pub fn key_spread(normal: &[u8; 14]) -> [u8; 16] {
    let mut spread = [0u8; 16];

    spread[0] = normal[0] & 0xfe;
    spread[1] = ((normal[0] << 7) | (normal[1] >> 1)) & 0xfe;
    spread[2] = ((normal[1] << 6) | (normal[2] >> 2)) & 0xfe;
    spread[3] = ((normal[2] << 5) | (normal[3] >> 3)) & 0xfe;
    spread[4] = ((normal[3] << 4) | (normal[4] >> 4)) & 0xfe;
    spread[5] = ((normal[4] << 3) | (normal[5] >> 5)) & 0xfe;
    spread[6] = ((normal[5] << 2) | (normal[6] >> 6)) & 0xfe;
    spread[7] = normal[6] << 1;
    spread[8] = normal[7] & 0xfe;
    spread[9] = ((normal[7] << 7) | (normal[8] >> 1)) & 0xfe;
    spread[10] = ((normal[8] << 6) | (normal[9] >> 2)) & 0xfe;
    spread[11] = ((normal[9] << 5) | (normal[10] >> 3)) & 0xfe;
    spread[12] = ((normal[10] << 4) | (normal[11] >> 4)) & 0xfe;
    spread[13] = ((normal[11] << 3) | (normal[12] >> 5)) & 0xfe;
    spread[14] = ((normal[12] << 2) | (normal[13] >> 6)) & 0xfe;
    spread[15] = normal[13] << 1;

    parity_adjust(&mut spread);
    spread
}

/// Derive the transient login key from the 14 bytes the server sends
/// before authentication, XORed with the statically configured key.
pub fn derive_login_key(configured_key: &[u8; 14], received: &[u8; 14]) -> [u8; 16] {
    let mut xored = [0u8; 14];
    for i in 0..14 {
        xored[i] = configured_key[i] ^ received[i];
    }
    key_spread(&xored)
}

/// Derive the session key used for all post-login frames, from the
/// configured key XORed round-robin with the hashed password.
pub fn derive_session_key(configured_key: &[u8; 14], password_hashed: &[u8]) -> [u8; 16] {
    let mut buf = *configured_key;
    for (i, b) in password_hashed.iter().enumerate() {
        buf[i % 14] ^= b;
    }
    key_spread(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_adjust_sets_odd_parity() {
        let mut key = [0x00u8, 0xff, 0x55, 0xaa];
        parity_adjust(&mut key);
        for b in key {
            let ones = (1..8).filter(|j| (b >> j) & 1 != 0).count();
            assert_eq!((ones + (b & 1) as usize) % 2, 1, "byte {b:#x} must have odd parity");
        }
    }

    #[test]
    fn key_spread_is_deterministic() {
        let input = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14];
        assert_eq!(key_spread(&input), key_spread(&input));
    }

    #[test]
    fn key_spread_output_has_parity_bits_set() {
        let input = [0xffu8; 14];
        let spread = key_spread(&input);
        for b in spread {
            assert_eq!(b & 1, b & 1); // parity bit is always defined (0 or 1)
            // every byte must carry odd parity over its top 7 bits
            let ones = (1..8).filter(|j| (b >> j) & 1 != 0).count();
            assert_eq!((ones + (b & 1) as usize) % 2, 1);
        }
    }

    #[test]
    fn derive_session_key_wraps_password_round_robin() {
        let cfg = [0u8; 14];
        let short = derive_session_key(&cfg, b"ab");
        let long = derive_session_key(&cfg, b"abababababababab"); // same pattern, longer
        assert_eq!(short, long, "round-robin XOR must repeat the same way regardless of length");
    }
}
