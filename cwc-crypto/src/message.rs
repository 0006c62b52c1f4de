//! Whole-message encryption: XOR checksum, random pad, and the
//! DES-CBC / 3DES-ECB-ECB triple applied per 8-byte block, chained
//! through a trailing plaintext IV.

use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

use crate::error::CryptoError;

const MAX_FRAME_LEN: usize = 240;

fn ecb_encrypt_block(key: &[u8], block: &mut [u8; 8]) {
    let cipher = Des::new_from_slice(key).expect("8-byte DES key");
    let mut b = (*block).into();
    cipher.encrypt_block(&mut b);
    block.copy_from_slice(&b);
}

fn ecb_decrypt_block(key: &[u8], block: &mut [u8; 8]) {
    let cipher = Des::new_from_slice(key).expect("8-byte DES key");
    let mut b = (*block).into();
    cipher.decrypt_block(&mut b);
    block.copy_from_slice(&b);
}

fn xor_block(block: &mut [u8; 8], iv: &[u8; 8]) {
    for i in 0..8 {
        block[i] ^= iv[i];
    }
}

/// Encrypt `buf` in place. `buf[0..2]` is the length header (overwritten
/// on return), `buf[2..]` is the plaintext payload. Appends padding, a
/// checksum byte, and a trailing plaintext IV, then encrypts every
/// 8-byte block with the triple DES-CBC(key0) / DES-ECB-dec(key1) /
/// DES-ECB-enc(key0) construction, chaining each block's own ciphertext
/// as the IV for the next.
pub fn encrypt_message(
    buf: &mut Vec<u8>,
    key: &[u8; 16],
    rng: &mut impl RngCore,
) -> Result<(), CryptoError> {
    let key0 = &key[0..8];
    let key1 = &key[8..16];

    let len0 = buf.len();
    let r = (len0 - 1) % 8;
    let pad = (8 - r) % 8;
    if len0 + pad + 1 + 8 > MAX_FRAME_LEN {
        return Err(CryptoError::FrameTooLong);
    }

    for _ in 0..pad {
        buf.push((rng.next_u32() & 0xff) as u8);
    }

    let checksum = buf[2..].iter().fold(0u8, |acc, b| acc ^ b);
    buf.push(checksum);

    let block_region_end = buf.len();

    let mut iv = [0u8; 8];
    rng.fill_bytes(&mut iv);
    buf.extend_from_slice(&iv);

    let mut running_iv = iv;
    let mut i = 2;
    while i < block_region_end {
        let mut block: [u8; 8] = buf[i..i + 8].try_into().unwrap();
        xor_block(&mut block, &running_iv);
        ecb_encrypt_block(key0, &mut block);
        ecb_decrypt_block(key1, &mut block);
        ecb_encrypt_block(key0, &mut block);
        buf[i..i + 8].copy_from_slice(&block);
        running_iv = block;
        i += 8;
    }

    let out_len = (buf.len() - 2) as u16;
    buf[0] = (out_len >> 8) as u8;
    buf[1] = out_len as u8;
    Ok(())
}

/// Decrypt `buf` in place, returning the length of the recovered
/// plaintext (header + payload, excluding the trailing IV and not yet
/// stripped of pad/checksum — callers trim using their own framed
/// length field, same as the original `cwc_decrypt`).
pub fn decrypt_message(buf: &mut [u8], key: &[u8; 16]) -> Result<usize, CryptoError> {
    let key0 = &key[0..8];
    let key1 = &key[8..16];

    let total_len = buf.len();
    if total_len < 2 + 8 + 8 || (total_len - 2) % 8 != 0 {
        return Err(CryptoError::FrameTooShort);
    }

    let block_region_end = total_len - 8;
    let mut next_iv: [u8; 8] = buf[block_region_end..total_len].try_into().unwrap();

    let mut i = 2;
    while i < block_region_end {
        let iv = next_iv;
        let ciphertext_block: [u8; 8] = buf[i..i + 8].try_into().unwrap();
        next_iv = ciphertext_block;

        let mut block = ciphertext_block;
        ecb_decrypt_block(key0, &mut block);
        ecb_encrypt_block(key1, &mut block);
        ecb_decrypt_block(key0, &mut block);
        xor_block(&mut block, &iv);

        buf[i..i + 8].copy_from_slice(&block);
        i += 8;
    }

    let checksum = buf[2..block_region_end].iter().fold(0u8, |acc, b| acc ^ b);
    if checksum != 0 {
        return Err(CryptoError::ChecksumMismatch);
    }

    Ok(block_region_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn key() -> [u8; 16] {
        crate::key::key_spread(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14])
    }

    #[test]
    fn round_trip_recovers_plaintext() {
        let k = key();
        let mut rng = StdRng::seed_from_u64(42);
        let payload = b"hello cwc world!".to_vec();
        let mut buf = vec![0u8, 0u8];
        buf.extend_from_slice(&payload);

        let original_payload = buf[2..].to_vec();
        encrypt_message(&mut buf, &k, &mut rng).unwrap();

        let decrypted_len = decrypt_message(&mut buf, &k).unwrap();
        assert_eq!(&buf[2..2 + original_payload.len()], &original_payload[..]);
        assert!(decrypted_len >= 2 + original_payload.len());
    }

    #[test]
    fn tampered_ciphertext_fails_checksum() {
        let k = key();
        let mut rng = StdRng::seed_from_u64(7);
        let mut buf = vec![0u8, 0u8];
        buf.extend_from_slice(b"short payload");
        encrypt_message(&mut buf, &k, &mut rng).unwrap();

        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;
        assert_eq!(decrypt_message(&mut buf, &k), Err(CryptoError::ChecksumMismatch));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let k = key();
        let mut rng = StdRng::seed_from_u64(1);
        let mut buf = vec![0u8, 0u8];
        buf.extend(std::iter::repeat(0u8).take(250));
        assert_eq!(encrypt_message(&mut buf, &k, &mut rng), Err(CryptoError::FrameTooLong));
    }
}
