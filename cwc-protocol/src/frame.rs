//! Outer frame: the 12-byte header (sequence number, service id, six
//! reserved zero bytes) that wraps every message before encryption.

use cwc_crypto::{decrypt_message, encrypt_message};
use rand::RngCore;

use crate::error::ProtocolError;

/// Largest frame this protocol allows, header and trailing IV included.
pub const MAX_MESSAGE_SIZE: usize = 240;
const FRAME_HEADER_LEN: usize = 12;

/// A decoded frame: the sequence number and service id from the outer
/// header, plus a view of the message body that follows them.
pub struct DecodedFrame<'a> {
    pub seq: u16,
    pub sid: u16,
    pub payload: &'a [u8],
}

/// Build and encrypt a frame carrying `payload` as its message body.
///
/// `seq` correlates a reply back to its request; `sid` is the DVB
/// service id a running-phase ECM/EMM message belongs to (0 during the
/// login/handshake phase).
pub fn encode_frame(
    key: &[u8; 16],
    seq: u16,
    sid: u16,
    payload: &[u8],
    rng: &mut impl RngCore,
) -> Result<Vec<u8>, ProtocolError> {
    if FRAME_HEADER_LEN + payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLong);
    }

    let mut buf = vec![0u8; FRAME_HEADER_LEN];
    buf[2] = (seq >> 8) as u8;
    buf[3] = seq as u8;
    buf[4] = (sid >> 8) as u8;
    buf[5] = sid as u8;
    buf.extend_from_slice(payload);

    encrypt_message(&mut buf, key, rng)?;
    Ok(buf)
}

/// Decrypt a received frame in place and split out its header fields.
///
/// `raw` must be exactly the bytes following the 2-byte length prefix
/// read off the wire, i.e. `length` bytes where `length` is the value
/// read from the first two octets of the connection stream.
pub fn decode_frame<'a>(key: &[u8; 16], raw: &'a mut [u8]) -> Result<DecodedFrame<'a>, ProtocolError> {
    let decrypted_len = decrypt_message(raw, key)?;
    if decrypted_len < FRAME_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort);
    }

    let seq = ((raw[2] as u16) << 8) | raw[3] as u16;
    let sid = ((raw[4] as u16) << 8) | raw[5] as u16;
    Ok(DecodedFrame {
        seq,
        sid,
        payload: &raw[FRAME_HEADER_LEN..decrypted_len],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn encode_then_decode_recovers_header_and_payload() {
        let key = cwc_crypto::key_spread(&[9u8; 14]);
        let mut rng = StdRng::seed_from_u64(5);
        let mut frame = encode_frame(&key, 7, 42, b"hello", &mut rng).unwrap();

        let decoded = decode_frame(&key, &mut frame).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.sid, 42);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn oversized_payload_is_rejected_before_encryption() {
        let key = cwc_crypto::key_spread(&[0u8; 14]);
        let mut rng = StdRng::seed_from_u64(1);
        let payload = vec![0u8; MAX_MESSAGE_SIZE];
        assert_eq!(
            encode_frame(&key, 0, 0, &payload, &mut rng),
            Err(ProtocolError::MessageTooLong)
        );
    }
}
