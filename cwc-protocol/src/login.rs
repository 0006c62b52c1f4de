//! Message bodies for the login/handshake phase: login request, card
//! data request, keep-alive. Each is built as `[opcode, len_hi,
//! len_lo, ...body]`, the envelope `encode_frame` then wraps in the
//! outer 12-byte header.

use crate::opcode::Opcode;

/// Build a `CLIENT_2_SERVER_LOGIN` body from a username and an
/// already-hashed password, both NUL-terminated the way the server
/// expects.
pub fn build_login_request(username: &str, password_hashed: &str) -> Vec<u8> {
    let mut user = username.as_bytes().to_vec();
    user.push(0);
    let mut pass = password_hashed.as_bytes().to_vec();
    pass.push(0);

    let body_len = user.len() + pass.len();
    let mut msg = Vec::with_capacity(3 + body_len);
    msg.push(Opcode::ClientLogin.as_u8());
    msg.push(0);
    msg.push(body_len as u8);
    msg.extend_from_slice(&user);
    msg.extend_from_slice(&pass);
    msg
}

pub fn build_card_data_request() -> Vec<u8> {
    vec![Opcode::CardDataReq.as_u8(), 0, 0]
}

pub fn build_keepalive() -> Vec<u8> {
    vec![Opcode::KeepAlive.as_u8(), 0, 0]
}
