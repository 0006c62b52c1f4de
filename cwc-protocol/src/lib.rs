//! Wire framing and message parsing for the CWC card-server protocol.
//!
//! This crate owns everything about turning bytes on the wire into
//! typed messages and back; it knows nothing about sockets, servers,
//! or retry policy — see `cwc-client` for that.

mod card_data;
mod error;
mod frame;
mod login;
mod opcode;
mod running;

pub use card_data::{CardData, Provider, parse_card_data};
pub use error::ProtocolError;
pub use frame::{DecodedFrame, MAX_MESSAGE_SIZE, decode_frame, encode_frame};
pub use login::{build_card_data_request, build_keepalive, build_login_request};
pub use opcode::Opcode;
pub use running::{CaMessageKind, EcmReply, classify_ca_message, parse_ecm_reply};
