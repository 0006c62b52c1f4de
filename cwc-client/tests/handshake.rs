//! End-to-end session tests: a fake card server on one end of an
//! in-memory duplex pipe, the real session/registry stack on the
//! other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use cwc_client::collaborators::testing::{IdentityPasswordHasher, QueuedConnector, RecordingStatusBus};
use cwc_client::{CwcBackoff, Registry, ServerConfig, SessionEvents, SessionHandle};
use cwc_crypto::{derive_login_key, derive_session_key};
use cwc_protocol::{CardData, Opcode, decode_frame, encode_frame};

const DES_KEY: [u8; 14] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14];
const PASSWORD: &str = "secret";

fn config() -> ServerConfig {
    ServerConfig {
        enabled: true,
        hostname: "test".to_string(),
        port: 1,
        username: "alice".to_string(),
        password: PASSWORD.to_string(),
        des_key: DES_KEY,
        emm: true,
        comment: String::new(),
    }
}

#[derive(Default)]
struct RecordingEvents {
    card_data: Mutex<Vec<CardData>>,
    handles: Mutex<Vec<SessionHandle>>,
    replies: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl SessionEvents for RecordingEvents {
    fn on_connected(&self, handle: SessionHandle) {
        self.handles.lock().unwrap().push(handle);
    }
    fn on_card_data(&self, card_data: &CardData) {
        self.card_data.lock().unwrap().push(card_data.clone());
    }
    fn on_running_reply(&self, seq: u16, payload: &[u8]) {
        self.replies.lock().unwrap().push((seq, payload.to_vec()));
    }
}

async fn read_frame(stream: &mut DuplexStream, key: &[u8; 16]) -> (u16, Vec<u8>) {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = ((len_buf[0] as usize) << 8) | len_buf[1] as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    let mut raw = Vec::with_capacity(2 + len);
    raw.extend_from_slice(&len_buf);
    raw.extend_from_slice(&body);
    let decoded = decode_frame(key, &mut raw).unwrap();
    (decoded.seq, decoded.payload.to_vec())
}

fn sample_card_data_payload() -> Vec<u8> {
    let mut msg = vec![Opcode::CardData.as_u8(), 0x00, 0x00, 0x07, 0x0b, 0x00];
    msg.extend_from_slice(&[0xaa; 8]); // unique address
    msg.push(1); // one provider
    msg.extend_from_slice(&[0x00, 0x01, 0x02]); // provider id
    msg.extend_from_slice(&[0x11; 8]); // shared address
    let plen: u16 = 14 + 11;
    msg[1] = ((plen >> 8) & 0x0f) as u8;
    msg[2] = plen as u8;
    msg
}

/// Plays the card-server side of the handshake: sends the pre-login
/// key, acks the login, and answers the card-data request. Returns
/// the connection and the derived session key so a test can keep
/// talking over the running phase.
async fn run_fake_handshake(mut stream: DuplexStream) -> (DuplexStream, [u8; 16], StdRng) {
    let mut rng = StdRng::seed_from_u64(1);

    let mut received_key = [0u8; 14];
    rng.fill_bytes(&mut received_key);
    stream.write_all(&received_key).await.unwrap();

    let login_key = derive_login_key(&DES_KEY, &received_key);
    let (seq, login_body) = read_frame(&mut stream, &login_key).await;
    assert_eq!(login_body[0], Opcode::ClientLogin.as_u8());

    let ack = encode_frame(&login_key, seq, 0, &[Opcode::ClientLoginAck.as_u8(), 0, 0], &mut rng).unwrap();
    stream.write_all(&ack).await.unwrap();

    let session_key = derive_session_key(&DES_KEY, PASSWORD.as_bytes());
    let (seq, card_req) = read_frame(&mut stream, &session_key).await;
    assert_eq!(card_req[0], Opcode::CardDataReq.as_u8());

    let reply = encode_frame(&session_key, seq, 0, &sample_card_data_payload(), &mut rng).unwrap();
    stream.write_all(&reply).await.unwrap();

    (stream, session_key, rng)
}

#[tokio::test]
async fn happy_path_login_and_card_data() {
    let connector = Arc::new(QueuedConnector::new());
    let (client_end, server_end) = tokio::io::duplex(4096);
    connector.push_stream(client_end);

    let server = tokio::spawn(run_fake_handshake(server_end));

    let status = Arc::new(RecordingStatusBus::default());
    let events = Arc::new(RecordingEvents::default());
    let mut registry = Registry::new(
        connector,
        Arc::new(IdentityPasswordHasher),
        status.clone(),
        Arc::new(CwcBackoff),
        events.clone(),
        Arc::new(|| true),
    );
    let snap = registry.create(config());

    server.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(events.card_data.lock().unwrap().len(), 1);
    assert_eq!(events.card_data.lock().unwrap()[0].caid, 0x0b00);
    assert_eq!(status.events.lock().unwrap().clone(), vec![(snap.id.clone(), true)]);
    assert!(registry.get(&snap.id).unwrap().connected);

    registry.delete(&snap.id).unwrap();
}

#[tokio::test]
async fn ecm_request_and_reply_round_trip_through_the_session() {
    let connector = Arc::new(QueuedConnector::new());
    let (client_end, server_end) = tokio::io::duplex(4096);
    connector.push_stream(client_end);

    let server = tokio::spawn(run_fake_handshake(server_end));

    let status = Arc::new(RecordingStatusBus::default());
    let events = Arc::new(RecordingEvents::default());
    let mut registry = Registry::new(
        connector,
        Arc::new(IdentityPasswordHasher),
        status,
        Arc::new(CwcBackoff),
        events.clone(),
        Arc::new(|| true),
    );
    let snap = registry.create(config());

    let (mut server_stream, session_key, mut rng) = server.await.unwrap();

    let handle = loop {
        if let Some(h) = events.handles.lock().unwrap().first().cloned() {
            break h;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let ecm_section = vec![0x80u8, 0, 3, 1, 2, 3];
    let seq = handle.queue_message(7, ecm_section.clone());

    let (received_seq, received_payload) = read_frame(&mut server_stream, &session_key).await;
    assert_eq!(received_seq, seq);
    assert_eq!(received_payload, ecm_section);

    let mut reply_payload = vec![0x80u8, 0, 0];
    reply_payload.extend_from_slice(&[0xaa; 8]); // even control word
    reply_payload.extend_from_slice(&[0xbb; 8]); // odd control word
    let reply = encode_frame(&session_key, seq, 0, &reply_payload, &mut rng).unwrap();
    server_stream.write_all(&reply).await.unwrap();

    let found = loop {
        let replies = events.replies.lock().unwrap();
        if let Some(entry) = replies.iter().find(|(s, _)| *s == seq) {
            break entry.clone();
        }
        drop(replies);
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(found.1, reply_payload);

    registry.delete(&snap.id).unwrap();
}

#[tokio::test]
async fn reconnects_immediately_after_a_single_connect_failure() {
    let connector = Arc::new(QueuedConnector::new());
    connector.push_failure(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
    let (client_end, server_end) = tokio::io::duplex(4096);
    connector.push_stream(client_end);

    let server = tokio::spawn(run_fake_handshake(server_end));

    let events = Arc::new(RecordingEvents::default());
    let mut registry = Registry::new(
        connector,
        Arc::new(IdentityPasswordHasher),
        Arc::new(RecordingStatusBus::default()),
        Arc::new(CwcBackoff),
        events.clone(),
        Arc::new(|| true),
    );
    let snap = registry.create(config());

    server.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(events.card_data.lock().unwrap().len(), 1);
    registry.delete(&snap.id).unwrap();
}
