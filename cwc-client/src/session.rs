//! Per-server session: the task-per-server connect/handshake/run/backoff
//! loop, plus its writer task. One [`run`] call owns one server for its
//! entire lifetime, from first connect attempt to cancellation.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cwc_crypto::{derive_login_key, derive_session_key};
use cwc_protocol::{
    CardData, Opcode, build_card_data_request, build_keepalive, build_login_request, decode_frame,
    encode_frame, parse_card_data,
};

use crate::collaborators::{PasswordHasher, StatusBus, TcpConnector};
use crate::config::ServerConfig;
use crate::error::{SessionError, SessionErrorKind, SessionPhase};
use crate::retry::{RetryContext, RetryPolicy};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const LOGIN_SALT: &str = "$1$abcdefgh$";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A message queued for the writer task: a pre-assigned sequence
/// number, the service id it belongs to (0 outside the running
/// phase), and the raw message body to frame and encrypt.
pub struct OutboundMessage {
    pub seq: u16,
    pub sid: u16,
    pub payload: Vec<u8>,
}

/// A handle scoped to one live connection: callers use it to queue
/// outbound ECM/EMM traffic and get back the sequence number assigned,
/// so they can correlate the eventual reply. It goes dead (sends are
/// silently dropped) once that connection's writer task exits; a new
/// one arrives through [`SessionEvents::on_connected`] on reconnect.
#[derive(Clone)]
pub struct SessionHandle {
    seq: Arc<AtomicU16>,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        SessionHandle { seq: Arc::new(AtomicU16::new(2)), tx }
    }

    /// Queue a message for the writer task and return the sequence
    /// number assigned to it.
    pub fn queue_message(&self, sid: u16, payload: Vec<u8>) -> u16 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(OutboundMessage { seq, sid, payload });
        seq
    }
}

/// Callbacks the session loop drives as the connection progresses.
/// Binding/registry management lives outside this crate's session
/// machinery; this is the seam it hooks into.
pub trait SessionEvents: Send + Sync + 'static {
    fn on_connected(&self, handle: SessionHandle) {
        let _ = handle;
    }
    fn on_card_data(&self, card_data: &CardData) {
        let _ = card_data;
    }
    /// A running-phase frame arrived that wasn't a keep-alive: an ECM
    /// or EMM reply, keyed by the sequence number the request used.
    fn on_running_reply(&self, seq: u16, payload: &[u8]) {
        let _ = (seq, payload);
    }
    /// The connection handed out by the last [`Self::on_connected`] has
    /// ended, whether cleanly or not. Fires once per connection that
    /// reached `on_connected`, before the next reconnect attempt.
    fn on_disconnected(&self) {}
}

/// Drive one server for its entire lifetime: wait while disabled,
/// connect, hand off to the writer/reader pair, and back off on
/// failure, until `cancel` fires. Returns a join handle the caller can
/// await during an orderly shutdown.
#[allow(clippy::too_many_arguments)]
pub fn run<C: TcpConnector>(
    id: String,
    config: Arc<std::sync::Mutex<ServerConfig>>,
    connector: Arc<C>,
    hasher: Arc<dyn PasswordHasher>,
    status: Arc<dyn StatusBus>,
    retry: Arc<dyn RetryPolicy>,
    events: Arc<dyn SessionEvents>,
    mut config_changed: broadcast::Receiver<()>,
    cancel: CancellationToken,
    subscriptions_active: Arc<dyn Fn() -> bool + Send + Sync>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let snapshot = config.lock().unwrap().clone();
            if !snapshot.enabled {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = config_changed.recv() => continue,
                }
            }

            tracing::info!(server = %id, host = %snapshot.hostname, port = snapshot.port, "attempting to connect");

            let connect_result = connector
                .connect(snapshot.hostname.clone(), snapshot.port, CONNECT_TIMEOUT)
                .await;

            let stream = match connect_result {
                Err(e) => {
                    attempts += 1;
                    tracing::info!(server = %id, host = %snapshot.hostname, error = %e, "connect failed");
                    if wait_for_retry(&*retry, attempts, &subscriptions_active, &cancel, &mut config_changed)
                        .await
                        .is_break()
                    {
                        break;
                    }
                    continue;
                }
                Ok(s) => s,
            };

            tracing::info!(server = %id, host = %snapshot.hostname, "connected");
            attempts = 0;

            let mut session_config_changed = config_changed.resubscribe();
            let outcome = run_session(
                &id,
                stream,
                &snapshot,
                &*hasher,
                &*status,
                &*events,
                &cancel,
                &mut session_config_changed,
            )
            .await;

            status.notify(&id, false);
            match outcome {
                Ok(()) => tracing::info!(server = %id, "session ended"),
                Err(e) => tracing::info!(server = %id, error = %e, "session failed"),
            }

            if cancel.is_cancelled() {
                break;
            }

            if wait_for_retry(&*retry, attempts, &subscriptions_active, &cancel, &mut config_changed)
                .await
                .is_break()
            {
                break;
            }
        }

        tracing::info!(server = %id, "destroyed");
    })
}

async fn wait_for_retry(
    retry: &dyn RetryPolicy,
    attempts: u32,
    subscriptions_active: &Arc<dyn Fn() -> bool + Send + Sync>,
    cancel: &CancellationToken,
    config_changed: &mut broadcast::Receiver<()>,
) -> ControlFlow<()> {
    let ctx = RetryContext { attempts, subscriptions_active: subscriptions_active() };
    match retry.should_retry(&ctx) {
        ControlFlow::Break(()) => ControlFlow::Break(()),
        ControlFlow::Continue(delay) => {
            if delay.is_zero() {
                return ControlFlow::Continue(());
            }
            tokio::select! {
                _ = cancel.cancelled() => ControlFlow::Break(()),
                _ = tokio::time::sleep(delay) => ControlFlow::Continue(()),
                _ = config_changed.recv() => ControlFlow::Continue(()),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<S>(
    id: &str,
    mut stream: S,
    config: &ServerConfig,
    hasher: &dyn PasswordHasher,
    status: &dyn StatusBus,
    events: &dyn SessionEvents,
    cancel: &CancellationToken,
    config_changed: &mut broadcast::Receiver<()>,
) -> Result<(), SessionError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let host = config.hostname.clone();
    let password_hashed = hasher.hash(&config.password, LOGIN_SALT);
    let mut rng = StdRng::from_entropy();

    let mut received_key = [0u8; 14];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut received_key))
        .await
        .map_err(|_| SessionError::new(host.clone(), SessionPhase::LoginKey, SessionErrorKind::Timeout))?
        .map_err(|e| SessionError::new(host.clone(), SessionPhase::LoginKey, SessionErrorKind::Io(e)))?;
    let login_key = derive_login_key(&config.des_key, &received_key);

    let login_body = build_login_request(&config.username, &password_hashed);
    write_direct(&mut stream, &login_key, 0, 0, &login_body, &mut rng, &host, SessionPhase::Login).await?;

    let (_, reply) = read_frame(&mut stream, &login_key, &host, SessionPhase::Login, Duration::from_secs(5)).await?;
    if reply.first().copied() != Some(Opcode::ClientLoginAck.as_u8()) {
        return Err(SessionError::new(host, SessionPhase::Login, SessionErrorKind::LoginRejected));
    }

    let session_key = derive_session_key(&config.des_key, password_hashed.as_bytes());

    let card_data_req = build_card_data_request();
    write_direct(&mut stream, &session_key, 1, 0, &card_data_req, &mut rng, &host, SessionPhase::CardData).await?;

    let (_, reply) = read_frame(&mut stream, &session_key, &host, SessionPhase::CardData, Duration::from_secs(5)).await?;
    if reply.first().copied() != Some(Opcode::CardData.as_u8()) {
        return Err(SessionError::new(host, SessionPhase::CardData, SessionErrorKind::CardDataRejected));
    }
    let card_data = parse_card_data(&reply)
        .map_err(|e| SessionError::new(host.clone(), SessionPhase::CardData, SessionErrorKind::Protocol(e)))?;

    status.notify(id, true);
    events.on_card_data(&card_data);

    let (mut read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    events.on_connected(SessionHandle::new(tx));

    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(run_writer(write_half, session_key, rng, writer_cancel, rx));

    let result = read_loop(&mut read_half, &session_key, &host, events, cancel, config_changed).await;

    writer_task.abort();
    events.on_disconnected();
    result
}

async fn run_writer<W: tokio::io::AsyncWrite + Unpin>(
    mut write_half: W,
    key: [u8; 16],
    mut rng: StdRng,
    cancel: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match encode_frame(&key, msg.seq, msg.sid, &msg.payload, &mut rng) {
                    Ok(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to frame outbound message"),
                }
            }
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                let ka = build_keepalive();
                if let Ok(bytes) = encode_frame(&key, 0, 0, &ka, &mut rng) {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Drive the read side of a running session until cancelled, the
/// connection breaks, or a config change forces a fresh reconnect —
/// the same effect the original gets from `shutdown(fd, RDWR)` on a
/// live update.
async fn read_loop<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut R,
    key: &[u8; 16],
    host: &str,
    events: &dyn SessionEvents,
    cancel: &CancellationToken,
    config_changed: &mut broadcast::Receiver<()>,
) -> Result<(), SessionError> {
    loop {
        let (seq, payload) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = config_changed.recv() => return Ok(()),
            r = read_frame(stream, key, host, SessionPhase::Running, KEEPALIVE_INTERVAL * 2) => r?,
        };
        if payload.first().copied() == Some(Opcode::KeepAlive.as_u8()) {
            continue;
        }
        events.on_running_reply(seq, &payload);
    }
}

async fn write_direct<S: tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    key: &[u8; 16],
    seq: u16,
    sid: u16,
    payload: &[u8],
    rng: &mut StdRng,
    host: &str,
    phase: SessionPhase,
) -> Result<(), SessionError> {
    let frame = encode_frame(key, seq, sid, payload, rng)
        .map_err(|e| SessionError::new(host, phase, SessionErrorKind::Protocol(e)))?;
    stream.write_all(&frame).await.map_err(|e| SessionError::new(host, phase, SessionErrorKind::Io(e)))
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut R,
    key: &[u8; 16],
    host: &str,
    phase: SessionPhase,
    timeout_dur: Duration,
) -> Result<(u16, Vec<u8>), SessionError> {
    let mut len_buf = [0u8; 2];
    tokio::time::timeout(timeout_dur, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| SessionError::new(host, phase, SessionErrorKind::Timeout))?
        .map_err(|e| SessionError::new(host, phase, SessionErrorKind::Io(e)))?;

    let msg_len = ((len_buf[0] as usize) << 8) | len_buf[1] as usize;
    if msg_len + 2 > cwc_protocol::MAX_MESSAGE_SIZE {
        return Err(SessionError::new(
            host,
            phase,
            SessionErrorKind::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "oversized message length")),
        ));
    }

    let mut body = vec![0u8; msg_len];
    tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut body))
        .await
        .map_err(|_| SessionError::new(host, phase, SessionErrorKind::Timeout))?
        .map_err(|e| SessionError::new(host, phase, SessionErrorKind::Io(e)))?;

    let mut raw = Vec::with_capacity(2 + body.len());
    raw.extend_from_slice(&len_buf);
    raw.extend_from_slice(&body);

    let decoded = decode_frame(key, &mut raw).map_err(|e| SessionError::new(host, phase, SessionErrorKind::Protocol(e)))?;
    Ok((decoded.seq, decoded.payload.to_vec()))
}
