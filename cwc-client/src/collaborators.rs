//! Pluggable backends for everything this crate treats as "somebody
//! else's problem": the transport, the block descrambler, password
//! hashing, status notification, and the service object a binding
//! feeds decrypted packets to. Each out-of-scope piece gets a trait so
//! the session engine compiles and is testable without them; only
//! `TcpConnector` is worth a bundled real implementation.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Connects to a card server. The default implementation dials a real
/// TCP socket; tests substitute an in-memory duplex stream.
pub trait TcpConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        host: String,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = io::Result<Self::Stream>> + Send>>;
}

/// The real, TCP-backed connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTcpConnector;

impl TcpConnector for TokioTcpConnector {
    type Stream = TcpStream;

    fn connect(
        &self,
        host: String,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = io::Result<Self::Stream>> + Send>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        })
    }
}

/// An opaque handle to a block-descrambler key context for one binding
/// (one `(server, service)` pair). The real CSA engine lives outside
/// this crate; callers provide one through [`BlockDescrambler`].
pub trait KeyContext: Send {
    fn set_even_control_word(&mut self, cw: &[u8; 8]);
    fn set_odd_control_word(&mut self, cw: &[u8; 8]);
}

/// Decrypts clusters of 188-byte transport-stream packets given a
/// pair of control words. Mirrors FFdecsa's `get_key_struct` /
/// `set_even_control_word` / `set_odd_control_word` / `decrypt_packets`
/// surface.
pub trait BlockDescrambler: Send + Sync + 'static {
    type Key: KeyContext;

    fn new_key_context(&self) -> Self::Key;

    /// How many 188-byte packets a cluster should hold before a batch
    /// decrypt is worth running.
    fn suggested_cluster_size(&self) -> usize;

    /// Decrypt as many whole packets in `cluster` as currently have a
    /// resolved key; returns how many packets (from the front) were
    /// decrypted in place.
    fn decrypt_packets(&self, key: &mut Self::Key, cluster: &mut [u8]) -> usize;
}

/// Hashes a plaintext password against a server-supplied salt. The
/// original uses crypt(3) (DES-based); that algorithm is an external
/// collaborator here.
pub trait PasswordHasher: Send + Sync + 'static {
    fn hash(&self, plain: &str, salt: &str) -> String;
}

/// Publishes connect/disconnect status for a server, mirroring
/// `cwc_comet_status_update`'s notification-bus call.
pub trait StatusBus: Send + Sync + 'static {
    fn notify(&self, server_id: &str, connected: bool);
}

/// The minimal surface a descrambler binding needs from "the
/// service" it's bound to.
pub trait TsServiceHandle: Send + Sync + 'static {
    fn caid(&self) -> u16;
    fn provider_id(&self) -> u32;
    fn recv_packet(&self, packet: &[u8; 188]);
}

/// Deterministic fakes for exercising the session/binding machinery
/// without a real transport, CSA engine, or password database.
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    /// A connector that hands out one end of an in-memory duplex pipe
    /// per call, queued up in advance by a test.
    pub struct QueuedConnector {
        streams: Mutex<VecDeque<io::Result<DuplexStream>>>,
    }

    impl QueuedConnector {
        pub fn new() -> Self {
            QueuedConnector { streams: Mutex::new(VecDeque::new()) }
        }

        pub fn push_stream(&self, stream: DuplexStream) {
            self.streams.lock().unwrap().push_back(Ok(stream));
        }

        pub fn push_failure(&self, err: io::Error) {
            self.streams.lock().unwrap().push_back(Err(err));
        }
    }

    impl Default for QueuedConnector {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TcpConnector for QueuedConnector {
        type Stream = DuplexStream;

        fn connect(
            &self,
            _host: String,
            _port: u16,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = io::Result<Self::Stream>> + Send>> {
            let next = self.streams.lock().unwrap().pop_front();
            Box::pin(async move {
                next.unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotConnected, "no queued stream")))
            })
        }
    }

    /// A control-word store with no real CSA behind it: "decryption"
    /// just means the cluster was handed a non-zero control word.
    pub struct FakeKeyContext {
        pub even: Option<[u8; 8]>,
        pub odd: Option<[u8; 8]>,
    }

    impl KeyContext for FakeKeyContext {
        fn set_even_control_word(&mut self, cw: &[u8; 8]) {
            self.even = Some(*cw);
        }

        fn set_odd_control_word(&mut self, cw: &[u8; 8]) {
            self.odd = Some(*cw);
        }
    }

    #[derive(Default)]
    pub struct FakeBlockDescrambler {
        pub cluster_size: usize,
    }

    impl BlockDescrambler for FakeBlockDescrambler {
        type Key = FakeKeyContext;

        fn new_key_context(&self) -> Self::Key {
            FakeKeyContext { even: None, odd: None }
        }

        fn suggested_cluster_size(&self) -> usize {
            if self.cluster_size == 0 { 16 } else { self.cluster_size }
        }

        fn decrypt_packets(&self, key: &mut Self::Key, cluster: &mut [u8]) -> usize {
            if key.even.is_none() && key.odd.is_none() {
                return 0;
            }
            cluster.len() / 188
        }
    }

    /// Passes the plaintext straight through, for tests that don't
    /// care about the hashing algorithm itself.
    #[derive(Default)]
    pub struct IdentityPasswordHasher;

    impl PasswordHasher for IdentityPasswordHasher {
        fn hash(&self, plain: &str, _salt: &str) -> String {
            plain.to_string()
        }
    }

    #[derive(Default)]
    pub struct RecordingStatusBus {
        pub events: Mutex<Vec<(String, bool)>>,
    }

    impl StatusBus for RecordingStatusBus {
        fn notify(&self, server_id: &str, connected: bool) {
            self.events.lock().unwrap().push((server_id.to_string(), connected));
        }
    }

    #[derive(Default)]
    pub struct RecordingService {
        pub caid: u16,
        pub provider_id: u32,
        pub packets: Arc<Mutex<Vec<[u8; 188]>>>,
    }

    impl TsServiceHandle for RecordingService {
        fn caid(&self) -> u16 {
            self.caid
        }

        fn provider_id(&self) -> u32 {
            self.provider_id
        }

        fn recv_packet(&self, packet: &[u8; 188]) {
            self.packets.lock().unwrap().push(*packet);
        }
    }
}
