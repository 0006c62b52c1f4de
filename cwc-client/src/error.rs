use std::fmt;
use std::io;

use cwc_protocol::ProtocolError;

/// The phase a session was in when it failed, used to make log lines
/// and errors self-describing without a caller having to track state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    LoginKey,
    Login,
    CardData,
    Running,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Connecting => "connecting",
            SessionPhase::LoginKey => "waiting for login key",
            SessionPhase::Login => "logging in",
            SessionPhase::CardData => "requesting card data",
            SessionPhase::Running => "running",
        };
        f.write_str(s)
    }
}

/// A session-level failure, tagged with the host and phase it happened
/// in so the caller's log line doesn't need extra context threading.
#[derive(Debug)]
pub struct SessionError {
    pub host: String,
    pub phase: SessionPhase,
    pub kind: SessionErrorKind,
}

#[derive(Debug)]
pub enum SessionErrorKind {
    Io(io::Error),
    Protocol(ProtocolError),
    LoginRejected,
    CardDataRejected,
    Timeout,
}

impl SessionError {
    pub fn new(host: impl Into<String>, phase: SessionPhase, kind: SessionErrorKind) -> Self {
        SessionError { host: host.into(), phase, kind }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SessionErrorKind::Io(e) => write!(f, "{}: {}: {}", self.host, self.phase, e),
            SessionErrorKind::Protocol(e) => write!(f, "{}: {}: {}", self.host, self.phase, e),
            SessionErrorKind::LoginRejected => write!(f, "{}: login rejected", self.host),
            SessionErrorKind::CardDataRejected => write!(f, "{}: card data request rejected", self.host),
            SessionErrorKind::Timeout => write!(f, "{}: {}: timed out", self.host, self.phase),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SessionErrorKind::Io(e) => Some(e),
            SessionErrorKind::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SessionErrorKind {
    fn from(e: ProtocolError) -> Self {
        SessionErrorKind::Protocol(e)
    }
}

impl From<io::Error> for SessionErrorKind {
    fn from(e: io::Error) -> Self {
        SessionErrorKind::Io(e)
    }
}

/// Failures from the registry's control-plane operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "no server with id {id:?}"),
        }
    }
}

impl std::error::Error for RegistryError {}
