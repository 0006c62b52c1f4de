//! Session engine and descrambling pipeline for CWC/newcamd-family
//! conditional-access card servers.
//!
//! This crate owns everything `cwc-protocol` doesn't: the per-server
//! connect/handshake/run/backoff state machine, per-service
//! descrambler bindings, the server registry and control plane, and
//! the collaborator traits that keep the transport, block descrambler,
//! password hashing, status bus, and TS service delivery pluggable.

pub mod binding;
pub mod bindings;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod registry;
pub mod retry;
pub mod session;

pub use binding::{Binding, DescrambleOutcome, KeyState, SectionOutcome, conax_emm_matches};
pub use bindings::BindingTable;
pub use collaborators::{BlockDescrambler, KeyContext, PasswordHasher, StatusBus, TcpConnector, TokioTcpConnector, TsServiceHandle};
pub use config::{ConfigUpdate, ServerConfig, ServerSnapshot, format_des_key, parse_des_key};
pub use error::{RegistryError, SessionError, SessionErrorKind, SessionPhase};
pub use registry::Registry;
pub use retry::{CwcBackoff, RetryContext, RetryPolicy};
pub use session::{OutboundMessage, SessionEvents, SessionHandle};
