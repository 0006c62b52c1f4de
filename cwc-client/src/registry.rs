//! The control plane: the set of configured servers and the
//! list/get/create/update/delete operations an admin surface drives.
//! One [`Registry`] owns every server's configuration and task handle;
//! callers share it behind `Arc<tokio::sync::Mutex<Registry<C>>>` so
//! every operation runs under the single global lock the original
//! takes for the same calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cwc_protocol::CardData;

use crate::binding::conax_emm_matches;
use crate::collaborators::{PasswordHasher, StatusBus, TcpConnector};
use crate::config::{ConfigUpdate, ServerConfig, ServerSnapshot, format_des_key, parse_des_key};
use crate::error::RegistryError;
use crate::retry::RetryPolicy;
use crate::session::{self, SessionEvents, SessionHandle};

struct Entry {
    config: Arc<Mutex<ServerConfig>>,
    config_changed: broadcast::Sender<()>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    card_data: Arc<Mutex<Option<CardData>>>,
    handle: Arc<Mutex<Option<SessionHandle>>>,
}

/// The set of configured CWC servers plus the running task for each
/// enabled one. Every mutating call is cheap and synchronous — the
/// `tokio::spawn` it may trigger is the only async-adjacent part — so
/// the type itself need not be `async`; callers serialize access by
/// holding it behind a mutex.
pub struct Registry<C: TcpConnector> {
    connector: Arc<C>,
    hasher: Arc<dyn PasswordHasher>,
    status: Arc<dyn StatusBus>,
    retry: Arc<dyn RetryPolicy>,
    subscriptions_active: Arc<dyn Fn() -> bool + Send + Sync>,
    events: Arc<dyn SessionEvents>,
    next_id: u64,
    entries: HashMap<String, Entry>,
}

impl<C: TcpConnector> Registry<C> {
    pub fn new(
        connector: Arc<C>,
        hasher: Arc<dyn PasswordHasher>,
        status: Arc<dyn StatusBus>,
        retry: Arc<dyn RetryPolicy>,
        events: Arc<dyn SessionEvents>,
        subscriptions_active: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Registry {
            connector,
            hasher,
            status,
            retry,
            subscriptions_active,
            events,
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn list(&self) -> Vec<ServerSnapshot> {
        let mut ids: Vec<&String> = self.entries.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| self.snapshot_of(id, &self.entries[id])).collect()
    }

    pub fn get(&self, id: &str) -> Result<ServerSnapshot, RegistryError> {
        let entry = self.entries.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(self.snapshot_of(id, entry))
    }

    /// Register a new server and spawn its session task. Assigns the
    /// next monotonic id, the way `cwc_entry_create` does.
    pub fn create(&mut self, config: ServerConfig) -> ServerSnapshot {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.spawn(id.clone(), config);
        self.get(&id).expect("just inserted")
    }

    /// Apply a partial patch and force a reconnect, mirroring
    /// `cwc_entry_update`'s side effects: the password (if changed)
    /// is picked up the next time the session hashes it, `reconfigure`
    /// is implied by the forced disconnect below, and the per-server
    /// config-changed broadcast wakes a blocked reader exactly where
    /// `shutdown(fd, RDWR)` would.
    pub fn update(&mut self, id: &str, patch: ConfigUpdate) -> Result<ServerSnapshot, RegistryError> {
        {
            let entry = self.entries.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let mut cfg = entry.config.lock().unwrap();
            if let Some(v) = patch.enabled {
                cfg.enabled = v;
            }
            if let Some(v) = patch.hostname {
                cfg.hostname = v;
            }
            if let Some(v) = patch.port {
                cfg.port = v;
            }
            if let Some(v) = patch.username {
                cfg.username = v;
            }
            if let Some(v) = patch.password {
                cfg.password = v;
            }
            if let Some(v) = patch.des_key {
                cfg.des_key = parse_des_key(&v);
            }
            if let Some(v) = patch.emm {
                cfg.emm = v;
            }
            if let Some(v) = patch.comment {
                cfg.comment = v;
            }
            drop(cfg);
            let _ = entry.config_changed.send(());
        }
        self.get(id)
    }

    /// Tear down a server's session task and forget its configuration.
    pub fn delete(&mut self, id: &str) -> Result<(), RegistryError> {
        let entry = self.entries.remove(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.cancel.cancel();
        entry.task.abort();
        Ok(())
    }

    /// Server ids whose cached card data matches the Conax global EMM
    /// fan-out rule for `section`, the way `cwc_emm` walks every
    /// session looking for a CAID/shared-address match.
    pub fn conax_emm_targets(&self, section: &[u8]) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| {
                let card_data = entry.card_data.lock().unwrap();
                let card_data = card_data.as_ref()?;
                let shared_addresses: Vec<[u8; 8]> =
                    card_data.providers.iter().map(|p| p.shared_address).collect();
                if entry.connected.load(Ordering::Relaxed)
                    && conax_emm_matches(card_data.caid, section, &shared_addresses)
                {
                    Some(id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Queue a message on a server's current connection, if it has
    /// one. Returns `None` if the server exists but isn't currently
    /// connected (the message is simply dropped, same as the original
    /// silently skipping a session with no open socket).
    pub fn queue_message(&self, id: &str, sid: u16, payload: Vec<u8>) -> Result<Option<u16>, RegistryError> {
        let entry = self.entries.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let handle = entry.handle.lock().unwrap();
        Ok(handle.as_ref().map(|h| h.queue_message(sid, payload)))
    }

    fn spawn(&mut self, id: String, config: ServerConfig) {
        let config = Arc::new(Mutex::new(config));
        let (config_changed_tx, config_changed_rx) = broadcast::channel(4);
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));
        let card_data = Arc::new(Mutex::new(None));
        let handle = Arc::new(Mutex::new(None));

        let events: Arc<dyn SessionEvents> = Arc::new(RegistryEvents {
            connected: connected.clone(),
            card_data: card_data.clone(),
            handle: handle.clone(),
            inner: self.events.clone(),
        });

        let task = session::run(
            id.clone(),
            config.clone(),
            self.connector.clone(),
            self.hasher.clone(),
            self.status.clone(),
            self.retry.clone(),
            events,
            config_changed_rx,
            cancel.clone(),
            self.subscriptions_active.clone(),
        );

        self.entries.insert(
            id,
            Entry { config, config_changed: config_changed_tx, cancel, task, connected, card_data, handle },
        );
    }

    fn snapshot_of(&self, id: &str, entry: &Entry) -> ServerSnapshot {
        let cfg = entry.config.lock().unwrap();
        ServerSnapshot {
            id: id.to_string(),
            enabled: cfg.enabled,
            connected: entry.connected.load(Ordering::Relaxed),
            hostname: cfg.hostname.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            des_key: format_des_key(&cfg.des_key),
            emm: cfg.emm,
            comment: cfg.comment.clone(),
        }
    }
}

/// Wraps the caller-supplied [`SessionEvents`] to also maintain the
/// registry's connected flag and cached card data, used for `list`
/// and the global EMM fan-out lookup.
struct RegistryEvents {
    connected: Arc<AtomicBool>,
    card_data: Arc<Mutex<Option<CardData>>>,
    handle: Arc<Mutex<Option<SessionHandle>>>,
    inner: Arc<dyn SessionEvents>,
}

impl SessionEvents for RegistryEvents {
    fn on_connected(&self, handle: SessionHandle) {
        self.connected.store(true, Ordering::Relaxed);
        *self.handle.lock().unwrap() = Some(handle.clone());
        self.inner.on_connected(handle);
    }

    fn on_card_data(&self, card_data: &CardData) {
        *self.card_data.lock().unwrap() = Some(card_data.clone());
        self.inner.on_card_data(card_data);
    }

    fn on_running_reply(&self, seq: u16, payload: &[u8]) {
        self.inner.on_running_reply(seq, payload);
    }

    fn on_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        *self.handle.lock().unwrap() = None;
        self.inner.on_disconnected();
    }
}
