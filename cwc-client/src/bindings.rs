//! The set of descrambler bindings a single server owns, wired
//! directly into that server's session: CA sections come in keyed by
//! service id, ECM requests go out over the session's current
//! [`SessionHandle`], and running-phase replies come back in through
//! [`SessionEvents`] and are routed to the binding whose `seq` they
//! answer.

use std::collections::HashMap;
use std::sync::Mutex;

use cwc_protocol::parse_ecm_reply;

use crate::binding::{Binding, DescrambleOutcome, KeyState, SectionOutcome};
use crate::collaborators::{BlockDescrambler, TsServiceHandle};
use crate::session::{SessionEvents, SessionHandle};

/// One server's bindings, keyed by an opaque service id the caller
/// assigns. Implements [`SessionEvents`] so it can be handed straight
/// to [`crate::registry::Registry::new`] (or composed with another
/// `SessionEvents` via [`crate::session::run`]'s caller) and have
/// ECM/EMM traffic flow end to end without any extra glue.
pub struct BindingTable<D: BlockDescrambler> {
    descrambler: D,
    handle: Mutex<Option<SessionHandle>>,
    bindings: Mutex<HashMap<String, Binding<D>>>,
}

impl<D: BlockDescrambler> BindingTable<D> {
    pub fn new(descrambler: D) -> Self {
        BindingTable { descrambler, handle: Mutex::new(None), bindings: Mutex::new(HashMap::new()) }
    }

    /// Create a binding for a newly started service, the way
    /// `start_service` instantiates one per spec §3's lifecycle rule.
    pub fn start_service(&self, service_id: impl Into<String>, sid: u16, caid: u16, provider_ids: Vec<u32>) {
        let binding = Binding::new(&self.descrambler, sid, caid, provider_ids);
        self.bindings.lock().unwrap().insert(service_id.into(), binding);
    }

    /// Tear down a service's binding, the way the service-stop hook
    /// destroys it in the original.
    pub fn stop_service(&self, service_id: &str) {
        self.bindings.lock().unwrap().remove(service_id);
    }

    pub fn key_state(&self, service_id: &str) -> Option<KeyState> {
        self.bindings.lock().unwrap().get(service_id).map(Binding::key_state)
    }

    /// A CA section arrived for `service_id`. Looks up its binding,
    /// runs the dedup/gating rules, and actually sends the ECM/EMM over
    /// the current connection — capturing the assigned `seq` on the
    /// binding so the eventual reply can find its way back.
    pub fn on_ca_section(
        &self,
        service_id: &str,
        stream_caid: u16,
        stream_provider_id: u32,
        section: &[u8],
        emm_enabled: bool,
    ) {
        let handle = self.handle.lock().unwrap();
        let connected = handle.is_some();
        let mut bindings = self.bindings.lock().unwrap();
        let Some(binding) = bindings.get_mut(service_id) else { return };

        match binding.on_ca_section(stream_caid, stream_provider_id, section, emm_enabled, connected) {
            SectionOutcome::Ignored => {}
            SectionOutcome::SendEcm(payload) => {
                if let Some(handle) = handle.as_ref() {
                    let seq = handle.queue_message(binding.sid(), payload);
                    binding.note_sent_seq(seq);
                }
            }
            SectionOutcome::SendEmm(payload) => {
                if let Some(handle) = handle.as_ref() {
                    handle.queue_message(binding.sid(), payload);
                }
            }
        }
    }

    /// Batch one TS packet into `service_id`'s cluster buffer, draining
    /// it into `service` once full.
    pub fn on_packet(
        &self,
        service_id: &str,
        packet: &[u8; 188],
        service: &dyn TsServiceHandle,
    ) -> Option<DescrambleOutcome> {
        let mut bindings = self.bindings.lock().unwrap();
        let binding = bindings.get_mut(service_id)?;
        Some(binding.descramble(&self.descrambler, packet, service))
    }
}

impl<D: BlockDescrambler> SessionEvents for BindingTable<D> {
    fn on_connected(&self, handle: SessionHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Route a running-phase reply back to whichever binding's `seq`
    /// it answers, per spec §4.3's reader responsibility: unmatched
    /// sequences (unknown binding, stale request) are silently dropped.
    fn on_running_reply(&self, seq: u16, payload: &[u8]) {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(binding) = bindings.values_mut().find(|b| b.matches_pending_seq(seq)) {
            binding.on_ecm_reply(parse_ecm_reply(payload));
        }
    }

    fn on_disconnected(&self) {
        *self.handle.lock().unwrap() = None;
    }
}
