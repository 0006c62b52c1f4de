//! A descrambler binding: the state tied to one `(server, service)`
//! pair — ECM dedup and in-flight gating, control-word state, and the
//! transport-stream cluster buffer that batches packets for the block
//! descrambler.

use cwc_protocol::{CaMessageKind, EcmReply, classify_ca_message};

use crate::collaborators::{BlockDescrambler, KeyContext, TsServiceHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Unknown,
    Resolved,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionOutcome {
    Ignored,
    SendEcm(Vec<u8>),
    SendEmm(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescrambleOutcome {
    Forbidden,
    NotReady,
    Buffered,
    Drained { delivered: usize },
}

pub struct Binding<D: BlockDescrambler> {
    sid: u16,
    caid: u16,
    provider_ids: Vec<u32>,
    key_state: KeyState,
    ecm_reply_pending: bool,
    last_ecm: Vec<u8>,
    /// The `seq` the in-flight ECM request was sent with, so the
    /// session's running-phase reply dispatch can find its way back to
    /// this binding — spec §3's "last outbound seq".
    pending_seq: Option<u16>,
    key_ctx: D::Key,
    cluster: Vec<u8>,
    cluster_size: usize,
    fill: usize,
}

impl<D: BlockDescrambler> Binding<D> {
    pub fn new(descrambler: &D, sid: u16, caid: u16, provider_ids: Vec<u32>) -> Self {
        let cluster_size = descrambler.suggested_cluster_size();
        Binding {
            sid,
            caid,
            provider_ids,
            key_state: KeyState::Unknown,
            ecm_reply_pending: false,
            last_ecm: Vec::new(),
            pending_seq: None,
            key_ctx: descrambler.new_key_context(),
            cluster: Vec::with_capacity(cluster_size * 188),
            cluster_size,
            fill: 0,
        }
    }

    pub fn sid(&self) -> u16 {
        self.sid
    }

    pub fn key_state(&self) -> KeyState {
        self.key_state
    }

    pub fn ecm_reply_pending(&self) -> bool {
        self.ecm_reply_pending
    }

    /// Record the `seq` a just-sent ECM request used, so a later
    /// [`Self::matches_pending_seq`] call can find this binding again.
    pub fn note_sent_seq(&mut self, seq: u16) {
        self.pending_seq = Some(seq);
    }

    /// Whether `seq` is the reply this binding is waiting on.
    pub fn matches_pending_seq(&self, seq: u16) -> bool {
        self.ecm_reply_pending && self.pending_seq == Some(seq)
    }

    fn verify_provider(&self, provider_id: u32) -> bool {
        provider_id == 0 || self.provider_ids.contains(&provider_id)
    }

    /// A CA section arrived on a stream with the given CAID/provider.
    /// Returns what the caller (the session, which owns the socket)
    /// should send, if anything.
    pub fn on_ca_section(
        &mut self,
        stream_caid: u16,
        stream_provider_id: u32,
        section: &[u8],
        emm_enabled: bool,
        connected: bool,
    ) -> SectionOutcome {
        if self.caid != stream_caid {
            return SectionOutcome::Ignored;
        }
        if !self.verify_provider(stream_provider_id) {
            return SectionOutcome::Ignored;
        }
        let Some(&table_id) = section.first() else {
            return SectionOutcome::Ignored;
        };
        if table_id & 0xf0 != 0x80 {
            return SectionOutcome::Ignored;
        }

        match classify_ca_message(table_id) {
            Some(CaMessageKind::Ecm) => {
                if self.ecm_reply_pending {
                    return SectionOutcome::Ignored;
                }
                if self.last_ecm == section {
                    return SectionOutcome::Ignored;
                }
                if !connected {
                    self.key_state = KeyState::Unknown;
                    return SectionOutcome::Ignored;
                }
                self.last_ecm = section.to_vec();
                self.ecm_reply_pending = true;
                SectionOutcome::SendEcm(section.to_vec())
            }
            Some(CaMessageKind::Emm) | None => {
                if emm_enabled {
                    SectionOutcome::SendEmm(section.to_vec())
                } else {
                    SectionOutcome::Ignored
                }
            }
        }
    }

    /// Apply a reply to the ECM request currently in flight. Pass
    /// `None` for a short/denied reply.
    pub fn on_ecm_reply(&mut self, reply: Option<EcmReply>) {
        self.ecm_reply_pending = false;
        self.pending_seq = None;
        match reply {
            None => self.key_state = KeyState::Forbidden,
            Some(cw) => {
                self.key_state = KeyState::Resolved;
                if let Some(even) = cw.even {
                    self.key_ctx.set_even_control_word(&even);
                }
                if let Some(odd) = cw.odd {
                    self.key_ctx.set_odd_control_word(&odd);
                }
            }
        }
    }

    /// Buffer one TS packet; once the cluster fills, hand it to the
    /// block descrambler and forward whatever comes back decrypted.
    pub fn descramble(
        &mut self,
        descrambler: &D,
        packet: &[u8; 188],
        service: &dyn TsServiceHandle,
    ) -> DescrambleOutcome {
        match self.key_state {
            KeyState::Forbidden => return DescrambleOutcome::Forbidden,
            KeyState::Unknown => return DescrambleOutcome::NotReady,
            KeyState::Resolved => {}
        }

        self.cluster.extend_from_slice(packet);
        self.fill += 1;
        if self.fill != self.cluster_size {
            return DescrambleOutcome::Buffered;
        }
        self.fill = 0;

        let delivered = descrambler.decrypt_packets(&mut self.key_ctx, &mut self.cluster);
        for i in 0..delivered {
            let pkt: [u8; 188] = self.cluster[i * 188..(i + 1) * 188].try_into().unwrap();
            service.recv_packet(&pkt);
        }

        let remainder = self.cluster_size - delivered;
        if remainder > 0 {
            self.cluster.copy_within(delivered * 188.., 0);
        }
        self.cluster.truncate(remainder * 188);
        self.fill = remainder;

        DescrambleOutcome::Drained { delivered }
    }
}

/// The Conax EMM fan-out rule: forward only when the server carries
/// CAID `0x0b00`, the section is a Conax EMM (`0x82`), and the
/// section's own address matches one of the server's providers.
pub fn conax_emm_matches(server_caid: u16, section: &[u8], provider_shared_addresses: &[[u8; 8]]) -> bool {
    if server_caid != 0x0b00 {
        return false;
    }
    if section.first() != Some(&0x82) {
        return false;
    }
    if section.len() < 10 {
        return false;
    }
    let addr = &section[3..10];
    provider_shared_addresses.iter().any(|sa| &sa[1..8] == addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::FakeBlockDescrambler;

    fn binding() -> Binding<FakeBlockDescrambler> {
        let d = FakeBlockDescrambler { cluster_size: 2 };
        Binding::new(&d, 1, 0x0b00, vec![0x010203])
    }

    #[test]
    fn duplicate_ecm_is_ignored_while_pending() {
        let mut b = binding();
        let ecm = vec![0x80, 0, 3, 1, 2, 3];
        assert_eq!(
            b.on_ca_section(0x0b00, 0x010203, &ecm, false, true),
            SectionOutcome::SendEcm(ecm.clone())
        );
        assert_eq!(b.on_ca_section(0x0b00, 0x010203, &ecm, false, true), SectionOutcome::Ignored);
    }

    #[test]
    fn wrong_caid_is_ignored() {
        let mut b = binding();
        let ecm = vec![0x80, 0, 3, 1, 2, 3];
        assert_eq!(b.on_ca_section(0x0100, 0x010203, &ecm, false, true), SectionOutcome::Ignored);
    }

    #[test]
    fn unverified_provider_is_ignored() {
        let mut b = binding();
        let ecm = vec![0x80, 0, 3, 1, 2, 3];
        assert_eq!(b.on_ca_section(0x0b00, 0xffffff, &ecm, false, true), SectionOutcome::Ignored);
    }

    #[test]
    fn emm_forwarded_only_when_enabled() {
        let mut b = binding();
        let emm = vec![0x82, 0, 3, 1, 2, 3];
        assert_eq!(b.on_ca_section(0x0b00, 0x010203, &emm, false, true), SectionOutcome::Ignored);
        assert_eq!(
            b.on_ca_section(0x0b00, 0x010203, &emm, true, true),
            SectionOutcome::SendEmm(emm.clone())
        );
    }

    #[test]
    fn disconnected_ecm_resets_to_unknown_without_sending() {
        let mut b = binding();
        let ecm = vec![0x80, 0, 3, 1, 2, 3];
        assert_eq!(b.on_ca_section(0x0b00, 0x010203, &ecm, false, false), SectionOutcome::Ignored);
        assert_eq!(b.key_state(), KeyState::Unknown);
    }

    #[test]
    fn short_reply_forbids_the_key() {
        let mut b = binding();
        b.on_ecm_reply(None);
        assert_eq!(b.key_state(), KeyState::Forbidden);
    }

    #[test]
    fn pending_seq_tracks_the_in_flight_request() {
        let mut b = binding();
        let ecm = vec![0x80, 0, 3, 1, 2, 3];
        b.on_ca_section(0x0b00, 0x010203, &ecm, false, true);
        assert!(!b.matches_pending_seq(41));
        b.note_sent_seq(42);
        assert!(b.matches_pending_seq(42));
        assert!(!b.matches_pending_seq(43));

        b.on_ecm_reply(Some(EcmReply { even: Some([1; 8]), odd: None }));
        assert!(!b.matches_pending_seq(42));
    }

    #[test]
    fn cluster_drains_once_full() {
        let d = FakeBlockDescrambler { cluster_size: 2 };
        let mut b = Binding::new(&d, 1, 0x0b00, vec![]);
        b.on_ecm_reply(Some(EcmReply { even: Some([1; 8]), odd: None }));

        let service = crate::collaborators::testing::RecordingService::default();
        let packet = [0xffu8; 188];

        assert_eq!(b.descramble(&d, &packet, &service), DescrambleOutcome::Buffered);
        assert_eq!(b.descramble(&d, &packet, &service), DescrambleOutcome::Drained { delivered: 2 });
        assert_eq!(service.packets.lock().unwrap().len(), 2);
    }

    #[test]
    fn conax_fan_out_matches_on_shared_address_suffix() {
        let mut section = vec![0x82u8, 0, 7];
        section.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00]);
        let providers = [[0x01, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00]];
        assert!(conax_emm_matches(0x0b00, &section, &providers));
        assert!(!conax_emm_matches(0x0100, &section, &providers));
    }
}
