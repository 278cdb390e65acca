//! Per-peer protocol state machine.
//!
//! Each connection gets a [`Peer`] in the session arena. All message
//! handling funnels through [`NodeCore::on_message`], a single match over
//! the wire enum; handlers return `Result<(), Violation>` and the
//! dispatcher converts any violation into `delete_self(error = true)`
//! with a ban; errors in a peer handler never unwind past that peer.

use std::collections::VecDeque;
use std::net::SocketAddr;

use shroud_messages::{
    AuthenticationMsg, ByeMsg, ByeReason, ChallengeMsg, ConfigMsg, ExternalAddrMsg, GetMinedMsg,
    GetProofChainWorkMsg, GetProofKernelMsg, GetProofStateMsg, GetProofUtxoMsg, IdType, MinedMsg,
    PeerInfoMsg, PeerInfoSelfMsg, PerMined, ProofKernelMsg, ProofStateMsg, ProofUtxoMsg, TimeMsg,
    WireMessage, ENTRIES_MAX,
};
use shroud_network::{pack_addr, InfoRef, Rating};
use shroud_types::{StateDescriptor, Timestamp};

use crate::error::{unexpected, Violation};
use crate::node::{Effect, NodeCore};
use crate::scheduler::TaskId;

/// Handle into the session arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerRef(pub u32);

/// Session flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerFlags(u16);

impl PeerFlags {
    pub const CONNECTED: u16 = 1 << 0;
    pub const PI_RCVD: u16 = 1 << 1;
    pub const OWNER: u16 = 1 << 2;
    pub const PROVEN_WORK_REQ: u16 = 1 << 3;
    pub const PROVEN_WORK: u16 = 1 << 4;
    pub const SYNC_PENDING: u16 = 1 << 5;
    pub const DONT_SYNC: u16 = 1 << 6;

    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }
}

/// One live session.
pub struct Peer {
    pub addr: SocketAddr,
    /// The remote's advertised listen port; 0 = does not accept inbound.
    pub port: u16,
    pub flags: PeerFlags,
    /// Remote tip; zeroed until the first `NewTip` (and on teardown).
    pub tip: StateDescriptor,
    /// Peer-table entry, attached after authentication.
    pub info: Option<InfoRef>,
    /// Keys this peer declared `DataMissing` for.
    pub rejected: std::collections::HashSet<(shroud_types::StateId, bool)>,
    /// BBS channels this peer subscribed to.
    pub subscriptions: std::collections::HashSet<u32>,
    /// The remote's last capability announcement.
    pub config: ConfigMsg,
    /// Nonce we challenged the remote with.
    pub challenge: [u8; 32],
    /// FIFO of tasks assigned to this peer.
    pub tasks: VecDeque<TaskId>,
    /// Deadline for the front task (ms); armed while tasks are in flight.
    pub request_deadline: Option<u64>,
    /// Next top-peers gossip round (ms); armed while `send_peers` is on.
    pub peers_resend_at: Option<u64>,
    /// Whether we dialed this peer (as opposed to accepting it).
    pub outbound: bool,
}

impl Peer {
    fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            port: 0,
            flags: PeerFlags::default(),
            tip: StateDescriptor::zero(),
            info: None,
            rejected: std::collections::HashSet::new(),
            subscriptions: std::collections::HashSet::new(),
            config: ConfigMsg::default(),
            challenge: [0u8; 32],
            tasks: VecDeque::new(),
            request_deadline: None,
            peers_resend_at: None,
            outbound,
        }
    }

    pub fn has_tip(&self) -> bool {
        self.tip.height != 0
    }
}

/// Session arena. Slots are reused; teardown is responsible for purging
/// every cross-reference first.
#[derive(Default)]
pub struct Peers {
    slots: Vec<Option<Peer>>,
    free: Vec<u32>,
}

impl Peers {
    pub fn alloc(&mut self, addr: SocketAddr, outbound: bool) -> PeerRef {
        let peer = Peer::new(addr, outbound);
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(peer);
                PeerRef(slot)
            }
            None => {
                self.slots.push(Some(peer));
                PeerRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, p: PeerRef) -> &Peer {
        self.slots[p.0 as usize].as_ref().expect("stale PeerRef")
    }

    pub fn get_mut(&mut self, p: PeerRef) -> &mut Peer {
        self.slots[p.0 as usize].as_mut().expect("stale PeerRef")
    }

    pub fn contains(&self, p: PeerRef) -> bool {
        self.slots
            .get(p.0 as usize)
            .map_or(false, |slot| slot.is_some())
    }

    pub fn release(&mut self, p: PeerRef) {
        self.slots[p.0 as usize] = None;
        self.free.push(p.0);
    }

    pub fn refs(&self) -> Vec<PeerRef> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| PeerRef(i as u32)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

impl NodeCore {
    /// An inbound connection was accepted.
    pub fn on_accepted(&mut self, addr: SocketAddr) -> PeerRef {
        let p = self.peers.alloc(addr, false);
        tracing::info!(peer = %addr, "+peer (inbound)");
        p
    }

    /// Dial a known peer from the activation policy.
    pub fn activate_peer(&mut self, info: InfoRef) {
        if self.peer_man.get(info).live.is_some() {
            return;
        }
        let packed = self.peer_man.get(info).address;
        let addr = SocketAddr::V4(shroud_network::unpack_addr(packed));
        let p = self.peers.alloc(addr, true);
        self.peers.get_mut(p).info = Some(info);
        self.peers.get_mut(p).port = addr.port();
        self.peer_man.attach_live(info, p.0);
        self.peer_man.on_active(info, true);
        tracing::info!(peer = %addr, "+peer (outbound)");
        self.outbox.push(Effect::Connect(p, addr));
    }

    /// The transport is up; run our side of the handshake.
    pub fn on_connected_secure(&mut self, p: PeerRef) {
        self.peers.get_mut(p).flags.set(PeerFlags::CONNECTED);

        // Let the remote know where we accept connections, if we do.
        if self.peers.get(p).outbound {
            if let Some(listen) = self.cfg.listen {
                self.send(
                    p,
                    WireMessage::PeerInfoSelf(PeerInfoSelfMsg {
                        port: listen.port(),
                    }),
                );
            }
        }

        let nonce = shroud_network::issue_challenge();
        self.peers.get_mut(p).challenge = nonce;
        self.send(p, WireMessage::Challenge(ChallengeMsg { nonce }));

        self.send(p, WireMessage::Config(self.local_config_msg()));

        if let Some(descriptor) = self.processor.cursor_descriptor() {
            self.send(
                p,
                WireMessage::NewTip(shroud_messages::NewTipMsg { descriptor }),
            );
        }
    }

    /// The capabilities we announce.
    pub fn local_config_msg(&self) -> ConfigMsg {
        ConfigMsg {
            cfg_checksum: self.cfg.rules_checksum(),
            spreading_transactions: true,
            bbs: true,
            send_peers: true,
        }
    }

    /// Transport-level failure or closed socket.
    pub fn on_io_error(&mut self, p: PeerRef) {
        if !self.peers.contains(p) {
            return;
        }
        self.delete_self(p, true, None);
    }

    /// Dispatch one received message. Any violation tears the peer down
    /// with a ban; the error stops at this boundary.
    pub fn on_message(&mut self, p: PeerRef, msg: WireMessage) {
        if !self.peers.contains(p) {
            return;
        }
        if let Err(Violation(what)) = self.handle_message(p, msg) {
            tracing::warn!(peer = %self.peers.get(p).addr, what, "protocol violation");
            self.delete_self(p, true, Some(ByeReason::Ban));
        }
    }

    fn handle_message(&mut self, p: PeerRef, msg: WireMessage) -> Result<(), Violation> {
        match msg {
            // Handshake
            WireMessage::PeerInfoSelf(m) => {
                self.peers.get_mut(p).port = m.port;
                Ok(())
            }
            WireMessage::Challenge(m) => {
                let sig = shroud_network::prove_identity(&m.nonce, &self.my_private);
                self.send(
                    p,
                    WireMessage::Authentication(AuthenticationMsg {
                        id: self.my_public_id,
                        id_type: IdType::Node,
                        signature: sig,
                    }),
                );
                Ok(())
            }
            WireMessage::Authentication(m) => self.on_authentication(p, m),

            // Session
            WireMessage::Config(m) => self.on_config(p, m),
            WireMessage::Bye(m) => {
                tracing::info!(peer = %self.peers.get(p).addr, reason = ?m.reason, "peer said bye");
                self.delete_self(p, false, None);
                Ok(())
            }
            WireMessage::Ping => {
                self.send(p, WireMessage::Pong);
                Ok(())
            }
            WireMessage::Pong => Ok(()),

            // Chain
            WireMessage::NewTip(m) => self.on_new_tip(p, m),
            WireMessage::GetHdr(m) => self.on_get_hdr(p, m),
            WireMessage::Hdr(m) => self.on_hdr(p, m),
            WireMessage::GetHdrPack(m) => self.on_get_hdr_pack(p, m),
            WireMessage::HdrPack(m) => self.on_hdr_pack(p, m),
            WireMessage::GetBody(m) => self.on_get_body(p, m),
            WireMessage::Body(m) => self.on_body(p, m),
            WireMessage::DataMissing => self.on_data_missing(p),

            // Proofs
            WireMessage::GetProofState(m) => self.on_get_proof_state(p, m),
            WireMessage::ProofState(_) => Ok(()),
            WireMessage::GetProofKernel(m) => self.on_get_proof_kernel(p, m),
            WireMessage::ProofKernel(_) => Ok(()),
            WireMessage::GetProofUtxo(m) => self.on_get_proof_utxo(p, m),
            WireMessage::ProofUtxo(_) => Ok(()),
            WireMessage::GetProofChainWork(m) => self.on_get_proof_chainwork(p, m),
            WireMessage::ProofChainWork(m) => self.on_proof_chainwork(p, m),

            // Transactions
            WireMessage::NewTransaction(m) => self.on_new_transaction(p, m),
            WireMessage::TxStatus(_) => Ok(()),
            WireMessage::HaveTransaction(m) => self.on_have_transaction(p, m),
            WireMessage::GetTransaction(m) => self.on_get_transaction(p, m),

            // BBS
            WireMessage::BbsMsg(m) => self.on_bbs_msg(p, m),
            WireMessage::BbsHaveMsg(m) => self.on_bbs_have_msg(p, m),
            WireMessage::BbsGetMsg(m) => self.on_bbs_get_msg(p, m),
            WireMessage::BbsSubscribe(m) => self.on_bbs_subscribe(p, m),
            WireMessage::BbsPickChannel => {
                let channel = self.bbs.recommended_channel;
                self.send(
                    p,
                    WireMessage::BbsPickChannelRes(shroud_messages::BbsPickChannelResMsg {
                        channel,
                    }),
                );
                Ok(())
            }
            WireMessage::BbsPickChannelRes(_) => Ok(()),

            // Macroblock sync
            WireMessage::MacroblockGet(m) => self.on_macroblock_get(p, m),
            WireMessage::Macroblock(m) => self.on_macroblock(p, m),

            // Gossip / misc
            WireMessage::PeerInfo(m) => self.on_peer_gossip(m),
            WireMessage::GetTime => {
                self.send(
                    p,
                    WireMessage::Time(TimeMsg {
                        value: Timestamp::now().as_secs(),
                    }),
                );
                Ok(())
            }
            WireMessage::Time(_) => Ok(()),
            WireMessage::GetExternalAddr => {
                let ip = self.peers.get(p).addr.ip();
                self.send(p, WireMessage::ExternalAddr(ExternalAddrMsg { ip }));
                Ok(())
            }
            WireMessage::ExternalAddr(_) => Ok(()),
            WireMessage::GetMined(m) => self.on_get_mined(p, m),
            WireMessage::Mined(_) => Ok(()),
        }
    }

    // -- Authentication ----------------------------------------------------

    fn on_authentication(&mut self, p: PeerRef, msg: AuthenticationMsg) -> Result<(), Violation> {
        let challenge = self.peers.get(p).challenge;
        if !shroud_network::verify_identity(&challenge, &msg.id, &msg.signature) {
            return unexpected("bad auth signature");
        }

        tracing::info!(peer = %self.peers.get(p).addr, id = %msg.id, ty = ?msg.id_type, "peer auth");

        if msg.id_type == IdType::Owner {
            if msg.id == self.my_owner_id {
                self.peers.get_mut(p).flags.set(PeerFlags::OWNER);
            }
            return Ok(());
        }

        if self.peers.get(p).flags.contains(PeerFlags::PI_RCVD) || msg.id.is_zero() {
            return unexpected("repeated or anonymous node auth");
        }
        self.peers.get_mut(p).flags.set(PeerFlags::PI_RCVD);

        // Previously attached info (we connected by address).
        if let Some(info) = self.peers.get(p).info {
            if self.peer_man.get(info).id == msg.id {
                self.peer_man.on_seen(info, self.now_ms / 1000);
                return Ok(()); // all settled already
            }

            // Detach: the address led to a different identity.
            self.peer_man.detach_live(info);
            self.peers.get_mut(p).info = None;
            if self.peer_man.get(info).id.is_zero() {
                tracing::info!("deleted anonymous peer entry");
                self.peer_man.delete(info);
            } else {
                tracing::info!("peer id differs, address was wrong");
                self.peer_man.on_active(info, false);
                self.peer_man.remove_addr(info);
            }
        }

        if msg.id == self.my_public_id {
            tracing::warn!("loopback connection");
            self.delete_self(p, false, Some(ByeReason::Loopback));
            return Ok(());
        }

        let port = self.peers.get(p).port;
        let addr_valid = port > 0;
        let packed = match (self.peers.get(p).addr, addr_valid) {
            (SocketAddr::V4(v4), true) => {
                pack_addr(std::net::SocketAddrV4::new(*v4.ip(), port))
            }
            _ => 0,
        };
        if !addr_valid {
            tracing::info!(peer = %self.peers.get(p).addr, "no advertised port");
        }

        let info = self.peer_man.on_peer(msg.id, packed, addr_valid && packed != 0);

        // Duplicate connection with the same identity: asymmetric close,
        // the side with the larger local id keeps its session.
        if let Some(live) = self.peer_man.get(info).live {
            let other = PeerRef(live);
            tracing::info!("duplicate connection for the same id");
            if self.my_public_id > msg.id {
                self.delete_self(other, false, Some(ByeReason::Duplicate));
                debug_assert!(self.peer_man.get(info).live.is_none());
            } else {
                self.delete_self(p, false, Some(ByeReason::Duplicate));
                return Ok(());
            }
        }

        if self.peer_man.is_banned(info) {
            tracing::info!("banned peer, dropping");
            self.delete_self(p, false, Some(ByeReason::Ban));
            return Ok(());
        }

        self.peer_man.attach_live(info, p.0);
        self.peers.get_mut(p).info = Some(info);
        self.peer_man.on_active(info, true);
        self.peer_man.on_seen(info, self.now_ms / 1000);
        Ok(())
    }

    // -- Capability renegotiation -------------------------------------------

    fn on_config(&mut self, p: PeerRef, msg: ConfigMsg) -> Result<(), Violation> {
        if msg.cfg_checksum != self.cfg.rules_checksum() {
            tracing::warn!(peer = %self.peers.get(p).addr, "incompatible rules checksum");
            self.delete_self(p, true, Some(ByeReason::Incompatible));
            return Ok(());
        }

        let old = self.peers.get(p).config;

        if !old.spreading_transactions && msg.spreading_transactions {
            for key in self.fluff.keys() {
                self.send(
                    p,
                    WireMessage::HaveTransaction(shroud_messages::HaveTransactionMsg { id: key }),
                );
            }
        }

        if old.send_peers != msg.send_peers {
            if msg.send_peers {
                let at = self.now_ms + self.cfg.timeout.top_peers_upd_ms;
                self.peers.get_mut(p).peers_resend_at = Some(at);
                self.on_resend_peers(p);
            } else {
                self.peers.get_mut(p).peers_resend_at = None;
            }
        }

        if !old.bbs && msg.bbs {
            match self.stores.bbs.enum_keys() {
                Ok(keys) => {
                    for key in keys {
                        self.send(
                            p,
                            WireMessage::BbsHaveMsg(shroud_messages::BbsHaveMsgBody { key }),
                        );
                    }
                }
                Err(e) => tracing::warn!(error = %e, "bbs backfill enumeration failed"),
            }
        }

        self.peers.get_mut(p).config = msg;
        Ok(())
    }

    /// Send the top-rated peers, skipping the recipient itself.
    pub fn on_resend_peers(&mut self, p: PeerRef) {
        let own_info = self.peers.get(p).info;
        let top = self.peer_man.top_rated(self.cfg.top_peers);
        for info in top {
            if Some(info) == own_info {
                continue;
            }
            let entry = self.peer_man.get(info);
            if entry.id.is_zero() || entry.address == 0 {
                continue;
            }
            let msg = PeerInfoMsg {
                id: entry.id,
                last_addr: SocketAddr::V4(shroud_network::unpack_addr(entry.address)),
            };
            self.send(p, WireMessage::PeerInfo(msg));
        }
    }

    fn on_peer_gossip(&mut self, msg: PeerInfoMsg) -> Result<(), Violation> {
        if msg.id != self.my_public_id {
            if let SocketAddr::V4(v4) = msg.last_addr {
                self.peer_man.on_peer(msg.id, pack_addr(v4), false);
            }
        }
        Ok(())
    }

    // -- Mined report --------------------------------------------------------

    fn on_get_mined(&mut self, p: PeerRef, msg: GetMinedMsg) -> Result<(), Violation> {
        let allowed = self.peers.get(p).flags.contains(PeerFlags::OWNER)
            || !self.cfg.restrict_mined_report_to_owner;

        let entries = if allowed {
            match self.stores.mined.enum_from(msg.height_min, ENTRIES_MAX) {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| PerMined {
                        id: row.id,
                        fees: row.fees,
                        active: row.active,
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "mined log enumeration failed");
                    Vec::new()
                }
            }
        } else {
            tracing::warn!(peer = %self.peers.get(p).addr, "unauthorized mined report request");
            Vec::new()
        };

        self.send(p, WireMessage::Mined(MinedMsg { entries }));
        Ok(())
    }

    // -- Proof serving -------------------------------------------------------

    fn on_get_proof_state(&mut self, p: PeerRef, msg: GetProofStateMsg) -> Result<(), Violation> {
        let proof = self.processor.proof_state(msg.height);
        self.send(p, WireMessage::ProofState(ProofStateMsg { proof }));
        Ok(())
    }

    fn on_get_proof_kernel(&mut self, p: PeerRef, msg: GetProofKernelMsg) -> Result<(), Violation> {
        let proof = self.processor.proof_kernel(&msg.id);
        self.send(p, WireMessage::ProofKernel(ProofKernelMsg { proof }));
        Ok(())
    }

    fn on_get_proof_utxo(&mut self, p: PeerRef, msg: GetProofUtxoMsg) -> Result<(), Violation> {
        let mut proofs = self.processor.proof_utxo(&msg.commitment, msg.maturity_min);
        proofs.truncate(ENTRIES_MAX);
        self.send(p, WireMessage::ProofUtxo(ProofUtxoMsg { proofs }));
        Ok(())
    }

    fn on_get_proof_chainwork(
        &mut self,
        p: PeerRef,
        msg: GetProofChainWorkMsg,
    ) -> Result<(), Violation> {
        let proof = self.processor.build_chainwork_proof(&msg.lower_bound);
        self.send(p, WireMessage::ProofChainWork(proof));
        Ok(())
    }

    // -- Request timeout -----------------------------------------------------

    /// The front task wasn't answered in time.
    pub fn on_peer_timeout(&mut self, p: PeerRef) {
        tracing::warn!(peer = %self.peers.get(p).addr, "request timeout");
        if let Some(info) = self.peers.get(p).info {
            self.peer_man
                .modify_rating(info, Rating::PENALTY_TIMEOUT, false);
        }
        self.delete_self(p, false, Some(ByeReason::Timeout));
    }

    // -- Teardown ------------------------------------------------------------

    /// Remove a session and every reference to it.
    pub fn delete_self(&mut self, p: PeerRef, is_error: bool, bye: Option<ByeReason>) {
        if !self.peers.contains(p) {
            return;
        }
        tracing::info!(peer = %self.peers.get(p).addr, error = is_error, "-peer");

        if let Some(reason) = bye {
            if self.peers.get(p).flags.contains(PeerFlags::CONNECTED) {
                self.send(p, WireMessage::Bye(ByeMsg { reason }));
            }
        }

        // Prevent task re-assignment to this peer during release.
        self.peers.get_mut(p).tip = StateDescriptor::zero();

        self.release_tasks(p);
        self.unsubscribe_all(p);

        if let Some(info) = self.peers.get_mut(p).info.take() {
            self.peer_man.detach_live(info);
            self.peer_man.on_active(info, false);
            if is_error {
                let severe = bye == Some(ByeReason::Ban);
                self.peer_man.on_remote_error(info, severe);
            }
        }

        let sync_slot_held = self.peers.get(p).flags.contains(PeerFlags::SYNC_PENDING);
        self.outbox.push(Effect::Disconnect(p));
        self.peers.release(p);

        if sync_slot_held {
            if let Some(sync) = self.sync.as_mut() {
                debug_assert!(sync.requests_pending > 0);
                sync.requests_pending = sync.requests_pending.saturating_sub(1);
                self.sync_cycle_all();
            }
        }
    }
}
