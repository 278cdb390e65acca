//! Node core: composition, identity, lifecycle.
//!
//! `NodeCore` owns every subsystem and runs single-threaded: the shell
//! (listener, per-peer read loops, beacon socket, timers) feeds it
//! events through plain method calls and drains the [`Effect`] outbox
//! after each one. The only off-core state is the verifier pool and the
//! miner workers.

use std::net::{SocketAddr, SocketAddrV4};

use shroud_messages::{
    BbsGetMsgBody, ByeReason, ConfigMsg, GetTransactionMsg, NewTipMsg, WireMessage,
};
use shroud_network::{pack_addr, PeerManager};
use shroud_store::{BbsStore, DummyStore, MinedStore, ParamStore, PeerStore};
use shroud_types::{MsgKey, PeerId, PrivateKey, StateDescriptor, TxKey};

use shroud_crypto::NonceChain;

use crate::bbs::BbsState;
use crate::config::NodeConfig;
use crate::miner::{MinedSolution, Miner};
use crate::peer::{PeerFlags, PeerRef, Peers};
use crate::processor::{ChainProcessor, DataStatus};
use crate::scheduler::TaskScheduler;
use crate::sync::SyncState;
use crate::txpool::{FluffPool, StemPool};
use crate::wanted::WantedSet;
use crate::NodeError;

/// Side effects the shell executes after each core call, in order.
#[derive(Debug)]
pub enum Effect {
    /// Serialize and write a message to the peer's socket.
    Send(PeerRef, WireMessage),
    /// Dial an outbound connection for a freshly allocated session.
    Connect(PeerRef, SocketAddr),
    /// Close the peer's socket and drop its read loop.
    Disconnect(PeerRef),
}

/// Persistent stores the core writes through.
pub struct Stores {
    pub params: Box<dyn ParamStore + Send>,
    pub peers: Box<dyn PeerStore + Send>,
    pub bbs: Box<dyn BbsStore + Send>,
    pub dummies: Box<dyn DummyStore + Send>,
    pub mined: Box<dyn MinedStore + Send>,
}

pub struct NodeCore {
    pub cfg: NodeConfig,
    pub processor: Box<dyn ChainProcessor>,
    pub stores: Stores,

    pub peers: Peers,
    pub sched: TaskScheduler,
    pub peer_man: PeerManager,
    pub fluff: FluffPool,
    pub stem: StemPool,
    pub bbs: BbsState,
    pub sync: Option<SyncState>,
    pub wanted_tx: WantedSet<TxKey>,
    pub wanted_bbs: WantedSet<MsgKey>,
    pub miner: Miner,

    pub outbox: Vec<Effect>,

    pub my_public_id: PeerId,
    pub my_owner_id: PeerId,
    pub(crate) my_private: PrivateKey,
    pub(crate) nonce: NonceChain,

    pub now_ms: u64,
    pub(crate) miner_restart_at: Option<u64>,
    pub(crate) miner_timer_pending: bool,
    peers_update_at: u64,
    peers_flush_at: u64,
}

impl NodeCore {
    pub fn new(
        cfg: NodeConfig,
        processor: Box<dyn ChainProcessor>,
        stores: Stores,
        solutions: tokio::sync::mpsc::UnboundedSender<MinedSolution>,
        now_ms: u64,
    ) -> Result<Self, NodeError> {
        if cfg.sync.force_resync {
            stores.params.clear_sync_target()?;
        }

        // Identity: load-or-create the node key, derive the owner id from
        // the wallet key.
        let secret = match stores.params.get_my_id()? {
            Some(secret) => secret,
            None => {
                let mut secret = [0u8; 32];
                getrandom::getrandom(&mut secret)
                    .map_err(|e| NodeError::Other(format!("no OS randomness: {e}")))?;
                stores.params.put_my_id(&secret)?;
                secret
            }
        };
        let node_keys = shroud_crypto::keypair_from_seed(&secret);
        let my_public_id = PeerId::new(node_keys.public.0);
        let owner_keys = shroud_crypto::keypair_from_seed(&cfg.wallet_key);
        let my_owner_id = PeerId::new(owner_keys.public.0);

        let mut nonce_init = [0u8; 32];
        getrandom::getrandom(&mut nonce_init)
            .map_err(|e| NodeError::Other(format!("no OS randomness: {e}")))?;
        let nonce = NonceChain::new(cfg.wallet_key, nonce_init);

        tracing::info!(id = %my_public_id, owner = %my_owner_id, "node identity");

        let miner = Miner::new(
            cfg.mining_threads,
            my_public_id,
            cfg.fake_pow_solve_time_ms,
            solutions,
        );

        let mut core = Self {
            peer_man: PeerManager::new(cfg.desired_peers),
            wanted_tx: WantedSet::new(cfg.timeout.get_tx_ms),
            wanted_bbs: WantedSet::new(cfg.timeout.get_bbs_msg_ms),
            peers_update_at: now_ms + cfg.timeout.peers_update_ms,
            peers_flush_at: now_ms + cfg.timeout.peers_db_flush_ms,
            cfg,
            processor,
            stores,
            peers: Peers::default(),
            sched: TaskScheduler::default(),
            fluff: FluffPool::default(),
            stem: StemPool::default(),
            bbs: BbsState::default(),
            sync: None,
            miner,
            outbox: Vec::new(),
            my_public_id,
            my_owner_id,
            my_private: node_keys.private,
            nonce,
            now_ms,
            miner_restart_at: None,
            miner_timer_pending: false,
        };

        tracing::info!(tip = %core.processor.cursor(), "initial tip");

        core.init_mode();
        core.refresh_congestions();
        core.init_peer_manager();

        if core.miner.thread_count() > 0 {
            // Async start: initialization may still import a macroblock.
            core.set_miner_timer(0, true);
        }

        core.bbs_cleanup();
        Ok(core)
    }

    fn init_peer_manager(&mut self) {
        let connect = self.cfg.connect.clone();
        for addr in connect {
            if let SocketAddr::V4(v4) = addr {
                self.peer_man.on_peer(PeerId::ZERO, pack_addr(v4), true);
            }
        }

        match self.stores.peers.load_all() {
            Ok(records) => {
                let my_id = self.my_public_id;
                self.peer_man.load(&records, &my_id);
                tracing::info!(peers = records.len(), "peer table loaded");
            }
            Err(e) => tracing::warn!(error = %e, "peer table load failed"),
        }
    }

    /// Drain the side effects produced by the last event.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn send(&mut self, p: PeerRef, msg: WireMessage) {
        self.outbox.push(Effect::Send(p, msg));
    }

    // -- Processor feed ------------------------------------------------------

    /// Feed a header; fires `on_new_state` when the cursor advanced.
    pub fn feed_header(&mut self, hdr: &StateDescriptor, from: &PeerId) -> DataStatus {
        let before = self.processor.cursor();
        let status = self.processor.on_header(hdr, from);
        if self.processor.cursor() != before {
            self.on_new_state();
        }
        status
    }

    /// Feed a block body; fires `on_new_state` when the cursor advanced.
    pub fn feed_block(
        &mut self,
        id: &shroud_types::StateId,
        body: &[u8],
        from: &PeerId,
    ) -> DataStatus {
        let before = self.processor.cursor();
        let status = self.processor.on_block(id, body, from);
        if self.processor.cursor() != before {
            self.on_new_state();
        }
        status
    }

    /// The chain advanced: notify peers, restart mining, re-derive wants.
    pub fn on_new_state(&mut self) {
        let Some(descriptor) = self.processor.cursor_descriptor() else {
            return;
        };
        tracing::info!(tip = %descriptor.id(), "my tip");

        self.miner.hard_abort();
        // Block construction is deferred to a zero-delay timer: the
        // processor may still hold its write transaction here.
        self.set_miner_timer(0, true);

        for p in self.peers.refs() {
            let peer = self.peers.get(p);
            if !peer.flags.contains(PeerFlags::CONNECTED) {
                continue;
            }
            if descriptor.chainwork <= peer.tip.chainwork {
                continue;
            }
            self.send(
                p,
                WireMessage::NewTip(NewTipMsg {
                    descriptor: descriptor.clone(),
                }),
            );
        }

        self.refresh_congestions();
    }

    // -- Timers --------------------------------------------------------------

    /// Advance every deadline-driven subsystem to `now_ms`.
    pub fn on_tick(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);

        // Announced transactions that never arrived: re-request once.
        for key in self.wanted_tx.expired(self.now_ms) {
            for p in self.peers.refs() {
                if self.peers.get(p).config.spreading_transactions {
                    self.send(p, WireMessage::GetTransaction(GetTransactionMsg { id: key }));
                }
            }
        }

        // Same for BBS messages; expiry also drives the cleanup sweep.
        let bbs_due = self.wanted_bbs.expired(self.now_ms);
        for key in &bbs_due {
            for p in self.peers.refs() {
                if self.peers.get(p).config.bbs {
                    self.send(p, WireMessage::BbsGetMsg(BbsGetMsgBody { key: *key }));
                }
            }
        }
        if !bbs_due.is_empty() {
            self.bbs_maybe_cleanup();
        }

        // Per-peer request timeouts and gossip rounds.
        for p in self.peers.refs() {
            if !self.peers.contains(p) {
                continue;
            }
            if let Some(deadline) = self.peers.get(p).request_deadline {
                if self.now_ms >= deadline {
                    self.on_peer_timeout(p);
                    continue;
                }
            }
            if let Some(at) = self.peers.get(p).peers_resend_at {
                if self.now_ms >= at {
                    let next = self.now_ms + self.cfg.timeout.top_peers_upd_ms;
                    self.peers.get_mut(p).peers_resend_at = Some(next);
                    self.on_resend_peers(p);
                }
            }
        }

        self.on_stem_timers();

        // Sync target detection deadline.
        let detect_due = self
            .sync
            .as_ref()
            .and_then(|s| s.detect_deadline)
            .map_or(false, |at| self.now_ms >= at);
        if detect_due {
            self.on_sync_timer();
        }

        // Peer-manager activation policy.
        if self.now_ms >= self.peers_update_at {
            self.peers_update_at = self.now_ms + self.cfg.timeout.peers_update_ms;
            for info in self.peer_man.pick_activation() {
                self.activate_peer(info);
            }
        }

        // Peer-table persistence.
        if self.now_ms >= self.peers_flush_at {
            self.peers_flush_at = self.now_ms + self.cfg.timeout.peers_db_flush_ms;
            self.flush_peers();
        }

        self.on_miner_timer();
    }

    pub(crate) fn flush_peers(&mut self) {
        let snapshot = self.peer_man.snapshot();
        if let Err(e) = self.stores.peers.replace_all(&snapshot) {
            tracing::warn!(error = %e, "peer table flush failed");
        }
    }

    // -- Discovery -----------------------------------------------------------

    /// The LAN beacon heard a node.
    pub fn on_beacon_peer(&mut self, id: PeerId, addr: SocketAddrV4) {
        if id == self.my_public_id {
            return;
        }
        self.peer_man.on_peer(id, pack_addr(addr), true);
    }

    // -- Shutdown ------------------------------------------------------------

    /// Graceful teardown mirroring initialization in reverse.
    pub fn shutdown(&mut self) {
        tracing::info!("node stopping");

        self.miner.shutdown();

        // Prevent task re-assignment and rebroadcast churn while the
        // peer list drains.
        for p in self.peers.refs() {
            let peer = self.peers.get_mut(p);
            peer.config = ConfigMsg::default();
            peer.tip = StateDescriptor::zero();
        }
        self.sync = None;

        loop {
            let Some(p) = self.peers.refs().into_iter().next() else {
                break;
            };
            self.delete_self(p, false, Some(ByeReason::Stopping));
        }

        while let Some(&t) = self.sched.unassigned.front() {
            self.sched.delete_unassigned(t);
        }
        debug_assert!(self.sched.is_empty());

        self.flush_peers();
        tracing::info!("node stopped");
    }
}
