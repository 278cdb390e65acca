//! Two-phase bootstrap: macroblock target detection, then shard download.
//!
//! Phase 1 probes every announcing peer for the macroblock it offers and
//! retains the best `(chainwork, height)` candidate; the phase ends on a
//! timer or as soon as the probe quorum answers. The committed target is
//! persisted so a restarted node resumes the same download. Phase 2
//! walks the data shards one request at a time, appending portions to
//! the shard files; an empty portion completes a shard. When the last
//! shard lands the macroblock is imported and the node switches to the
//! incremental scheduler.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use shroud_messages::{
    GetProofChainWorkMsg, MacroblockGetMsg, MacroblockMsg, NewTipMsg, ProofChainWorkMsg,
    WireMessage, MACRO_SHARD_COUNT,
};
use shroud_network::Rating;
use shroud_types::{ChainWork, StateId};

use crate::error::{unexpected, Violation};
use crate::node::NodeCore;
use crate::peer::{PeerFlags, PeerRef};
use crate::processor::{shard_file_name, DataStatus};

/// Bootstrap state. `None` on the node means normal operation.
pub struct SyncState {
    /// Committed (or best-so-far) macroblock id; zero while undecided.
    pub target: StateId,
    /// Chainwork of the best candidate's peer.
    pub best: ChainWork,
    /// Phase 1 = true, phase 2 = false.
    pub detecting: bool,
    /// Outstanding probes (phase 1) or download requests (phase 2).
    pub requests_pending: u32,
    /// Shard currently downloading.
    pub i_data: u8,
    /// Phase 1 deadline, armed when the first candidate arrives.
    pub detect_deadline: Option<u64>,
}

impl NodeCore {
    /// Decide at startup whether to bootstrap from a macroblock.
    pub(crate) fn init_mode(&mut self) {
        if self.processor.cursor().height != 0 {
            return;
        }
        if !self.cfg.treasury.is_empty() {
            tracing::info!("creating new blockchain from treasury");
            return;
        }
        if self.cfg.sync.src_peers == 0 {
            return;
        }

        tracing::info!("sync mode");
        let target = match self.stores.params.get_sync_target() {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(error = %e, "sync target load failed");
                None
            }
        };

        match target {
            Some(target) => {
                tracing::info!(%target, "resuming sync");
                self.sync = Some(SyncState {
                    target,
                    best: ChainWork::ZERO,
                    detecting: false,
                    requests_pending: 0,
                    i_data: 0,
                    detect_deadline: None,
                });
            }
            None => {
                tracing::info!("searching for the best peer");
                self.sync = Some(SyncState {
                    target: StateId::ZERO,
                    best: ChainWork::ZERO,
                    detecting: true,
                    requests_pending: 0,
                    i_data: 0,
                    detect_deadline: None,
                });
            }
        }
    }

    // -- Tip handling --------------------------------------------------------

    pub(crate) fn on_new_tip(&mut self, p: PeerRef, msg: NewTipMsg) -> Result<(), Violation> {
        if msg.descriptor.chainwork < self.peers.get(p).tip.chainwork {
            return unexpected("tip chainwork went backwards");
        }

        self.peers.get_mut(p).tip = msg.descriptor.clone();
        self.peers.get_mut(p).rejected.clear();

        let id = msg.descriptor.id();
        tracing::info!(peer = %self.peers.get(p).addr, %id, "peer tip");

        if self.peers.get(p).info.is_none() {
            return Ok(());
        }

        let sync_mode = self.sync.is_some();

        if self.processor.is_remote_tip_needed(&msg.descriptor) {
            let from = self
                .peers
                .get(p)
                .info
                .map_or(shroud_types::PeerId::ZERO, |info| {
                    self.peer_man.get(info).id
                });
            match self.feed_header(&msg.descriptor, &from) {
                DataStatus::Invalid => return unexpected("invalid tip"),
                DataStatus::Accepted => {
                    if let Some(info) = self.peers.get(p).info {
                        self.peer_man.modify_rating(info, Rating::REWARD_HEADER, true);
                    }
                    if !sync_mode {
                        self.refresh_congestions(); // may delete this session
                        return Ok(());
                    }
                }
                DataStatus::Unreachable => {
                    tracing::warn!(%id, "tip unreachable");
                }
                DataStatus::Rejected => {}
            }
        }

        if !sync_mode {
            self.take_tasks(p);
            return Ok(());
        }

        let proven_req = self.peers.get(p).flags.contains(PeerFlags::PROVEN_WORK_REQ);
        if !proven_req {
            self.peers.get_mut(p).flags.set(PeerFlags::PROVEN_WORK_REQ);
            self.send(
                p,
                WireMessage::GetProofChainWork(GetProofChainWorkMsg {
                    lower_bound: ChainWork::ZERO,
                }),
            );
        }

        let detecting = self.sync.as_ref().map_or(false, |s| s.detecting);
        if detecting {
            if !proven_req {
                // Probe what macroblock this peer offers.
                self.peers.get_mut(p).flags.set(PeerFlags::DONT_SYNC);
                self.send(
                    p,
                    WireMessage::MacroblockGet(MacroblockGetMsg {
                        id: StateId::ZERO,
                        data: 0,
                        offset: 0,
                    }),
                );
                tracing::info!(peer = %self.peers.get(p).addr, "sending macroblock query");
            }
        } else {
            self.sync_cycle_peer(p);
        }
        Ok(())
    }

    pub(crate) fn on_proof_chainwork(
        &mut self,
        p: PeerRef,
        msg: ProofChainWorkMsg,
    ) -> Result<(), Violation> {
        let tip = self.peers.get(p).tip.clone();
        if !self.processor.verify_chainwork_proof(&msg, &tip) {
            return unexpected("chainwork proof does not match the tip");
        }

        tracing::info!(peer = %self.peers.get(p).addr, "chainwork ok");
        self.peers.get_mut(p).flags.set(PeerFlags::PROVEN_WORK);

        if self.sync.is_some() {
            self.sync_cycle_all();
        }
        Ok(())
    }

    // -- Macroblock exchange -------------------------------------------------

    pub(crate) fn on_macroblock(&mut self, p: PeerRef, msg: MacroblockMsg) -> Result<(), Violation> {
        tracing::info!(
            peer = %self.peers.get(p).addr,
            portion = msg.portion.len(),
            "got macroblock"
        );

        if self.sync.is_none() {
            return Ok(());
        }
        if !self.peers.get(p).flags.contains(PeerFlags::PROVEN_WORK) {
            return unexpected("macroblock without proven work");
        }

        if self.peers.get(p).flags.contains(PeerFlags::SYNC_PENDING) {
            self.peers.get_mut(p).flags.clear(PeerFlags::SYNC_PENDING);
            let sync = self.sync.as_mut().expect("sync checked above");
            debug_assert!(sync.requests_pending > 0);
            sync.requests_pending = sync.requests_pending.saturating_sub(1);

            if msg.id == sync.target {
                tracing::info!(peer = %self.peers.get(p).addr, "downloading macroblock portion");
                self.sync_cycle_data(p, msg.portion);
            } else {
                tracing::info!(peer = %self.peers.get(p).addr, "peer incompatible");
                self.peers.get_mut(p).flags.set(PeerFlags::DONT_SYNC);
                self.sync_cycle_all();
            }
            return Ok(());
        }

        // Probe response.
        self.peers.get_mut(p).flags.clear(PeerFlags::DONT_SYNC);

        let detecting = self.sync.as_ref().map_or(false, |s| s.detecting);
        if !detecting {
            return Ok(());
        }

        let tip_work = self.peers.get(p).tip.chainwork;
        let sync = self.sync.as_mut().expect("sync checked above");

        // Retain the (chainwork, height)-lexicographically best offer.
        if tip_work > sync.best || (tip_work == sync.best && msg.id.height > sync.target.height) {
            tracing::info!(target = %msg.id, peer = %self.peers.get(p).addr, "sync target so far");
            sync.target = msg.id;
            sync.best = tip_work;

            if sync.detect_deadline.is_none() {
                sync.detect_deadline = Some(self.now_ms + self.cfg.sync.timeout_ms);
            }
        }

        sync.requests_pending += 1;
        if sync.requests_pending >= self.cfg.sync.src_peers {
            self.on_sync_timer();
        }
        Ok(())
    }

    /// Phase 1 concluded: commit the best target, or give up on
    /// macroblock sync entirely.
    pub(crate) fn on_sync_timer(&mut self) {
        let Some(sync) = self.sync.as_mut() else {
            return;
        };
        debug_assert!(sync.detecting);

        if sync.target.height != 0 {
            sync.detect_deadline = None;
            sync.detecting = false;
            sync.requests_pending = 0;
            let target = sync.target;
            tracing::info!(%target, "sync target final");
            if let Err(e) = self.stores.params.put_sync_target(&target) {
                tracing::warn!(error = %e, "sync target persist failed");
            }
            self.sync_cycle_all();
        } else {
            self.sync = None;
            tracing::info!("switching to standard sync");
            self.refresh_congestions();
        }
    }

    /// Find any peer that can serve the current shard.
    pub(crate) fn sync_cycle_all(&mut self) {
        {
            let Some(sync) = self.sync.as_ref() else {
                return;
            };
            if sync.detecting || sync.requests_pending > 0 {
                return;
            }
        }
        for p in self.peers.refs() {
            if self.sync_cycle_peer(p) {
                break;
            }
        }
    }

    /// Ask `p` for the current shard, resuming at the local file size.
    /// Returns whether a request went out.
    pub(crate) fn sync_cycle_peer(&mut self, p: PeerRef) -> bool {
        let (target, i_data) = {
            let Some(sync) = self.sync.as_ref() else {
                return false;
            };
            if sync.detecting || sync.requests_pending > 0 {
                return false;
            }
            (sync.target, sync.i_data)
        };

        debug_assert!(!self.peers.get(p).flags.contains(PeerFlags::SYNC_PENDING));
        let flags = self.peers.get(p).flags;
        if flags.contains(PeerFlags::DONT_SYNC) || !flags.contains(PeerFlags::PROVEN_WORK) {
            return false;
        }
        if self.peers.get(p).tip.height < target.height {
            return false;
        }

        let offset = std::fs::metadata(self.shard_path(target.height, i_data))
            .map(|m| m.len())
            .unwrap_or(0);

        self.send(
            p,
            WireMessage::MacroblockGet(MacroblockGetMsg {
                id: target,
                data: i_data,
                offset,
            }),
        );
        self.peers.get_mut(p).flags.set(PeerFlags::SYNC_PENDING);
        self.sync.as_mut().expect("sync checked above").requests_pending += 1;

        tracing::info!(
            peer = %self.peers.get(p).addr,
            idx = i_data,
            offset,
            "sending macroblock request"
        );
        true
    }

    /// A portion arrived for the current shard.
    fn sync_cycle_data(&mut self, p: PeerRef, portion: Vec<u8>) {
        let (target, i_data) = {
            let sync = self.sync.as_ref().expect("caller checked");
            debug_assert!(!sync.detecting && sync.requests_pending == 0);
            (sync.target, sync.i_data)
        };

        if portion.is_empty() {
            tracing::info!(idx = i_data, "sync cycle complete for shard");
            let next = i_data + 1;
            if next == MACRO_SHARD_COUNT {
                self.sync = None;
                tracing::info!("sync download complete");
                self.finish_macroblock_sync(target);
                return;
            }
            self.sync.as_mut().expect("caller checked").i_data = next;
        } else {
            let path = self.shard_path(target.height, i_data);
            if let Err(e) = append_shard(&path, &portion) {
                tracing::warn!(error = %e, "shard append failed");
                return;
            }
            tracing::info!(bytes = portion.len(), "portion appended");
        }

        if self.peers.contains(p) {
            self.sync_cycle_peer(p);
        } else {
            self.sync_cycle_all();
        }
    }

    fn finish_macroblock_sync(&mut self, target: StateId) {
        let dir = self.macroblock_dir(target.height);
        match self.processor.import_macroblock(&dir, &target) {
            Ok(()) => {
                if let Err(e) = self.stores.params.clear_sync_target() {
                    tracing::warn!(error = %e, "sync target clear failed");
                }
                self.on_new_state();
            }
            Err(e) => {
                tracing::error!(error = %e, "macroblock import failed");
                self.refresh_congestions();
            }
        }
    }

    // -- Serving -------------------------------------------------------------

    pub(crate) fn on_macroblock_get(
        &mut self,
        p: PeerRef,
        msg: MacroblockGetMsg,
    ) -> Result<(), Violation> {
        if msg.data >= MACRO_SHARD_COUNT {
            return unexpected("bad macroblock shard index");
        }

        let mut out = MacroblockMsg {
            id: StateId::ZERO,
            portion: Vec::new(),
        };

        if self.cfg.history_upload_portion > 0 {
            if let Some(own) = self.processor.macroblock_id() {
                out.id = own;
                if msg.id.height != 0 && msg.id == own {
                    let path = self.shard_path(own.height, msg.data);
                    out.portion =
                        read_shard_portion(&path, msg.offset, self.cfg.history_upload_portion);
                }
            }
        }

        self.send(p, WireMessage::Macroblock(out));
        Ok(())
    }

    // -- Paths ---------------------------------------------------------------

    pub fn macroblock_dir(&self, height: u64) -> PathBuf {
        self.cfg.data_dir.join(format!("macroblock_{height}"))
    }

    pub fn shard_path(&self, height: u64, i_data: u8) -> PathBuf {
        self.macroblock_dir(height).join(shard_file_name(i_data))
    }
}

fn append_shard(path: &std::path::Path, portion: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(portion)
}

fn read_shard_portion(path: &std::path::Path, offset: u64, max: u32) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(bytes) if (offset as usize) < bytes.len() => {
            let start = offset as usize;
            let end = (start + max as usize).min(bytes.len());
            bytes[start..end].to_vec()
        }
        _ => Vec::new(),
    }
}
