//! Congestion tracking: which chain objects are missing, which peer is
//! fetching each one, and what happens when a fetch fails.
//!
//! Every missing object is a [`Task`] keyed by `(StateId, is_block)`.
//! A task is either in the unassigned queue or on exactly one peer's
//! FIFO list; `owner` mirrors which. At most one header pack and one
//! body pack are outstanding globally, and a peer transferring a block
//! is not given anything else until it finishes.

use std::collections::{HashMap, VecDeque};

use shroud_messages::{
    BodyMsg, GetBodyMsg, GetHdrMsg, GetHdrPackMsg, HdrMsg, HdrPackMsg, WireMessage,
    HDR_PACK_MAX_SIZE,
};
use shroud_network::Rating;
use shroud_types::{PeerId, StateId};

use crate::error::{unexpected, Violation};
use crate::node::NodeCore;
use crate::peer::{PeerFlags, PeerRef};
use crate::processor::DataStatus;

/// Request a header pack instead of single headers when the peer is at
/// least this far ahead.
const PACK_THRESHOLD: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

#[derive(Clone, Copy, Debug)]
pub struct Task {
    pub key: (StateId, bool),
    /// Still wanted by the processor; cleared and re-derived on refresh.
    pub relevant: bool,
    /// This request went out as a batched header pack.
    pub pack: bool,
    pub owner: Option<PeerRef>,
}

#[derive(Default)]
pub struct TaskScheduler {
    slots: Vec<Option<Task>>,
    free: Vec<u32>,
    by_key: HashMap<(StateId, bool), TaskId>,
    pub unassigned: VecDeque<TaskId>,
    pub pack_hdr_count: u32,
    pub pack_body_count: u32,
}

impl TaskScheduler {
    pub fn get(&self, t: TaskId) -> &Task {
        self.slots[t.0 as usize].as_ref().expect("stale TaskId")
    }

    pub fn get_mut(&mut self, t: TaskId) -> &mut Task {
        self.slots[t.0 as usize].as_mut().expect("stale TaskId")
    }

    pub fn find(&self, key: &(StateId, bool)) -> Option<TaskId> {
        self.by_key.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.by_key.values().copied().collect()
    }

    fn create(&mut self, key: (StateId, bool)) -> TaskId {
        let task = Task {
            key,
            relevant: true,
            pack: false,
            owner: None,
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(task);
                TaskId(slot)
            }
            None => {
                self.slots.push(Some(task));
                TaskId((self.slots.len() - 1) as u32)
            }
        };
        self.by_key.insert(key, id);
        self.unassigned.push_back(id);
        id
    }

    /// Delete a task that sits in the unassigned queue.
    pub fn delete_unassigned(&mut self, t: TaskId) {
        let task = self.slots[t.0 as usize].take().expect("stale TaskId");
        debug_assert!(task.owner.is_none() && !task.pack);
        self.by_key.remove(&task.key);
        self.unassigned.retain(|&id| id != t);
        self.free.push(t.0);
    }
}

impl NodeCore {
    // -- Requesting ---------------------------------------------------------

    /// The processor wants object `id`. Idempotent per key.
    pub fn request_data(&mut self, id: StateId, is_block: bool, preferred: Option<PeerId>) {
        let key = (id, is_block);
        match self.sched.find(&key) {
            Some(t) => self.sched.get_mut(t).relevant = true,
            None => {
                tracing::info!(
                    what = if is_block { "block" } else { "header" },
                    %id,
                    "requesting"
                );
                let t = self.sched.create(key);
                self.try_assign_task(t, preferred);
            }
        }
    }

    /// Re-derive the wanted set from the processor. Paused during
    /// macroblock sync. Tasks that come back not-relevant are dropped.
    pub fn refresh_congestions(&mut self) {
        if self.sync.is_some() {
            return;
        }

        for t in self.sched.task_ids() {
            self.sched.get_mut(t).relevant = false;
        }

        let mut wants = Vec::new();
        self.processor
            .enum_congestions(&mut |id, is_block, preferred| {
                wants.push((id, is_block, preferred));
            });
        for (id, is_block, preferred) in wants {
            self.request_data(id, is_block, preferred);
        }

        let stale: Vec<TaskId> = self
            .sched
            .unassigned
            .iter()
            .copied()
            .filter(|&t| !self.sched.get(t).relevant)
            .collect();
        for t in stale {
            self.sched.delete_unassigned(t);
        }
    }

    // -- Assignment ---------------------------------------------------------

    pub fn should_assign_task(&self, t: TaskId, p: PeerRef) -> bool {
        let task = self.sched.get(t);
        let peer = self.peers.get(p);
        let (id, _) = task.key;

        if peer.tip.height < id.height {
            return false;
        }
        if peer.tip.height == id.height && peer.tip.id().hash != id.hash {
            return false;
        }

        // Don't ask anything from non-authenticated peers.
        if !peer.flags.contains(PeerFlags::PI_RCVD) || peer.info.is_none() {
            return false;
        }

        // A peer transferring a block gets nothing else until it's done.
        if peer.tasks.iter().any(|&id| self.sched.get(id).key.1) {
            return false;
        }

        !peer.rejected.contains(&task.key)
    }

    /// Find a peer for `t`: the preferred one if eligible, else the first
    /// eligible session in arena order.
    pub fn try_assign_task(&mut self, t: TaskId, preferred: Option<PeerId>) {
        if let Some(id) = preferred {
            if let Some(info) = self.peer_man.find(&id) {
                if let Some(live) = self.peer_man.get(info).live {
                    let p = PeerRef(live);
                    if self.peers.contains(p)
                        && self.peers.get(p).flags.contains(PeerFlags::PI_RCVD)
                    {
                        self.assign_task(t, p);
                        return;
                    }
                }
            }
        }

        for p in self.peers.refs() {
            if self.should_assign_task(t, p) {
                self.assign_task(t, p);
                return;
            }
        }
    }

    /// Move `t` onto `p` and send the request.
    pub fn assign_task(&mut self, t: TaskId, p: PeerRef) {
        let (id, is_block) = self.sched.get(t).key;

        let cursor_height = self.processor.cursor().height;
        let mut pack_size = 0u32;
        if id.height > cursor_height {
            let dh = id.height - cursor_height;
            if dh >= PACK_THRESHOLD {
                pack_size = HDR_PACK_MAX_SIZE.min(dh as u32);
            }
        }

        if is_block {
            self.send(p, WireMessage::GetBody(GetBodyMsg { id }));
        } else if self.sched.pack_hdr_count == 0 && pack_size > 0 {
            self.send(
                p,
                WireMessage::GetHdrPack(GetHdrPackMsg {
                    top: id,
                    count: pack_size,
                }),
            );
            self.sched.get_mut(t).pack = true;
            self.sched.pack_hdr_count += 1;
        } else {
            self.send(p, WireMessage::GetHdr(GetHdrMsg { id }));
        }

        debug_assert!(self.sched.get(t).owner.is_none());
        self.sched.get_mut(t).owner = Some(p);
        self.sched.unassigned.retain(|&x| x != t);

        let was_empty = self.peers.get(p).tasks.is_empty();
        self.peers.get_mut(p).tasks.push_back(t);
        if was_empty {
            self.set_timer_wrt_first_task(p);
        }
    }

    /// Arm (or disarm) the peer's request timer from its front task.
    pub fn set_timer_wrt_first_task(&mut self, p: PeerRef) {
        let deadline = self.peers.get(p).tasks.front().map(|&t| {
            let is_block = self.sched.get(t).key.1;
            let timeout = if is_block {
                self.cfg.timeout.get_block_ms
            } else {
                self.cfg.timeout.get_state_ms
            };
            self.now_ms + timeout
        });
        self.peers.get_mut(p).request_deadline = deadline;
    }

    /// A fresh tip arrived: rescan the unassigned queue for work this
    /// peer can take.
    pub fn take_tasks(&mut self, p: PeerRef) {
        let candidates: Vec<TaskId> = self.sched.unassigned.iter().copied().collect();
        for t in candidates {
            if self.should_assign_task(t, p) {
                self.assign_task(t, p);
            }
        }
    }

    // -- Release ------------------------------------------------------------

    /// Detach the peer's front task and put it back in play.
    fn release_task(&mut self, p: PeerRef, t: TaskId) {
        debug_assert_eq!(self.sched.get(t).owner, Some(p));
        self.sched.get_mut(t).owner = None;

        if self.sched.get(t).pack {
            let counter = if self.sched.get(t).key.1 {
                &mut self.sched.pack_body_count
            } else {
                &mut self.sched.pack_hdr_count
            };
            debug_assert!(*counter > 0);
            *counter -= 1;
            self.sched.get_mut(t).pack = false;
        }

        self.peers.get_mut(p).tasks.retain(|&x| x != t);
        self.sched.unassigned.push_back(t);

        if self.sched.get(t).relevant {
            self.try_assign_task(t, None);
        } else {
            self.sched.delete_unassigned(t);
        }
    }

    /// Release everything a dying peer held.
    pub fn release_tasks(&mut self, p: PeerRef) {
        while let Some(&t) = self.peers.get(p).tasks.front() {
            self.release_task(p, t);
        }
    }

    fn get_first_task(&self, p: PeerRef) -> Result<TaskId, Violation> {
        match self.peers.get(p).tasks.front() {
            Some(&t) => Ok(t),
            None => unexpected("response without a request"),
        }
    }

    fn on_first_task_done(&mut self, p: PeerRef) {
        let t = *self.peers.get(p).tasks.front().expect("no front task");
        self.release_task(p, t);
        if self.peers.contains(p) {
            self.set_timer_wrt_first_task(p);
        }
    }

    /// Completion path shared by `Hdr` and `Body`: the front task is
    /// done, and an accepted object may have opened new gaps.
    fn on_first_task_done_status(
        &mut self,
        p: PeerRef,
        status: DataStatus,
    ) -> Result<(), Violation> {
        if status == DataStatus::Invalid {
            return unexpected("peer sent invalid chain object");
        }
        let t = self.get_first_task(p)?;
        self.sched.get_mut(t).relevant = false;
        self.on_first_task_done(p);

        if status == DataStatus::Accepted {
            self.refresh_congestions(); // may delete this session
        }
        Ok(())
    }

    // -- Serving ------------------------------------------------------------

    pub(crate) fn on_get_hdr(&mut self, p: PeerRef, msg: GetHdrMsg) -> Result<(), Violation> {
        match self.processor.get_header(&msg.id) {
            Some(descriptor) => self.send(p, WireMessage::Hdr(HdrMsg { descriptor })),
            None => self.send(p, WireMessage::DataMissing),
        }
        Ok(())
    }

    pub(crate) fn on_get_hdr_pack(
        &mut self,
        p: PeerRef,
        msg: GetHdrPackMsg,
    ) -> Result<(), Violation> {
        if msg.count == 0 || msg.count > HDR_PACK_MAX_SIZE {
            return unexpected("bad header pack count");
        }
        let headers = self.processor.get_header_pack(&msg.top, msg.count);
        if headers.is_empty() {
            self.send(p, WireMessage::DataMissing);
        } else {
            self.send(p, WireMessage::HdrPack(HdrPackMsg { headers }));
        }
        Ok(())
    }

    pub(crate) fn on_get_body(&mut self, p: PeerRef, msg: GetBodyMsg) -> Result<(), Violation> {
        match self.processor.get_block(&msg.id) {
            Some(buffer) => self.send(p, WireMessage::Body(BodyMsg { buffer })),
            None => self.send(p, WireMessage::DataMissing),
        }
        Ok(())
    }

    // -- Responses ----------------------------------------------------------

    pub(crate) fn on_data_missing(&mut self, p: PeerRef) -> Result<(), Violation> {
        let t = self.get_first_task(p)?;
        let key = self.sched.get(t).key;
        self.peers.get_mut(p).rejected.insert(key);
        self.on_first_task_done(p);
        Ok(())
    }

    pub(crate) fn on_hdr(&mut self, p: PeerRef, msg: HdrMsg) -> Result<(), Violation> {
        let t = self.get_first_task(p)?;
        let task = *self.sched.get(t);

        if task.key.1 || task.pack {
            return unexpected("header answers a non-header request");
        }
        if msg.descriptor.id() != task.key.0 {
            return unexpected("header does not match the request");
        }

        let from = self.peer_identity(p);
        if let Some(info) = self.peers.get(p).info {
            self.peer_man.modify_rating(info, Rating::REWARD_HEADER, true);
        }

        let status = self.feed_header(&msg.descriptor, &from);
        if !self.peers.contains(p) {
            return Ok(());
        }
        self.on_first_task_done_status(p, status)
    }

    pub(crate) fn on_hdr_pack(&mut self, p: PeerRef, msg: HdrPackMsg) -> Result<(), Violation> {
        let t = self.get_first_task(p)?;
        let task = *self.sched.get(t);

        if task.key.1 || !task.pack {
            return unexpected("header pack answers a non-pack request");
        }
        if msg.headers.is_empty() || msg.headers.len() > HDR_PACK_MAX_SIZE as usize {
            return unexpected("bad header pack size");
        }

        // Top first, each element naming the next one's hash.
        if msg.headers[0].id() != task.key.0 {
            return unexpected("header pack top does not match the request");
        }
        for pair in msg.headers.windows(2) {
            if pair[0].height != pair[1].height + 1 || pair[0].prev != pair[1].id().hash {
                return unexpected("header pack does not chain");
            }
        }

        let from = self.peer_identity(p);
        let mut accepted = 0u32;
        let mut invalid = false;
        for descriptor in msg.headers.iter().rev() {
            match self.feed_header(descriptor, &from) {
                DataStatus::Accepted => accepted += 1,
                DataStatus::Invalid => invalid = true,
                _ => {}
            }
        }

        if !self.peers.contains(p) {
            return Ok(());
        }
        self.on_first_task_done(p);

        if accepted > 0 {
            if let Some(info) = self.peers.get(p).info {
                self.peer_man
                    .modify_rating(info, Rating::REWARD_HEADER * accepted, true);
            }
            self.refresh_congestions(); // may delete this session
        } else if invalid {
            return unexpected("header pack contained only invalid headers");
        }
        Ok(())
    }

    pub(crate) fn on_body(&mut self, p: PeerRef, msg: BodyMsg) -> Result<(), Violation> {
        let t = self.get_first_task(p)?;
        let task = *self.sched.get(t);

        if !task.key.1 || task.pack {
            return unexpected("body answers a non-body request");
        }

        let from = self.peer_identity(p);
        if let Some(info) = self.peers.get(p).info {
            self.peer_man.modify_rating(info, Rating::REWARD_BLOCK, true);
        }

        let status = self.feed_block(&task.key.0, &msg.buffer, &from);
        if !self.peers.contains(p) {
            return Ok(());
        }
        self.on_first_task_done_status(p, status)
    }

    fn peer_identity(&self, p: PeerRef) -> PeerId {
        self.peers
            .get(p)
            .info
            .map_or(PeerId::ZERO, |info| self.peer_man.get(info).id)
    }
}
