//! Peer database: ratings, bans, activation policy, persistence.
//!
//! Every peer the node has ever heard of gets a [`PeerInfo`] row, indexed
//! by id, by claimed address, and by rating (an ordered multiset, for
//! "top N" selection). A live session holds a back-reference into this
//! table once authenticated.

use std::collections::{BTreeSet, HashMap};

use shroud_store::PeerRecord;
use shroud_types::PeerId;

/// Index of the live session attached to a peer entry. Opaque to this
/// crate; the node's session arena defines its meaning.
pub type SessionRef = u32;

/// Stable handle into the peer table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InfoRef(pub u32);

/// Rating constants. Zero is reserved for "banned" and is sticky.
pub struct Rating;

impl Rating {
    pub const INITIAL: u32 = 1024;
    pub const MAX: u32 = 10 * 1024;
    pub const REWARD_HEADER: u32 = 64;
    pub const REWARD_BLOCK: u32 = 512;
    pub const PENALTY_TIMEOUT: u32 = 256;
    pub const PENALTY_REMOTE_ERR: u32 = 128;
}

/// One row of the peer table.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Packed ip:port (see [`crate::addr`]); 0 = unknown.
    pub address: u64,
    /// Raw rating; 0 = banned.
    pub raw_rating: u32,
    /// Unix seconds of the last successful interaction.
    pub last_seen: u64,
    /// The live session currently attached, if any.
    pub live: Option<SessionRef>,
    /// Whether the activation policy currently wants this peer connected.
    pub active: bool,
}

/// Central registry of known peers.
pub struct PeerManager {
    slots: Vec<Option<PeerInfo>>,
    free: Vec<u32>,
    by_id: HashMap<PeerId, InfoRef>,
    by_addr: HashMap<u64, InfoRef>,
    /// `(rating, slot)` pairs, ascending. Kept in lockstep with `slots`.
    by_rating: BTreeSet<(u32, u32)>,
    desired_active: usize,
}

impl PeerManager {
    pub fn new(desired_active: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            by_rating: BTreeSet::new(),
            desired_active,
        }
    }

    pub fn get(&self, r: InfoRef) -> &PeerInfo {
        self.slots[r.0 as usize].as_ref().expect("stale InfoRef")
    }

    fn get_mut(&mut self, r: InfoRef) -> &mut PeerInfo {
        self.slots[r.0 as usize].as_mut().expect("stale InfoRef")
    }

    pub fn find(&self, id: &PeerId) -> Option<InfoRef> {
        self.by_id.get(id).copied()
    }

    /// Number of rows in the table.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc(&mut self, info: PeerInfo) -> InfoRef {
        let rating = info.raw_rating;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(info);
                slot
            }
            None => {
                self.slots.push(Some(info));
                (self.slots.len() - 1) as u32
            }
        };
        self.by_rating.insert((rating, slot));
        InfoRef(slot)
    }

    /// Merge-or-create a peer entry.
    ///
    /// - Known non-anonymous id: updates the address when `addr_valid` and
    ///   different; if another entry already claimed that address, the old
    ///   holder's address is cleared (it turned out to be wrong).
    /// - Anonymous id (`PeerId::ZERO`): keyed by address only.
    pub fn on_peer(&mut self, id: PeerId, addr: u64, addr_valid: bool) -> InfoRef {
        if !id.is_zero() {
            if let Some(r) = self.by_id.get(&id).copied() {
                if addr_valid && addr != 0 && self.get(r).address != addr {
                    self.claim_addr(r, addr);
                }
                return r;
            }
        } else if let Some(r) = self.by_addr.get(&addr).copied() {
            return r;
        }

        let r = self.alloc(PeerInfo {
            id,
            address: 0,
            raw_rating: Rating::INITIAL,
            last_seen: 0,
            live: None,
            active: false,
        });
        if !id.is_zero() {
            self.by_id.insert(id, r);
        }
        if addr_valid && addr != 0 {
            self.claim_addr(r, addr);
        }
        tracing::debug!(peer = %id, addr, "new peer entry");
        r
    }

    /// Point `addr` at `r`, clearing it from any previous holder.
    fn claim_addr(&mut self, r: InfoRef, addr: u64) {
        if let Some(old) = self.by_addr.insert(addr, r) {
            if old != r {
                self.get_mut(old).address = 0;
            }
        }
        let prev = self.get(r).address;
        if prev != 0 && prev != addr {
            self.by_addr.remove(&prev);
        }
        self.get_mut(r).address = addr;
    }

    /// Forget a peer's address (it turned out to be wrong).
    pub fn remove_addr(&mut self, r: InfoRef) {
        let prev = self.get(r).address;
        if prev != 0 {
            self.by_addr.remove(&prev);
            self.get_mut(r).address = 0;
        }
    }

    /// Remove an entry entirely (anonymous infos whose session died).
    pub fn delete(&mut self, r: InfoRef) {
        let info = self.slots[r.0 as usize].take().expect("stale InfoRef");
        self.by_rating.remove(&(info.raw_rating, r.0));
        if !info.id.is_zero() {
            self.by_id.remove(&info.id);
        }
        if info.address != 0 {
            self.by_addr.remove(&info.address);
        }
        self.free.push(r.0);
    }

    fn set_rating(&mut self, r: InfoRef, rating: u32) {
        let old = self.get(r).raw_rating;
        if old == rating {
            return;
        }
        self.by_rating.remove(&(old, r.0));
        self.by_rating.insert((rating, r.0));
        self.get_mut(r).raw_rating = rating;
    }

    /// Adjust a rating up or down. Saturates at [`Rating::MAX`]; penalties
    /// floor at 1; only [`PeerManager::ban`] reaches 0, and 0 is sticky.
    pub fn modify_rating(&mut self, r: InfoRef, delta: u32, up: bool) {
        let old = self.get(r).raw_rating;
        if old == 0 {
            return;
        }
        let new = if up {
            old.saturating_add(delta).min(Rating::MAX)
        } else {
            old.saturating_sub(delta).max(1)
        };
        self.set_rating(r, new);
    }

    /// Ban: rating drops to 0 and stays there.
    pub fn ban(&mut self, r: InfoRef) {
        let id = self.get(r).id;
        tracing::warn!(peer = %id, "peer banned");
        self.set_rating(r, 0);
    }

    pub fn is_banned(&self, r: InfoRef) -> bool {
        self.get(r).raw_rating == 0
    }

    /// A disconnected peer misbehaved; severe errors ban outright.
    pub fn on_remote_error(&mut self, r: InfoRef, severe: bool) {
        if severe {
            self.ban(r);
        } else {
            self.modify_rating(r, Rating::PENALTY_REMOTE_ERR, false);
        }
    }

    pub fn on_seen(&mut self, r: InfoRef, now: u64) {
        self.get_mut(r).last_seen = now;
    }

    pub fn on_active(&mut self, r: InfoRef, active: bool) {
        self.get_mut(r).active = active;
    }

    pub fn attach_live(&mut self, r: InfoRef, session: SessionRef) {
        self.get_mut(r).live = Some(session);
    }

    pub fn detach_live(&mut self, r: InfoRef) {
        self.get_mut(r).live = None;
    }

    /// The `n` best-rated, non-banned peers, descending.
    pub fn top_rated(&self, n: usize) -> Vec<InfoRef> {
        self.by_rating
            .iter()
            .rev()
            .filter(|(rating, _)| *rating > 0)
            .take(n)
            .map(|&(_, slot)| InfoRef(slot))
            .collect()
    }

    /// Peers the activation policy wants connected now: the best-rated
    /// inactive entries with a known address, up to the configured quorum
    /// minus those already active.
    pub fn pick_activation(&self) -> Vec<InfoRef> {
        let active = self
            .slots
            .iter()
            .flatten()
            .filter(|info| info.active)
            .count();
        let want = self.desired_active.saturating_sub(active);

        self.by_rating
            .iter()
            .rev()
            .filter(|(rating, _)| *rating > 0)
            .map(|&(_, slot)| InfoRef(slot))
            .filter(|&r| {
                let info = self.get(r);
                !info.active && info.live.is_none() && info.address != 0
            })
            .take(want)
            .collect()
    }

    /// Snapshot for the periodic table flush. Anonymous entries are not
    /// persisted.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.slots
            .iter()
            .flatten()
            .filter(|info| !info.id.is_zero())
            .map(|info| PeerRecord {
                id: info.id,
                address: info.address,
                rating: info.raw_rating,
                last_seen: info.last_seen,
            })
            .collect()
    }

    /// Rebuild entries from a persisted table, skipping our own id.
    pub fn load(&mut self, records: &[PeerRecord], my_id: &PeerId) {
        for record in records {
            if record.id == *my_id {
                continue;
            }
            let r = self.on_peer(record.id, record.address, record.address != 0);
            if record.rating == 0 {
                self.set_rating(r, 0);
            } else {
                self.set_rating(r, record.rating.min(Rating::MAX));
            }
            self.get_mut(r).last_seen = record.last_seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> PeerId {
        PeerId::new([seed; 32])
    }

    #[test]
    fn on_peer_creates_then_merges() {
        let mut pm = PeerManager::new(4);
        let a = pm.on_peer(id(1), 100, true);
        let b = pm.on_peer(id(1), 100, true);
        assert_eq!(a, b);
        assert_eq!(pm.len(), 1);
        assert_eq!(pm.get(a).raw_rating, Rating::INITIAL);
    }

    #[test]
    fn address_update_steals_from_old_holder() {
        let mut pm = PeerManager::new(4);
        let a = pm.on_peer(id(1), 100, true);
        let b = pm.on_peer(id(2), 200, true);

        // Peer 2 shows up claiming peer 1's address.
        let b2 = pm.on_peer(id(2), 100, true);
        assert_eq!(b, b2);
        assert_eq!(pm.get(b).address, 100);
        assert_eq!(pm.get(a).address, 0);
    }

    #[test]
    fn anonymous_entries_key_by_address() {
        let mut pm = PeerManager::new(4);
        let a = pm.on_peer(PeerId::ZERO, 300, true);
        let b = pm.on_peer(PeerId::ZERO, 300, true);
        assert_eq!(a, b);
        let c = pm.on_peer(PeerId::ZERO, 301, true);
        assert_ne!(a, c);
    }

    #[test]
    fn rating_saturates_and_floors() {
        let mut pm = PeerManager::new(4);
        let r = pm.on_peer(id(1), 0, false);

        for _ in 0..1000 {
            pm.modify_rating(r, Rating::REWARD_BLOCK, true);
        }
        assert_eq!(pm.get(r).raw_rating, Rating::MAX);

        for _ in 0..1000 {
            pm.modify_rating(r, Rating::PENALTY_TIMEOUT, false);
        }
        assert_eq!(pm.get(r).raw_rating, 1);
        assert!(!pm.is_banned(r));
    }

    #[test]
    fn ban_is_sticky() {
        let mut pm = PeerManager::new(4);
        let r = pm.on_peer(id(1), 0, false);
        pm.ban(r);
        assert!(pm.is_banned(r));

        pm.modify_rating(r, Rating::REWARD_BLOCK, true);
        assert!(pm.is_banned(r));
        pm.modify_rating(r, Rating::PENALTY_TIMEOUT, false);
        assert!(pm.is_banned(r));
    }

    #[test]
    fn top_rated_orders_descending_and_skips_banned() {
        let mut pm = PeerManager::new(4);
        let a = pm.on_peer(id(1), 0, false);
        let b = pm.on_peer(id(2), 0, false);
        let c = pm.on_peer(id(3), 0, false);

        pm.modify_rating(a, 100, true);
        pm.modify_rating(b, 500, true);
        pm.ban(c);

        let top = pm.top_rated(10);
        assert_eq!(top, vec![b, a]);
    }

    #[test]
    fn activation_respects_quorum_and_eligibility() {
        let mut pm = PeerManager::new(2);
        let a = pm.on_peer(id(1), 100, true);
        let b = pm.on_peer(id(2), 200, true);
        let _no_addr = pm.on_peer(id(3), 0, false);
        let banned = pm.on_peer(id(4), 400, true);
        pm.ban(banned);
        pm.modify_rating(b, 500, true);

        let picks = pm.pick_activation();
        assert_eq!(picks, vec![b, a]);

        pm.on_active(b, true);
        let picks = pm.pick_activation();
        assert_eq!(picks, vec![a]);
    }

    #[test]
    fn snapshot_load_roundtrip() {
        let mut pm = PeerManager::new(4);
        let a = pm.on_peer(id(1), 100, true);
        pm.modify_rating(a, 64, true);
        pm.on_seen(a, 12345);
        let banned = pm.on_peer(id(2), 200, true);
        pm.ban(banned);
        pm.on_peer(PeerId::ZERO, 300, true); // anonymous, not persisted

        let records = pm.snapshot();
        assert_eq!(records.len(), 2);

        let mut pm2 = PeerManager::new(4);
        pm2.load(&records, &id(9));
        let a2 = pm2.find(&id(1)).unwrap();
        assert_eq!(pm2.get(a2).raw_rating, Rating::INITIAL + 64);
        assert_eq!(pm2.get(a2).last_seen, 12345);
        let b2 = pm2.find(&id(2)).unwrap();
        assert!(pm2.is_banned(b2));
    }

    #[test]
    fn load_skips_own_id() {
        let mut pm = PeerManager::new(4);
        let records = vec![PeerRecord {
            id: id(7),
            address: 700,
            rating: 2048,
            last_seen: 1,
        }];
        pm.load(&records, &id(7));
        assert!(pm.find(&id(7)).is_none());
    }

    #[test]
    fn delete_clears_all_indexes() {
        let mut pm = PeerManager::new(4);
        let r = pm.on_peer(id(1), 100, true);
        pm.delete(r);
        assert!(pm.find(&id(1)).is_none());
        assert_eq!(pm.len(), 0);
        assert!(pm.top_rated(10).is_empty());

        // The slot is reusable afterwards.
        let r2 = pm.on_peer(id(2), 100, true);
        assert_eq!(pm.get(r2).id, id(2));
    }
}
