//! Persistent peer table trait.
//!
//! Stores the peer manager's view of the network so the node can
//! reconnect with sensible ratings on restart. The flush is a full
//! rewrite of the table inside one backend transaction.

use crate::StoreError;
use shroud_types::PeerId;

/// One persisted peer row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Packed socket address (ip + port), 0 when unknown.
    pub address: u64,
    /// Raw rating; 0 means banned.
    pub rating: u32,
    /// Unix seconds of the last successful interaction.
    pub last_seen: u64,
}

/// Trait for persisting the peer table across restarts.
pub trait PeerStore {
    /// Replace the entire peer table with `records`, atomically.
    fn replace_all(&self, records: &[PeerRecord]) -> Result<(), StoreError>;

    /// Load every persisted peer row.
    fn load_all(&self) -> Result<Vec<PeerRecord>, StoreError>;
}
