//! Mined-block log trait.
//!
//! Records every block this node mined together with the fees it
//! collected, served to the owner via the mined report.

use crate::StoreError;
use shroud_types::StateId;

/// One mined-log row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinedEntry {
    pub id: StateId,
    pub fees: u64,
    /// Whether the state is still on the active chain.
    pub active: bool,
}

/// Trait for the mined-block log.
pub trait MinedStore {
    /// Append a mined block.
    fn insert(&self, id: &StateId, fees: u64) -> Result<(), StoreError>;

    /// Entries with `height >= height_min`, ascending, at most `limit`.
    fn enum_from(&self, height_min: u64, limit: usize) -> Result<Vec<MinedEntry>, StoreError>;
}
