//! Node parameter storage trait.
//!
//! A small key-value table for node-level parameters that must survive
//! restarts: the node identity key and the committed macroblock sync
//! target.

use crate::StoreError;
use shroud_types::StateId;

/// Trait for persisting node parameters.
pub trait ParamStore {
    /// Store the node's private identity scalar.
    fn put_my_id(&self, secret: &[u8; 32]) -> Result<(), StoreError>;

    /// Load the node's private identity scalar, if one was ever stored.
    fn get_my_id(&self) -> Result<Option<[u8; 32]>, StoreError>;

    /// Persist the committed sync target so a restarted node resumes the
    /// same macroblock download.
    fn put_sync_target(&self, target: &StateId) -> Result<(), StoreError>;

    /// Load the committed sync target. `None` when no sync is in progress.
    fn get_sync_target(&self) -> Result<Option<StateId>, StoreError>;

    /// Clear the sync target (sync finished or force-resync requested).
    fn clear_sync_target(&self) -> Result<(), StoreError>;
}
