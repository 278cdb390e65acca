//! Dummy-UTXO bookkeeping trait.
//!
//! Dummies are node-generated outputs spent back by the dandelion
//! pipeline to equalize input/output counts. Each row maps a blinding
//! scalar to the height at which the dummy becomes spendable again.

use crate::StoreError;

/// Trait for the dummy-UTXO table.
pub trait DummyStore {
    /// Record a dummy created with `blinding`, spendable from `height`.
    fn insert(&self, blinding: &[u8; 32], height: u64) -> Result<(), StoreError>;

    /// The dummy with the lowest spendable height, if any.
    fn pick_lowest(&self) -> Result<Option<([u8; 32], u64)>, StoreError>;

    /// Move a dummy's spendable height forward (spend retry window).
    fn set_height(&self, blinding: &[u8; 32], height: u64) -> Result<(), StoreError>;

    /// Remove a dummy whose output turned out to be spent.
    fn delete(&self, blinding: &[u8; 32]) -> Result<(), StoreError>;

    /// Number of stored dummies.
    fn count(&self) -> Result<usize, StoreError>;
}
