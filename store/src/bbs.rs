//! Bulletin-board message storage trait.

use crate::StoreError;
use shroud_types::MsgKey;

/// One stored bulletin-board message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BbsRecord {
    pub key: MsgKey,
    pub channel: u32,
    pub time_posted: u64,
    pub payload: Vec<u8>,
}

/// Trait for the store-and-forward message table.
///
/// Keys are `H(payload || channel)`; insertion is first-writer-wins.
pub trait BbsStore {
    /// Insert a message. Returns `false` if the key already exists.
    fn insert(&self, record: &BbsRecord) -> Result<bool, StoreError>;

    /// Whether a message with this key is stored.
    fn contains(&self, key: &MsgKey) -> Result<bool, StoreError>;

    /// Fetch a message by key.
    fn get(&self, key: &MsgKey) -> Result<Option<BbsRecord>, StoreError>;

    /// All messages on `channel` posted at or after `time_from`.
    fn enum_channel(&self, channel: u32, time_from: u64) -> Result<Vec<BbsRecord>, StoreError>;

    /// Keys of every stored message (for capability backfill).
    fn enum_keys(&self) -> Result<Vec<MsgKey>, StoreError>;

    /// Message count per populated channel, ascending by channel.
    fn channel_populations(&self) -> Result<Vec<(u32, u32)>, StoreError>;

    /// Delete messages posted before `cutoff`. Returns how many were removed.
    fn delete_older_than(&self, cutoff: u64) -> Result<usize, StoreError>;
}
