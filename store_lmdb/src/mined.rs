//! LMDB implementation of MinedStore.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env};

use shroud_store::{MinedEntry, MinedStore, StoreError};
use shroud_types::{BlockHash, StateId};

use crate::LmdbError;

pub struct LmdbMinedStore {
    pub(crate) env: Arc<Env>,
    pub(crate) mined_db: Database<Bytes, Bytes>,
}

// Key: height_be(8) || hash(32). Value: fees_be(8) || active(1).
fn encode_key(id: &StateId) -> [u8; 40] {
    let mut out = [0u8; 40];
    out[..8].copy_from_slice(&id.height.to_be_bytes());
    out[8..].copy_from_slice(id.hash.as_bytes());
    out
}

impl MinedStore for LmdbMinedStore {
    fn insert(&self, id: &StateId, fees: u64) -> Result<(), StoreError> {
        let mut val = [0u8; 9];
        val[..8].copy_from_slice(&fees.to_be_bytes());
        val[8] = 1;

        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.mined_db
            .put(&mut wtxn, &encode_key(id), &val)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn enum_from(&self, height_min: u64, limit: usize) -> Result<Vec<MinedEntry>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let start = encode_key(&StateId::new(height_min, BlockHash::ZERO));
        let iter = self
            .mined_db
            .range(
                &rtxn,
                &(std::ops::Bound::Included(&start[..]), std::ops::Bound::Unbounded),
            )
            .map_err(LmdbError::from)?;

        let mut result = Vec::new();
        for entry in iter {
            let (key, val) = entry.map_err(LmdbError::from)?;
            if key.len() != 40 || val.len() != 9 {
                continue;
            }
            let height = u64::from_be_bytes(key[..8].try_into().expect("8 bytes"));
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key[8..]);
            result.push(MinedEntry {
                id: StateId::new(height, BlockHash::new(hash)),
                fees: u64::from_be_bytes(val[..8].try_into().expect("8 bytes")),
                active: val[8] != 0,
            });
            if result.len() == limit {
                break;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{LmdbEnvironment, DEFAULT_MAP_SIZE};

    #[test]
    fn enum_from_height_and_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = LmdbEnvironment::open(dir.path(), DEFAULT_MAP_SIZE).expect("open");
        let store = env.mined_store();

        for h in 1..=5u64 {
            store
                .insert(&StateId::new(h, BlockHash::new([h as u8; 32])), h * 100)
                .unwrap();
        }

        let entries = store.enum_from(3, 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id.height, 3);
        assert_eq!(entries[0].fees, 300);
        assert!(entries[0].active);

        let capped = store.enum_from(1, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }
}
