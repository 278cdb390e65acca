//! LMDB implementation of DummyStore.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env};

use shroud_store::{DummyStore, StoreError};

use crate::LmdbError;

pub struct LmdbDummyStore {
    pub(crate) env: Arc<Env>,
    pub(crate) dummies_db: Database<Bytes, Bytes>,
}

impl DummyStore for LmdbDummyStore {
    fn insert(&self, blinding: &[u8; 32], height: u64) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.dummies_db
            .put(&mut wtxn, blinding, &height.to_be_bytes())
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn pick_lowest(&self) -> Result<Option<([u8; 32], u64)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.dummies_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut best: Option<([u8; 32], u64)> = None;
        for entry in iter {
            let (key, val) = entry.map_err(LmdbError::from)?;
            if key.len() != 32 || val.len() != 8 {
                continue;
            }
            let height = u64::from_be_bytes(val.try_into().expect("checked length"));
            if best.map_or(true, |(_, h)| height < h) {
                let mut blinding = [0u8; 32];
                blinding.copy_from_slice(key);
                best = Some((blinding, height));
            }
        }
        Ok(best)
    }

    fn set_height(&self, blinding: &[u8; 32], height: u64) -> Result<(), StoreError> {
        self.insert(blinding, height)
    }

    fn delete(&self, blinding: &[u8; 32]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.dummies_db
            .delete(&mut wtxn, blinding)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let len = self.dummies_db.len(&rtxn).map_err(LmdbError::from)?;
        Ok(len as usize)
    }
}
