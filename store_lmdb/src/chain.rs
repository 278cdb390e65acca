//! Raw chain KV handed to the processor.
//!
//! The chain processor owns its data layout; the node only provides a
//! durable byte-to-byte table.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env};

use shroud_store::StoreError;

use crate::LmdbError;

#[derive(Clone)]
pub struct LmdbChainKv {
    pub(crate) env: Arc<Env>,
    pub(crate) chain_db: Database<Bytes, Bytes>,
}

impl LmdbChainKv {
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.chain_db
            .put(&mut wtxn, key, value)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        Ok(self
            .chain_db
            .get(&rtxn, key)
            .map_err(LmdbError::from)?
            .map(|v| v.to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.chain_db
            .delete(&mut wtxn, key)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    /// All `(key, value)` pairs whose key starts with `prefix`.
    pub fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self
            .chain_db
            .range(
                &rtxn,
                &(std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded),
            )
            .map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (key, val) = entry.map_err(LmdbError::from)?;
            if !key.starts_with(prefix) {
                break;
            }
            result.push((key.to_vec(), val.to_vec()));
        }
        Ok(result)
    }
}
