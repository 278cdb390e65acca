//! LMDB implementation of ParamStore.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env};

use shroud_store::{ParamStore, StoreError};
use shroud_types::{BlockHash, StateId};

use crate::LmdbError;

const KEY_MY_ID: &[u8] = b"my_id";
const KEY_SYNC_TARGET: &[u8] = b"sync_target";

pub struct LmdbParamStore {
    pub(crate) env: Arc<Env>,
    pub(crate) params_db: Database<Bytes, Bytes>,
}

impl LmdbParamStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.params_db
            .put(&mut wtxn, key, value)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let val = self
            .params_db
            .get(&rtxn, key)
            .map_err(LmdbError::from)?
            .map(|v| v.to_vec());
        Ok(val)
    }
}

impl ParamStore for LmdbParamStore {
    fn put_my_id(&self, secret: &[u8; 32]) -> Result<(), StoreError> {
        self.put(KEY_MY_ID, secret)
    }

    fn get_my_id(&self) -> Result<Option<[u8; 32]>, StoreError> {
        match self.get(KEY_MY_ID)? {
            Some(bytes) if bytes.len() == 32 => {
                let arr: [u8; 32] = bytes.try_into().expect("checked length");
                Ok(Some(arr))
            }
            Some(_) => Err(StoreError::Corruption("my_id has wrong length".into())),
            None => Ok(None),
        }
    }

    fn put_sync_target(&self, target: &StateId) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(40);
        buf.extend_from_slice(&target.height.to_be_bytes());
        buf.extend_from_slice(target.hash.as_bytes());
        self.put(KEY_SYNC_TARGET, &buf)
    }

    fn get_sync_target(&self) -> Result<Option<StateId>, StoreError> {
        match self.get(KEY_SYNC_TARGET)? {
            Some(bytes) if bytes.len() == 40 => {
                let height = u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"));
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes[8..]);
                Ok(Some(StateId::new(height, BlockHash::new(hash))))
            }
            Some(_) => Err(StoreError::Corruption("sync_target has wrong length".into())),
            None => Ok(None),
        }
    }

    fn clear_sync_target(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.params_db
            .delete(&mut wtxn, KEY_SYNC_TARGET)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }
}
