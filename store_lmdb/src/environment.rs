//! LMDB environment setup.

use std::path::Path;
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::bbs::LmdbBbsStore;
use crate::chain::LmdbChainKv;
use crate::dummy::LmdbDummyStore;
use crate::mined::LmdbMinedStore;
use crate::param::LmdbParamStore;
use crate::peer::LmdbPeerStore;
use crate::LmdbError;

/// Default LMDB map size: 1 GiB.
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;
/// Number of named LMDB databases.
pub const MAX_DBS: u32 = 7;

/// Wraps the LMDB environment and all database handles.
pub struct LmdbEnvironment {
    env: Arc<Env>,

    pub(crate) params_db: Database<Bytes, Bytes>,
    pub(crate) peers_db: Database<Bytes, Bytes>,

    // BBS store: records by key, plus a (channel, time, key) index.
    pub(crate) bbs_db: Database<Bytes, Bytes>,
    pub(crate) bbs_idx_db: Database<Bytes, Bytes>,

    pub(crate) dummies_db: Database<Bytes, Bytes>,
    pub(crate) mined_db: Database<Bytes, Bytes>,

    // Raw KV handed to the chain processor.
    pub(crate) chain_db: Database<Bytes, Bytes>,
}

impl LmdbEnvironment {
    /// Open or create an LMDB environment at the given path.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path)
            .map_err(|e| LmdbError::Heed(format!("failed to create directory: {e}")))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(MAX_DBS)
                .map_size(map_size)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;

        let params_db = env.create_database(&mut wtxn, Some("params"))?;
        let peers_db = env.create_database(&mut wtxn, Some("peers"))?;
        let bbs_db = env.create_database(&mut wtxn, Some("bbs"))?;
        let bbs_idx_db = env.create_database(&mut wtxn, Some("bbs_idx"))?;
        let dummies_db = env.create_database(&mut wtxn, Some("dummies"))?;
        let mined_db = env.create_database(&mut wtxn, Some("mined"))?;
        let chain_db = env.create_database(&mut wtxn, Some("chain"))?;

        wtxn.commit()?;

        Ok(Self {
            env: Arc::new(env),
            params_db,
            peers_db,
            bbs_db,
            bbs_idx_db,
            dummies_db,
            mined_db,
            chain_db,
        })
    }

    /// Get a shared reference to the underlying heed environment.
    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// Create a param store backed by this environment.
    pub fn param_store(&self) -> LmdbParamStore {
        LmdbParamStore {
            env: Arc::clone(&self.env),
            params_db: self.params_db,
        }
    }

    /// Create a peer store backed by this environment.
    pub fn peer_store(&self) -> LmdbPeerStore {
        LmdbPeerStore {
            env: Arc::clone(&self.env),
            peers_db: self.peers_db,
        }
    }

    /// Create a BBS store backed by this environment.
    pub fn bbs_store(&self) -> LmdbBbsStore {
        LmdbBbsStore {
            env: Arc::clone(&self.env),
            bbs_db: self.bbs_db,
            bbs_idx_db: self.bbs_idx_db,
        }
    }

    /// Create a dummy store backed by this environment.
    pub fn dummy_store(&self) -> LmdbDummyStore {
        LmdbDummyStore {
            env: Arc::clone(&self.env),
            dummies_db: self.dummies_db,
        }
    }

    /// Create a mined-log store backed by this environment.
    pub fn mined_store(&self) -> LmdbMinedStore {
        LmdbMinedStore {
            env: Arc::clone(&self.env),
            mined_db: self.mined_db,
        }
    }

    /// Create the raw chain KV handed to the processor.
    pub fn chain_kv(&self) -> LmdbChainKv {
        LmdbChainKv {
            env: Arc::clone(&self.env),
            chain_db: self.chain_db,
        }
    }

    /// Force an `fsync` of the LMDB memory-mapped file to disk.
    ///
    /// LMDB ensures durability on every write-transaction commit; this is
    /// called once more during graceful shutdown.
    pub fn force_sync(&self) -> Result<(), LmdbError> {
        let wtxn = self.env.write_txn()?;
        wtxn.commit()?;
        Ok(())
    }
}
