//! LMDB implementation of PeerStore.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env};

use shroud_store::{PeerRecord, PeerStore, StoreError};
use shroud_types::PeerId;

use crate::LmdbError;

pub struct LmdbPeerStore {
    pub(crate) env: Arc<Env>,
    pub(crate) peers_db: Database<Bytes, Bytes>,
}

// Row layout: address(8) || rating(4) || last_seen(8), all big-endian.
const ROW_LEN: usize = 20;

fn encode_row(r: &PeerRecord) -> [u8; ROW_LEN] {
    let mut out = [0u8; ROW_LEN];
    out[..8].copy_from_slice(&r.address.to_be_bytes());
    out[8..12].copy_from_slice(&r.rating.to_be_bytes());
    out[12..].copy_from_slice(&r.last_seen.to_be_bytes());
    out
}

fn decode_row(id: PeerId, bytes: &[u8]) -> Option<PeerRecord> {
    if bytes.len() != ROW_LEN {
        return None;
    }
    Some(PeerRecord {
        id,
        address: u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes")),
        rating: u32::from_be_bytes(bytes[8..12].try_into().expect("4 bytes")),
        last_seen: u64::from_be_bytes(bytes[12..].try_into().expect("8 bytes")),
    })
}

impl PeerStore for LmdbPeerStore {
    fn replace_all(&self, records: &[PeerRecord]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.peers_db.clear(&mut wtxn).map_err(LmdbError::from)?;
        for r in records {
            self.peers_db
                .put(&mut wtxn, r.id.as_bytes(), &encode_row(r))
                .map_err(LmdbError::from)?;
        }
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.peers_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (key, val) = entry.map_err(LmdbError::from)?;
            if key.len() != 32 {
                continue;
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(key);
            if let Some(record) = decode_row(PeerId::new(id), val) {
                result.push(record);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{LmdbEnvironment, DEFAULT_MAP_SIZE};

    fn record(seed: u8, rating: u32) -> PeerRecord {
        PeerRecord {
            id: PeerId::new([seed; 32]),
            address: 0x7F00_0001_0000_1F90 + seed as u64,
            rating,
            last_seen: 1_700_000_000 + seed as u64,
        }
    }

    #[test]
    fn replace_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = LmdbEnvironment::open(dir.path(), DEFAULT_MAP_SIZE).expect("open");
        let store = env.peer_store();

        let records = vec![record(1, 1024), record(2, 0), record(3, 4096)];
        store.replace_all(&records).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by_key(|r| r.id);
        assert_eq!(loaded, records);
    }

    #[test]
    fn replace_overwrites_previous_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = LmdbEnvironment::open(dir.path(), DEFAULT_MAP_SIZE).expect("open");
        let store = env.peer_store();

        store.replace_all(&[record(1, 10), record(2, 20)]).unwrap();
        store.replace_all(&[record(3, 30)]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, PeerId::new([3u8; 32]));
    }
}
