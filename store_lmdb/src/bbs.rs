//! LMDB implementation of BbsStore.
//!
//! Two databases: `bbs` maps message key -> record, `bbs_idx` is a
//! `(channel_be, time_be, key)` index enabling channel enumeration in
//! time order and cheap population counting.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env};

use shroud_store::{BbsRecord, BbsStore, StoreError};
use shroud_types::MsgKey;

use crate::LmdbError;

pub struct LmdbBbsStore {
    pub(crate) env: Arc<Env>,
    pub(crate) bbs_db: Database<Bytes, Bytes>,
    pub(crate) bbs_idx_db: Database<Bytes, Bytes>,
}

fn idx_key(channel: u32, time_posted: u64, key: &MsgKey) -> [u8; 44] {
    let mut out = [0u8; 44];
    out[..4].copy_from_slice(&channel.to_be_bytes());
    out[4..12].copy_from_slice(&time_posted.to_be_bytes());
    out[12..].copy_from_slice(key.as_bytes());
    out
}

fn encode_record(r: &BbsRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + r.payload.len());
    out.extend_from_slice(&r.channel.to_be_bytes());
    out.extend_from_slice(&r.time_posted.to_be_bytes());
    out.extend_from_slice(&r.payload);
    out
}

fn decode_record(key: MsgKey, bytes: &[u8]) -> Option<BbsRecord> {
    if bytes.len() < 12 {
        return None;
    }
    Some(BbsRecord {
        key,
        channel: u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes")),
        time_posted: u64::from_be_bytes(bytes[4..12].try_into().expect("8 bytes")),
        payload: bytes[12..].to_vec(),
    })
}

impl BbsStore for LmdbBbsStore {
    fn insert(&self, record: &BbsRecord) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        if self
            .bbs_db
            .get(&wtxn, record.key.as_bytes())
            .map_err(LmdbError::from)?
            .is_some()
        {
            return Ok(false);
        }
        self.bbs_db
            .put(&mut wtxn, record.key.as_bytes(), &encode_record(record))
            .map_err(LmdbError::from)?;
        self.bbs_idx_db
            .put(
                &mut wtxn,
                &idx_key(record.channel, record.time_posted, &record.key),
                &[],
            )
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(true)
    }

    fn contains(&self, key: &MsgKey) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        Ok(self
            .bbs_db
            .get(&rtxn, key.as_bytes())
            .map_err(LmdbError::from)?
            .is_some())
    }

    fn get(&self, key: &MsgKey) -> Result<Option<BbsRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let val = self
            .bbs_db
            .get(&rtxn, key.as_bytes())
            .map_err(LmdbError::from)?;
        Ok(val.and_then(|v| decode_record(*key, v)))
    }

    fn enum_channel(&self, channel: u32, time_from: u64) -> Result<Vec<BbsRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let start = idx_key(channel, time_from, &MsgKey::new([0u8; 32]));
        let iter = self
            .bbs_idx_db
            .range(
                &rtxn,
                &(std::ops::Bound::Included(&start[..]), std::ops::Bound::Unbounded),
            )
            .map_err(LmdbError::from)?;

        let mut result = Vec::new();
        for entry in iter {
            let (ikey, _) = entry.map_err(LmdbError::from)?;
            if ikey.len() != 44 || ikey[..4] != channel.to_be_bytes() {
                break;
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&ikey[12..]);
            let key = MsgKey::new(key);
            if let Some(v) = self.bbs_db.get(&rtxn, key.as_bytes()).map_err(LmdbError::from)? {
                if let Some(record) = decode_record(key, v) {
                    result.push(record);
                }
            }
        }
        Ok(result)
    }

    fn enum_keys(&self) -> Result<Vec<MsgKey>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.bbs_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (key, _) = entry.map_err(LmdbError::from)?;
            if key.len() == 32 {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(key);
                result.push(MsgKey::new(arr));
            }
        }
        Ok(result)
    }

    fn channel_populations(&self) -> Result<Vec<(u32, u32)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.bbs_idx_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result: Vec<(u32, u32)> = Vec::new();
        for entry in iter {
            let (ikey, _) = entry.map_err(LmdbError::from)?;
            if ikey.len() != 44 {
                continue;
            }
            let channel = u32::from_be_bytes(ikey[..4].try_into().expect("4 bytes"));
            match result.last_mut() {
                Some((ch, count)) if *ch == channel => *count += 1,
                _ => result.push((channel, 1)),
            }
        }
        Ok(result)
    }

    fn delete_older_than(&self, cutoff: u64) -> Result<usize, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.bbs_idx_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut stale = Vec::new();
        for entry in iter {
            let (ikey, _) = entry.map_err(LmdbError::from)?;
            if ikey.len() != 44 {
                continue;
            }
            let time_posted = u64::from_be_bytes(ikey[4..12].try_into().expect("8 bytes"));
            if time_posted < cutoff {
                stale.push(ikey.to_vec());
            }
        }
        drop(rtxn);

        let count = stale.len();
        if !stale.is_empty() {
            let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
            for ikey in &stale {
                self.bbs_idx_db
                    .delete(&mut wtxn, ikey)
                    .map_err(LmdbError::from)?;
                self.bbs_db
                    .delete(&mut wtxn, &ikey[12..])
                    .map_err(LmdbError::from)?;
            }
            wtxn.commit().map_err(LmdbError::from)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{LmdbEnvironment, DEFAULT_MAP_SIZE};

    fn record(channel: u32, time_posted: u64, payload: &[u8]) -> BbsRecord {
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(&channel.to_be_bytes());
        key[4..12].copy_from_slice(&time_posted.to_be_bytes());
        key[12] = payload.first().copied().unwrap_or(0);
        BbsRecord {
            key: MsgKey::new(key),
            channel,
            time_posted,
            payload: payload.to_vec(),
        }
    }

    fn open_store() -> (tempfile::TempDir, LmdbBbsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = LmdbEnvironment::open(dir.path(), DEFAULT_MAP_SIZE).expect("open");
        let store = env.bbs_store();
        (dir, store)
    }

    #[test]
    fn insert_is_first_writer_wins() {
        let (_dir, store) = open_store();
        let r = record(1, 100, b"hello");
        assert!(store.insert(&r).unwrap());
        assert!(!store.insert(&r).unwrap());
        assert!(store.contains(&r.key).unwrap());
    }

    #[test]
    fn enum_channel_respects_time_from() {
        let (_dir, store) = open_store();
        store.insert(&record(5, 100, b"old")).unwrap();
        store.insert(&record(5, 200, b"new")).unwrap();
        store.insert(&record(6, 300, b"other channel")).unwrap();

        let msgs = store.enum_channel(5, 150).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"new");
    }

    #[test]
    fn populations_count_per_channel() {
        let (_dir, store) = open_store();
        store.insert(&record(1, 10, b"a")).unwrap();
        store.insert(&record(1, 20, b"b")).unwrap();
        store.insert(&record(3, 30, b"c")).unwrap();

        assert_eq!(store.channel_populations().unwrap(), vec![(1, 2), (3, 1)]);
    }

    #[test]
    fn delete_older_than_removes_record_and_index() {
        let (_dir, store) = open_store();
        store.insert(&record(1, 10, b"stale")).unwrap();
        store.insert(&record(1, 500, b"fresh")).unwrap();

        assert_eq!(store.delete_older_than(100).unwrap(), 1);
        assert_eq!(store.channel_populations().unwrap(), vec![(1, 1)]);
        assert_eq!(store.enum_keys().unwrap().len(), 1);
    }
}
