/// RocksDB-backed datastore with an explicit transaction handle.
///
/// Tables are key prefixes and values are JSON documents. A `Transaction` buffers its
/// writes in an overlay (so reads observe the transaction's own writes) and applies them
/// atomically through a `WriteBatch` on `commit`. Dropping a transaction without
/// committing discards its writes.
use log::{debug, trace};
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::error::{BlobberError, Result};

const SEQUENCE_PREFIX: &str = "sequence:";

pub struct Database {
    pub inner: Arc<DB>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        debug!("Opened database at {}", path.as_ref().display());
        Ok(Self {
            inner: Arc::new(db),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a new unit of work. The handle must not be shared across tasks.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            db: self,
            writes: BTreeMap::new(),
        }
    }

    /// Hands out the next value of a per-table sequence.
    ///
    /// Sequences are persisted immediately and outside any transaction, so a rolled back
    /// transaction leaves a gap. Gaps are harmless: sequences only order rows.
    pub fn next_sequence(&self, table: &str) -> Result<u64> {
        let mut sequences = self.sequences.lock();
        let key = format!("{}{}", SEQUENCE_PREFIX, table);
        let current = match sequences.get(table) {
            Some(value) => *value,
            None => match self.inner.get(key.as_bytes())? {
                Some(raw) => serde_json::from_slice(&raw)?,
                None => 0,
            },
        };
        let next = current + 1;
        self.inner.put(key.as_bytes(), serde_json::to_vec(&next)?)?;
        sequences.insert(table.to_string(), next);
        trace!("Sequence {} advanced to {}", table, next);
        Ok(next)
    }
}

/// Buffered unit of work against the `Database`.
pub struct Transaction<'a> {
    db: &'a Database,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Transaction<'a> {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = match self.writes.get(key.as_bytes()) {
            Some(Some(value)) => Some(value.clone()),
            Some(None) => None,
            None => self.db.inner.get(key.as_bytes())?,
        };
        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(BlobberError::from))
            .transpose()
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(match self.writes.get(key.as_bytes()) {
            Some(value) => value.is_some(),
            None => self.db.inner.get_pinned(key.as_bytes())?.is_some(),
        })
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.writes.insert(key.as_bytes().to_vec(), Some(bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.writes.insert(key.as_bytes().to_vec(), None);
    }

    /// Returns every `(key, value)` under `prefix` in ascending key order, merging the
    /// transaction's pending writes over the committed state.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let iter = self
            .db
            .inner
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, value) in self
            .writes
            .range(prefix.as_bytes().to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix.as_bytes()))
        {
            match value {
                Some(bytes) => {
                    merged.insert(key.clone(), bytes.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged
            .into_iter()
            .map(|(key, value)| {
                let key = String::from_utf8(key)
                    .map_err(|e| BlobberError::Internal(format!("non utf-8 key: {}", e)))?;
                Ok((key, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    pub fn next_sequence(&self, table: &str) -> Result<u64> {
        self.db.next_sequence(table)
    }

    pub fn commit(self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        let count = self.writes.len();
        for (key, value) in self.writes {
            match value {
                Some(bytes) => batch.put(key, bytes),
                None => batch.delete(key),
            }
        }
        self.db.inner.write(batch)?;
        trace!("Committed transaction with {} writes", count);
        Ok(())
    }

    /// Discards all buffered writes.
    pub fn rollback(self) {
        trace!("Rolled back transaction with {} writes", self.writes.len());
    }
}

#[cfg(test)]
pub(crate) fn test_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(dir.path().join("db")).expect("open db");
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_your_writes_and_commit() {
        let (_dir, db) = test_database();
        let mut tx = db.begin();
        tx.put("item:a", &1u32).unwrap();
        assert_eq!(tx.get::<u32>("item:a").unwrap(), Some(1));
        assert_eq!(db.begin().get::<u32>("item:a").unwrap(), None);
        tx.commit().unwrap();
        assert_eq!(db.begin().get::<u32>("item:a").unwrap(), Some(1));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (_dir, db) = test_database();
        let mut tx = db.begin();
        tx.put("item:a", &"x").unwrap();
        tx.rollback();
        assert!(!db.begin().exists("item:a").unwrap());
    }

    #[test]
    fn test_scan_prefix_merges_overlay() {
        let (_dir, db) = test_database();
        let mut tx = db.begin();
        tx.put("item:1", &1u32).unwrap();
        tx.put("item:2", &2u32).unwrap();
        tx.put("other:1", &9u32).unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin();
        tx.delete("item:1");
        tx.put("item:3", &3u32).unwrap();
        let rows: Vec<u32> = tx
            .scan_prefix::<u32>("item:")
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(rows, vec![2, 3]);
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::new(dir.path()).unwrap();
            assert_eq!(db.next_sequence("challenges").unwrap(), 1);
            assert_eq!(db.next_sequence("challenges").unwrap(), 2);
            assert_eq!(db.next_sequence("write_markers").unwrap(), 1);
        }
        let db = Database::new(dir.path()).unwrap();
        assert_eq!(db.next_sequence("challenges").unwrap(), 3);
    }
}
