//! An in-memory multi-CF engine. Snapshots are O(number of CFs): each CF is
//! an `Arc`'d ordered map and the write path copies-on-write, so a snapshot
//! pins the maps it cloned while later batches build new ones.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, Mutex},
};

use kernel::{Error, Result};

use crate::{CfName, Cursor, Engine, Modify, Snapshot, WriteBatch, ALL_CFS};

type CfMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone)]
pub struct MemEngine {
    inner: Arc<Mutex<HashMap<CfName, Arc<CfMap>>>>,
}

impl Default for MemEngine {
    fn default() -> MemEngine {
        MemEngine::new()
    }
}

impl MemEngine {
    pub fn new() -> MemEngine {
        let mut cfs = HashMap::new();
        for cf in ALL_CFS {
            cfs.insert(cf, Arc::new(CfMap::new()));
        }
        MemEngine {
            inner: Arc::new(Mutex::new(cfs)),
        }
    }

    fn cf(cfs: &mut HashMap<CfName, Arc<CfMap>>, cf: CfName) -> Result<&mut Arc<CfMap>> {
        cfs.get_mut(cf)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown column family {}", cf)))
    }
}

impl Engine for MemEngine {
    type Snap = MemSnapshot;

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut cfs = self.inner.lock().unwrap();
        for modify in batch.into_modifies() {
            match modify {
                Modify::Put(cf, key, value) => {
                    let map = Self::cf(&mut cfs, cf)?;
                    Arc::make_mut(map).insert(key, value);
                }
                Modify::Delete(cf, key) => {
                    let map = Self::cf(&mut cfs, cf)?;
                    Arc::make_mut(map).remove(&key);
                }
            }
        }
        Ok(())
    }

    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cfs = self.inner.lock().unwrap();
        Ok(Self::cf(&mut cfs, cf)?.get(key).cloned())
    }

    fn snapshot(&self) -> Result<Self::Snap> {
        let cfs = self.inner.lock().unwrap();
        Ok(MemSnapshot {
            cfs: Arc::new(cfs.clone()),
        })
    }
}

#[derive(Clone)]
pub struct MemSnapshot {
    cfs: Arc<HashMap<CfName, Arc<CfMap>>>,
}

impl MemSnapshot {
    fn cf(&self, cf: CfName) -> Result<&Arc<CfMap>> {
        self.cfs
            .get(cf)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown column family {}", cf)))
    }
}

impl Snapshot for MemSnapshot {
    type Iter = MemCursor;

    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.cf(cf)?.get(key).cloned())
    }

    fn iter(&self, cf: CfName) -> Result<Self::Iter> {
        Ok(MemCursor {
            map: self.cf(cf)?.clone(),
            current: None,
        })
    }
}

pub struct MemCursor {
    map: Arc<CfMap>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl Cursor for MemCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek(&mut self, target: &[u8]) {
        self.current = self
            .map
            .range::<[u8], _>((Bound::Included(target), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
    }

    fn seek_to_first(&mut self) {
        self.current = self.map.iter().next().map(|(k, v)| (k.clone(), v.clone()));
    }

    fn next(&mut self) {
        let cur = self.current.take().expect("cursor is not valid");
        self.current = self
            .map
            .range::<[u8], _>((Bound::Excluded(cur.0.as_slice()), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("cursor is not valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("cursor is not valid").1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CF_DATA, CF_WRITE};

    fn put(engine: &MemEngine, cf: CfName, key: &[u8], value: &[u8]) {
        let mut batch = WriteBatch::default();
        batch.put(cf, key.to_vec(), value.to_vec());
        engine.write(batch).unwrap();
    }

    #[test]
    fn test_point_ops() {
        let engine = MemEngine::new();
        put(&engine, CF_DATA, b"a", b"1");
        assert_eq!(engine.get(CF_DATA, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(CF_WRITE, b"a").unwrap(), None);

        let mut batch = WriteBatch::default();
        batch.delete(CF_DATA, b"a".to_vec());
        engine.write(batch).unwrap();
        assert_eq!(engine.get(CF_DATA, b"a").unwrap(), None);
    }

    #[test]
    fn test_unknown_cf_rejected() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::default();
        batch.put("bogus", b"k".to_vec(), b"v".to_vec());
        assert!(engine.write(batch).is_err());
        assert!(engine.get("bogus", b"k").is_err());
    }

    #[test]
    fn test_snapshot_isolation() {
        let engine = MemEngine::new();
        put(&engine, CF_DATA, b"k", b"old");
        let snap = engine.snapshot().unwrap();
        put(&engine, CF_DATA, b"k", b"new");
        put(&engine, CF_DATA, b"k2", b"x");

        assert_eq!(snap.get(CF_DATA, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(snap.get(CF_DATA, b"k2").unwrap(), None);
        assert_eq!(engine.get(CF_DATA, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_batch_atomic_across_cfs() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::default();
        batch.put(CF_DATA, b"d".to_vec(), b"1".to_vec());
        batch.put(CF_WRITE, b"w".to_vec(), b"2".to_vec());
        engine.write(batch).unwrap();
        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.get(CF_DATA, b"d").unwrap(), Some(b"1".to_vec()));
        assert_eq!(snap.get(CF_WRITE, b"w").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_cursor_walk() {
        let engine = MemEngine::new();
        for (k, v) in [(b"a", b"1"), (b"c", b"3"), (b"e", b"5")] {
            put(&engine, CF_DATA, k, v);
        }
        let snap = engine.snapshot().unwrap();
        let mut cursor = snap.iter(CF_DATA).unwrap();
        assert!(!cursor.valid());

        cursor.seek_to_first();
        let mut seen = vec![];
        while cursor.valid() {
            seen.push((cursor.key().to_vec(), cursor.value().to_vec()));
            cursor.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
                (b"e".to_vec(), b"5".to_vec()),
            ]
        );

        cursor.seek(b"b");
        assert!(cursor.valid());
        assert_eq!(cursor.key(), b"c");
        cursor.seek(b"f");
        assert!(!cursor.valid());
    }
}
