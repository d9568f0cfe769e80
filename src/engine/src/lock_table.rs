//! An advisory, in-memory mirror of the lock CF. Read paths consult it to
//! surface lock conflicts without touching storage; writers maintain it when
//! they apply batches. It never blocks a reader: a conflict is returned to
//! the client, who resolves it through check-txn-status + resolve-lock.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::RwLock,
};

use kernel::{Key, LockRecord, TimeStamp};

use crate::error::LockInfo;

#[derive(Default)]
pub struct MemoryLockTable {
    locks: RwLock<BTreeMap<Key, LockRecord>>,
}

impl MemoryLockTable {
    pub fn new() -> MemoryLockTable {
        MemoryLockTable::default()
    }

    pub fn insert(&self, key: Key, lock: LockRecord) {
        self.locks.write().unwrap().insert(key, lock);
    }

    pub fn remove(&self, key: &Key) {
        self.locks.write().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.locks.write().unwrap().clear();
    }

    fn conflict(lock: &LockRecord, ts: TimeStamp, resolved: &[TimeStamp]) -> bool {
        lock.start_ts <= ts && !resolved.contains(&lock.start_ts)
    }

    /// The lock a read at `ts` would trip over on `key`, if any.
    pub fn check_key(
        &self,
        key: &Key,
        ts: TimeStamp,
        resolved_locks: &[TimeStamp],
    ) -> Option<LockInfo> {
        let locks = self.locks.read().unwrap();
        let lock = locks.get(key)?;
        if Self::conflict(lock, ts, resolved_locks) {
            return Some(LockInfo {
                key: key.clone(),
                primary: lock.primary.clone(),
                start_ts: lock.start_ts,
                ttl_ms: lock.ttl_ms,
                kind: lock.kind,
            });
        }
        None
    }

    /// The first conflicting lock in `[start, end)` for a read at `ts`.
    /// An empty `end` means unbounded.
    pub fn check_range(
        &self,
        start: &Key,
        end: &Key,
        ts: TimeStamp,
        resolved_locks: &[TimeStamp],
    ) -> Option<LockInfo> {
        let locks = self.locks.read().unwrap();
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };
        for (key, lock) in locks.range((Bound::Included(start), upper)) {
            if Self::conflict(lock, ts, resolved_locks) {
                return Some(LockInfo {
                    key: key.clone(),
                    primary: lock.primary.clone(),
                    start_ts: lock.start_ts,
                    ttl_ms: lock.ttl_ms,
                    kind: lock.kind,
                });
            }
        }
        None
    }
}
