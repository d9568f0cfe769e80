use kernel::{keys::decode_ts_key, Key, LockRecord, TimeStamp, WriteKind, WriteRecord};
use storage::{Cursor, Snapshot, CF_DATA, CF_LOCK, CF_WRITE};

use crate::error::{Error, LockInfo, Result};

/// Read-side MVCC access over one snapshot. The write cursor is created
/// lazily and reused across calls, so sequential key lookups stay cheap.
pub struct MvccReader<S: Snapshot> {
    snapshot: S,
    write_cursor: Option<S::Iter>,
}

impl<S: Snapshot> MvccReader<S> {
    pub fn new(snapshot: S) -> MvccReader<S> {
        MvccReader {
            snapshot,
            write_cursor: None,
        }
    }

    pub fn snapshot(&self) -> &S {
        &self.snapshot
    }

    pub fn load_lock(&self, key: &Key) -> Result<Option<LockRecord>> {
        match self.snapshot.get(CF_LOCK, &key.encode_lock())? {
            Some(raw) => Ok(Some(LockRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Raises `KeyIsLocked` when an in-flight lock of any kind hides `key`
    /// from a read at `ts`. Locks named in `resolved_locks` were already
    /// settled by the client and are skipped.
    pub fn check_lock(&self, key: &Key, ts: TimeStamp, resolved_locks: &[TimeStamp]) -> Result<()> {
        if let Some(lock) = self.load_lock(key)? {
            if lock.start_ts <= ts && !resolved_locks.contains(&lock.start_ts) {
                return Err(Error::KeyIsLocked(LockInfo {
                    key: key.clone(),
                    primary: lock.primary.clone(),
                    start_ts: lock.start_ts,
                    ttl_ms: lock.ttl_ms,
                    kind: lock.kind,
                }));
            }
        }
        Ok(())
    }

    fn write_cursor(&mut self) -> Result<&mut S::Iter> {
        if self.write_cursor.is_none() {
            self.write_cursor = Some(self.snapshot.iter(CF_WRITE)?);
        }
        Ok(self.write_cursor.as_mut().unwrap())
    }

    /// The newest commit record of `key` with `commit_ts <= ts`.
    pub fn seek_write(
        &mut self,
        key: &Key,
        ts: TimeStamp,
    ) -> Result<Option<(TimeStamp, WriteRecord)>> {
        let cursor = self.write_cursor()?;
        cursor.seek(&key.encode_write(ts));
        if !cursor.valid() {
            return Ok(None);
        }
        let (found_key, commit_ts) = decode_ts_key(cursor.key())?;
        if &found_key != key {
            return Ok(None);
        }
        let write = WriteRecord::decode(cursor.value())?;
        Ok(Some((commit_ts, write)))
    }

    /// The newest commit record of `key` at any timestamp.
    pub fn latest_write(&mut self, key: &Key) -> Result<Option<(TimeStamp, WriteRecord)>> {
        self.seek_write(key, TimeStamp::max())
    }

    /// Walks `key`'s commit history looking for the record written by the
    /// transaction that started at `start_ts`. A commit has
    /// `commit_ts > start_ts`; a rollback sits at exactly `start_ts`, so the
    /// walk stops once commit timestamps drop below `start_ts`.
    pub fn get_txn_commit_record(
        &mut self,
        key: &Key,
        start_ts: TimeStamp,
    ) -> Result<Option<(TimeStamp, WriteRecord)>> {
        let mut seek_ts = TimeStamp::max();
        while let Some((commit_ts, write)) = self.seek_write(key, seek_ts)? {
            if commit_ts < start_ts {
                break;
            }
            if write.start_ts == start_ts {
                return Ok(Some((commit_ts, write)));
            }
            if commit_ts.is_zero() {
                break;
            }
            seek_ts = commit_ts.prev();
        }
        Ok(None)
    }

    fn load_data(&self, key: &Key, start_ts: TimeStamp) -> Result<Vec<u8>> {
        match self.snapshot.get(CF_DATA, &key.encode_data(start_ts))? {
            Some(value) => Ok(value),
            None => Err(Error::Corruption(format!(
                "data record of key {} at {} referenced by a commit is gone",
                key, start_ts
            ))),
        }
    }

    fn value_of(&self, key: &Key, write: &WriteRecord) -> Result<Vec<u8>> {
        match &write.short_value {
            Some(value) => Ok(value.clone()),
            None => self.load_data(key, write.start_ts),
        }
    }

    /// The value visible at `ts`, ignoring locks. Lock conflicts are the
    /// caller's business via `check_lock` or the memory lock table.
    pub fn get(&mut self, key: &Key, ts: TimeStamp) -> Result<Option<Vec<u8>>> {
        let mut seek_ts = ts;
        while let Some((commit_ts, write)) = self.seek_write(key, seek_ts)? {
            match write.kind {
                WriteKind::Put => return Ok(Some(self.value_of(key, &write)?)),
                WriteKind::Delete => return Ok(None),
                WriteKind::Rollback | WriteKind::Lock => {
                    if commit_ts.is_zero() {
                        break;
                    }
                    seek_ts = commit_ts.prev();
                }
            }
        }
        Ok(None)
    }

    /// Forward scan of visible values in `[start, end)` at `ts`. Returns up
    /// to `limit` pairs plus the key to resume from, if the range was not
    /// exhausted.
    #[allow(clippy::type_complexity)]
    pub fn scan(
        &mut self,
        start: &Key,
        end: &Key,
        ts: TimeStamp,
        limit: usize,
        resolved_locks: &[TimeStamp],
    ) -> Result<(Vec<(Key, Vec<u8>)>, Option<Key>)> {
        let mut pairs = Vec::with_capacity(limit.min(1024));
        let mut current = start.clone();
        loop {
            let user_key = {
                let cursor = self.write_cursor()?;
                cursor.seek(&current.encode_write(TimeStamp::max()));
                if !cursor.valid() {
                    return Ok((pairs, None));
                }
                let (user_key, _) = decode_ts_key(cursor.key())?;
                user_key
            };
            if !end.is_empty() && user_key >= *end {
                return Ok((pairs, None));
            }
            if pairs.len() >= limit {
                return Ok((pairs, Some(user_key)));
            }
            self.check_lock(&user_key, ts, resolved_locks)?;
            if let Some(value) = self.get(&user_key, ts)? {
                pairs.push((user_key.clone(), value));
            }
            current = user_key.next_key();
        }
    }

    /// Locks accepted by `filter`, in key order, up to `limit` (0 = all).
    pub fn scan_locks<F>(
        &mut self,
        start: Option<&Key>,
        filter: F,
        limit: usize,
    ) -> Result<Vec<(Key, LockRecord)>>
    where
        F: Fn(&LockRecord) -> bool,
    {
        let mut cursor = self.snapshot.iter(CF_LOCK)?;
        match start {
            Some(key) => cursor.seek(&key.encode_lock()),
            None => cursor.seek_to_first(),
        }
        let mut locks = vec![];
        while cursor.valid() {
            let key = kernel::keys::decode_lock_key(cursor.key())?;
            let lock = LockRecord::decode(cursor.value())?;
            if filter(&lock) {
                locks.push((key, lock));
                if limit > 0 && locks.len() >= limit {
                    break;
                }
            }
            cursor.next();
        }
        Ok(locks)
    }
}
