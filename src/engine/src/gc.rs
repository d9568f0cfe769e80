//! MVCC garbage collection. For every user key, versions at or below the
//! safe point are reduced to the single record a reader at the safe point
//! could still observe; rollback markers and superseded versions go, along
//! with their data records. Runs in bounded steps so the write path is never
//! starved.

use kernel::{keys::decode_ts_key, Key, TimeStamp, WriteKind, WriteRecord};
use storage::{Cursor, Engine, Snapshot, WriteBatch, CF_DATA, CF_WRITE};

use crate::{error::Result, mvcc::MvccReader};

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub processed_keys: usize,
    pub deleted_writes: usize,
    pub deleted_data: usize,
}

pub struct GcStep {
    pub batch: WriteBatch,
    /// The user key to resume from, if the range was not exhausted.
    pub next: Option<Key>,
    pub stats: GcStats,
}

/// Collects deletions for at most `batch_limit` user keys starting at `from`.
pub fn gc_step<S: Snapshot>(
    snapshot: &S,
    safe_point: TimeStamp,
    from: Option<&Key>,
    batch_limit: usize,
) -> Result<GcStep> {
    let mut batch = WriteBatch::default();
    let mut stats = GcStats::default();
    let mut cursor = snapshot.iter(CF_WRITE)?;
    match from {
        Some(key) => cursor.seek(&key.encode_write(TimeStamp::max())),
        None => cursor.seek_to_first(),
    }

    let mut current_key: Option<Key> = None;
    // Set once the version a safe-point reader would see has been found;
    // everything older for the key is then superseded.
    let mut remove_older = false;

    while cursor.valid() {
        let (user_key, commit_ts) = decode_ts_key(cursor.key())?;
        if current_key.as_ref() != Some(&user_key) {
            if stats.processed_keys >= batch_limit {
                return Ok(GcStep {
                    batch,
                    next: Some(user_key),
                    stats,
                });
            }
            current_key = Some(user_key.clone());
            remove_older = false;
            stats.processed_keys += 1;
        }

        if commit_ts > safe_point {
            cursor.next();
            continue;
        }

        let write = WriteRecord::decode(cursor.value())?;
        let delete = if remove_older {
            true
        } else {
            match write.kind {
                WriteKind::Put => {
                    // The version visible at the safe point stays.
                    remove_older = true;
                    false
                }
                WriteKind::Delete => {
                    // Nothing is visible either way; the tombstone can go too.
                    remove_older = true;
                    true
                }
                // Bookkeeping records below the safe point are always dead.
                WriteKind::Rollback | WriteKind::Lock => true,
            }
        };
        if delete {
            batch.delete(CF_WRITE, cursor.key().to_vec());
            stats.deleted_writes += 1;
            if write.kind == WriteKind::Put && write.short_value.is_none() {
                batch.delete(CF_DATA, user_key.encode_data(write.start_ts));
                stats.deleted_data += 1;
            }
        }
        cursor.next();
    }

    Ok(GcStep {
        batch,
        next: None,
        stats,
    })
}

/// Collects data records no write or lock record references anymore.
/// Bounded like `gc_step`; resumes from the returned key.
pub fn gc_orphan_step<S: Snapshot>(
    snapshot: &S,
    safe_point: TimeStamp,
    from: Option<&Key>,
    batch_limit: usize,
) -> Result<GcStep> {
    let mut batch = WriteBatch::default();
    let mut stats = GcStats::default();
    let mut reader = MvccReader::new(snapshot.clone());
    let mut cursor = snapshot.iter(CF_DATA)?;
    match from {
        Some(key) => cursor.seek(&key.encode_data(TimeStamp::max())),
        None => cursor.seek_to_first(),
    }

    while cursor.valid() {
        if stats.processed_keys >= batch_limit {
            let (user_key, _) = decode_ts_key(cursor.key())?;
            return Ok(GcStep {
                batch,
                next: Some(user_key),
                stats,
            });
        }
        let (user_key, start_ts) = decode_ts_key(cursor.key())?;
        stats.processed_keys += 1;
        if start_ts < safe_point {
            let referenced = match reader.load_lock(&user_key)? {
                Some(lock) if lock.start_ts == start_ts => true,
                _ => reader.get_txn_commit_record(&user_key, start_ts)?.is_some(),
            };
            if !referenced {
                batch.delete(CF_DATA, cursor.key().to_vec());
                stats.deleted_data += 1;
            }
        }
        cursor.next();
    }

    Ok(GcStep {
        batch,
        next: None,
        stats,
    })
}

/// Runs a full GC pass at `safe_point`, applying one bounded batch at a time
/// and calling `yield_fn` between batches so the caller can reschedule.
pub fn run_gc<E: Engine>(
    engine: &E,
    safe_point: TimeStamp,
    batch_limit: usize,
    mut yield_fn: impl FnMut(),
) -> Result<GcStats> {
    let mut total = GcStats::default();
    let mut from: Option<Key> = None;
    loop {
        let snapshot = engine.snapshot()?;
        let step = gc_step(&snapshot, safe_point, from.as_ref(), batch_limit)?;
        total.processed_keys += step.stats.processed_keys;
        total.deleted_writes += step.stats.deleted_writes;
        total.deleted_data += step.stats.deleted_data;
        if !step.batch.is_empty() {
            engine.write(step.batch)?;
        }
        match step.next {
            Some(key) => {
                from = Some(key);
                yield_fn();
            }
            None => break,
        }
    }

    let mut from: Option<Key> = None;
    loop {
        let snapshot = engine.snapshot()?;
        let step = gc_orphan_step(&snapshot, safe_point, from.as_ref(), batch_limit)?;
        total.deleted_data += step.stats.deleted_data;
        if !step.batch.is_empty() {
            engine.write(step.batch)?;
        }
        match step.next {
            Some(key) => {
                from = Some(key);
                yield_fn();
            }
            None => break,
        }
    }

    info!(
        "gc finished at safe point {}: {} keys, {} writes and {} data records removed",
        safe_point, total.processed_keys, total.deleted_writes, total.deleted_data
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use kernel::KeyMode;
    use storage::MemEngine;

    use super::*;

    fn key(id: i64) -> Key {
        Key::encode_id(KeyMode::TxnExecutor, 1, id)
    }

    fn ts(v: u64) -> TimeStamp {
        TimeStamp::new(v)
    }

    fn put_version(engine: &MemEngine, k: &Key, value: &[u8], start: u64, commit: u64, short: bool) {
        let mut batch = WriteBatch::default();
        if short {
            let record = WriteRecord::new(WriteKind::Put, ts(start), Some(value.to_vec()));
            batch.put(CF_WRITE, k.encode_write(ts(commit)), record.encode());
        } else {
            batch.put(CF_DATA, k.encode_data(ts(start)), value.to_vec());
            let record = WriteRecord::new(WriteKind::Put, ts(start), None);
            batch.put(CF_WRITE, k.encode_write(ts(commit)), record.encode());
        }
        engine.write(batch).unwrap();
    }

    fn delete_version(engine: &MemEngine, k: &Key, start: u64, commit: u64) {
        let mut batch = WriteBatch::default();
        let record = WriteRecord::new(WriteKind::Delete, ts(start), None);
        batch.put(CF_WRITE, k.encode_write(ts(commit)), record.encode());
        engine.write(batch).unwrap();
    }

    fn rollback_marker(engine: &MemEngine, k: &Key, start: u64) {
        let mut batch = WriteBatch::default();
        let record = WriteRecord::new(WriteKind::Rollback, ts(start), None);
        batch.put(CF_WRITE, k.encode_write(ts(start)), record.encode());
        engine.write(batch).unwrap();
    }

    fn visible(engine: &MemEngine, k: &Key, at: u64) -> Option<Vec<u8>> {
        let mut reader = MvccReader::new(storage::Engine::snapshot(engine).unwrap());
        reader.get(k, ts(at)).unwrap()
    }

    #[test]
    fn test_gc_keeps_safe_point_visibility() {
        let engine = MemEngine::new();
        let k = key(1);
        put_version(&engine, &k, b"v1", 10, 20, true);
        put_version(&engine, &k, b"v2", 30, 40, false);
        put_version(&engine, &k, b"v3", 50, 60, true);

        let stats = run_gc(&engine, ts(45), 100, || {}).unwrap();
        // v1 is superseded below the safe point; v2 is what a reader at 45
        // sees; v3 is above the safe point.
        assert_eq!(stats.deleted_writes, 1);
        assert_eq!(visible(&engine, &k, 45), Some(b"v2".to_vec()));
        assert_eq!(visible(&engine, &k, 70), Some(b"v3".to_vec()));
        assert_eq!(visible(&engine, &k, 25), None, "v1 must be gone");
    }

    #[test]
    fn test_gc_removes_delete_tombstones_and_rollbacks() {
        let engine = MemEngine::new();
        let k = key(1);
        put_version(&engine, &k, b"v1", 10, 20, true);
        delete_version(&engine, &k, 30, 40);
        rollback_marker(&engine, &k, 45);

        let stats = run_gc(&engine, ts(50), 100, || {}).unwrap();
        // rollback marker + delete tombstone + superseded v1
        assert_eq!(stats.deleted_writes, 3);
        assert_eq!(visible(&engine, &k, 100), None);

        let snapshot = storage::Engine::snapshot(&engine).unwrap();
        let mut cursor = snapshot.iter(CF_WRITE).unwrap();
        cursor.seek_to_first();
        assert!(!cursor.valid(), "write CF should be empty after gc");
    }

    #[test]
    fn test_gc_deletes_data_records_of_superseded_versions() {
        let engine = MemEngine::new();
        let k = key(1);
        put_version(&engine, &k, b"big-old", 10, 20, false);
        put_version(&engine, &k, b"big-new", 30, 40, false);

        run_gc(&engine, ts(50), 100, || {}).unwrap();
        let snapshot = storage::Engine::snapshot(&engine).unwrap();
        assert!(snapshot
            .get(CF_DATA, &k.encode_data(ts(10)))
            .unwrap()
            .is_none());
        assert!(snapshot
            .get(CF_DATA, &k.encode_data(ts(30)))
            .unwrap()
            .is_some());
        assert_eq!(visible(&engine, &k, 60), Some(b"big-new".to_vec()));
    }

    #[test]
    fn test_gc_orphan_data() {
        let engine = MemEngine::new();
        let k = key(1);
        // A data record with no write record referencing it (crashed txn
        // whose lock was collapsed).
        let mut batch = WriteBatch::default();
        batch.put(CF_DATA, k.encode_data(ts(10)), b"orphan".to_vec());
        engine.write(batch).unwrap();
        // And a live version.
        put_version(&engine, &k, b"live", 30, 40, false);

        run_gc(&engine, ts(100), 100, || {}).unwrap();
        let snapshot = storage::Engine::snapshot(&engine).unwrap();
        assert!(snapshot
            .get(CF_DATA, &k.encode_data(ts(10)))
            .unwrap()
            .is_none());
        assert_eq!(visible(&engine, &k, 50), Some(b"live".to_vec()));
    }

    #[test]
    fn test_gc_yields_between_batches() {
        let engine = MemEngine::new();
        for id in 1..=10 {
            let k = key(id);
            put_version(&engine, &k, b"old", 10, 20, true);
            put_version(&engine, &k, b"new", 30, 40, true);
        }
        let mut yields = 0;
        let stats = run_gc(&engine, ts(50), 3, || yields += 1).unwrap();
        assert_eq!(stats.deleted_writes, 10);
        assert!(yields >= 3, "expected cooperative yields, got {}", yields);
        for id in 1..=10 {
            assert_eq!(visible(&engine, &key(id), 60), Some(b"new".to_vec()));
        }
    }
}
