//! Write commands of the transaction engine. A command is validated and
//! latched by the caller, executed here against one snapshot, and its batch
//! is applied through the serialized write path.

use std::fmt::{self, Display, Formatter};

use kernel::{Key, Mutation, TimeStamp};
use storage::{Snapshot, WriteBatch};

use crate::{
    error::{Error, Result},
    mvcc::txn::MvccTxn,
};

pub use crate::mvcc::txn::TxnStatus;

/// Per-mutation prewrite constraint carried by the pessimistic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrewriteCheck {
    Optimistic,
    /// The mutation must convert an existing pessimistic lock whose
    /// `for_update_ts` equals this one.
    Pessimistic { for_update_ts: TimeStamp },
}

/// Store transaction commands. All of them execute on the leader only,
/// against a region that already passed epoch validation.
pub enum Command {
    /// The first phase of 2PC: lock every key and stage the values.
    Prewrite {
        mutations: Vec<Mutation>,
        primary: Key,
        start_ts: TimeStamp,
        lock_ttl: u64,
        txn_size: u64,
        /// Either empty (fully optimistic) or one entry per mutation.
        checks: Vec<PrewriteCheck>,
        /// Present when the client runs the async-commit protocol.
        secondaries: Option<Vec<Key>>,
        min_commit_ts: TimeStamp,
    },
    /// Lock keys ahead of prewrite, re-checking against `for_update_ts`.
    AcquirePessimisticLock {
        keys: Vec<Key>,
        primary: Key,
        start_ts: TimeStamp,
        for_update_ts: TimeStamp,
        lock_ttl: u64,
        return_values: bool,
    },
    /// The second phase of 2PC.
    Commit {
        keys: Vec<Key>,
        start_ts: TimeStamp,
        commit_ts: TimeStamp,
    },
    /// Abort the transaction; leaves rollback tombstones.
    Rollback {
        keys: Vec<Key>,
        start_ts: TimeStamp,
    },
    /// Drop pessimistic locks only; never touches data.
    PessimisticRollback {
        keys: Vec<Key>,
        start_ts: TimeStamp,
        for_update_ts: TimeStamp,
    },
    /// Probe (and possibly settle) a transaction through its primary lock.
    CheckTxnStatus {
        primary_key: Key,
        start_ts: TimeStamp,
        caller_start_ts: TimeStamp,
        current_ts: TimeStamp,
    },
    /// Commit or roll back the region's locks of one transaction, after its
    /// status was decided through the primary.
    ResolveLock {
        start_ts: TimeStamp,
        /// Zero means roll back.
        commit_ts: TimeStamp,
        /// Empty means every lock of the transaction in the region.
        keys: Vec<Key>,
    },
    /// Keep a long transaction's primary lock alive.
    TxnHeartBeat {
        primary_key: Key,
        start_ts: TimeStamp,
        advise_ttl_ms: u64,
    },
}

impl Command {
    pub fn start_ts(&self) -> TimeStamp {
        match self {
            Command::Prewrite { start_ts, .. }
            | Command::AcquirePessimisticLock { start_ts, .. }
            | Command::Commit { start_ts, .. }
            | Command::Rollback { start_ts, .. }
            | Command::PessimisticRollback { start_ts, .. }
            | Command::CheckTxnStatus { start_ts, .. }
            | Command::ResolveLock { start_ts, .. }
            | Command::TxnHeartBeat { start_ts, .. } => *start_ts,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Command::Prewrite { .. } => "prewrite",
            Command::AcquirePessimisticLock { .. } => "acquire_pessimistic_lock",
            Command::Commit { .. } => "commit",
            Command::Rollback { .. } => "rollback",
            Command::PessimisticRollback { .. } => "pessimistic_rollback",
            Command::CheckTxnStatus { .. } => "check_txn_status",
            Command::ResolveLock { .. } => "resolve_lock",
            Command::TxnHeartBeat { .. } => "txn_heart_beat",
        }
    }

    /// The keys the scheduler must latch before executing this command.
    /// Region-wide resolve latches nothing extra: it runs behind the write
    /// queue and conflicts are re-checked per key.
    pub fn latch_keys(&self) -> Vec<&Key> {
        match self {
            Command::Prewrite { mutations, .. } => {
                mutations.iter().map(|mutation| mutation.key()).collect()
            }
            Command::AcquirePessimisticLock { keys, .. }
            | Command::Commit { keys, .. }
            | Command::Rollback { keys, .. }
            | Command::PessimisticRollback { keys, .. }
            | Command::ResolveLock { keys, .. } => keys.iter().collect(),
            Command::CheckTxnStatus { primary_key, .. }
            | Command::TxnHeartBeat { primary_key, .. } => vec![primary_key],
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Command::Prewrite {
                mutations,
                start_ts,
                ..
            } => write!(f, "kv::command::prewrite {} keys @ {}", mutations.len(), start_ts),
            Command::AcquirePessimisticLock {
                keys,
                start_ts,
                for_update_ts,
                ..
            } => write!(
                f,
                "kv::command::acquire_pessimistic_lock {} keys @ {} for_update {}",
                keys.len(),
                start_ts,
                for_update_ts
            ),
            Command::Commit {
                keys,
                start_ts,
                commit_ts,
            } => write!(
                f,
                "kv::command::commit {} keys {} -> {}",
                keys.len(),
                start_ts,
                commit_ts
            ),
            Command::Rollback { keys, start_ts } => {
                write!(f, "kv::command::rollback {} keys @ {}", keys.len(), start_ts)
            }
            Command::PessimisticRollback { keys, start_ts, .. } => write!(
                f,
                "kv::command::pessimistic_rollback {} keys @ {}",
                keys.len(),
                start_ts
            ),
            Command::CheckTxnStatus {
                primary_key,
                start_ts,
                ..
            } => write!(f, "kv::command::check_txn_status {} @ {}", primary_key, start_ts),
            Command::ResolveLock {
                start_ts,
                commit_ts,
                ..
            } => write!(f, "kv::command::resolve_lock {} -> {}", start_ts, commit_ts),
            Command::TxnHeartBeat {
                primary_key,
                start_ts,
                advise_ttl_ms,
            } => write!(
                f,
                "kv::command::txn_heart_beat {} @ {} ttl {}",
                primary_key, start_ts, advise_ttl_ms
            ),
        }
    }
}

/// What the command hands back besides its write batch.
#[derive(Debug)]
pub enum ProcessResult {
    Res,
    /// Per-key outcomes of a prewrite; lock conflicts are data, not failure.
    MultiRes { results: Vec<Result<()>> },
    TxnStatus { status: TxnStatus },
    /// Values read under freshly taken pessimistic locks.
    Values { values: Vec<Option<Vec<u8>>> },
    Ttl { ttl_ms: u64 },
}

pub struct WriteResult {
    pub batch: WriteBatch,
    pub pr: ProcessResult,
}

/// Executes a write command against `snapshot`, buffering mutations into the
/// returned batch. The caller owns latching before and applying after.
pub fn process_write<S: Snapshot>(
    snapshot: S,
    short_value_threshold: usize,
    cmd: Command,
) -> Result<WriteResult> {
    match cmd {
        Command::Prewrite {
            mutations,
            primary,
            start_ts,
            lock_ttl,
            txn_size,
            checks,
            secondaries,
            min_commit_ts,
        } => {
            if !checks.is_empty() && checks.len() != mutations.len() {
                return Err(Error::Engine(kernel::Error::InvalidArgument(
                    "pessimistic checks do not match mutations".to_owned(),
                )));
            }
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            let mut indexed: Vec<(usize, Mutation)> = mutations.into_iter().enumerate().collect();
            indexed.sort_by(|a, b| a.1.key().cmp(b.1.key()));

            let mut results = Vec::with_capacity(indexed.len());
            let mut locked = false;
            for (index, mutation) in indexed {
                let check = match checks.get(index) {
                    Some(PrewriteCheck::Pessimistic { for_update_ts }) => Some(*for_update_ts),
                    _ => None,
                };
                match txn.prewrite(
                    mutation,
                    &primary,
                    lock_ttl,
                    txn_size,
                    secondaries.as_deref(),
                    min_commit_ts,
                    check,
                ) {
                    Ok(()) => results.push(Ok(())),
                    Err(err @ Error::KeyIsLocked(_)) => {
                        locked = true;
                        results.push(Err(err));
                    }
                    Err(err) => return Err(err),
                }
            }
            // A partially locked prewrite stages nothing; the client resolves
            // the conflicts and retries the whole request.
            let batch = if locked {
                WriteBatch::default()
            } else {
                let mut batch = WriteBatch::default();
                batch.extend(txn.into_modifies());
                batch
            };
            Ok(WriteResult {
                batch,
                pr: ProcessResult::MultiRes { results },
            })
        }
        Command::AcquirePessimisticLock {
            mut keys,
            primary,
            start_ts,
            for_update_ts,
            lock_ttl,
            return_values,
        } => {
            keys.sort();
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                let value = txn.acquire_pessimistic_lock(
                    key,
                    &primary,
                    for_update_ts,
                    lock_ttl,
                    return_values,
                )?;
                values.push(value);
            }
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: if return_values {
                    ProcessResult::Values { values }
                } else {
                    ProcessResult::Res
                },
            })
        }
        Command::Commit {
            mut keys,
            start_ts,
            commit_ts,
        } => {
            if commit_ts <= start_ts {
                return Err(Error::Engine(kernel::Error::InvalidArgument(format!(
                    "commit_ts {} must exceed start_ts {}",
                    commit_ts, start_ts
                ))));
            }
            keys.sort();
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            for key in &keys {
                txn.commit(key, commit_ts)?;
            }
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: ProcessResult::Res,
            })
        }
        Command::Rollback { mut keys, start_ts } => {
            keys.sort();
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            for key in &keys {
                txn.rollback(key)?;
            }
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: ProcessResult::Res,
            })
        }
        Command::PessimisticRollback {
            mut keys,
            start_ts,
            for_update_ts,
        } => {
            keys.sort();
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            for key in &keys {
                txn.pessimistic_rollback(key, for_update_ts)?;
            }
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: ProcessResult::Res,
            })
        }
        Command::CheckTxnStatus {
            primary_key,
            start_ts,
            caller_start_ts,
            current_ts,
        } => {
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            let status = txn.check_txn_status(&primary_key, caller_start_ts, current_ts)?;
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: ProcessResult::TxnStatus { status },
            })
        }
        Command::ResolveLock {
            start_ts,
            commit_ts,
            keys,
        } => {
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            let keys = if keys.is_empty() {
                txn.reader()
                    .scan_locks(None, |lock| lock.start_ts == start_ts, 0)?
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect()
            } else {
                let mut keys = keys;
                keys.sort();
                keys
            };
            for key in &keys {
                if commit_ts.is_zero() {
                    txn.rollback(key)?;
                } else {
                    txn.commit(key, commit_ts)?;
                }
            }
            debug!(
                "resolved {} locks of txn {} ({})",
                keys.len(),
                start_ts,
                if commit_ts.is_zero() { "rollback" } else { "commit" }
            );
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: ProcessResult::Res,
            })
        }
        Command::TxnHeartBeat {
            primary_key,
            start_ts,
            advise_ttl_ms,
        } => {
            let mut txn = MvccTxn::new(snapshot, start_ts, short_value_threshold);
            let ttl_ms = txn.heart_beat(&primary_key, advise_ttl_ms)?;
            let mut batch = WriteBatch::default();
            batch.extend(txn.into_modifies());
            Ok(WriteResult {
                batch,
                pr: ProcessResult::Ttl { ttl_ms },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use kernel::{KeyMode, LockKind};
    use storage::{Engine, MemEngine};

    use super::*;
    use crate::mvcc::MvccReader;

    fn key(id: i64) -> Key {
        Key::encode_id(KeyMode::TxnExecutor, 1, id)
    }

    fn ts(v: u64) -> TimeStamp {
        TimeStamp::new(v)
    }

    fn run(engine: &MemEngine, cmd: Command) -> Result<ProcessResult> {
        let result = process_write(engine.snapshot().unwrap(), 255, cmd)?;
        let mut batch = WriteBatch::default();
        batch.extend(result.batch.into_modifies());
        engine.write(batch).unwrap();
        Ok(result.pr)
    }

    fn prewrite(engine: &MemEngine, keys: &[(i64, &[u8])], primary: i64, start_ts: u64) -> Result<ProcessResult> {
        run(
            engine,
            Command::Prewrite {
                mutations: keys
                    .iter()
                    .map(|(id, value)| Mutation::Put((key(*id), value.to_vec())))
                    .collect(),
                primary: key(primary),
                start_ts: ts(start_ts),
                lock_ttl: 3000,
                txn_size: keys.len() as u64,
                checks: vec![],
                secondaries: None,
                min_commit_ts: TimeStamp::zero(),
            },
        )
    }

    fn commit(engine: &MemEngine, keys: &[i64], start_ts: u64, commit_ts: u64) -> Result<ProcessResult> {
        run(
            engine,
            Command::Commit {
                keys: keys.iter().map(|id| key(*id)).collect(),
                start_ts: ts(start_ts),
                commit_ts: ts(commit_ts),
            },
        )
    }

    fn read(engine: &MemEngine, id: i64, at: u64) -> Option<Vec<u8>> {
        let mut reader = MvccReader::new(engine.snapshot().unwrap());
        reader.get(&key(id), ts(at)).unwrap()
    }

    #[test]
    fn test_optimistic_happy_path() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"v1"), (2, b"v2")], 1, 100).unwrap();
        commit(&engine, &[1, 2], 100, 110).unwrap();
        assert_eq!(read(&engine, 1, 120), Some(b"v1".to_vec()));
        assert_eq!(read(&engine, 2, 120), Some(b"v2".to_vec()));
        assert_eq!(read(&engine, 1, 95), None);
    }

    #[test]
    fn test_prewrite_reports_locks_per_key() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"a")], 1, 100).unwrap();

        match prewrite(&engine, &[(1, b"b"), (2, b"b")], 1, 105).unwrap() {
            ProcessResult::MultiRes { results } => {
                let errors: Vec<&Result<()>> = results.iter().filter(|r| r.is_err()).collect();
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], Err(Error::KeyIsLocked(_))));
            }
            other => panic!("expected MultiRes, got {:?}", other),
        }
        // The conflicted prewrite staged nothing, key 2 stays unlocked.
        let reader = MvccReader::new(engine.snapshot().unwrap());
        assert!(reader.load_lock(&key(2)).unwrap().is_none());
    }

    #[test]
    fn test_commit_ts_must_exceed_start_ts() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"v")], 1, 100).unwrap();
        assert!(commit(&engine, &[1], 100, 100).is_err());
    }

    #[test]
    fn test_resolve_lock_region_wide() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"a"), (2, b"b"), (3, b"c")], 1, 100).unwrap();

        // Roll the whole transaction back without naming keys.
        run(
            &engine,
            Command::ResolveLock {
                start_ts: ts(100),
                commit_ts: TimeStamp::zero(),
                keys: vec![],
            },
        )
        .unwrap();

        let reader = MvccReader::new(engine.snapshot().unwrap());
        for id in 1..=3 {
            assert!(reader.load_lock(&key(id)).unwrap().is_none());
        }
        assert_eq!(read(&engine, 1, 200), None);
    }

    #[test]
    fn test_resolve_lock_commit_subset() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"a"), (2, b"b")], 1, 100).unwrap();
        run(
            &engine,
            Command::ResolveLock {
                start_ts: ts(100),
                commit_ts: ts(110),
                keys: vec![key(2)],
            },
        )
        .unwrap();
        assert_eq!(read(&engine, 2, 120), Some(b"b".to_vec()));
        // Key 1 still locked.
        let reader = MvccReader::new(engine.snapshot().unwrap());
        assert!(reader.load_lock(&key(1)).unwrap().is_some());
    }

    #[test]
    fn test_pessimistic_lock_and_values() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"old")], 1, 50).unwrap();
        commit(&engine, &[1], 50, 60).unwrap();

        let pr = run(
            &engine,
            Command::AcquirePessimisticLock {
                keys: vec![key(1), key(2)],
                primary: key(1),
                start_ts: ts(100),
                for_update_ts: ts(100),
                lock_ttl: 3000,
                return_values: true,
            },
        )
        .unwrap();
        match pr {
            ProcessResult::Values { values } => {
                assert_eq!(values, vec![Some(b"old".to_vec()), None]);
            }
            other => panic!("expected Values, got {:?}", other),
        }
        let reader = MvccReader::new(engine.snapshot().unwrap());
        let lock = reader.load_lock(&key(1)).unwrap().unwrap();
        assert_eq!(lock.kind, LockKind::PessimisticLock);
        assert_eq!(lock.for_update_ts, ts(100));
    }

    #[test]
    fn test_check_txn_status_and_resolve_after_crash() {
        let engine = MemEngine::new();
        // ttl 1000ms, physical start 1000ms; primary is k1, secondaries k2 k3.
        let start = TimeStamp::compose(1000, 0);
        run(
            &engine,
            Command::Prewrite {
                mutations: vec![
                    Mutation::Put((key(1), b"a".to_vec())),
                    Mutation::Put((key(2), b"b".to_vec())),
                    Mutation::Put((key(3), b"c".to_vec())),
                ],
                primary: key(1),
                start_ts: start,
                lock_ttl: 1000,
                txn_size: 3,
                checks: vec![],
                secondaries: None,
                min_commit_ts: TimeStamp::zero(),
            },
        )
        .unwrap();

        // Wall time passed the ttl; probing the primary settles it.
        let pr = run(
            &engine,
            Command::CheckTxnStatus {
                primary_key: key(1),
                start_ts: start,
                caller_start_ts: TimeStamp::compose(2000, 0),
                current_ts: TimeStamp::compose(3000, 0),
            },
        )
        .unwrap();
        assert!(matches!(
            pr,
            ProcessResult::TxnStatus {
                status: TxnStatus::LockNotExist
            }
        ));

        // The secondaries are cleaned by resolve-lock.
        run(
            &engine,
            Command::ResolveLock {
                start_ts: start,
                commit_ts: TimeStamp::zero(),
                keys: vec![key(2), key(3)],
            },
        )
        .unwrap();
        let reader = MvccReader::new(engine.snapshot().unwrap());
        for id in 1..=3 {
            assert!(reader.load_lock(&key(id)).unwrap().is_none());
        }

        // A later transaction takes the keys cleanly.
        let later = TimeStamp::compose(5000, 0).into_inner();
        prewrite(&engine, &[(2, b"fresh")], 2, later).unwrap();
        commit(&engine, &[2], later, later + 10).unwrap();
        assert_eq!(read(&engine, 2, later + 20), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_heart_beat_command() {
        let engine = MemEngine::new();
        prewrite(&engine, &[(1, b"v")], 1, 100).unwrap();
        match run(
            &engine,
            Command::TxnHeartBeat {
                primary_key: key(1),
                start_ts: ts(100),
                advise_ttl_ms: 9000,
            },
        )
        .unwrap()
        {
            ProcessResult::Ttl { ttl_ms } => assert_eq!(ttl_ms, 9000),
            other => panic!("expected Ttl, got {:?}", other),
        }
    }

    #[test]
    fn test_latch_keys_cover_mutations() {
        let cmd = Command::Prewrite {
            mutations: vec![
                Mutation::Put((key(1), b"a".to_vec())),
                Mutation::Delete(key(2)),
            ],
            primary: key(1),
            start_ts: ts(1),
            lock_ttl: 10,
            txn_size: 2,
            checks: vec![],
            secondaries: None,
            min_commit_ts: TimeStamp::zero(),
        };
        assert_eq!(cmd.latch_keys().len(), 2);
        assert_eq!(cmd.tag(), "prewrite");
        assert_eq!(cmd.start_ts(), ts(1));
    }
}
