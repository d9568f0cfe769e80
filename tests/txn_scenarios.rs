// Copyright 2025 The dingokv Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end transaction scenarios against a full region store.

use std::sync::Arc;

use dingokv::{
    engine::{commands::PrewriteCheck, ProcessResult, TxnStatus},
    index::{MetricType, VectorIndexParams, VectorWithId},
    runtime::{RegionState, ServerResult},
    Command, CoreConfig, ErrorCode, Key, KeyMode, KeyRange, MemEngine, Mutation, RegionMeta,
    RegionStore, RequestContext, StoreServices, TimeStamp,
};

fn key(id: i64) -> Key {
    Key::encode_id(KeyMode::TxnExecutor, 1, id)
}

fn ts(v: u64) -> TimeStamp {
    TimeStamp::new(v)
}

fn open_store() -> RegionStore<MemEngine> {
    let config = CoreConfig::default();
    let services = StoreServices::new(&config);
    let mut meta = RegionMeta::new(1, KeyRange::new(key(1), key(1_000_000)));
    meta.state = RegionState::Normal;
    RegionStore::open(MemEngine::new(), meta, Arc::new(config), services).unwrap()
}

fn ctx(store: &RegionStore<MemEngine>) -> RequestContext {
    RequestContext::new(store.region().id(), store.region().meta().epoch)
}

fn prewrite(
    store: &RegionStore<MemEngine>,
    entries: &[(i64, &[u8])],
    primary: i64,
    start_ts: TimeStamp,
    lock_ttl: u64,
) -> ServerResult<ProcessResult> {
    store.execute(
        &ctx(store),
        Command::Prewrite {
            mutations: entries
                .iter()
                .map(|(id, value)| Mutation::Put((key(*id), value.to_vec())))
                .collect(),
            primary: key(primary),
            start_ts,
            lock_ttl,
            txn_size: entries.len() as u64,
            checks: vec![],
            secondaries: None,
            min_commit_ts: TimeStamp::zero(),
        },
    )
}

fn commit(
    store: &RegionStore<MemEngine>,
    keys: &[i64],
    start_ts: TimeStamp,
    commit_ts: TimeStamp,
) -> ServerResult<ProcessResult> {
    store.execute(
        &ctx(store),
        Command::Commit {
            keys: keys.iter().map(|id| key(*id)).collect(),
            start_ts,
            commit_ts,
        },
    )
}

fn prewrite_errors(pr: ProcessResult) -> Vec<dingokv::engine::Error> {
    match pr {
        ProcessResult::MultiRes { results } => {
            results.into_iter().filter_map(|result| result.err()).collect()
        }
        other => panic!("expected MultiRes, got {:?}", other),
    }
}

// Scenario 1: the optimistic commit happy path.
#[test]
fn test_optimistic_commit_happy_path() {
    let store = open_store();
    prewrite(&store, &[(1, b"v1"), (2, b"v2")], 1, ts(100), 3000).unwrap();
    commit(&store, &[1, 2], ts(100), ts(110)).unwrap();

    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(120)).unwrap(),
        Some(b"v1".to_vec())
    );
    assert_eq!(
        store.get(&ctx(&store), &key(2), ts(120)).unwrap(),
        Some(b"v2".to_vec())
    );
    assert_eq!(store.get(&ctx(&store), &key(1), ts(95)).unwrap(), None);
    assert_eq!(store.get(&ctx(&store), &key(2), ts(95)).unwrap(), None);
}

// Scenario 2: a write-write conflict, observed first as a lock and after the
// competitor's commit as a write conflict.
#[test]
fn test_write_write_conflict() {
    let store = open_store();

    // Txn A holds the lock.
    prewrite(&store, &[(1, b"vA")], 1, ts(100), 3000).unwrap();

    // Txn B runs into it.
    let errors = prewrite_errors(prewrite(&store, &[(1, b"vB")], 1, ts(105), 3000).unwrap());
    match &errors[..] {
        [dingokv::engine::Error::KeyIsLocked(info)] => {
            assert_eq!(info.primary, key(1));
            assert_eq!(info.start_ts, ts(100));
            assert_eq!(info.ttl_ms, 3000);
        }
        other => panic!("expected KeyIsLocked, got {:?}", other),
    }

    // A commits; B retries below the commit and must see the conflict.
    commit(&store, &[1], ts(100), ts(110)).unwrap();
    let err = prewrite(&store, &[(1, b"vB")], 1, ts(105), 3000).unwrap_err();
    assert_eq!(err.code, ErrorCode::WriteConflict);
    let conflict = err.txn_result.write_conflict.unwrap();
    assert_eq!(conflict.conflict_commit_ts, ts(110));

    // B restarts with a higher start_ts and wins.
    prewrite(&store, &[(1, b"vB")], 1, ts(120), 3000).unwrap();
    commit(&store, &[1], ts(120), ts(130)).unwrap();
    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(140)).unwrap(),
        Some(b"vB".to_vec())
    );
}

// Scenario 3: pessimistic locking with a for_update_ts retry.
#[test]
fn test_pessimistic_retry() {
    let store = open_store();

    // An external txn will commit k at 120; stage its prewrite first.
    prewrite(&store, &[(1, b"external")], 1, ts(90), 3000).unwrap();
    commit(&store, &[1], ts(90), ts(120)).unwrap();

    // PessimisticLock at for_update_ts=100 loses to that commit.
    let err = store
        .execute(
            &ctx(&store),
            Command::AcquirePessimisticLock {
                keys: vec![key(1)],
                primary: key(1),
                start_ts: ts(100),
                for_update_ts: ts(100),
                lock_ttl: 3000,
                return_values: false,
            },
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::WriteConflict);
    assert!(
        err.txn_result
            .write_conflict
            .unwrap()
            .retry_with_new_for_update_ts
    );

    // Re-lock with for_update_ts=130, then the guarded prewrite succeeds.
    store
        .execute(
            &ctx(&store),
            Command::AcquirePessimisticLock {
                keys: vec![key(1)],
                primary: key(1),
                start_ts: ts(100),
                for_update_ts: ts(130),
                lock_ttl: 3000,
                return_values: false,
            },
        )
        .unwrap();
    store
        .execute(
            &ctx(&store),
            Command::Prewrite {
                mutations: vec![Mutation::Put((key(1), b"mine".to_vec()))],
                primary: key(1),
                start_ts: ts(100),
                lock_ttl: 3000,
                txn_size: 1,
                checks: vec![PrewriteCheck::Pessimistic {
                    for_update_ts: ts(130),
                }],
                secondaries: None,
                min_commit_ts: TimeStamp::zero(),
            },
        )
        .unwrap();
    commit(&store, &[1], ts(100), ts(140)).unwrap();
    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(150)).unwrap(),
        Some(b"mine".to_vec())
    );
}

// Scenario 4: a crashed client's primary is expired and its secondaries are
// cleaned up by another transaction.
#[test]
fn test_primary_failure_resolved() {
    let store = open_store();
    let start = TimeStamp::compose(1000, 0);

    prewrite(&store, &[(1, b"a"), (2, b"b"), (3, b"c")], 1, start, 1000).unwrap();

    // Another txn reads k2 and trips over the lock.
    let err = store.get(&ctx(&store), &key(2), TimeStamp::compose(3000, 0)).unwrap_err();
    assert_eq!(err.code, ErrorCode::KeyIsLocked);
    let primary = err.txn_result.locked.unwrap().primary;
    assert_eq!(primary, key(1));

    // The primary is past its TTL; probing settles the txn as dead.
    let pr = store
        .execute(
            &ctx(&store),
            Command::CheckTxnStatus {
                primary_key: primary,
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

    // Resolve the secondaries, then the key serves again.
    store
        .execute(
            &ctx(&store),
            Command::ResolveLock {
                start_ts: start,
                commit_ts: TimeStamp::zero(),
                keys: vec![key(2), key(3)],
            },
        )
        .unwrap();
    assert_eq!(
        store
            .get(&ctx(&store), &key(2), TimeStamp::compose(3000, 0))
            .unwrap(),
        None
    );

    // And a retry of the whole write goes through.
    let retry = TimeStamp::compose(4000, 0);
    prewrite(&store, &[(1, b"a"), (2, b"b"), (3, b"c")], 1, retry, 3000).unwrap();
    commit(&store, &[1, 2, 3], retry, retry.next()).unwrap();
    assert_eq!(
        store
            .get(&ctx(&store), &key(2), TimeStamp::compose(5000, 0))
            .unwrap(),
        Some(b"b".to_vec())
    );
}

// Scenario 5: vector upsert and search consistency across MVCC snapshots.
#[test]
fn test_vector_upsert_search_consistency() {
    let mut store = open_store();
    store
        .enable_vector_index(VectorIndexParams::flat(4, MetricType::L2))
        .unwrap();

    let row = VectorWithId::new(42, vec![1.0, 0.0, 0.0, 0.0]);
    prewrite(&store, &[(42, &row.encode().unwrap())], 42, ts(90), 3000).unwrap();
    commit(&store, &[42], ts(90), ts(100)).unwrap();

    let hits = store
        .vector_search(&ctx(&store), &[1.0, 0.0, 0.0, 0.0], 1, &[], Some(ts(110)))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 42);
    assert_eq!(hits[0].distance, 0.0);

    let row = VectorWithId::new(42, vec![0.0, 1.0, 0.0, 0.0]);
    prewrite(&store, &[(42, &row.encode().unwrap())], 42, ts(115), 3000).unwrap();
    commit(&store, &[42], ts(115), ts(120)).unwrap();

    // The snapshot at 110 still sees the original vector.
    let hits = store
        .vector_search(&ctx(&store), &[1.0, 0.0, 0.0, 0.0], 1, &[], Some(ts(110)))
        .unwrap();
    assert_eq!(hits[0].distance, 0.0);

    // The snapshot at 130 sees the upsert, at L2 distance 2.0.
    let hits = store
        .vector_search(&ctx(&store), &[1.0, 0.0, 0.0, 0.0], 1, &[], Some(ts(130)))
        .unwrap();
    assert_eq!(hits[0].id, 42);
    assert_eq!(hits[0].distance, 2.0);
}

// Scenario 6: an epoch behind a split is told the current definition.
#[test]
fn test_epoch_mismatch_after_split() {
    let store = open_store();
    let mut stale = ctx(&store);
    stale.epoch.version = 7;
    store
        .region()
        .update_meta(store.engine(), |meta| meta.epoch.version = 7)
        .unwrap();
    assert!(store.get(&stale, &key(1), ts(100)).is_ok());

    // The split raises the version from 7 to 8.
    store
        .region()
        .update_range(store.engine(), KeyRange::new(key(1), key(500_000)))
        .unwrap();

    let err = store.get(&stale, &key(1), ts(100)).unwrap_err();
    assert_eq!(err.code, ErrorCode::EpochNotMatch);
    let current = err.current_region.unwrap();
    assert_eq!(current.epoch.version, 8);
}

// Invariant: two identical prewrites leave the same on-disk state as one.
#[test]
fn test_idempotent_prewrite() {
    let store = open_store();
    prewrite(&store, &[(1, b"v"), (2, b"w")], 1, ts(100), 3000).unwrap();
    let before = dump_region(&store);
    prewrite(&store, &[(1, b"v"), (2, b"w")], 1, ts(100), 3000).unwrap();
    assert_eq!(before, dump_region(&store));

    commit(&store, &[1, 2], ts(100), ts(110)).unwrap();
    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(120)).unwrap(),
        Some(b"v".to_vec())
    );
}

fn dump_region(store: &RegionStore<MemEngine>) -> Vec<(String, Vec<u8>, Vec<u8>)> {
    use dingokv::storage::{Cursor, Engine, Snapshot};
    let snapshot = store.engine().snapshot().unwrap();
    let mut dump = vec![];
    for cf in dingokv::storage::ALL_CFS {
        let mut cursor = snapshot.iter(cf).unwrap();
        cursor.seek_to_first();
        while cursor.valid() {
            dump.push((cf.to_owned(), cursor.key().to_vec(), cursor.value().to_vec()));
            cursor.next();
        }
    }
    dump
}

// Invariant: committed timestamps observed by a reader are strictly
// increasing per key, and snapshots are pure under concurrent prewrites.
#[test]
fn test_snapshot_purity_and_commit_monotonicity() {
    let store = open_store();
    let mut observed = vec![];
    for round in 0..5u64 {
        let start = ts(100 + round * 10);
        let commit_at = ts(105 + round * 10);
        prewrite(&store, &[(1, format!("v{}", round).as_bytes())], 1, start, 3000).unwrap();
        commit(&store, &[1], start, commit_at).unwrap();
        observed.push(commit_at);
    }
    assert!(observed.windows(2).all(|pair| pair[0] < pair[1]));

    // A reader at 107 always sees round 0, prewrites above it or not.
    prewrite(&store, &[(1, b"in-flight")], 1, ts(500), 3000).unwrap();
    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(107)).unwrap(),
        Some(b"v0".to_vec())
    );
}

// Invariant: after all in-flight transactions settle, the index holds
// exactly the latest committed value per id.
#[test]
fn test_index_convergence() {
    let mut store = open_store();
    store
        .enable_vector_index(VectorIndexParams::flat(2, MetricType::L2))
        .unwrap();

    for id in 1..=10i64 {
        for round in 0..3u64 {
            let start = ts(100 * id as u64 + round * 10);
            let row = VectorWithId::new(id, vec![id as f32, round as f32]);
            prewrite(&store, &[(id, &row.encode().unwrap())], id, start, 3000).unwrap();
            commit(&store, &[id], start, start.next()).unwrap();
        }
    }
    // Delete the even ids.
    for id in (2..=10i64).step_by(2) {
        let start = ts(10_000 + id as u64);
        store
            .execute(
                &ctx(&store),
                Command::Prewrite {
                    mutations: vec![Mutation::Delete(key(id))],
                    primary: key(id),
                    start_ts: start,
                    lock_ttl: 3000,
                    txn_size: 1,
                    checks: vec![],
                    secondaries: None,
                    min_commit_ts: TimeStamp::zero(),
                },
            )
            .unwrap();
        commit(&store, &[id], start, start.next()).unwrap();
    }

    assert_eq!(store.vector_count(&ctx(&store)).unwrap(), 5);
    for id in (1..=9i64).step_by(2) {
        let hits = store
            .vector_search(&ctx(&store), &[id as f32, 2.0], 1, &[], None)
            .unwrap();
        assert_eq!(hits[0].id, id, "latest value of id {} must win", id);
        assert_eq!(hits[0].distance, 0.0);
    }
}

// Invariant: GC at a safe point never breaks a read at or above it.
#[test]
fn test_gc_safety() {
    let store = open_store();
    for round in 0..4u64 {
        let start = ts(100 + round * 100);
        prewrite(&store, &[(1, format!("r{}", round).as_bytes())], 1, start, 3000).unwrap();
        commit(&store, &[1], start, start.next()).unwrap();
    }

    // Safe point between round 2 and round 3.
    store.update_safe_point(ts(350)).unwrap();
    store.run_gc_now().unwrap();

    // Reads at and above the safe point see what they always saw.
    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(350)).unwrap(),
        Some(b"r2".to_vec())
    );
    assert_eq!(
        store.get(&ctx(&store), &key(1), ts(1_000)).unwrap(),
        Some(b"r3".to_vec())
    );
}

// Lock-write exclusion: for any (key, start_ts) at most one of lock record,
// rollback record, committed write exists.
#[test]
fn test_lock_write_exclusion() {
    use dingokv::engine::MvccReader;
    use dingokv::storage::Engine;

    let store = open_store();
    prewrite(&store, &[(1, b"v")], 1, ts(100), 3000).unwrap();
    commit(&store, &[1], ts(100), ts(110)).unwrap();

    // Rolled-back txn on the same key.
    prewrite(&store, &[(1, b"x")], 1, ts(200), 3000).unwrap();
    store
        .execute(
            &ctx(&store),
            Command::Rollback {
                keys: vec![key(1)],
                start_ts: ts(200),
            },
        )
        .unwrap();

    let mut reader = MvccReader::new(store.engine().snapshot().unwrap());
    for start_ts in [ts(100), ts(200)] {
        let lock = reader
            .load_lock(&key(1))
            .unwrap()
            .filter(|lock| lock.start_ts == start_ts);
        let record = reader.get_txn_commit_record(&key(1), start_ts).unwrap();
        let states = usize::from(lock.is_some()) + usize::from(record.is_some());
        assert_eq!(states, 1, "txn {} must be in exactly one state", start_ts);
    }
}
