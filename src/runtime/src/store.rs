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

//! `RegionStore` is the request-facing surface of one region: a single
//! validation pass per RPC, latched writes through the transaction engine,
//! snapshot reads, streaming scans, index search, GC and backup. Process-wide
//! resources (pools, streams, safe points) are injected as [`StoreServices`],
//! never reached through globals.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use engine::{
    commands::{process_write, Command, ProcessResult},
    gc::{run_gc, GcStats},
    Latches, MemoryLockTable, MvccReader,
};
use index::{
    DocumentIndexWrapper, DocumentWithId, PreFilter, ScoredEntry, VectorIndexParams,
    VectorIndexWrapper, VectorWithId,
};
use kernel::{
    keys::{decode_lock_key, decode_ts_key},
    CoreConfig, ErrorCode, Key, KeyRange, LockRecord, TimeStamp, WriteKind, WriteRecord,
};
use storage::{Cursor, Engine, Modify, Snapshot, WriteBatch, CF_DATA, CF_LOCK, CF_WRITE};

use crate::{
    backup,
    region::{persist_meta, Region, RegionMeta, RegionState},
    safepoint::SafePointMap,
    scheduler::WorkerPool,
    service::{IsolationLevel, RequestContext, ServerError, ServerResult},
    stream::{StreamCursor, StreamManager, StreamTakeError},
};

/// Process-wide singletons shared by every region store, handed into
/// constructors explicitly.
pub struct StoreServices<E: Engine> {
    pub read_pool: Arc<WorkerPool>,
    pub write_pool: Arc<WorkerPool>,
    pub background_pool: Arc<WorkerPool>,
    pub streams: Arc<StreamManager<E::Snap>>,
    pub safe_points: Arc<SafePointMap>,
    pub cluster_read_only: Arc<AtomicBool>,
}

impl<E: Engine> Clone for StoreServices<E> {
    fn clone(&self) -> Self {
        StoreServices {
            read_pool: self.read_pool.clone(),
            write_pool: self.write_pool.clone(),
            background_pool: self.background_pool.clone(),
            streams: self.streams.clone(),
            safe_points: self.safe_points.clone(),
            cluster_read_only: self.cluster_read_only.clone(),
        }
    }
}

impl<E: Engine> StoreServices<E> {
    pub fn new(config: &CoreConfig) -> StoreServices<E> {
        StoreServices {
            read_pool: Arc::new(WorkerPool::new(
                "read-pool",
                config.read_pool_size,
                config.worker_queue_size,
            )),
            write_pool: Arc::new(WorkerPool::new(
                "write-pool",
                config.write_pool_size,
                config.worker_queue_size,
            )),
            background_pool: Arc::new(WorkerPool::new("background", 1, config.worker_queue_size)),
            streams: Arc::new(StreamManager::new(Duration::from_millis(
                config.stream_ttl_ms,
            ))),
            safe_points: Arc::new(SafePointMap::new()),
            cluster_read_only: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One chunk of a (possibly streaming) scan.
#[derive(Debug)]
pub struct ScanResponse {
    pub pairs: Vec<(Key, Vec<u8>)>,
    /// Present when the scan was forced to stream and has more to give.
    pub stream_id: Option<u64>,
    pub finished: bool,
}

pub type DoneCallback<T> = Box<dyn FnOnce(ServerResult<T>) + Send + 'static>;

pub struct RegionStore<E: Engine> {
    engine: E,
    region: Arc<Region>,
    latches: Arc<Latches>,
    lock_table: Arc<MemoryLockTable>,
    vector_index: Option<Arc<VectorIndexWrapper>>,
    document_index: Option<Arc<DocumentIndexWrapper>>,
    services: StoreServices<E>,
    config: Arc<CoreConfig>,
}

impl<E: Engine> Clone for RegionStore<E> {
    fn clone(&self) -> Self {
        RegionStore {
            engine: self.engine.clone(),
            region: self.region.clone(),
            latches: self.latches.clone(),
            lock_table: self.lock_table.clone(),
            vector_index: self.vector_index.clone(),
            document_index: self.document_index.clone(),
            services: self.services.clone(),
            config: self.config.clone(),
        }
    }
}

impl<E: Engine> RegionStore<E> {
    /// Opens a region store, persisting `meta` and rebuilding the in-memory
    /// lock table from the lock CF (relevant after restart).
    pub fn open(
        engine: E,
        meta: RegionMeta,
        config: Arc<CoreConfig>,
        services: StoreServices<E>,
    ) -> ServerResult<RegionStore<E>> {
        persist_meta(&engine, &meta)?;
        let store = RegionStore {
            engine,
            region: Arc::new(Region::new(meta)),
            latches: Arc::new(Latches::new(256)),
            lock_table: Arc::new(MemoryLockTable::new()),
            vector_index: None,
            document_index: None,
            services,
            config,
        };
        store.recover_lock_table()?;
        Ok(store)
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn lock_table(&self) -> &Arc<MemoryLockTable> {
        &self.lock_table
    }

    /// Attaches (and builds) a vector index over this region's rows.
    pub fn enable_vector_index(&mut self, params: VectorIndexParams) -> ServerResult<()> {
        let wrapper = Arc::new(VectorIndexWrapper::new(
            self.region.id(),
            params,
            self.config.flat_need_save_count,
        ));
        wrapper.build()?;
        self.vector_index = Some(wrapper);
        Ok(())
    }

    pub fn enable_document_index(&mut self) -> ServerResult<()> {
        let wrapper = Arc::new(DocumentIndexWrapper::new(
            self.region.id(),
            self.config.flat_need_save_count,
        ));
        wrapper.build()?;
        self.document_index = Some(wrapper);
        Ok(())
    }

    pub fn vector_index(&self) -> Option<&Arc<VectorIndexWrapper>> {
        self.vector_index.as_ref()
    }

    pub fn document_index(&self) -> Option<&Arc<DocumentIndexWrapper>> {
        self.document_index.as_ref()
    }

    fn recover_lock_table(&self) -> ServerResult<()> {
        let snapshot = self.engine.snapshot()?;
        let mut reader = MvccReader::new(snapshot);
        let locks = reader
            .scan_locks(None, |_| true, 0)
            .map_err(ServerError::from)?;
        let count = locks.len();
        for (key, lock) in locks {
            self.lock_table.insert(key, lock);
        }
        if count > 0 {
            info!(
                "region {} recovered {} in-flight locks",
                self.region.id(),
                count
            );
        }
        Ok(())
    }

    // ---- validation ----------------------------------------------------

    /// The single validation pass every request goes through before any
    /// work is queued.
    fn check_region(&self, ctx: &RequestContext) -> ServerResult<Arc<RegionMeta>> {
        let meta = self.region.meta();
        if ctx.region_id != meta.id {
            return Err(ServerError::new(
                ErrorCode::RegionNotFound,
                format!("region {} is not served here", ctx.region_id),
            ));
        }
        if !meta.leader {
            return Err(
                ServerError::new(ErrorCode::NotLeader, "peer is not the leader")
                    .with_region((*meta).clone()),
            );
        }
        if ctx.epoch != meta.epoch {
            return Err(ServerError::new(
                ErrorCode::EpochNotMatch,
                format!(
                    "epoch {:?} is stale, current is {:?}",
                    ctx.epoch, meta.epoch
                ),
            )
            .with_region((*meta).clone()));
        }
        Ok(meta)
    }

    fn check_readable(&self, meta: &RegionMeta) -> ServerResult<()> {
        match meta.state {
            RegionState::Normal | RegionState::Splitting | RegionState::Merging => Ok(()),
            state => Err(ServerError::new(
                ErrorCode::RegionNotReady,
                format!("region {} is {:?}", meta.id, state),
            )),
        }
    }

    fn check_writable(&self, meta: &RegionMeta) -> ServerResult<()> {
        if self.services.cluster_read_only.load(Ordering::Acquire) {
            return Err(ServerError::new(
                ErrorCode::ClusterReadOnly,
                "cluster is read-only",
            ));
        }
        match meta.state {
            RegionState::Normal => Ok(()),
            RegionState::Splitting | RegionState::Merging
                if !meta.disable_change && !meta.temporary_disable_change =>
            {
                Ok(())
            }
            state => Err(ServerError::new(
                ErrorCode::RegionNotReady,
                format!("region {} is {:?} and rejects writes", meta.id, state),
            )),
        }
    }

    fn check_keys(&self, meta: &RegionMeta, keys: &[&Key]) -> ServerResult<()> {
        for key in keys {
            if key.is_empty() {
                return Err(ServerError::new(ErrorCode::KeyEmpty, "empty key"));
            }
            key.validate()?;
            if !meta.range.contains(key) {
                return Err(ServerError::new(
                    ErrorCode::EpochNotMatch,
                    format!("key {} is outside region {}", key, meta.id),
                )
                .with_region(meta.clone()));
            }
        }
        Ok(())
    }

    fn check_write_caps(&self, cmd: &Command) -> ServerResult<()> {
        let (count, payload) = match cmd {
            Command::Prewrite { mutations, .. } => {
                if mutations.len() > self.config.max_prewrite_count {
                    return Err(ServerError::new(
                        ErrorCode::BatchExceeded,
                        format!(
                            "prewrite carries {} mutations, cap is {}",
                            mutations.len(),
                            self.config.max_prewrite_count
                        ),
                    ));
                }
                let payload: usize = mutations
                    .iter()
                    .map(|mutation| match mutation {
                        kernel::Mutation::Put((key, value)) => key.len() + value.len(),
                        kernel::Mutation::Delete(key) | kernel::Mutation::Lock(key) => key.len(),
                    })
                    .sum();
                (mutations.len(), payload)
            }
            other => {
                let keys = other.latch_keys();
                (keys.len(), keys.iter().map(|key| key.len()).sum())
            }
        };
        if count > self.config.max_batch_count {
            return Err(ServerError::new(
                ErrorCode::BatchExceeded,
                format!("{} keys exceed the batch cap {}", count, self.config.max_batch_count),
            ));
        }
        if payload > self.config.max_request_size {
            return Err(ServerError::new(
                ErrorCode::RequestSizeExceeded,
                format!(
                    "request of {} bytes exceeds the cap {}",
                    payload, self.config.max_request_size
                ),
            ));
        }
        Ok(())
    }

    fn check_safe_point(&self, read_ts: TimeStamp) -> ServerResult<()> {
        if let Err(safe_point) = self
            .services
            .safe_points
            .check_read_ts(self.region.id(), read_ts)
        {
            return Err(ServerError::new(
                ErrorCode::IllegalParameter,
                format!(
                    "read ts {} is below the gc safe point {}",
                    read_ts, safe_point
                ),
            ));
        }
        Ok(())
    }

    // ---- write path ----------------------------------------------------

    /// Validates, latches, executes and applies one write command. Latches
    /// are held until the index wrappers saw the commit, which is what keeps
    /// `on_commit` in per-key commit order.
    pub fn execute(&self, ctx: &RequestContext, cmd: Command) -> ServerResult<ProcessResult> {
        let meta = self.check_region(ctx)?;
        self.check_writable(&meta)?;
        let latch_keys: Vec<Key> = cmd.latch_keys().into_iter().cloned().collect();
        let region_wide = matches!(&cmd, Command::ResolveLock { keys, .. } if keys.is_empty());
        if latch_keys.is_empty() && !region_wide {
            return Err(ServerError::new(ErrorCode::KeyEmpty, "no keys in request"));
        }
        if !region_wide {
            self.check_keys(&meta, &latch_keys.iter().collect::<Vec<_>>())?;
        }
        self.check_write_caps(&cmd)?;

        let tag = cmd.tag();
        let _guard = self.latches.lock_keys(latch_keys.iter());
        let snapshot = self.engine.snapshot()?;
        let result = process_write(snapshot, self.config.short_value_threshold, cmd)
            .map_err(ServerError::from)?;
        if !result.batch.is_empty() {
            self.apply(result.batch)?;
        }
        debug!("region {} executed {}", meta.id, tag);
        Ok(result.pr)
    }

    /// Enqueues `cmd` into the write pool instead of blocking the RPC
    /// thread. The closure owns request and callback; if the queue is full
    /// (or background work is backed up) the callback still fires, with
    /// `RequestFull`.
    pub fn async_execute(
        &self,
        ctx: RequestContext,
        cmd: Command,
        done: DoneCallback<ProcessResult>,
    ) {
        if !self.config.enable_async_operation {
            done(self.execute(&ctx, cmd));
            return;
        }
        if self.services.background_pool.pending() > self.config.max_background_task_count {
            done(Err(ServerError::new(
                ErrorCode::RequestFull,
                "background tasks are backed up",
            )));
            return;
        }
        let done = Arc::new(Mutex::new(Some(done)));
        let handoff = done.clone();
        let store = self.clone();
        let task = Box::new(move || {
            if let Some(done) = handoff.lock().unwrap().take() {
                done(store.execute(&ctx, cmd));
            }
        });
        if self.services.write_pool.execute_rr(task).is_err() {
            if let Some(done) = done.lock().unwrap().take() {
                done(Err(ServerError::new(
                    ErrorCode::RequestFull,
                    "write pool is full",
                )));
            }
        }
    }

    fn apply(&self, batch: WriteBatch) -> ServerResult<()> {
        let modifies = batch.modifies().to_vec();
        self.engine.write(batch)?;
        self.post_apply(&modifies);
        Ok(())
    }

    /// Mirrors an applied batch into the memory lock table and the index
    /// wrappers. Runs under the writer's latches, after the engine write.
    fn post_apply(&self, modifies: &[Modify]) {
        for modify in modifies {
            match modify {
                Modify::Put(cf, key, value) if *cf == CF_LOCK => {
                    match (decode_lock_key(key), LockRecord::decode(value)) {
                        (Ok(user_key), Ok(lock)) => self.lock_table.insert(user_key, lock),
                        _ => error!("region {} applied an undecodable lock", self.region.id()),
                    }
                }
                Modify::Delete(cf, key) if *cf == CF_LOCK => {
                    if let Ok(user_key) = decode_lock_key(key) {
                        self.lock_table.remove(&user_key);
                    }
                }
                Modify::Put(cf, key, value) if *cf == CF_WRITE => {
                    let Ok((user_key, commit_ts)) = decode_ts_key(key) else {
                        error!("region {} applied an undecodable write key", self.region.id());
                        continue;
                    };
                    self.region.advance_txn_access_max_ts(commit_ts);
                    match WriteRecord::decode(value) {
                        Ok(write) => self.notify_index(&user_key, commit_ts, &write),
                        Err(err) => {
                            error!(
                                "region {} applied an undecodable write record: {}",
                                self.region.id(),
                                err
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn committed_value(&self, user_key: &Key, write: &WriteRecord) -> Option<Vec<u8>> {
        if let Some(value) = &write.short_value {
            return Some(value.clone());
        }
        match self.engine.get(CF_DATA, &user_key.encode_data(write.start_ts)) {
            Ok(value) => value,
            Err(err) => {
                error!("loading committed value of {}: {}", user_key, err);
                None
            }
        }
    }

    fn notify_index(&self, user_key: &Key, commit_ts: TimeStamp, write: &WriteRecord) {
        if self.vector_index.is_none() && self.document_index.is_none() {
            return;
        }
        // Only 8-byte entity-id keys are indexed rows.
        let Ok(id) = user_key.int_id() else { return };
        let deleted = match write.kind {
            WriteKind::Put => false,
            WriteKind::Delete => true,
            WriteKind::Rollback | WriteKind::Lock => return,
        };

        if let Some(wrapper) = &self.vector_index {
            let entry = if deleted {
                None
            } else {
                let Some(raw) = self.committed_value(user_key, write) else {
                    return;
                };
                match VectorWithId::decode(&raw) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        error!("undecodable vector row {}: {}", user_key, err);
                        return;
                    }
                }
            };
            if let Err(err) = wrapper.on_commit(id, entry, commit_ts) {
                error!("vector index on_commit for {}: {}", user_key, err);
            }
        } else if let Some(wrapper) = &self.document_index {
            let doc = if deleted {
                None
            } else {
                let Some(raw) = self.committed_value(user_key, write) else {
                    return;
                };
                match DocumentWithId::decode(&raw) {
                    Ok(doc) => Some(doc),
                    Err(err) => {
                        error!("undecodable document row {}: {}", user_key, err);
                        return;
                    }
                }
            };
            if let Err(err) = wrapper.on_commit(id, doc, commit_ts) {
                error!("document index on_commit for {}: {}", user_key, err);
            }
        }
    }

    // ---- read path -----------------------------------------------------

    /// Point read at `read_ts`. Lock conflicts come from the memory lock
    /// table and are surfaced, never waited on.
    pub fn get(
        &self,
        ctx: &RequestContext,
        key: &Key,
        read_ts: TimeStamp,
    ) -> ServerResult<Option<Vec<u8>>> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        self.check_keys(&meta, &[key])?;
        self.check_safe_point(read_ts)?;
        if ctx.isolation_level == IsolationLevel::SnapshotIsolation {
            if let Some(lock) = self.lock_table.check_key(key, read_ts, &ctx.resolved_locks) {
                return Err(engine::Error::KeyIsLocked(lock).into());
            }
        }
        self.region.advance_txn_access_max_ts(read_ts);
        let snapshot = self.engine.snapshot()?;
        let mut reader = MvccReader::new(snapshot);
        reader.get(key, read_ts).map_err(ServerError::from)
    }

    /// Range scan at `read_ts`. Scans asking for more than
    /// `stream_message_max_limit_size` rows are forced to stream: the first
    /// chunk comes back with a `stream_id` to resume with.
    pub fn scan(
        &self,
        ctx: &RequestContext,
        range: KeyRange,
        read_ts: TimeStamp,
        limit: usize,
    ) -> ServerResult<ScanResponse> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        if !range.is_valid() || range.start.is_empty() {
            return Err(ServerError::new(ErrorCode::RangeInvalid, "invalid scan range"));
        }
        if !meta.range.covers(&range) {
            return Err(ServerError::new(
                ErrorCode::EpochNotMatch,
                "scan range is outside the region",
            )
            .with_region((*meta).clone()));
        }
        self.check_safe_point(read_ts)?;
        self.region.advance_txn_access_max_ts(read_ts);

        let chunk_limit = limit.min(self.config.stream_message_max_limit_size);
        let snapshot = self.engine.snapshot()?;
        let mut cursor = StreamCursor {
            snapshot,
            read_ts,
            next_key: range.start.clone(),
            end_key: range.end.clone(),
            resolved_locks: ctx.resolved_locks.clone(),
        };
        let (pairs, finished) = self.scan_chunk(ctx, &mut cursor, chunk_limit)?;
        if finished {
            return Ok(ScanResponse {
                pairs,
                stream_id: None,
                finished: true,
            });
        }
        if limit > self.config.stream_message_max_limit_size {
            let stream_id = self.services.streams.register(cursor);
            return Ok(ScanResponse {
                pairs,
                stream_id: Some(stream_id),
                finished: false,
            });
        }
        Ok(ScanResponse {
            pairs,
            stream_id: None,
            finished: false,
        })
    }

    /// Resumes a streaming scan with a client-supplied per-chunk limit.
    pub fn stream_next(
        &self,
        ctx: &RequestContext,
        stream_id: u64,
        limit: usize,
    ) -> ServerResult<ScanResponse> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        let mut cursor = match self.services.streams.take(stream_id) {
            Ok(cursor) => cursor,
            Err(StreamTakeError::Expired) => {
                return Err(ServerError::new(
                    ErrorCode::StreamExpired,
                    format!("stream {} expired", stream_id),
                ));
            }
            Err(StreamTakeError::NotFound) => {
                return Err(ServerError::new(
                    ErrorCode::StreamExpired,
                    format!("stream {} is unknown", stream_id),
                ));
            }
            Err(StreamTakeError::Busy) => {
                return Err(ServerError::new(
                    ErrorCode::RequestFull,
                    format!("stream {} is serving another chunk", stream_id),
                ));
            }
        };
        let chunk_limit = limit.clamp(1, self.config.stream_message_max_limit_size);
        match self.scan_chunk(ctx, &mut cursor, chunk_limit) {
            Ok((pairs, finished)) => {
                if finished {
                    self.services.streams.finish(stream_id);
                    Ok(ScanResponse {
                        pairs,
                        stream_id: None,
                        finished: true,
                    })
                } else {
                    self.services.streams.put_back(stream_id, cursor);
                    Ok(ScanResponse {
                        pairs,
                        stream_id: Some(stream_id),
                        finished: false,
                    })
                }
            }
            Err(err) => {
                self.services.streams.finish(stream_id);
                Err(err)
            }
        }
    }

    fn scan_chunk(
        &self,
        ctx: &RequestContext,
        cursor: &mut StreamCursor<E::Snap>,
        limit: usize,
    ) -> ServerResult<(Vec<(Key, Vec<u8>)>, bool)> {
        if ctx.isolation_level == IsolationLevel::SnapshotIsolation {
            if let Some(lock) = self.lock_table.check_range(
                &cursor.next_key,
                &cursor.end_key,
                cursor.read_ts,
                &cursor.resolved_locks,
            ) {
                return Err(engine::Error::KeyIsLocked(lock).into());
            }
        }
        let mut reader = MvccReader::new(cursor.snapshot.clone());
        let (pairs, next) = reader
            .scan(
                &cursor.next_key,
                &cursor.end_key,
                cursor.read_ts,
                limit,
                &cursor.resolved_locks,
            )
            .map_err(ServerError::from)?;
        match next {
            Some(next_key) => {
                cursor.next_key = next_key;
                Ok((pairs, false))
            }
            None => Ok((pairs, true)),
        }
    }

    // ---- index operations ----------------------------------------------

    fn vector_wrapper(&self) -> ServerResult<&Arc<VectorIndexWrapper>> {
        self.vector_index.as_ref().ok_or_else(|| {
            ServerError::new(
                ErrorCode::IllegalParameter,
                format!("region {} has no vector index", self.region.id()),
            )
        })
    }

    fn document_wrapper(&self) -> ServerResult<&Arc<DocumentIndexWrapper>> {
        self.document_index.as_ref().ok_or_else(|| {
            ServerError::new(
                ErrorCode::IllegalParameter,
                format!("region {} has no document index", self.region.id()),
            )
        })
    }

    pub fn vector_search(
        &self,
        ctx: &RequestContext,
        query: &[f32],
        top_k: usize,
        filters: &[PreFilter],
        snapshot_ts: Option<TimeStamp>,
    ) -> ServerResult<Vec<ScoredEntry>> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        if let Some(ts) = snapshot_ts {
            self.check_safe_point(ts)?;
        }
        let wrapper = self.vector_wrapper()?;
        wrapper
            .search(query, top_k, filters, snapshot_ts)
            .map_err(ServerError::from)
    }

    /// Index searches are expensive; async dispatch uses the least-loaded
    /// read worker rather than round-robin.
    pub fn async_vector_search(
        &self,
        ctx: RequestContext,
        query: Vec<f32>,
        top_k: usize,
        filters: Vec<PreFilter>,
        snapshot_ts: Option<TimeStamp>,
        done: DoneCallback<Vec<ScoredEntry>>,
    ) {
        if !self.config.enable_async_search {
            done(self.vector_search(&ctx, &query, top_k, &filters, snapshot_ts));
            return;
        }
        let done = Arc::new(Mutex::new(Some(done)));
        let handoff = done.clone();
        let store = self.clone();
        let task = Box::new(move || {
            if let Some(done) = handoff.lock().unwrap().take() {
                done(store.vector_search(&ctx, &query, top_k, &filters, snapshot_ts));
            }
        });
        if self.services.read_pool.execute_least_queue(task).is_err() {
            if let Some(done) = done.lock().unwrap().take() {
                done(Err(ServerError::new(
                    ErrorCode::RequestFull,
                    "read pool is full",
                )));
            }
        }
    }

    pub fn vector_range_search(
        &self,
        ctx: &RequestContext,
        query: &[f32],
        radius: f32,
        filters: &[PreFilter],
    ) -> ServerResult<Vec<ScoredEntry>> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        let wrapper = self.vector_wrapper()?;
        wrapper
            .range_search(query, radius, filters)
            .map_err(ServerError::from)
    }

    pub fn vector_count(&self, ctx: &RequestContext) -> ServerResult<usize> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        Ok(self.vector_wrapper()?.count())
    }

    pub fn async_vector_count(&self, ctx: RequestContext, done: DoneCallback<usize>) {
        if !self.config.enable_async_count {
            done(self.vector_count(&ctx));
            return;
        }
        let done = Arc::new(Mutex::new(Some(done)));
        let handoff = done.clone();
        let store = self.clone();
        let task = Box::new(move || {
            if let Some(done) = handoff.lock().unwrap().take() {
                done(store.vector_count(&ctx));
            }
        });
        if self.services.read_pool.execute_rr(task).is_err() {
            if let Some(done) = done.lock().unwrap().take() {
                done(Err(ServerError::new(
                    ErrorCode::RequestFull,
                    "read pool is full",
                )));
            }
        }
    }

    pub fn document_search(
        &self,
        ctx: &RequestContext,
        query: &str,
        top_k: usize,
        filters: &[PreFilter],
        snapshot_ts: Option<TimeStamp>,
    ) -> ServerResult<Vec<ScoredEntry>> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        if let Some(ts) = snapshot_ts {
            self.check_safe_point(ts)?;
        }
        let wrapper = self.document_wrapper()?;
        wrapper
            .search(query, top_k, filters, snapshot_ts)
            .map_err(ServerError::from)
    }

    pub fn document_count(&self, ctx: &RequestContext) -> ServerResult<usize> {
        let meta = self.check_region(ctx)?;
        self.check_readable(&meta)?;
        Ok(self.document_wrapper()?.count())
    }

    /// Reindexes `[start, end)` from the live data CF, used after a split or
    /// when an index file fails its generation check.
    pub fn rebuild_vector_index(&self, start: &Key, end: &Key) -> ServerResult<usize> {
        let wrapper = self.vector_wrapper()?.clone();
        let rows = self.scan_index_rows(start, end, |raw| VectorWithId::decode(raw).ok())?;
        let count = rows.len();
        wrapper.rebuild_from_rows(rows).map_err(ServerError::from)?;
        Ok(count)
    }

    pub fn rebuild_document_index(&self, start: &Key, end: &Key) -> ServerResult<usize> {
        let wrapper = self.document_wrapper()?.clone();
        let rows = self.scan_index_rows(start, end, |raw| DocumentWithId::decode(raw).ok())?;
        let count = rows.len();
        wrapper.rebuild_from_rows(rows).map_err(ServerError::from)?;
        Ok(count)
    }

    fn scan_index_rows<T, F>(
        &self,
        start: &Key,
        end: &Key,
        decode: F,
    ) -> ServerResult<Vec<(T, TimeStamp)>>
    where
        F: Fn(&[u8]) -> Option<T>,
    {
        let snapshot = self.engine.snapshot()?;
        let mut reader = MvccReader::new(snapshot);
        let mut rows = vec![];
        let mut from = start.clone();
        loop {
            let (pairs, next) = reader
                .scan(&from, end, TimeStamp::max(), 1024, &[])
                .map_err(ServerError::from)?;
            for (key, raw) in pairs {
                let Some(row) = decode(&raw) else {
                    warn!("skipping undecodable indexed row {}", key);
                    continue;
                };
                let commit_ts = reader
                    .latest_write(&key)
                    .map_err(ServerError::from)?
                    .map(|(commit_ts, _)| commit_ts)
                    .unwrap_or_else(TimeStamp::zero);
                rows.push((row, commit_ts));
            }
            match next {
                Some(key) => from = key,
                None => break,
            }
        }
        Ok(rows)
    }

    // ---- gc, backup, lifecycle -----------------------------------------

    /// Publishes a new safe point and trims index version history under it.
    pub fn update_safe_point(&self, safe_point: TimeStamp) -> ServerResult<bool> {
        let advanced = self
            .services
            .safe_points
            .update(&self.engine, self.region.id(), safe_point)?;
        if advanced {
            if let Some(wrapper) = &self.vector_index {
                wrapper.truncate_versions(safe_point);
            }
            if let Some(wrapper) = &self.document_index {
                wrapper.truncate_versions(safe_point);
            }
        }
        Ok(advanced)
    }

    /// Runs a GC pass at the current safe point, yielding between batches.
    pub fn run_gc_now(&self) -> ServerResult<GcStats> {
        let safe_point = self.services.safe_points.get(self.region.id());
        if safe_point.is_zero() {
            return Ok(GcStats::default());
        }
        run_gc(&self.engine, safe_point, self.config.gc_batch_keys, || {
            std::thread::yield_now()
        })
        .map_err(ServerError::from)
    }

    /// Schedules a GC pass on the background worker at low priority.
    pub fn schedule_gc(&self) -> ServerResult<()> {
        let store = self.clone();
        let task = Box::new(move || {
            if let Err(err) = store.run_gc_now() {
                error!("background gc of region {} failed: {}", store.region.id(), err);
            }
        });
        if self.services.background_pool.execute_rr(task).is_err() {
            return Err(ServerError::new(
                ErrorCode::RequestFull,
                "background queue is full",
            ));
        }
        Ok(())
    }

    /// Backs the region's whole range up at `backup_ts`.
    pub fn backup<P: AsRef<Path>>(&self, path: P, backup_ts: TimeStamp) -> ServerResult<usize> {
        let meta = self.region.meta();
        let snapshot = self.engine.snapshot()?;
        backup::backup_range(snapshot, meta.id, &meta.range, backup_ts, path)
            .map_err(ServerError::from)
    }

    /// Restores a backup file into this region and reindexes if needed.
    pub fn restore<P: AsRef<Path>>(&self, path: P) -> ServerResult<usize> {
        let (_, restored) =
            backup::restore_file(&self.engine, path, self.config.short_value_threshold)
                .map_err(ServerError::from)?;
        let meta = self.region.meta();
        if self.vector_index.is_some() {
            self.rebuild_vector_index(&meta.range.start, &meta.range.end)?;
        }
        if self.document_index.is_some() {
            self.rebuild_document_index(&meta.range.start, &meta.range.end)?;
        }
        Ok(restored)
    }

    /// Walks the region through `Tombstone → Deleting → Deleted`, clearing
    /// every CF in range.
    pub fn destroy(&self) -> ServerResult<()> {
        self.region.transition(&self.engine, RegionState::Tombstone)?;
        self.region.transition(&self.engine, RegionState::Deleting)?;

        let meta = self.region.meta();
        let snapshot = self.engine.snapshot()?;
        let mut batch = WriteBatch::default();
        for cf in [CF_DATA, CF_LOCK, CF_WRITE] {
            let mut cursor = snapshot.iter(cf)?;
            cursor.seek(meta.range.start.as_encoded());
            while cursor.valid() {
                // Internal keys carry a suffix; range membership is decided
                // on the decoded user key.
                let user_key = if cf == CF_LOCK {
                    decode_lock_key(cursor.key())
                } else {
                    decode_ts_key(cursor.key()).map(|(key, _)| key)
                };
                match user_key {
                    Ok(user_key) if meta.range.contains(&user_key) => {
                        batch.delete(cf, cursor.key().to_vec());
                    }
                    _ => break,
                }
                cursor.next();
            }
        }
        self.engine.write(batch)?;
        self.lock_table.clear();
        self.region.transition(&self.engine, RegionState::Deleted)?;
        info!("region {} destroyed", self.region.id());
        Ok(())
    }
}
