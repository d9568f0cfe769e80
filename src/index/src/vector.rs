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

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, RwLock},
};

use kernel::TimeStamp;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    flat::FlatIndex,
    metric::MetricType,
    persist,
    types::{
        check_entity_id, matches_all, IndexState, PreFilter, ScoredEntry, VectorIndexParams,
        VectorIndexVariant, VectorWithId,
    },
};

/// The capability set every vector index variant provides. Implementations
/// hold only the current tip; MVCC history lives in the wrapper.
pub trait VectorIndex: Send + Sync {
    fn add(&mut self, entry: &VectorWithId) -> Result<()>;
    fn remove(&mut self, id: i64) -> bool;
    fn search(&self, query: &[f32], top_k: usize, filters: &[PreFilter])
        -> Result<Vec<ScoredEntry>>;
    /// `threshold` is already in the metric's native direction.
    fn range_search(
        &self,
        query: &[f32],
        threshold: f32,
        filters: &[PreFilter],
    ) -> Result<Vec<ScoredEntry>>;
    fn count(&self) -> usize;
    fn memory_size(&self) -> usize;
    fn dimension(&self) -> usize;
    fn metric_type(&self) -> MetricType;
}

fn build_handle(params: &VectorIndexParams) -> Result<Box<dyn VectorIndex>> {
    match params.variant {
        VectorIndexVariant::Flat => {
            Ok(Box::new(FlatIndex::new(params.dimension, params.metric)))
        }
        other => Err(Error::Build(format!(
            "vector index variant {:?} is not linked into this build",
            other
        ))),
    }
}

/// Committed versions of one id, ascending by commit timestamp. `None` marks
/// a delete.
type VersionChain = Vec<(TimeStamp, Option<VectorWithId>)>;

fn visible_at(chain: &VersionChain, ts: TimeStamp) -> Option<&VectorWithId> {
    chain
        .iter()
        .rev()
        .find(|(commit_ts, _)| *commit_ts <= ts)
        .and_then(|(_, entry)| entry.as_ref())
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    generation: u64,
    applied_max_ts: TimeStamp,
    versions: BTreeMap<i64, VersionChain>,
}

struct Inner {
    handle: Box<dyn VectorIndex>,
    versions: BTreeMap<i64, VersionChain>,
    applied_max_ts: TimeStamp,
    dirty: u64,
    generation: u64,
}

/// Ties a vector index to its region's MVCC timeline. Commits arrive exactly
/// once per key in commit order; searches run either at the tip (through the
/// variant handle) or at a snapshot timestamp (through the version chains,
/// which are exact for every variant).
///
/// The wrapper carries only its region's id, never a region handle, so the
/// region can own the wrapper without a reference cycle.
pub struct VectorIndexWrapper {
    region_id: u64,
    params: VectorIndexParams,
    save_threshold: u64,
    state: Mutex<IndexState>,
    inner: RwLock<Inner>,
}

impl VectorIndexWrapper {
    pub fn new(region_id: u64, params: VectorIndexParams, save_threshold: u64) -> VectorIndexWrapper {
        // The handle is replaced on build; starting from an empty flat index
        // keeps `Inner` shaped the same in every state.
        let handle = Box::new(FlatIndex::new(params.dimension, params.metric));
        VectorIndexWrapper {
            region_id,
            params,
            save_threshold,
            state: Mutex::new(IndexState::NotReady),
            inner: RwLock::new(Inner {
                handle,
                versions: BTreeMap::new(),
                applied_max_ts: TimeStamp::zero(),
                dirty: 0,
                generation: 0,
            }),
        }
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn state(&self) -> IndexState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock().unwrap() == IndexState::Ready
    }

    fn check_ready(&self) -> Result<()> {
        let state = self.state.lock().unwrap().clone();
        match state {
            IndexState::Ready => Ok(()),
            IndexState::BuildError => Err(Error::Build("index is in build-error state".to_owned())),
            other => Err(Error::NotReady(other)),
        }
    }

    /// Builds the variant handle from the recorded timeline and starts
    /// serving. Safe to call again after a build error.
    pub fn build(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                IndexState::Ready | IndexState::Building | IndexState::Rebuilding => return Ok(()),
                _ => *state = IndexState::Building,
            }
        }
        let result = self.populate_handle();
        let mut state = self.state.lock().unwrap();
        match result {
            Ok(count) => {
                info!(
                    "vector index of region {} built with {} live entries",
                    self.region_id, count
                );
                *state = IndexState::Ready;
                Ok(())
            }
            Err(err) => {
                error!(
                    "vector index build of region {} failed: {}",
                    self.region_id, err
                );
                *state = IndexState::BuildError;
                Err(err)
            }
        }
    }

    fn populate_handle(&self) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        let mut handle = build_handle(&self.params)?;
        let mut count = 0;
        for chain in inner.versions.values() {
            if let Some((_, Some(entry))) = chain.last() {
                handle.add(entry)?;
                count += 1;
            }
        }
        inner.handle = handle;
        Ok(count)
    }

    /// Applies one committed write. Called exactly once per key per commit,
    /// in commit order, while the committing request still holds its latches.
    pub fn on_commit(
        &self,
        id: i64,
        entry: Option<VectorWithId>,
        commit_ts: TimeStamp,
    ) -> Result<()> {
        check_entity_id(id)?;
        if let Some(entry) = &entry {
            if entry.values.len() != self.params.dimension {
                return Err(Error::DimensionMismatch {
                    expect: self.params.dimension,
                    got: entry.values.len(),
                });
            }
        }
        let mut inner = self.inner.write().unwrap();
        // Upsert is remove-then-add, both under the same write lock.
        inner.handle.remove(id);
        if let Some(entry) = &entry {
            inner.handle.add(entry)?;
        }
        let chain = inner.versions.entry(id).or_default();
        match chain.binary_search_by_key(&commit_ts, |(ts, _)| *ts) {
            Ok(pos) => chain[pos] = (commit_ts, entry),
            Err(pos) => chain.insert(pos, (commit_ts, entry)),
        }
        if commit_ts > inner.applied_max_ts {
            inner.applied_max_ts = commit_ts;
        }
        inner.dirty += 1;
        Ok(())
    }

    pub fn applied_max_ts(&self) -> TimeStamp {
        self.inner.read().unwrap().applied_max_ts
    }

    /// Top-k closest entries passing `filters`, at the tip or at
    /// `snapshot_ts`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &[PreFilter],
        snapshot_ts: Option<TimeStamp>,
    ) -> Result<Vec<ScoredEntry>> {
        self.check_ready()?;
        let inner = self.inner.read().unwrap();
        match snapshot_ts {
            Some(ts) if ts < inner.applied_max_ts => {
                if query.len() != self.params.dimension {
                    return Err(Error::DimensionMismatch {
                        expect: self.params.dimension,
                        got: query.len(),
                    });
                }
                let metric = self.params.metric;
                let mut hits: Vec<ScoredEntry> = inner
                    .versions
                    .iter()
                    .filter_map(|(id, chain)| visible_at(chain, ts).map(|entry| (*id, entry)))
                    .filter(|(id, entry)| matches_all(filters, *id, &entry.scalar_fields))
                    .map(|(id, entry)| ScoredEntry {
                        id,
                        distance: metric.score(query, &entry.values),
                    })
                    .collect();
                hits.sort_by(|a, b| metric.closer(a.distance, b.distance).then(a.id.cmp(&b.id)));
                hits.truncate(top_k);
                Ok(hits)
            }
            _ => inner.handle.search(query, top_k, filters),
        }
    }

    /// Every entry within `radius` of `query`, unordered. For similarity
    /// metrics (inner-product, cosine) the client-facing radius is
    /// distance-like and is transformed to a similarity lower bound of
    /// `1 - radius` before traversal.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        filters: &[PreFilter],
    ) -> Result<Vec<ScoredEntry>> {
        self.check_ready()?;
        let threshold = if self.params.metric.smaller_is_closer() {
            radius
        } else {
            1.0 - radius
        };
        let inner = self.inner.read().unwrap();
        inner.handle.range_search(query, threshold, filters)
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().handle.count()
    }

    pub fn memory_size(&self) -> usize {
        self.inner.read().unwrap().handle.memory_size()
    }

    pub fn dimension(&self) -> usize {
        self.params.dimension
    }

    pub fn metric_type(&self) -> MetricType {
        self.params.metric
    }

    /// Whether enough has changed since the last save to warrant one.
    pub fn need_to_save(&self, log_behind: u64) -> bool {
        let inner = self.inner.read().unwrap();
        inner.dirty >= self.save_threshold || log_behind >= self.save_threshold
    }

    /// Persists the timeline and bumps the generation. Returns the
    /// generation written, which the loader must present.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        inner.generation += 1;
        let snapshot = IndexSnapshot {
            generation: inner.generation,
            applied_max_ts: inner.applied_max_ts,
            versions: inner.versions.clone(),
        };
        persist::save(path.as_ref(), &snapshot)?;
        inner.dirty = 0;
        info!(
            "vector index of region {} saved at generation {}",
            self.region_id, inner.generation
        );
        Ok(inner.generation)
    }

    /// Loads a persisted timeline. The file's generation must match
    /// `expected_generation`; on mismatch the caller falls back to
    /// `rebuild_from_rows` over the live data CF.
    pub fn load<P: AsRef<Path>>(&self, path: P, expected_generation: u64) -> Result<()> {
        let snapshot: IndexSnapshot = persist::load(path.as_ref())?;
        if snapshot.generation != expected_generation {
            return Err(Error::GenerationMismatch {
                expect: expected_generation,
                found: snapshot.generation,
            });
        }
        {
            let mut inner = self.inner.write().unwrap();
            inner.versions = snapshot.versions;
            inner.applied_max_ts = snapshot.applied_max_ts;
            inner.generation = snapshot.generation;
            inner.dirty = 0;
        }
        *self.state.lock().unwrap() = IndexState::NotReady;
        self.build()
    }

    /// Discards the current state and reindexes from rows scanned out of the
    /// data CF, used after splits or corruption.
    pub fn rebuild_from_rows<I>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (VectorWithId, TimeStamp)>,
    {
        *self.state.lock().unwrap() = IndexState::Rebuilding;
        let result = (|| {
            let mut inner = self.inner.write().unwrap();
            inner.versions.clear();
            inner.applied_max_ts = TimeStamp::zero();
            let mut handle = build_handle(&self.params)?;
            for (entry, commit_ts) in rows {
                check_entity_id(entry.id)?;
                handle.remove(entry.id);
                handle.add(&entry)?;
                let chain = inner.versions.entry(entry.id).or_default();
                chain.push((commit_ts, Some(entry)));
                if commit_ts > inner.applied_max_ts {
                    inner.applied_max_ts = commit_ts;
                }
            }
            inner.handle = handle;
            inner.dirty = 0;
            Ok(())
        })();
        let mut state = self.state.lock().unwrap();
        match result {
            Ok(()) => {
                *state = IndexState::Ready;
                info!("vector index of region {} rebuilt", self.region_id);
                Ok(())
            }
            Err(err) => {
                *state = IndexState::BuildError;
                Err(err)
            }
        }
    }

    /// Drops version history that no reader at or above `safe_point` can
    /// observe anymore. The latest version at or below the safe point stays.
    pub fn truncate_versions(&self, safe_point: TimeStamp) {
        let mut inner = self.inner.write().unwrap();
        let mut emptied = vec![];
        for (id, chain) in inner.versions.iter_mut() {
            let keep_from = chain
                .iter()
                .rposition(|(ts, _)| *ts <= safe_point)
                .unwrap_or(0);
            chain.drain(..keep_from);
            // A chain reduced to one tombstone is dead weight.
            if chain.len() == 1 && chain[0].1.is_none() && chain[0].0 <= safe_point {
                emptied.push(*id);
            }
        }
        for id in emptied {
            inner.versions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(v: u64) -> TimeStamp {
        TimeStamp::new(v)
    }

    fn wrapper() -> VectorIndexWrapper {
        let wrapper = VectorIndexWrapper::new(
            1,
            VectorIndexParams::flat(4, MetricType::L2),
            10_000,
        );
        wrapper.build().unwrap();
        wrapper
    }

    #[test]
    fn test_not_ready_until_built() {
        let wrapper = VectorIndexWrapper::new(
            1,
            VectorIndexParams::flat(4, MetricType::L2),
            100,
        );
        assert!(matches!(
            wrapper.search(&[0.0; 4], 1, &[], None),
            Err(Error::NotReady(IndexState::NotReady))
        ));
        wrapper.build().unwrap();
        assert!(wrapper.is_ready());
        assert!(wrapper.search(&[0.0; 4], 1, &[], None).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_variant_reports_build_error() {
        let mut params = VectorIndexParams::flat(4, MetricType::L2);
        params.variant = VectorIndexVariant::Hnsw;
        params.hnsw_m = Some(16);
        let wrapper = VectorIndexWrapper::new(1, params, 100);
        assert!(wrapper.build().is_err());
        assert_eq!(wrapper.state(), IndexState::BuildError);
        assert!(matches!(
            wrapper.search(&[0.0; 4], 1, &[], None),
            Err(Error::Build(_))
        ));
    }

    #[test]
    fn test_upsert_and_snapshot_search() {
        let wrapper = wrapper();
        wrapper
            .on_commit(42, Some(VectorWithId::new(42, vec![1.0, 0.0, 0.0, 0.0])), ts(100))
            .unwrap();

        let hits = wrapper
            .search(&[1.0, 0.0, 0.0, 0.0], 1, &[], Some(ts(110)))
            .unwrap();
        assert_eq!(hits[0].id, 42);
        assert_eq!(hits[0].distance, 0.0);

        wrapper
            .on_commit(42, Some(VectorWithId::new(42, vec![0.0, 1.0, 0.0, 0.0])), ts(120))
            .unwrap();

        // The old snapshot still sees the old vector ...
        let hits = wrapper
            .search(&[1.0, 0.0, 0.0, 0.0], 1, &[], Some(ts(110)))
            .unwrap();
        assert_eq!(hits[0].id, 42);
        assert_eq!(hits[0].distance, 0.0);

        // ... while the tip sees the upsert.
        let hits = wrapper
            .search(&[1.0, 0.0, 0.0, 0.0], 1, &[], Some(ts(130)))
            .unwrap();
        assert_eq!(hits[0].id, 42);
        assert_eq!(hits[0].distance, 2.0);
    }

    #[test]
    fn test_delete_visibility() {
        let wrapper = wrapper();
        wrapper
            .on_commit(7, Some(VectorWithId::new(7, vec![0.0; 4])), ts(100))
            .unwrap();
        wrapper.on_commit(7, None, ts(200)).unwrap();

        assert!(wrapper.search(&[0.0; 4], 1, &[], None).unwrap().is_empty());
        let hits = wrapper.search(&[0.0; 4], 1, &[], Some(ts(150))).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(wrapper.count(), 0);
    }

    #[test]
    fn test_range_search_radius_transform() {
        let params = VectorIndexParams::flat(2, MetricType::Cosine);
        let wrapper = VectorIndexWrapper::new(1, params, 100);
        wrapper.build().unwrap();
        wrapper
            .on_commit(1, Some(VectorWithId::new(1, vec![1.0, 0.0])), ts(10))
            .unwrap();
        wrapper
            .on_commit(2, Some(VectorWithId::new(2, vec![0.0, 1.0])), ts(10))
            .unwrap();

        // radius 0.3 means cosine similarity >= 0.7: only the aligned vector.
        let hits = wrapper.range_search(&[1.0, 0.0], 0.3, &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn test_save_load_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector_1.idx");

        let wrapper = wrapper();
        wrapper
            .on_commit(1, Some(VectorWithId::new(1, vec![1.0, 2.0, 3.0, 4.0])), ts(50))
            .unwrap();
        let generation = wrapper.save(&path).unwrap();
        assert_eq!(generation, 1);

        let restored = VectorIndexWrapper::new(
            1,
            VectorIndexParams::flat(4, MetricType::L2),
            10_000,
        );
        restored.load(&path, generation).unwrap();
        assert!(restored.is_ready());
        assert_eq!(restored.count(), 1);
        assert_eq!(restored.applied_max_ts(), ts(50));

        // A stale generation is refused; the caller rebuilds instead.
        let stale = VectorIndexWrapper::new(
            1,
            VectorIndexParams::flat(4, MetricType::L2),
            10_000,
        );
        assert!(matches!(
            stale.load(&path, generation + 1),
            Err(Error::GenerationMismatch { .. })
        ));
    }

    #[test]
    fn test_rebuild_from_rows() {
        let wrapper = wrapper();
        wrapper
            .on_commit(1, Some(VectorWithId::new(1, vec![9.0; 4])), ts(10))
            .unwrap();
        wrapper
            .rebuild_from_rows(vec![
                (VectorWithId::new(5, vec![1.0; 4]), ts(30)),
                (VectorWithId::new(6, vec![2.0; 4]), ts(40)),
            ])
            .unwrap();
        assert_eq!(wrapper.count(), 2);
        assert!(wrapper
            .search(&[9.0; 4], 1, &[], None)
            .unwrap()
            .iter()
            .all(|hit| hit.id != 1));
        assert_eq!(wrapper.applied_max_ts(), ts(40));
    }

    #[test]
    fn test_need_to_save() {
        let wrapper = VectorIndexWrapper::new(
            1,
            VectorIndexParams::flat(2, MetricType::L2),
            3,
        );
        wrapper.build().unwrap();
        assert!(!wrapper.need_to_save(0));
        for id in 1..=3 {
            wrapper
                .on_commit(id, Some(VectorWithId::new(id, vec![0.0, 0.0])), ts(id as u64))
                .unwrap();
        }
        assert!(wrapper.need_to_save(0));
        assert!(wrapper.need_to_save(10));
    }

    #[test]
    fn test_truncate_versions() {
        let wrapper = wrapper();
        for (version, at) in [(1.0f32, 10u64), (2.0, 20), (3.0, 30)] {
            wrapper
                .on_commit(1, Some(VectorWithId::new(1, vec![version; 4])), ts(at))
                .unwrap();
        }
        wrapper.on_commit(2, Some(VectorWithId::new(2, vec![0.0; 4])), ts(10)).unwrap();
        wrapper.on_commit(2, None, ts(15)).unwrap();

        wrapper.truncate_versions(ts(25));
        // Version at 20 is the latest at or below the safe point; 10 is gone.
        let hits = wrapper.search(&[2.0; 4], 1, &[], Some(ts(25))).unwrap();
        assert_eq!(hits[0].distance, 0.0);
        // The fully deleted id's chain was dropped entirely.
        let hits = wrapper.search(&[0.0; 4], 5, &[], Some(ts(12))).unwrap();
        assert!(hits.iter().all(|hit| hit.id != 2));
    }
}
