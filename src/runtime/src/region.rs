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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use kernel::{coding::put_fixed_64, Error, Key, KeyRange, Result, TimeStamp};
use serde::{Deserialize, Serialize};
use storage::{Cursor, Engine, Snapshot, WriteBatch, CF_META};

/// Reserved internal prefixes in the meta CF.
pub const REGION_META_PREFIX: &[u8] = b"store_region_meta/";
pub const REGION_CHANGE_PREFIX: &[u8] = b"region_change_record/";
pub const RAFT_META_PREFIX: &[u8] = b"store_raft_meta/";

/// `(version, conf_version)`: the logical configuration of a region.
/// `version` moves on every range mutation, `conf_version` on every peer
/// change. Clients must present a current pair to be served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub version: u64,
    pub conf_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub store_id: u64,
    pub peer_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    New,
    Normal,
    Splitting,
    Merging,
    Tombstone,
    Deleting,
    Deleted,
}

impl RegionState {
    fn can_transition_to(self, next: RegionState) -> bool {
        use RegionState::*;
        matches!(
            (self, next),
            (New, Normal)
                | (Normal, Splitting)
                | (Normal, Merging)
                | (Normal, Tombstone)
                | (Splitting, Normal)
                | (Merging, Normal)
                | (Splitting, Tombstone)
                | (Merging, Tombstone)
                | (Tombstone, Deleting)
                | (Deleting, Deleted)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMeta {
    pub id: u64,
    pub epoch: RegionEpoch,
    pub range: KeyRange,
    pub peers: Vec<Peer>,
    pub state: RegionState,
    pub leader: bool,
    /// Writes are rejected while a split/merge holds this.
    pub disable_change: bool,
    pub temporary_disable_change: bool,
}

impl RegionMeta {
    pub fn new(id: u64, range: KeyRange) -> RegionMeta {
        RegionMeta {
            id,
            epoch: RegionEpoch {
                version: 1,
                conf_version: 1,
            },
            range,
            peers: vec![],
            state: RegionState::New,
            leader: true,
            disable_change: false,
            temporary_disable_change: false,
        }
    }
}

fn region_meta_key(id: u64) -> Vec<u8> {
    let mut key = REGION_META_PREFIX.to_vec();
    put_fixed_64(&mut key, id);
    key
}

fn region_change_key(id: u64, seq: u64) -> Vec<u8> {
    let mut key = REGION_CHANGE_PREFIX.to_vec();
    put_fixed_64(&mut key, id);
    put_fixed_64(&mut key, seq);
    key
}

/// One region's live meta. Mutations go through a copy-swap so readers take
/// a cheap `Arc` clone and never block behind a writer.
pub struct Region {
    meta: RwLock<Arc<RegionMeta>>,
    change_seq: AtomicU64,
    raw_applied_max_ts: AtomicU64,
    txn_access_max_ts: AtomicU64,
}

impl Region {
    pub fn new(meta: RegionMeta) -> Region {
        Region {
            meta: RwLock::new(Arc::new(meta)),
            change_seq: AtomicU64::new(0),
            raw_applied_max_ts: AtomicU64::new(0),
            txn_access_max_ts: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.meta().id
    }

    /// The current meta snapshot.
    pub fn meta(&self) -> Arc<RegionMeta> {
        self.meta.read().unwrap().clone()
    }

    pub fn raw_applied_max_ts(&self) -> TimeStamp {
        TimeStamp::new(self.raw_applied_max_ts.load(Ordering::Acquire))
    }

    pub fn txn_access_max_ts(&self) -> TimeStamp {
        TimeStamp::new(self.txn_access_max_ts.load(Ordering::Acquire))
    }

    /// Both high-water marks only move forward.
    pub fn advance_raw_applied_max_ts(&self, ts: TimeStamp) {
        self.raw_applied_max_ts
            .fetch_max(ts.into_inner(), Ordering::AcqRel);
    }

    pub fn advance_txn_access_max_ts(&self, ts: TimeStamp) {
        self.txn_access_max_ts
            .fetch_max(ts.into_inner(), Ordering::AcqRel);
    }

    /// Applies `mutate` to a copy of the meta, swaps it in, persists it, and
    /// appends a change record.
    pub fn update_meta<E, F>(&self, engine: &E, mutate: F) -> Result<Arc<RegionMeta>>
    where
        E: Engine,
        F: FnOnce(&mut RegionMeta),
    {
        let mut guard = self.meta.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);
        let next = Arc::new(next);
        persist_meta_with_change(engine, &next, self.change_seq.fetch_add(1, Ordering::Relaxed))?;
        *guard = next.clone();
        Ok(next)
    }

    /// Moves the region to `next` if the lifecycle allows it.
    pub fn transition<E: Engine>(&self, engine: &E, next: RegionState) -> Result<Arc<RegionMeta>> {
        let current = self.meta().state;
        if !current.can_transition_to(next) {
            return Err(Error::InvalidArgument(format!(
                "region {} cannot move from {:?} to {:?}",
                self.id(),
                current,
                next
            )));
        }
        info!("region {} state {:?} -> {:?}", self.id(), current, next);
        self.update_meta(engine, |meta| meta.state = next)
    }

    /// Shrinks (or replaces) the served range, bumping `epoch.version` the
    /// way a split commit does.
    pub fn update_range<E: Engine>(&self, engine: &E, range: KeyRange) -> Result<Arc<RegionMeta>> {
        if !range.is_valid() {
            return Err(Error::InvalidArgument("invalid region range".to_owned()));
        }
        self.update_meta(engine, |meta| {
            meta.range = range;
            meta.epoch.version += 1;
        })
    }

    /// Range membership is always checked on encoded keys; raw client bytes
    /// never reach this point. A key too short to be encoded is rejected
    /// rather than compared.
    pub fn check_key_in_range(&self, key: &Key) -> Result<()> {
        key.validate()?;
        let meta = self.meta();
        if meta.range.contains(key) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "key {} is outside region {}",
                key,
                meta.id
            )))
        }
    }
}

fn persist_meta_with_change<E: Engine>(engine: &E, meta: &RegionMeta, seq: u64) -> Result<()> {
    let encoded = bincode::serialize(meta)
        .map_err(|err| Error::Corruption(format!("region meta serialization: {}", err)))?;
    let mut batch = WriteBatch::default();
    batch.put(CF_META, region_meta_key(meta.id), encoded.clone());
    batch.put(CF_META, region_change_key(meta.id, seq), encoded);
    engine.write(batch)
}

/// Persists a freshly assigned region meta (no change record yet).
pub fn persist_meta<E: Engine>(engine: &E, meta: &RegionMeta) -> Result<()> {
    let encoded = bincode::serialize(meta)
        .map_err(|err| Error::Corruption(format!("region meta serialization: {}", err)))?;
    let mut batch = WriteBatch::default();
    batch.put(CF_META, region_meta_key(meta.id), encoded);
    engine.write(batch)
}

/// Replays every persisted region meta, used on restart.
pub fn load_all_metas<E: Engine>(engine: &E) -> Result<Vec<RegionMeta>> {
    let snapshot = engine.snapshot()?;
    let mut cursor = snapshot.iter(CF_META)?;
    cursor.seek(REGION_META_PREFIX);
    let mut metas = vec![];
    while cursor.valid() && cursor.key().starts_with(REGION_META_PREFIX) {
        let meta: RegionMeta = bincode::deserialize(cursor.value())
            .map_err(|err| Error::Corruption(format!("region meta deserialization: {}", err)))?;
        metas.push(meta);
        cursor.next();
    }
    Ok(metas)
}
