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
    collections::HashMap,
    sync::RwLock,
};

use kernel::{
    coding::{decode_fixed_64, put_fixed_64},
    Result, TimeStamp,
};
use storage::{Cursor, Engine, Snapshot, WriteBatch, CF_META};

const SAFE_POINT_PREFIX: &[u8] = b"store_gc_safe_point/";

fn safe_point_key(region_id: u64) -> Vec<u8> {
    let mut key = SAFE_POINT_PREFIX.to_vec();
    put_fixed_64(&mut key, region_id);
    key
}

/// The per-region GC low-watermark published by the coordinator. Reads below
/// it are refused; GC may physically remove anything beneath it. Strictly
/// monotone, persisted in the meta CF, reloaded on restart.
pub struct SafePointMap {
    points: RwLock<HashMap<u64, TimeStamp>>,
}

impl Default for SafePointMap {
    fn default() -> SafePointMap {
        SafePointMap::new()
    }
}

impl SafePointMap {
    pub fn new() -> SafePointMap {
        SafePointMap {
            points: RwLock::new(HashMap::new()),
        }
    }

    /// Reloads every persisted safe point, used on restart.
    pub fn load<E: Engine>(engine: &E) -> Result<SafePointMap> {
        let snapshot = engine.snapshot()?;
        let mut cursor = snapshot.iter(CF_META)?;
        cursor.seek(SAFE_POINT_PREFIX);
        let mut points = HashMap::new();
        while cursor.valid() && cursor.key().starts_with(SAFE_POINT_PREFIX) {
            let region_id = decode_fixed_64(&cursor.key()[SAFE_POINT_PREFIX.len()..]);
            let ts = TimeStamp::new(decode_fixed_64(cursor.value()));
            points.insert(region_id, ts);
            cursor.next();
        }
        Ok(SafePointMap {
            points: RwLock::new(points),
        })
    }

    pub fn get(&self, region_id: u64) -> TimeStamp {
        self.points
            .read()
            .unwrap()
            .get(&region_id)
            .copied()
            .unwrap_or_else(TimeStamp::zero)
    }

    /// Advances a region's safe point. Regressions are ignored, not errors:
    /// the coordinator may replay an older publication after a restart.
    /// Returns whether the watermark moved.
    pub fn update<E: Engine>(&self, engine: &E, region_id: u64, ts: TimeStamp) -> Result<bool> {
        {
            let points = self.points.read().unwrap();
            if points.get(&region_id).copied().unwrap_or_else(TimeStamp::zero) >= ts {
                return Ok(false);
            }
        }
        let mut encoded = vec![];
        put_fixed_64(&mut encoded, ts.into_inner());
        let mut batch = WriteBatch::default();
        batch.put(CF_META, safe_point_key(region_id), encoded);
        engine.write(batch)?;

        let mut points = self.points.write().unwrap();
        let entry = points.entry(region_id).or_insert_with(TimeStamp::zero);
        if *entry >= ts {
            return Ok(false);
        }
        *entry = ts;
        info!("region {} gc safe point advanced to {}", region_id, ts);
        Ok(true)
    }

    /// Refuses reads beneath the watermark; GC may already have removed the
    /// versions such a read would need.
    pub fn check_read_ts(&self, region_id: u64, read_ts: TimeStamp) -> std::result::Result<(), TimeStamp> {
        let safe_point = self.get(region_id);
        if read_ts < safe_point {
            Err(safe_point)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use storage::MemEngine;

    use super::*;

    #[test]
    fn test_monotone_updates() {
        let engine = MemEngine::new();
        let map = SafePointMap::new();
        assert!(map.update(&engine, 1, TimeStamp::new(100)).unwrap());
        assert!(!map.update(&engine, 1, TimeStamp::new(50)).unwrap());
        assert!(!map.update(&engine, 1, TimeStamp::new(100)).unwrap());
        assert!(map.update(&engine, 1, TimeStamp::new(200)).unwrap());
        assert_eq!(map.get(1), TimeStamp::new(200));
        assert_eq!(map.get(2), TimeStamp::zero());
    }

    #[test]
    fn test_read_ts_gate() {
        let engine = MemEngine::new();
        let map = SafePointMap::new();
        map.update(&engine, 1, TimeStamp::new(100)).unwrap();
        assert!(map.check_read_ts(1, TimeStamp::new(100)).is_ok());
        assert!(map.check_read_ts(1, TimeStamp::new(150)).is_ok());
        assert_eq!(map.check_read_ts(1, TimeStamp::new(99)), Err(TimeStamp::new(100)));
    }

    #[test]
    fn test_reload_after_restart() {
        let engine = MemEngine::new();
        {
            let map = SafePointMap::new();
            map.update(&engine, 1, TimeStamp::new(100)).unwrap();
            map.update(&engine, 9, TimeStamp::new(70)).unwrap();
        }
        let reloaded = SafePointMap::load(&engine).unwrap();
        assert_eq!(reloaded.get(1), TimeStamp::new(100));
        assert_eq!(reloaded.get(9), TimeStamp::new(70));
    }
}
