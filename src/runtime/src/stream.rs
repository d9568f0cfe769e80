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

//! Server-side cursors for large scans. A stream pins the snapshot its first
//! chunk was served from, so every chunk observes the same MVCC state; idle
//! streams expire on a TTL.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use kernel::{Key, TimeStamp};

#[derive(Debug)]
pub struct StreamCursor<S> {
    pub snapshot: S,
    pub read_ts: TimeStamp,
    pub next_key: Key,
    pub end_key: Key,
    pub resolved_locks: Vec<TimeStamp>,
}

struct StreamSlot<S> {
    cursor: Option<StreamCursor<S>>,
    deadline: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StreamTakeError {
    Expired,
    NotFound,
    /// A chunk for this stream is already being served.
    Busy,
}

pub struct StreamManager<S> {
    streams: Mutex<HashMap<u64, StreamSlot<S>>>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl<S> StreamManager<S> {
    pub fn new(ttl: Duration) -> StreamManager<S> {
        StreamManager {
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a new stream and returns its id.
    pub fn register(&self, cursor: StreamCursor<S>) -> u64 {
        self.sweep();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = StreamSlot {
            cursor: Some(cursor),
            deadline: Instant::now() + self.ttl,
        };
        self.streams.lock().unwrap().insert(id, slot);
        debug!("stream {} registered", id);
        id
    }

    /// Takes the cursor out for one chunk. The caller must `put_back` or
    /// `finish` it.
    pub fn take(&self, id: u64) -> Result<StreamCursor<S>, StreamTakeError> {
        let mut streams = self.streams.lock().unwrap();
        match streams.get_mut(&id) {
            None => Err(StreamTakeError::NotFound),
            Some(slot) if slot.deadline < Instant::now() => {
                streams.remove(&id);
                Err(StreamTakeError::Expired)
            }
            Some(slot) => slot.cursor.take().ok_or(StreamTakeError::Busy),
        }
    }

    /// Returns the cursor after a chunk and refreshes the TTL.
    pub fn put_back(&self, id: u64, cursor: StreamCursor<S>) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(slot) = streams.get_mut(&id) {
            slot.cursor = Some(cursor);
            slot.deadline = Instant::now() + self.ttl;
        }
    }

    /// Drops a finished (or abandoned) stream.
    pub fn finish(&self, id: u64) {
        self.streams.lock().unwrap().remove(&id);
        debug!("stream {} finished", id);
    }

    /// Drops every expired stream.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.streams
            .lock()
            .unwrap()
            .retain(|_, slot| slot.deadline >= now);
    }
}
