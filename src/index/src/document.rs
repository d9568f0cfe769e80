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
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Mutex, RwLock},
};

use kernel::TimeStamp;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    persist,
    types::{check_entity_id, matches_all, DocumentWithId, IndexState, PreFilter, ScalarValue,
        ScoredEntry},
};

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}

/// Term-frequency scoring over every text field of a document.
fn score_doc(doc: &DocumentWithId, query_tokens: &[String]) -> f32 {
    let mut frequencies: HashMap<&str, u32> = HashMap::new();
    for value in doc.fields.values() {
        if let ScalarValue::Text(text) = value {
            for token in tokenize(text) {
                if let Some(query) = query_tokens.iter().find(|q| **q == token) {
                    *frequencies.entry(query.as_str()).or_default() += 1;
                }
            }
        }
    }
    frequencies.values().map(|tf| *tf as f32).sum()
}

#[derive(Default)]
struct InvertedIndex {
    // token -> doc id -> term frequency
    postings: HashMap<String, BTreeMap<i64, u32>>,
    docs: HashMap<i64, DocumentWithId>,
}

impl InvertedIndex {
    fn add(&mut self, doc: &DocumentWithId) {
        self.remove(doc.id);
        for value in doc.fields.values() {
            if let ScalarValue::Text(text) = value {
                for token in tokenize(text) {
                    *self
                        .postings
                        .entry(token)
                        .or_default()
                        .entry(doc.id)
                        .or_default() += 1;
                }
            }
        }
        self.docs.insert(doc.id, doc.clone());
    }

    fn remove(&mut self, id: i64) -> bool {
        if self.docs.remove(&id).is_none() {
            return false;
        }
        self.postings.retain(|_, posting| {
            posting.remove(&id);
            !posting.is_empty()
        });
        true
    }

    fn search(&self, query: &str, top_k: usize, filters: &[PreFilter]) -> Vec<ScoredEntry> {
        let query_tokens: Vec<String> = tokenize(query).collect();
        let mut scores: BTreeMap<i64, f32> = BTreeMap::new();
        for token in &query_tokens {
            if let Some(posting) = self.postings.get(token) {
                for (id, tf) in posting {
                    *scores.entry(*id).or_default() += *tf as f32;
                }
            }
        }
        let mut hits: Vec<ScoredEntry> = scores
            .into_iter()
            .filter(|(id, _)| {
                self.docs
                    .get(id)
                    .is_some_and(|doc| matches_all(filters, *id, &doc.fields))
            })
            .map(|(id, score)| ScoredEntry {
                id,
                distance: score,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.distance
                .partial_cmp(&a.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        hits
    }

    fn memory_size(&self) -> usize {
        let postings: usize = self
            .postings
            .iter()
            .map(|(token, posting)| token.len() + posting.len() * 12)
            .sum();
        postings + self.docs.len() * std::mem::size_of::<DocumentWithId>()
    }
}

type VersionChain = Vec<(TimeStamp, Option<DocumentWithId>)>;

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    generation: u64,
    applied_max_ts: TimeStamp,
    versions: BTreeMap<i64, VersionChain>,
}

struct Inner {
    index: InvertedIndex,
    versions: BTreeMap<i64, VersionChain>,
    applied_max_ts: TimeStamp,
    dirty: u64,
    generation: u64,
}

/// The document-side sibling of `VectorIndexWrapper`: an inverted text index
/// over scalar fields, fed by committed writes, searchable at the tip or at
/// an MVCC snapshot.
pub struct DocumentIndexWrapper {
    region_id: u64,
    save_threshold: u64,
    state: Mutex<IndexState>,
    inner: RwLock<Inner>,
}

impl DocumentIndexWrapper {
    pub fn new(region_id: u64, save_threshold: u64) -> DocumentIndexWrapper {
        DocumentIndexWrapper {
            region_id,
            save_threshold,
            state: Mutex::new(IndexState::NotReady),
            inner: RwLock::new(Inner {
                index: InvertedIndex::default(),
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

    pub fn build(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                IndexState::Ready | IndexState::Building | IndexState::Rebuilding => return Ok(()),
                _ => *state = IndexState::Building,
            }
        }
        {
            let mut inner = self.inner.write().unwrap();
            let mut index = InvertedIndex::default();
            for chain in inner.versions.values() {
                if let Some((_, Some(doc))) = chain.last() {
                    index.add(doc);
                }
            }
            inner.index = index;
        }
        *self.state.lock().unwrap() = IndexState::Ready;
        info!("document index of region {} built", self.region_id);
        Ok(())
    }

    /// One committed write, delivered in commit order per key.
    pub fn on_commit(
        &self,
        id: i64,
        doc: Option<DocumentWithId>,
        commit_ts: TimeStamp,
    ) -> Result<()> {
        check_entity_id(id)?;
        let mut inner = self.inner.write().unwrap();
        match &doc {
            Some(doc) => inner.index.add(doc),
            None => {
                inner.index.remove(id);
            }
        }
        let chain = inner.versions.entry(id).or_default();
        match chain.binary_search_by_key(&commit_ts, |(ts, _)| *ts) {
            Ok(pos) => chain[pos] = (commit_ts, doc),
            Err(pos) => chain.insert(pos, (commit_ts, doc)),
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

    /// Top-k documents matching `query`, best score first.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &[PreFilter],
        snapshot_ts: Option<TimeStamp>,
    ) -> Result<Vec<ScoredEntry>> {
        self.check_ready()?;
        let inner = self.inner.read().unwrap();
        match snapshot_ts {
            Some(ts) if ts < inner.applied_max_ts => {
                let query_tokens: Vec<String> = tokenize(query).collect();
                let mut hits: Vec<ScoredEntry> = inner
                    .versions
                    .iter()
                    .filter_map(|(id, chain)| {
                        chain
                            .iter()
                            .rev()
                            .find(|(commit_ts, _)| *commit_ts <= ts)
                            .and_then(|(_, doc)| doc.as_ref())
                            .map(|doc| (*id, doc))
                    })
                    .filter(|(id, doc)| matches_all(filters, *id, &doc.fields))
                    .map(|(id, doc)| ScoredEntry {
                        id,
                        distance: score_doc(doc, &query_tokens),
                    })
                    .filter(|hit| hit.distance > 0.0)
                    .collect();
                hits.sort_by(|a, b| {
                    b.distance
                        .partial_cmp(&a.distance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.id.cmp(&b.id))
                });
                hits.truncate(top_k);
                Ok(hits)
            }
            _ => Ok(inner.index.search(query, top_k, filters)),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().index.docs.len()
    }

    pub fn memory_size(&self) -> usize {
        self.inner.read().unwrap().index.memory_size()
    }

    pub fn need_to_save(&self, log_behind: u64) -> bool {
        let inner = self.inner.read().unwrap();
        inner.dirty >= self.save_threshold || log_behind >= self.save_threshold
    }

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
        Ok(inner.generation)
    }

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

    pub fn rebuild_from_rows<I>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (DocumentWithId, TimeStamp)>,
    {
        *self.state.lock().unwrap() = IndexState::Rebuilding;
        let result = (|| {
            let mut inner = self.inner.write().unwrap();
            inner.versions.clear();
            inner.applied_max_ts = TimeStamp::zero();
            inner.index = InvertedIndex::default();
            for (doc, commit_ts) in rows {
                check_entity_id(doc.id)?;
                inner.index.add(&doc);
                let id = doc.id;
                let chain = inner.versions.entry(id).or_default();
                chain.push((commit_ts, Some(doc)));
                if commit_ts > inner.applied_max_ts {
                    inner.applied_max_ts = commit_ts;
                }
            }
            inner.dirty = 0;
            Ok(())
        })();
        let mut state = self.state.lock().unwrap();
        match result {
            Ok(()) => {
                *state = IndexState::Ready;
                info!("document index of region {} rebuilt", self.region_id);
                Ok(())
            }
            Err(err) => {
                *state = IndexState::BuildError;
                Err(err)
            }
        }
    }

    pub fn truncate_versions(&self, safe_point: TimeStamp) {
        let mut inner = self.inner.write().unwrap();
        let mut emptied = vec![];
        for (id, chain) in inner.versions.iter_mut() {
            let keep_from = chain
                .iter()
                .rposition(|(ts, _)| *ts <= safe_point)
                .unwrap_or(0);
            chain.drain(..keep_from);
            if chain.len() == 1 && chain[0].1.is_none() && chain[0].0 <= safe_point {
                emptied.push(*id);
            }
        }
        for id in emptied {
            inner.versions.remove(&id);
        }
    }
}
