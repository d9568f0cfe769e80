//! The brute-force reference index: exact, always available, and the
//! baseline the approximate variants are validated against.

use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    metric::MetricType,
    types::{matches_all, PreFilter, ScoredEntry, VectorWithId},
    vector::VectorIndex,
};

pub struct FlatIndex {
    dimension: usize,
    metric: MetricType,
    entries: HashMap<i64, VectorWithId>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: MetricType) -> FlatIndex {
        FlatIndex {
            dimension,
            metric,
            entries: HashMap::new(),
        }
    }

    fn check_dimension(&self, got: usize) -> Result<()> {
        if got != self.dimension {
            return Err(Error::DimensionMismatch {
                expect: self.dimension,
                got,
            });
        }
        Ok(())
    }

    fn scored<'a>(
        &'a self,
        query: &'a [f32],
        filters: &'a [PreFilter],
    ) -> impl Iterator<Item = ScoredEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| matches_all(filters, entry.id, &entry.scalar_fields))
            .map(move |entry| ScoredEntry {
                id: entry.id,
                distance: self.metric.score(query, &entry.values),
            })
    }
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, entry: &VectorWithId) -> Result<()> {
        self.check_dimension(entry.values.len())?;
        self.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn remove(&mut self, id: i64) -> bool {
        self.entries.remove(&id).is_some()
    }

    fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &[PreFilter],
    ) -> Result<Vec<ScoredEntry>> {
        self.check_dimension(query.len())?;
        let mut hits: Vec<ScoredEntry> = self.scored(query, filters).collect();
        hits.sort_by(|a, b| {
            self.metric
                .closer(a.distance, b.distance)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn range_search(
        &self,
        query: &[f32],
        threshold: f32,
        filters: &[PreFilter],
    ) -> Result<Vec<ScoredEntry>> {
        self.check_dimension(query.len())?;
        let within = |score: f32| {
            if self.metric.smaller_is_closer() {
                score <= threshold
            } else {
                score >= threshold
            }
        };
        Ok(self
            .scored(query, filters)
            .filter(|hit| within(hit.distance))
            .collect())
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    fn memory_size(&self) -> usize {
        self.entries
            .values()
            .map(|entry| {
                std::mem::size_of::<VectorWithId>()
                    + entry.values.len() * std::mem::size_of::<f32>()
            })
            .sum()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric_type(&self) -> MetricType {
        self.metric
    }
}
