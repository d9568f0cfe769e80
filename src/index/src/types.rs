use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Entity ids must be positive and leave headroom below `i64::MAX`, which is
/// reserved as an unbounded scan sentinel.
pub fn check_entity_id(id: i64) -> Result<()> {
    if id <= 0 || id == i64::MAX {
        return Err(Error::InvalidId(id));
    }
    Ok(())
}

/// A scalar attribute attached to a vector or document row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// A vector row as stored in the data CF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorWithId {
    pub id: i64,
    pub values: Vec<f32>,
    pub scalar_fields: HashMap<String, ScalarValue>,
}

impl VectorWithId {
    pub fn new(id: i64, values: Vec<f32>) -> VectorWithId {
        VectorWithId {
            id,
            values,
            scalar_fields: HashMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<VectorWithId> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// A document row as stored in the data CF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentWithId {
    pub id: i64,
    pub fields: HashMap<String, ScalarValue>,
}

impl DocumentWithId {
    pub fn new(id: i64) -> DocumentWithId {
        DocumentWithId {
            id,
            fields: HashMap::new(),
        }
    }

    pub fn with_text(mut self, field: &str, text: &str) -> DocumentWithId {
        self.fields
            .insert(field.to_owned(), ScalarValue::Text(text.to_owned()));
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<DocumentWithId> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// Lifecycle of an index wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    NotReady,
    Building,
    Ready,
    Rebuilding,
    BuildError,
}

/// A predicate the index honors while enumerating candidates, so top-k is
/// taken over the filtered set rather than filtered afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreFilter {
    /// Inclusive id bounds.
    IdRange { min: i64, max: i64 },
    IdIn(Vec<i64>),
    ScalarEq { field: String, value: ScalarValue },
}

impl PreFilter {
    pub fn matches(&self, id: i64, fields: &HashMap<String, ScalarValue>) -> bool {
        match self {
            PreFilter::IdRange { min, max } => id >= *min && id <= *max,
            PreFilter::IdIn(ids) => ids.contains(&id),
            PreFilter::ScalarEq { field, value } => fields.get(field) == Some(value),
        }
    }
}

pub fn matches_all(filters: &[PreFilter], id: i64, fields: &HashMap<String, ScalarValue>) -> bool {
    filters.iter().all(|filter| filter.matches(id, fields))
}

/// One search hit. `distance` is the metric's raw score: squared euclidean
/// for L2 (smaller is closer), similarity for inner-product and cosine
/// (larger is closer).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub id: i64,
    pub distance: f32,
}

/// The index variants a region may carry. Only `Flat` is served in-process;
/// the others are declared so configuration round-trips and report a build
/// error until their engines are linked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorIndexVariant {
    Flat,
    Hnsw,
    IvfFlat,
    DiskAnn,
}

/// Per-variant construction parameters, kept separate from the wrapper so
/// configuration can be serialized independent of the live index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexParams {
    pub variant: VectorIndexVariant,
    pub dimension: usize,
    pub metric: crate::metric::MetricType,
    /// HNSW: neighbors per node.
    pub hnsw_m: Option<usize>,
    /// HNSW: construction beam width.
    pub hnsw_ef_construction: Option<usize>,
    /// IVF: partition count.
    pub ivf_ncentroids: Option<usize>,
}

impl VectorIndexParams {
    pub fn flat(dimension: usize, metric: crate::metric::MetricType) -> VectorIndexParams {
        VectorIndexParams {
            variant: VectorIndexVariant::Flat,
            dimension,
            metric,
            hnsw_m: None,
            hnsw_ef_construction: None,
            ivf_ncentroids: None,
        }
    }
}
