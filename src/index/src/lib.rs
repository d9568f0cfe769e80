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

#![deny(clippy::all)]

//! Secondary vector and document indexes. Each wrapper mirrors the committed
//! state of its region's data CF, keyed by the entity id embedded in every
//! user key, and answers searches either at the current tip or at an MVCC
//! snapshot timestamp.

#[macro_use]
extern crate log;

mod error;

pub mod document;
pub mod flat;
pub mod metric;
pub mod persist;
pub mod types;
pub mod vector;

pub use self::{
    document::DocumentIndexWrapper,
    error::{Error, Result},
    flat::FlatIndex,
    metric::MetricType,
    types::{
        DocumentWithId, IndexState, PreFilter, ScalarValue, ScoredEntry, VectorIndexParams,
        VectorIndexVariant, VectorWithId,
    },
    vector::{VectorIndex, VectorIndexWrapper},
};
