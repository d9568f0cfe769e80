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

//! The per-region runtime: request validation and the response envelope,
//! worker pools, stream cursors, safe points, backup, and the `RegionStore`
//! facade that ties the transaction engine and the secondary indexes to one
//! region.

#[macro_use]
extern crate log;

pub mod backup;
pub mod logger;
pub mod region;
pub mod safepoint;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod stream;

pub use self::{
    region::{Peer, Region, RegionEpoch, RegionMeta, RegionState},
    safepoint::SafePointMap,
    scheduler::WorkerPool,
    service::{IsolationLevel, RequestContext, ServerError, ServerResult, TxnResult},
    store::{RegionStore, ScanResponse, StoreServices},
    stream::StreamManager,
};
