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

//! dingokv: a per-region transactional storage and indexing engine.
//!
//! The workspace splits along the seams a region store is built from:
//! [`kernel`] holds key codecs, record formats and the error taxonomy,
//! [`storage`] the column-family engine abstraction, [`engine`] the
//! percolator transaction machinery, [`index`] the secondary vector and
//! document indexes, and [`runtime`] the request-facing region store with
//! its scheduling, streaming, safe-point and backup services.

pub use engine;
pub use index;
pub use kernel;
pub use runtime;
pub use storage;

pub use engine::{Command, ProcessResult, TxnStatus};
pub use kernel::{CoreConfig, ErrorCode, Key, KeyMode, KeyRange, Mutation, TimeStamp};
pub use runtime::{RegionMeta, RegionStore, RequestContext, StoreServices};
pub use storage::MemEngine;
