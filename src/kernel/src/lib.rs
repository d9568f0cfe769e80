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
#![allow(clippy::module_inception)]

#[macro_use]
mod error;

pub mod coding;
pub mod config;
pub mod keys;
pub mod record;
pub mod timestamp;

pub use self::{
    config::CoreConfig,
    error::{Error, ErrorCode, Result},
    keys::{Key, KeyMode, KeyRange},
    record::{LockKind, LockRecord, Mutation, WriteKind, WriteRecord},
    timestamp::TimeStamp,
};
