#![deny(clippy::all)]
#![allow(clippy::module_inception)]

//! The per-region transaction engine: MVCC visibility over the storage
//! engine, percolator-style two-phase commit with optimistic and pessimistic
//! locking, write serialization through latches, and MVCC garbage collection.

#[macro_use]
extern crate log;

mod error;

pub mod commands;
pub mod gc;
pub mod latch;
pub mod lock_table;
pub mod mvcc;

pub use self::{
    commands::{Command, PrewriteCheck, ProcessResult, TxnStatus, WriteResult},
    error::{Error, LockInfo, Result, WriteConflictReason},
    latch::{Latches, LatchGuard},
    lock_table::MemoryLockTable,
    mvcc::{MvccReader, MvccTxn},
};
