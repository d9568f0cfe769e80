#![deny(clippy::all)]

//! The byte-level engine abstraction the transactional core runs on. The real
//! deployment backs this with a replicated, persistent store; every write
//! handed to [`Engine::write`] arrives already serialized in commit order by
//! the replication layer, so implementations only guarantee atomicity and
//! durability of a single batch.

pub mod iterator;
pub mod mem;

use kernel::Result;

pub use crate::{iterator::Cursor, mem::MemEngine};

/// A logical column family name.
pub type CfName = &'static str;

/// User values at their start_ts.
pub const CF_DATA: CfName = "default";
/// In-flight lock records, one per user key.
pub const CF_LOCK: CfName = "lock";
/// Commit records keyed by `user_key ∥ ~commit_ts`.
pub const CF_WRITE: CfName = "write";
/// Reserved internal prefixes: region meta, change records, safe points.
pub const CF_META: CfName = "meta";

pub const ALL_CFS: [CfName; 4] = [CF_DATA, CF_LOCK, CF_WRITE, CF_META];

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modify {
    Put(CfName, Vec<u8>, Vec<u8>),
    Delete(CfName, Vec<u8>),
}

impl Modify {
    pub fn key(&self) -> &[u8] {
        match self {
            Modify::Put(_, key, _) => key,
            Modify::Delete(_, key) => key,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Modify::Put(_, key, value) => key.len() + value.len(),
            Modify::Delete(_, key) => key.len(),
        }
    }
}

/// An ordered set of modifications applied atomically across all CFs.
#[derive(Debug, Default)]
pub struct WriteBatch {
    modifies: Vec<Modify>,
}

impl WriteBatch {
    pub fn put(&mut self, cf: CfName, key: Vec<u8>, value: Vec<u8>) {
        self.modifies.push(Modify::Put(cf, key, value));
    }

    pub fn delete(&mut self, cf: CfName, key: Vec<u8>) {
        self.modifies.push(Modify::Delete(cf, key));
    }

    pub fn extend(&mut self, modifies: Vec<Modify>) {
        self.modifies.extend(modifies);
    }

    pub fn len(&self) -> usize {
        self.modifies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifies.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.modifies.iter().map(Modify::size).sum()
    }

    pub fn modifies(&self) -> &[Modify] {
        &self.modifies
    }

    pub fn into_modifies(self) -> Vec<Modify> {
        self.modifies
    }
}

/// `Engine` is the storage seam of a region.
///
/// `Engine` should be thread safe.
pub trait Engine: Send + Sync + Clone + 'static {
    type Snap: Snapshot;

    /// Apply `batch` atomically across CFs. Durable once this returns.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Point read of the latest value.
    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// A consistent view across all CFs as of the call.
    fn snapshot(&self) -> Result<Self::Snap>;
}

/// A frozen, consistent view of every CF. Cheap to clone; readers hold one
/// across an entire scan or stream.
pub trait Snapshot: Clone + Send + Sync + 'static {
    type Iter: Cursor;

    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// A cursor positioned before the first entry of `cf`.
    fn iter(&self, cf: CfName) -> Result<Self::Iter>;
}
