//! Lock and write record formats stored in the `lock` and `write` column
//! families. Both are hand-coded so the write CF stays scannable without a
//! schema registry; layout changes require a new kind byte.

use crate::{
    coding::VarintU64,
    keys::Key,
    Error, Result, TimeStamp,
};

/// A single mutation inside a prewrite or pessimistic-lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put((Key, Vec<u8>)),
    Delete(Key),
    /// Key-only mutation used by the pessimistic lock path.
    Lock(Key),
}

impl Mutation {
    pub fn key(&self) -> &Key {
        match self {
            Mutation::Put((key, _)) => key,
            Mutation::Delete(key) => key,
            Mutation::Lock(key) => key,
        }
    }

    pub fn into_key_value(self) -> (Key, Option<Vec<u8>>) {
        match self {
            Mutation::Put((key, value)) => (key, Some(value)),
            Mutation::Delete(key) => (key, None),
            Mutation::Lock(key) => (key, None),
        }
    }
}

/// What a commit record says happened to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteKind {
    Put = b'P',
    Delete = b'D',
    Rollback = b'R',
    Lock = b'L',
}

impl WriteKind {
    pub fn from_byte(b: u8) -> Result<WriteKind> {
        match b {
            b'P' => Ok(WriteKind::Put),
            b'D' => Ok(WriteKind::Delete),
            b'R' => Ok(WriteKind::Rollback),
            b'L' => Ok(WriteKind::Lock),
            other => Err(Error::Corruption(format!("unknown write kind {}", other))),
        }
    }
}

/// The kind of an in-flight lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockKind {
    Put = b'P',
    Delete = b'D',
    PessimisticLock = b'S',
}

impl LockKind {
    pub fn from_byte(b: u8) -> Result<LockKind> {
        match b {
            b'P' => Ok(LockKind::Put),
            b'D' => Ok(LockKind::Delete),
            b'S' => Ok(LockKind::PessimisticLock),
            other => Err(Error::Corruption(format!("unknown lock kind {}", other))),
        }
    }

    /// The write kind a commit of this lock produces. A pessimistic lock
    /// that was never converted commits as a no-op `Lock` marker.
    pub fn committed_kind(self) -> WriteKind {
        match self {
            LockKind::Put => WriteKind::Put,
            LockKind::Delete => WriteKind::Delete,
            LockKind::PessimisticLock => WriteKind::Lock,
        }
    }
}

const FLAG_FOR_UPDATE: u8 = 1;
const FLAG_ASYNC_COMMIT: u8 = 1 << 1;
const FLAG_SHORT_VALUE: u8 = 1 << 2;

/// The lock record stored at `user_key ∥ 0x00` in the lock CF. Exactly one
/// may exist per user key at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub kind: LockKind,
    pub primary: Key,
    pub start_ts: TimeStamp,
    /// Zero for optimistic locks.
    pub for_update_ts: TimeStamp,
    pub ttl_ms: u64,
    pub txn_size: u64,
    pub min_commit_ts: TimeStamp,
    pub use_async_commit: bool,
    pub secondaries: Vec<Key>,
    pub short_value: Option<Vec<u8>>,
}

impl LockRecord {
    pub fn new(kind: LockKind, primary: Key, start_ts: TimeStamp, ttl_ms: u64) -> LockRecord {
        LockRecord {
            kind,
            primary,
            start_ts,
            for_update_ts: TimeStamp::zero(),
            ttl_ms,
            txn_size: 0,
            min_commit_ts: TimeStamp::zero(),
            use_async_commit: false,
            secondaries: vec![],
            short_value: None,
        }
    }

    pub fn is_pessimistic(&self) -> bool {
        self.kind == LockKind::PessimisticLock
    }

    /// Whether the lock has outlived its TTL at `current_ts` (physical
    /// milliseconds compared, logical bits ignored).
    pub fn is_expired(&self, current_ts: TimeStamp) -> bool {
        self.start_ts.physical() + self.ttl_ms < current_ts.physical()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if !self.for_update_ts.is_zero() {
            flags |= FLAG_FOR_UPDATE;
        }
        if self.use_async_commit {
            flags |= FLAG_ASYNC_COMMIT;
        }
        if self.short_value.is_some() {
            flags |= FLAG_SHORT_VALUE;
        }
        let mut buf = Vec::with_capacity(32 + self.primary.len());
        buf.push(self.kind as u8);
        buf.push(flags);
        VarintU64::put_varint_prefixed_slice(&mut buf, self.primary.as_encoded());
        VarintU64::put_varint(&mut buf, self.start_ts.into_inner());
        VarintU64::put_varint(&mut buf, self.ttl_ms);
        VarintU64::put_varint(&mut buf, self.txn_size);
        VarintU64::put_varint(&mut buf, self.min_commit_ts.into_inner());
        if flags & FLAG_FOR_UPDATE != 0 {
            VarintU64::put_varint(&mut buf, self.for_update_ts.into_inner());
        }
        VarintU64::put_varint(&mut buf, self.secondaries.len() as u64);
        for secondary in &self.secondaries {
            VarintU64::put_varint_prefixed_slice(&mut buf, secondary.as_encoded());
        }
        if let Some(value) = &self.short_value {
            VarintU64::put_varint_prefixed_slice(&mut buf, value);
        }
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<LockRecord> {
        if src.len() < 2 {
            return Err(Error::Corruption("lock record too short".to_owned()));
        }
        let kind = LockKind::from_byte(src[0])?;
        let flags = src[1];
        src = &src[2..];
        let primary = Key::from_encoded(VarintU64::get_varint_prefixed_slice(&mut src)?.to_vec());
        let start_ts = TimeStamp::new(VarintU64::get_varint(&mut src)?);
        let ttl_ms = VarintU64::get_varint(&mut src)?;
        let txn_size = VarintU64::get_varint(&mut src)?;
        let min_commit_ts = TimeStamp::new(VarintU64::get_varint(&mut src)?);
        let for_update_ts = if flags & FLAG_FOR_UPDATE != 0 {
            TimeStamp::new(VarintU64::get_varint(&mut src)?)
        } else {
            TimeStamp::zero()
        };
        let secondary_count = VarintU64::get_varint(&mut src)?;
        let mut secondaries = Vec::with_capacity(secondary_count as usize);
        for _ in 0..secondary_count {
            secondaries
                .push(Key::from_encoded(VarintU64::get_varint_prefixed_slice(&mut src)?.to_vec()));
        }
        let short_value = if flags & FLAG_SHORT_VALUE != 0 {
            Some(VarintU64::get_varint_prefixed_slice(&mut src)?.to_vec())
        } else {
            None
        };
        if !src.is_empty() {
            return Err(Error::Corruption("trailing bytes in lock record".to_owned()));
        }
        Ok(LockRecord {
            kind,
            primary,
            start_ts,
            for_update_ts,
            ttl_ms,
            txn_size,
            min_commit_ts,
            use_async_commit: flags & FLAG_ASYNC_COMMIT != 0,
            secondaries,
            short_value,
        })
    }
}

/// The commit record stored at `user_key ∥ ~commit_ts` in the write CF.
/// Small values ride inline; larger ones live in the data CF at `start_ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub start_ts: TimeStamp,
    pub short_value: Option<Vec<u8>>,
}

impl WriteRecord {
    pub fn new(kind: WriteKind, start_ts: TimeStamp, short_value: Option<Vec<u8>>) -> WriteRecord {
        WriteRecord {
            kind,
            start_ts,
            short_value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(self.kind as u8);
        VarintU64::put_varint(&mut buf, self.start_ts.into_inner());
        if let Some(value) = &self.short_value {
            buf.push(b'v');
            VarintU64::put_varint_prefixed_slice(&mut buf, value);
        }
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<WriteRecord> {
        if src.is_empty() {
            return Err(Error::Corruption("empty write record".to_owned()));
        }
        let kind = WriteKind::from_byte(src[0])?;
        src = &src[1..];
        let start_ts = TimeStamp::new(VarintU64::get_varint(&mut src)?);
        let short_value = match src.first() {
            Some(&b'v') => {
                src = &src[1..];
                Some(VarintU64::get_varint_prefixed_slice(&mut src)?.to_vec())
            }
            Some(other) => {
                return Err(Error::Corruption(format!(
                    "unknown write record tag {}",
                    other
                )));
            }
            None => None,
        };
        if !src.is_empty() {
            return Err(Error::Corruption("trailing bytes in write record".to_owned()));
        }
        Ok(WriteRecord {
            kind,
            start_ts,
            short_value,
        })
    }
}
