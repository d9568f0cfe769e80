//! Encoded user keys and the MVCC internal-key codec.
//!
//! A user key is `prefix (1 byte) ∥ partition_id (8 bytes, BE) ∥ payload`;
//! for indexed rows the payload is an 8-byte big-endian entity id. Internal
//! keys append a timestamp suffix whose bits are inverted so that a forward
//! scan over one user key yields commit records from newest to oldest.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    coding::{decode_fixed_64, put_fixed_64},
    Error, Result, TimeStamp,
};

/// prefix byte + partition id
pub const MIN_ENCODED_KEY_LEN: usize = 9;
/// inverted timestamp suffix on data/write internal keys
pub const TS_SUFFIX_LEN: usize = 8;
/// sentinel suffix on lock internal keys
pub const LOCK_SENTINEL: u8 = 0x00;

/// The key namespace, raw/transactional crossed with executor/client origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyMode {
    RawExecutor = b'r',
    RawClient = b'R',
    TxnExecutor = b't',
    TxnClient = b'T',
}

impl KeyMode {
    pub fn from_byte(b: u8) -> Result<KeyMode> {
        match b {
            b'r' => Ok(KeyMode::RawExecutor),
            b'R' => Ok(KeyMode::RawClient),
            b't' => Ok(KeyMode::TxnExecutor),
            b'T' => Ok(KeyMode::TxnClient),
            other => Err(Error::CorruptedInternalKey(vec![other])),
        }
    }

    pub fn is_txn(self) -> bool {
        matches!(self, KeyMode::TxnExecutor | KeyMode::TxnClient)
    }
}

/// An encoded user key. The engine never looks at raw client bytes past the
/// request boundary; everything below `RegionStore` carries this type.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn from_encoded(encoded: Vec<u8>) -> Key {
        Key(encoded)
    }

    /// Encodes an arbitrary payload under `mode` and `partition_id`.
    pub fn encode(mode: KeyMode, partition_id: i64, payload: &[u8]) -> Key {
        let mut buf = Vec::with_capacity(MIN_ENCODED_KEY_LEN + payload.len());
        buf.push(mode as u8);
        put_fixed_64(&mut buf, partition_id as u64);
        buf.extend_from_slice(payload);
        Key(buf)
    }

    /// Encodes an indexed row key carrying an 8-byte big-endian entity id.
    pub fn encode_id(mode: KeyMode, partition_id: i64, id: i64) -> Key {
        let mut buf = Vec::with_capacity(MIN_ENCODED_KEY_LEN + 8);
        buf.push(mode as u8);
        put_fixed_64(&mut buf, partition_id as u64);
        put_fixed_64(&mut buf, id as u64);
        Key(buf)
    }

    pub fn as_encoded(&self) -> &[u8] {
        &self.0
    }

    pub fn into_encoded(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.len() < MIN_ENCODED_KEY_LEN {
            return Err(Error::CorruptedInternalKey(self.0.clone()));
        }
        KeyMode::from_byte(self.0[0]).map(|_| ())
    }

    pub fn mode(&self) -> Result<KeyMode> {
        self.validate()?;
        KeyMode::from_byte(self.0[0])
    }

    pub fn partition_id(&self) -> Result<i64> {
        self.validate()?;
        Ok(decode_fixed_64(&self.0[1..MIN_ENCODED_KEY_LEN]) as i64)
    }

    /// The entity id of an indexed row key. Errors unless the payload is
    /// exactly 8 bytes.
    pub fn int_id(&self) -> Result<i64> {
        self.validate()?;
        if self.0.len() != MIN_ENCODED_KEY_LEN + 8 {
            return Err(Error::CorruptedInternalKey(self.0.clone()));
        }
        Ok(decode_fixed_64(&self.0[MIN_ENCODED_KEY_LEN..]) as i64)
    }

    /// The lexicographic successor, the smallest key strictly greater than
    /// every internal key derived from this one.
    pub fn next_key(&self) -> Key {
        let mut buf = self.0.clone();
        buf.push(0x00);
        Key(buf)
    }

    /// `user_key ∥ ~commit_ts`, the internal key of a commit record.
    pub fn encode_write(&self, commit_ts: TimeStamp) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() + TS_SUFFIX_LEN);
        buf.extend_from_slice(&self.0);
        put_fixed_64(&mut buf, !commit_ts.into_inner());
        buf
    }

    /// `user_key ∥ ~start_ts`, the internal key of a data record.
    pub fn encode_data(&self, start_ts: TimeStamp) -> Vec<u8> {
        self.encode_write(start_ts)
    }

    /// `user_key ∥ 0x00`, the internal key of the (single) lock record.
    pub fn encode_lock(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() + 1);
        buf.extend_from_slice(&self.0);
        buf.push(LOCK_SENTINEL);
        buf
    }
}

/// Splits a write/data internal key back into `(user_key, ts)`.
pub fn decode_ts_key(encoded: &[u8]) -> Result<(Key, TimeStamp)> {
    if encoded.len() < MIN_ENCODED_KEY_LEN + TS_SUFFIX_LEN {
        return Err(Error::CorruptedInternalKey(encoded.to_vec()));
    }
    let split = encoded.len() - TS_SUFFIX_LEN;
    let ts = TimeStamp::new(!decode_fixed_64(&encoded[split..]));
    Ok((Key::from_encoded(encoded[..split].to_vec()), ts))
}

/// Strips the lock sentinel back off a lock internal key.
pub fn decode_lock_key(encoded: &[u8]) -> Result<Key> {
    if encoded.len() < MIN_ENCODED_KEY_LEN + 1 || encoded[encoded.len() - 1] != LOCK_SENTINEL {
        return Err(Error::CorruptedInternalKey(encoded.to_vec()));
    }
    Ok(Key::from_encoded(encoded[..encoded.len() - 1].to_vec()))
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A half-open key range `[start, end)`. An empty `end` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(start: Key, end: Key) -> KeyRange {
        KeyRange { start, end }
    }

    pub fn unbounded() -> KeyRange {
        KeyRange::default()
    }

    pub fn is_valid(&self) -> bool {
        self.end.is_empty() || self.start < self.end
    }

    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.start && (self.end.is_empty() || key < &self.end)
    }

    /// True if `[other.start, other.end)` lies entirely inside this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        other.start >= self.start
            && (self.end.is_empty() || (!other.end.is_empty() && other.end <= self.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> Key {
        Key::encode_id(KeyMode::TxnExecutor, 7, id)
    }

    #[test]
    fn test_key_layout() {
        let k = key(42);
        assert_eq!(k.len(), 17);
        assert_eq!(k.mode().unwrap(), KeyMode::TxnExecutor);
        assert_eq!(k.partition_id().unwrap(), 7);
        assert_eq!(k.int_id().unwrap(), 42);
    }

    #[test]
    fn test_write_keys_sort_newest_first() {
        let k = key(1);
        let w_old = k.encode_write(TimeStamp::new(100));
        let w_new = k.encode_write(TimeStamp::new(200));
        // larger commit_ts must sort first under a forward scan
        assert!(w_new < w_old);

        let (decoded, ts) = decode_ts_key(&w_old).unwrap();
        assert_eq!(decoded, k);
        assert_eq!(ts, TimeStamp::new(100));
    }

    #[test]
    fn test_lock_key_roundtrip() {
        let k = key(9);
        let lk = k.encode_lock();
        assert_eq!(decode_lock_key(&lk).unwrap(), k);
        assert!(decode_lock_key(k.as_encoded()).is_err());
    }

    #[test]
    fn test_corrupted_keys_rejected() {
        assert!(decode_ts_key(b"short").is_err());
        assert!(Key::from_encoded(vec![b'x'; 12]).mode().is_err());
        assert!(Key::from_encoded(vec![]).validate().is_err());
    }

    #[test]
    fn test_next_key_bounds_all_versions() {
        let k = key(5);
        let upper = k.next_key();
        for ts in [0u64, 1, u64::MAX - 1, u64::MAX] {
            let w = k.encode_write(TimeStamp::new(ts));
            assert!(w.as_slice() < upper.as_encoded());
        }
    }

    #[test]
    fn test_range_contains() {
        let r = KeyRange::new(key(10), key(20));
        assert!(r.contains(&key(10)));
        assert!(r.contains(&key(19)));
        assert!(!r.contains(&key(20)));
        assert!(!r.contains(&key(9)));
        assert!(KeyRange::unbounded().contains(&key(1)));
        assert!(r.is_valid());
        assert!(!KeyRange::new(key(20), key(10)).is_valid());
    }
}
