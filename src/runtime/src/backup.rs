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

//! Range backup and restore. A backup file is a sequence of checksummed
//! records:
//!
//! ```text
//! | ----- 4 bytes ----- | -- 4 bytes -- |
//!      CRC32 checksum     payload length    snap-compressed bincode payload
//! ```
//!
//! The first record is the header, the rest are entry chunks holding the
//! values visible at `backup_ts`. Restore replays them as committed writes.

use std::{
    fs,
    io::{Read, Write},
    path::Path,
};

use engine::{MvccReader, Result};
use kernel::{
    coding::{decode_fixed_32, put_fixed_32},
    Error, Key, KeyRange, TimeStamp, WriteKind, WriteRecord,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use storage::{Engine, Snapshot, WriteBatch, CF_DATA, CF_WRITE};

const RECORD_HEADER_SIZE: usize = 8;
const ENTRIES_PER_CHUNK: usize = 1024;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct BackupHeader {
    pub region_id: u64,
    pub backup_ts: TimeStamp,
    pub range: KeyRange,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupEntry {
    pub key: Key,
    pub value: Vec<u8>,
    pub commit_ts: TimeStamp,
}

fn write_record<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)
        .map_err(|err| Error::Corruption(format!("backup record serialization: {}", err)))?;
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&payload)
        .map_err(|err| Error::Corruption(format!("backup record compression: {}", err)))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + compressed.len());
    put_fixed_32(&mut buf, crc32fast::hash(&compressed));
    put_fixed_32(&mut buf, compressed.len() as u32);
    buf.extend_from_slice(&compressed);
    writer.write_all(&buf).map_err(Error::IO)?;
    Ok(())
}

fn read_record<T: DeserializeOwned>(buf: &[u8], offset: &mut usize) -> Result<Option<T>> {
    if *offset == buf.len() {
        return Ok(None);
    }
    if buf.len() - *offset < RECORD_HEADER_SIZE {
        return Err(Error::Corruption("truncated backup record header".to_owned()).into());
    }
    let checksum = decode_fixed_32(&buf[*offset..]);
    let length = decode_fixed_32(&buf[*offset + 4..]) as usize;
    let payload_start = *offset + RECORD_HEADER_SIZE;
    if buf.len() - payload_start < length {
        return Err(Error::Corruption("truncated backup record payload".to_owned()).into());
    }
    let payload = &buf[payload_start..payload_start + length];
    if crc32fast::hash(payload) != checksum {
        return Err(Error::Corruption("backup record failed its checksum".to_owned()).into());
    }
    let decompressed = snap::raw::Decoder::new()
        .decompress_vec(payload)
        .map_err(|err| Error::Corruption(format!("backup record decompression: {}", err)))?;
    let value = bincode::deserialize(&decompressed)
        .map_err(|err| Error::Corruption(format!("backup record deserialization: {}", err)))?;
    *offset = payload_start + length;
    Ok(Some(value))
}

/// Writes every value in `range` visible at `backup_ts` into `path`.
/// Returns the number of entries written.
pub fn backup_range<S: Snapshot, P: AsRef<Path>>(
    snapshot: S,
    region_id: u64,
    range: &KeyRange,
    backup_ts: TimeStamp,
    path: P,
) -> Result<usize> {
    let mut file = fs::File::create(path.as_ref()).map_err(Error::IO)?;
    write_record(
        &mut file,
        &BackupHeader {
            region_id,
            backup_ts,
            range: range.clone(),
        },
    )?;

    let mut reader = MvccReader::new(snapshot);
    let mut total = 0;
    let mut from = range.start.clone();
    loop {
        let (pairs, next) = reader.scan(&from, &range.end, backup_ts, ENTRIES_PER_CHUNK, &[])?;
        if !pairs.is_empty() {
            total += pairs.len();
            let chunk: Vec<BackupEntry> = pairs
                .into_iter()
                .map(|(key, value)| BackupEntry {
                    key,
                    value,
                    commit_ts: backup_ts,
                })
                .collect();
            write_record(&mut file, &chunk)?;
        }
        match next {
            Some(key) => from = key,
            None => break,
        }
    }
    file.sync_all().map_err(Error::IO)?;
    info!(
        "backup of region {} at {} wrote {} entries",
        region_id, backup_ts, total
    );
    Ok(total)
}

/// Replays a backup file as committed writes. Values small enough ride
/// inline in the write record, the rest land in the data CF.
pub fn restore_file<E: Engine, P: AsRef<Path>>(
    engine: &E,
    path: P,
    short_value_threshold: usize,
) -> Result<(BackupHeader, usize)> {
    let mut buf = vec![];
    fs::File::open(path.as_ref())
        .and_then(|mut file| file.read_to_end(&mut buf))
        .map_err(Error::IO)?;

    let mut offset = 0;
    let header: BackupHeader = read_record(&buf, &mut offset)?
        .ok_or_else(|| Error::Corruption("backup file has no header".to_owned()))?;

    let mut total = 0;
    while let Some(chunk) = read_record::<Vec<BackupEntry>>(&buf, &mut offset)? {
        let mut batch = WriteBatch::default();
        for entry in chunk {
            total += 1;
            let commit_ts = entry.commit_ts;
            if entry.value.len() <= short_value_threshold {
                let record = WriteRecord::new(WriteKind::Put, commit_ts, Some(entry.value));
                batch.put(CF_WRITE, entry.key.encode_write(commit_ts), record.encode());
            } else {
                batch.put(CF_DATA, entry.key.encode_data(commit_ts), entry.value);
                let record = WriteRecord::new(WriteKind::Put, commit_ts, None);
                batch.put(CF_WRITE, entry.key.encode_write(commit_ts), record.encode());
            }
        }
        engine.write(batch)?;
    }
    info!(
        "restored {} entries of region {} at {}",
        total, header.region_id, header.backup_ts
    );
    Ok((header, total))
}
