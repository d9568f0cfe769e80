//! On-disk index files. One record per file:
//!
//! ```text
//! | ----- 4 bytes ----- | -- 4 bytes -- | ...
//!     CRC32 checksum     payload length   snap-compressed bincode payload
//! ```
//!
//! The checksum covers the compressed payload. Files are written to a
//! sibling temp path and renamed into place, so a crashed save never leaves
//! a half-written generation behind.

use std::{
    fs,
    io::{Read, Write},
    path::Path,
};

use kernel::coding::{decode_fixed_32, put_fixed_32};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

const HEADER_SIZE: usize = 8;

pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)?;
    let compressed = snap::raw::Encoder::new().compress_vec(&payload)?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + compressed.len());
    put_fixed_32(&mut buf, crc32fast::hash(&compressed));
    put_fixed_32(&mut buf, compressed.len() as u32);
    buf.extend_from_slice(&compressed);

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![];
    file.read_to_end(&mut buf)?;
    if buf.len() < HEADER_SIZE {
        return Err(Error::Corrupted(format!(
            "index file {} is shorter than its header",
            path.display()
        )));
    }
    let checksum = decode_fixed_32(&buf[..4]);
    let length = decode_fixed_32(&buf[4..8]) as usize;
    let payload = &buf[HEADER_SIZE..];
    if payload.len() != length {
        return Err(Error::Corrupted(format!(
            "index file {} declares {} payload bytes but carries {}",
            path.display(),
            length,
            payload.len()
        )));
    }
    if crc32fast::hash(payload) != checksum {
        return Err(Error::Corrupted(format!(
            "index file {} failed its checksum",
            path.display()
        )));
    }
    let decompressed = snap::raw::Decoder::new().decompress_vec(payload)?;
    Ok(bincode::deserialize(&decompressed)?)
}

/// The canonical file name of a region's index at a generation.
pub fn index_file_name(kind: &str, region_id: u64, generation: u64) -> String {
    format!("{}_index_{}_{:06}.idx", kind, region_id, generation)
}
