use kernel::ErrorCode;
use thiserror::Error;

use crate::types::IndexState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("index is not ready to serve: {0:?}")]
    NotReady(IndexState),
    #[error("index build failed: {0}")]
    Build(String),
    #[error("dimension mismatch: index has {expect}, query has {got}")]
    DimensionMismatch { expect: usize, got: usize },
    #[error("invalid entity id {0}")]
    InvalidId(i64),
    #[error("index file generation mismatch: expected {expect}, found {found}")]
    GenerationMismatch { expect: u64, found: u64 },
    #[error("corrupted index file: {0}")]
    Corrupted(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("compression error: {0}")]
    Compression(#[from] snap::Error),
}

impl Error {
    /// The stable code the response envelope carries for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotReady(_) => ErrorCode::IndexNotReady,
            Error::Build(_) | Error::GenerationMismatch { .. } => ErrorCode::IndexBuildError,
            Error::DimensionMismatch { .. } | Error::InvalidId(_) => ErrorCode::IllegalParameter,
            Error::Corrupted(_) | Error::Io(_) | Error::Codec(_) | Error::Compression(_) => {
                ErrorCode::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
