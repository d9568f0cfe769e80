use quick_error::quick_error;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        /// If the hint is `None`, the key is deleted
        NotFound(hint: Option<String>) {
            display("key seeking failed: {:?}", hint)
        }
        Corruption(hint: String) {
            display("data corruption: {}", hint)
        }
        CorruptedInternalKey(key: Vec<u8>) {
            display("corrupted internal key: {:?}", key)
        }
        InvalidArgument(hint: String) {
            display("invalid argument: {}", hint)
        }
        /// The snapshot the caller holds is no longer usable
        Aborted(hint: String) {
            display("operation aborted: {}", hint)
        }
        Closed(hint: String) {
            display("try to operate a closed component: {}", hint)
        }
        IO(err: std::io::Error) {
            from()
            display("I/O operation error: {}", err)
            cause(err)
        }
        Customized(hint: String) {
            display("{}", hint)
        }
    }
}

#[macro_export]
macro_rules! map_io_res {
    ($result:expr) => {
        match $result {
            Ok(v) => Ok(v),
            Err(e) => Err($crate::Error::IO(e)),
        }
    };
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes carried in every response envelope. Clients dispatch on
/// these, so variants must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    Internal = 1,
    EpochNotMatch = 2,
    RegionNotFound = 3,
    RegionNotReady = 4,
    NotLeader = 5,
    KeyIsLocked = 6,
    WriteConflict = 7,
    TxnLockNotFound = 8,
    TxnRolledBack = 9,
    CommitTsExpired = 10,
    StreamExpired = 11,
    RequestFull = 12,
    IllegalParameter = 13,
    IndexBuildError = 14,
    IndexNotReady = 15,
    RangeInvalid = 16,
    KeyEmpty = 17,
    BatchExceeded = 18,
    RequestSizeExceeded = 19,
    ClusterReadOnly = 20,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// True for codes the client may retry after refreshing routing metadata
    /// or waiting the condition out. Input errors and conflicts are not
    /// retryable as-is.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::EpochNotMatch
                | ErrorCode::RegionNotFound
                | ErrorCode::RegionNotReady
                | ErrorCode::NotLeader
                | ErrorCode::RequestFull
                | ErrorCode::IndexNotReady
                | ErrorCode::ClusterReadOnly
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        fn fails() -> Result<()> {
            let e: std::io::Result<()> =
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
            map_io_res!(e)
        }
        match fails() {
            Err(Error::IO(_)) => {}
            other => panic!("expected IO error, got {:?}", other),
        }
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::EpochNotMatch.is_retryable());
        assert!(ErrorCode::RequestFull.is_retryable());
        assert!(!ErrorCode::WriteConflict.is_retryable());
        assert!(!ErrorCode::IllegalParameter.is_retryable());
        assert!(ErrorCode::Ok.is_ok());
    }
}
