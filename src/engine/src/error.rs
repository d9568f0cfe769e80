use kernel::{ErrorCode, Key, LockKind, TimeStamp};
use quick_error::quick_error;

/// Everything a client needs to resolve a lock it ran into: who holds it,
/// where its primary lives, and how long it claims to stay alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Key,
    pub primary: Key,
    pub start_ts: TimeStamp,
    pub ttl_ms: u64,
    pub kind: LockKind,
}

/// Why a write-write conflict was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConflictReason {
    /// A commit landed at or after our `start_ts`; restart with a fresh one.
    Optimistic,
    /// A commit landed after our `for_update_ts`; re-lock with a fresh one.
    RetryWithNewForUpdateTs,
}

quick_error! {
    /// Transactional outcomes. Most variants are protocol results the client
    /// acts on, not failures; only `Engine` and `Corruption` are fatal.
    #[derive(Debug)]
    pub enum Error {
        Engine(err: kernel::Error) {
            from()
            display("engine error: {}", err)
            cause(err)
        }
        Corruption(hint: String) {
            display("mvcc corruption: {}", hint)
        }
        KeyIsLocked(info: LockInfo) {
            display("key {} is locked by txn {} (primary {})",
                info.key, info.start_ts, info.primary)
        }
        WriteConflict {
            start_ts: TimeStamp,
            conflict_start_ts: TimeStamp,
            conflict_commit_ts: TimeStamp,
            key: Key,
            reason: WriteConflictReason,
        } {
            display("write conflict: txn {} saw commit {} on key {} ({:?})",
                start_ts, conflict_commit_ts, key, reason)
        }
        TxnLockNotFound {
            start_ts: TimeStamp,
            key: Key,
        } {
            display("lock of txn {} not found on key {}", start_ts, key)
        }
        TxnRolledBack {
            start_ts: TimeStamp,
            key: Key,
        } {
            display("txn {} was rolled back, key {}", start_ts, key)
        }
        AlreadyCommitted {
            start_ts: TimeStamp,
            commit_ts: TimeStamp,
            key: Key,
        } {
            display("txn {} already committed at {} on key {}", start_ts, commit_ts, key)
        }
        PessimisticLockNotFound {
            start_ts: TimeStamp,
            key: Key,
        } {
            display("pessimistic lock of txn {} not found on key {}", start_ts, key)
        }
        CommitTsExpired {
            start_ts: TimeStamp,
            commit_ts: TimeStamp,
            min_commit_ts: TimeStamp,
            key: Key,
        } {
            display("commit ts {} of txn {} is below min_commit_ts {}",
                commit_ts, start_ts, min_commit_ts)
        }
    }
}

impl Error {
    /// The stable code the response envelope carries for this outcome.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Engine(kernel::Error::CorruptedInternalKey(_)) => ErrorCode::Internal,
            Error::Engine(_) | Error::Corruption(_) => ErrorCode::Internal,
            Error::KeyIsLocked(_) => ErrorCode::KeyIsLocked,
            Error::WriteConflict { .. } => ErrorCode::WriteConflict,
            Error::TxnLockNotFound { .. } | Error::PessimisticLockNotFound { .. } => {
                ErrorCode::TxnLockNotFound
            }
            Error::TxnRolledBack { .. } => ErrorCode::TxnRolledBack,
            // Rollback refused because the txn is committed: the lock is gone,
            // which is what the client can observe.
            Error::AlreadyCommitted { .. } => ErrorCode::TxnLockNotFound,
            Error::CommitTsExpired { .. } => ErrorCode::CommitTsExpired,
        }
    }

    /// True for protocol outcomes the client resolves by following the
    /// percolator rules rather than by reporting a failure.
    pub fn is_txn_result(&self) -> bool {
        !matches!(self, Error::Engine(_) | Error::Corruption(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use kernel::KeyMode;

    use super::*;

    #[test]
    fn test_codes() {
        let key = Key::encode_id(KeyMode::TxnExecutor, 1, 1);
        let err = Error::TxnRolledBack {
            start_ts: TimeStamp::new(5),
            key: key.clone(),
        };
        assert_eq!(err.code(), ErrorCode::TxnRolledBack);
        assert!(err.is_txn_result());

        let err = Error::Engine(kernel::Error::Corruption("bad".to_owned()));
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(!err.is_txn_result());

        let err = Error::WriteConflict {
            start_ts: TimeStamp::new(100),
            conflict_start_ts: TimeStamp::new(90),
            conflict_commit_ts: TimeStamp::new(110),
            key,
            reason: WriteConflictReason::Optimistic,
        };
        assert_eq!(err.code(), ErrorCode::WriteConflict);
    }
}
