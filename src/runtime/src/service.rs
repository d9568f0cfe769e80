//! The request context every RPC carries and the error envelope every
//! response carries. Transactional conflicts ride in `TxnResult` as data the
//! client acts on; `code` alone decides whether a response is a success.

use engine::{Error as TxnError, LockInfo, WriteConflictReason};
use kernel::{ErrorCode, Key, TimeStamp};

use crate::region::{RegionEpoch, RegionMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    SnapshotIsolation,
    /// Reads skip lock checks and observe the newest committed version.
    ReadCommitted,
}

/// Carried by every request; validated once per RPC before any work queues.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub region_id: u64,
    pub epoch: RegionEpoch,
    pub isolation_level: IsolationLevel,
    /// Transactions this client already resolved; their locks are invisible.
    pub resolved_locks: Vec<TimeStamp>,
}

impl RequestContext {
    pub fn new(region_id: u64, epoch: RegionEpoch) -> RequestContext {
        RequestContext {
            region_id,
            epoch,
            ..RequestContext::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteConflictInfo {
    pub start_ts: TimeStamp,
    pub conflict_start_ts: TimeStamp,
    pub conflict_commit_ts: TimeStamp,
    pub key: Key,
    pub retry_with_new_for_update_ts: bool,
}

/// The structured transactional outcome of a response. A response is a
/// success iff `code == Ok` and this is empty of conflict variants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxnResult {
    pub locked: Option<LockInfo>,
    pub write_conflict: Option<WriteConflictInfo>,
    pub txn_not_found: Option<(TimeStamp, Key)>,
    pub txn_rolled_back: Option<(TimeStamp, Key)>,
    pub already_committed: Option<TimeStamp>,
    pub commit_ts_expired: Option<(TimeStamp, TimeStamp)>,
}

impl TxnResult {
    pub fn is_empty(&self) -> bool {
        *self == TxnResult::default()
    }
}

/// The error half of the response envelope.
#[derive(Debug)]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
    /// Populated on routing errors so the client can refresh.
    pub current_region: Option<RegionMeta>,
    pub txn_result: TxnResult,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> ServerError {
        ServerError {
            code,
            message: message.into(),
            current_region: None,
            txn_result: TxnResult::default(),
        }
    }

    pub fn with_region(mut self, region: RegionMeta) -> ServerError {
        self.current_region = Some(region);
        self
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<kernel::Error> for ServerError {
    fn from(err: kernel::Error) -> ServerError {
        let code = match &err {
            kernel::Error::InvalidArgument(_) => ErrorCode::IllegalParameter,
            kernel::Error::CorruptedInternalKey(_) => ErrorCode::Internal,
            _ => ErrorCode::Internal,
        };
        ServerError::new(code, err.to_string())
    }
}

impl From<TxnError> for ServerError {
    fn from(err: TxnError) -> ServerError {
        let mut server_error = ServerError::new(err.code(), err.to_string());
        match err {
            TxnError::KeyIsLocked(info) => server_error.txn_result.locked = Some(info),
            TxnError::WriteConflict {
                start_ts,
                conflict_start_ts,
                conflict_commit_ts,
                key,
                reason,
            } => {
                server_error.txn_result.write_conflict = Some(WriteConflictInfo {
                    start_ts,
                    conflict_start_ts,
                    conflict_commit_ts,
                    key,
                    retry_with_new_for_update_ts: reason
                        == WriteConflictReason::RetryWithNewForUpdateTs,
                });
            }
            TxnError::TxnLockNotFound { start_ts, key }
            | TxnError::PessimisticLockNotFound { start_ts, key } => {
                server_error.txn_result.txn_not_found = Some((start_ts, key));
            }
            TxnError::TxnRolledBack { start_ts, key } => {
                server_error.txn_result.txn_rolled_back = Some((start_ts, key));
            }
            TxnError::AlreadyCommitted { commit_ts, .. } => {
                server_error.txn_result.already_committed = Some(commit_ts);
            }
            TxnError::CommitTsExpired {
                commit_ts,
                min_commit_ts,
                ..
            } => {
                server_error.txn_result.commit_ts_expired = Some((commit_ts, min_commit_ts));
            }
            TxnError::Engine(_) | TxnError::Corruption(_) => {}
        }
        server_error
    }
}

impl From<index::Error> for ServerError {
    fn from(err: index::Error) -> ServerError {
        ServerError::new(err.code(), err.to_string())
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;
