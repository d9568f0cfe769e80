use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of low bits reserved for the logical component of a timestamp
/// handed out by the oracle. The remaining high bits are wall-clock
/// milliseconds.
const PHYSICAL_SHIFT: u32 = 18;

/// A monotone 64-bit timestamp from the external oracle.
///
/// `start_ts` identifies a transaction, `commit_ts > start_ts` orders its
/// commit, `for_update_ts` is re-obtained on each pessimistic lock
/// acquisition. The engine never generates timestamps itself.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeStamp(u64);

impl TimeStamp {
    pub const fn zero() -> Self {
        TimeStamp(0)
    }

    pub const fn max() -> Self {
        TimeStamp(u64::MAX)
    }

    pub const fn new(ts: u64) -> Self {
        TimeStamp(ts)
    }

    /// Builds a timestamp from a wall-clock millisecond count and a logical
    /// counter, the way the oracle composes them.
    pub const fn compose(physical: u64, logical: u64) -> Self {
        TimeStamp((physical << PHYSICAL_SHIFT) + logical)
    }

    pub const fn physical(self) -> u64 {
        self.0 >> PHYSICAL_SHIFT
    }

    pub const fn logical(self) -> u64 {
        self.0 & ((1 << PHYSICAL_SHIFT) - 1)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_max(self) -> bool {
        self.0 == u64::MAX
    }

    pub const fn next(self) -> Self {
        TimeStamp(self.0 + 1)
    }

    pub const fn prev(self) -> Self {
        TimeStamp(self.0 - 1)
    }
}

impl From<u64> for TimeStamp {
    fn from(ts: u64) -> Self {
        TimeStamp(ts)
    }
}

impl From<TimeStamp> for u64 {
    fn from(ts: TimeStamp) -> Self {
        ts.0
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
