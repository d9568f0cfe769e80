use kernel::{
    Key, LockKind, LockRecord, Mutation, TimeStamp, WriteKind, WriteRecord,
};
use storage::{Modify, Snapshot, CF_DATA, CF_LOCK, CF_WRITE};

use crate::{
    error::{Error, LockInfo, Result, WriteConflictReason},
    mvcc::MvccReader,
};

/// The status of a transaction as observed through its primary lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    RolledBack,
    Committed { commit_ts: TimeStamp },
    Locked { ttl_ms: u64, min_commit_ts: TimeStamp },
    LockNotExist,
}

/// A write transaction against one snapshot. Mutations are buffered as
/// `Modify`s and only become visible when the caller applies the batch
/// through the serialized write path.
pub struct MvccTxn<S: Snapshot> {
    reader: MvccReader<S>,
    start_ts: TimeStamp,
    short_value_threshold: usize,
    modifies: Vec<Modify>,
}

impl<S: Snapshot> MvccTxn<S> {
    pub fn new(snapshot: S, start_ts: TimeStamp, short_value_threshold: usize) -> MvccTxn<S> {
        MvccTxn {
            reader: MvccReader::new(snapshot),
            start_ts,
            short_value_threshold,
            modifies: vec![],
        }
    }

    pub fn start_ts(&self) -> TimeStamp {
        self.start_ts
    }

    pub fn reader(&mut self) -> &mut MvccReader<S> {
        &mut self.reader
    }

    pub fn into_modifies(self) -> Vec<Modify> {
        self.modifies
    }

    pub fn write_bytes(&self) -> usize {
        self.modifies.iter().map(Modify::size).sum()
    }

    fn put_lock(&mut self, key: &Key, lock: &LockRecord) {
        self.modifies
            .push(Modify::Put(CF_LOCK, key.encode_lock(), lock.encode()));
    }

    fn unlock_key(&mut self, key: &Key) {
        self.modifies.push(Modify::Delete(CF_LOCK, key.encode_lock()));
    }

    fn put_write(&mut self, key: &Key, commit_ts: TimeStamp, write: &WriteRecord) {
        self.modifies
            .push(Modify::Put(CF_WRITE, key.encode_write(commit_ts), write.encode()));
    }

    fn put_data(&mut self, key: &Key, value: Vec<u8>) {
        self.modifies
            .push(Modify::Put(CF_DATA, key.encode_data(self.start_ts), value));
    }

    fn delete_data(&mut self, key: &Key, start_ts: TimeStamp) {
        self.modifies
            .push(Modify::Delete(CF_DATA, key.encode_data(start_ts)));
    }

    fn lock_info(&self, key: &Key, lock: &LockRecord) -> LockInfo {
        LockInfo {
            key: key.clone(),
            primary: lock.primary.clone(),
            start_ts: lock.start_ts,
            ttl_ms: lock.ttl_ms,
            kind: lock.kind,
        }
    }

    /// Prewrites one mutation. `pessimistic_check` carries the
    /// `for_update_ts` the client expects its pessimistic lock to hold; when
    /// present the existing pessimistic lock is converted in place.
    #[allow(clippy::too_many_arguments)]
    pub fn prewrite(
        &mut self,
        mutation: Mutation,
        primary: &Key,
        lock_ttl: u64,
        txn_size: u64,
        secondaries: Option<&[Key]>,
        min_commit_ts: TimeStamp,
        pessimistic_check: Option<TimeStamp>,
    ) -> Result<()> {
        let kind = match &mutation {
            Mutation::Put(_) => LockKind::Put,
            Mutation::Delete(_) => LockKind::Delete,
            Mutation::Lock(_) => {
                return Err(Error::Engine(kernel::Error::InvalidArgument(
                    "lock-only mutations go through the pessimistic lock path".to_owned(),
                )));
            }
        };
        let (key, value) = mutation.into_key_value();

        // The classic percolator write-write conflict. An optimistic
        // prewrite aborts on any commit at or after its start_ts; a
        // pessimistic one was already admitted at its for_update_ts and only
        // conflicts with commits above that.
        if let Some((commit_ts, write)) = self.reader.latest_write(&key)? {
            match pessimistic_check {
                None if commit_ts >= self.start_ts => {
                    return Err(Error::WriteConflict {
                        start_ts: self.start_ts,
                        conflict_start_ts: write.start_ts,
                        conflict_commit_ts: commit_ts,
                        key,
                        reason: WriteConflictReason::Optimistic,
                    });
                }
                Some(for_update_ts) if commit_ts > for_update_ts => {
                    return Err(Error::WriteConflict {
                        start_ts: self.start_ts,
                        conflict_start_ts: write.start_ts,
                        conflict_commit_ts: commit_ts,
                        key,
                        reason: WriteConflictReason::RetryWithNewForUpdateTs,
                    });
                }
                _ => {}
            }
        }

        match self.reader.load_lock(&key)? {
            Some(lock) if lock.start_ts != self.start_ts => {
                return Err(Error::KeyIsLocked(self.lock_info(&key, &lock)));
            }
            Some(lock) => {
                if let Some(expected_for_update_ts) = pessimistic_check {
                    if !lock.is_pessimistic() {
                        // Converted by a previous identical prewrite.
                        return Ok(());
                    }
                    if lock.for_update_ts != expected_for_update_ts {
                        return Err(Error::PessimisticLockNotFound {
                            start_ts: self.start_ts,
                            key,
                        });
                    }
                } else if !lock.is_pessimistic() {
                    // Retried prewrite; the lock is already in place.
                    return Ok(());
                }
                // An unexpected pessimistic lock of our own txn without a
                // check falls through and is converted as well.
            }
            None => {
                if pessimistic_check.is_some() {
                    return Err(Error::PessimisticLockNotFound {
                        start_ts: self.start_ts,
                        key,
                    });
                }
            }
        }

        let mut lock = LockRecord::new(kind, primary.clone(), self.start_ts, lock_ttl);
        lock.txn_size = txn_size;
        lock.min_commit_ts = min_commit_ts;
        lock.for_update_ts = pessimistic_check.unwrap_or_else(TimeStamp::zero);
        if let Some(secondaries) = secondaries {
            lock.use_async_commit = true;
            lock.secondaries = secondaries.to_vec();
        }
        if let Some(value) = value {
            if value.len() <= self.short_value_threshold {
                lock.short_value = Some(value);
            } else {
                self.put_data(&key, value);
            }
        }
        self.put_lock(&key, &lock);
        Ok(())
    }

    /// Takes or refreshes a pessimistic lock on `key`. Returns the value
    /// visible at `for_update_ts` when `return_values` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire_pessimistic_lock(
        &mut self,
        key: Key,
        primary: &Key,
        for_update_ts: TimeStamp,
        lock_ttl: u64,
        return_values: bool,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(lock) = self.reader.load_lock(&key)? {
            if lock.start_ts != self.start_ts {
                return Err(Error::KeyIsLocked(self.lock_info(&key, &lock)));
            }
            if !lock.is_pessimistic() {
                // Already prewritten by ourselves; locking again is a no-op.
                return Ok(None);
            }
            if lock.for_update_ts >= for_update_ts {
                // Idempotent retry.
                return Ok(None);
            }
            // Refresh below with the newer for_update_ts.
        } else if let Some((commit_ts, write)) = self.reader.latest_write(&key)? {
            if commit_ts > for_update_ts {
                return Err(Error::WriteConflict {
                    start_ts: self.start_ts,
                    conflict_start_ts: write.start_ts,
                    conflict_commit_ts: commit_ts,
                    key,
                    reason: WriteConflictReason::RetryWithNewForUpdateTs,
                });
            }
        }

        let value = if return_values {
            self.reader.get(&key, for_update_ts)?
        } else {
            None
        };
        let mut lock =
            LockRecord::new(LockKind::PessimisticLock, primary.clone(), self.start_ts, lock_ttl);
        lock.for_update_ts = for_update_ts;
        self.put_lock(&key, &lock);
        Ok(value)
    }

    /// Commits `key` at `commit_ts`. Idempotent with respect to keys the
    /// transaction already committed.
    pub fn commit(&mut self, key: &Key, commit_ts: TimeStamp) -> Result<()> {
        match self.reader.load_lock(key)? {
            Some(lock) if lock.start_ts == self.start_ts => {
                if !lock.min_commit_ts.is_zero() && commit_ts < lock.min_commit_ts {
                    return Err(Error::CommitTsExpired {
                        start_ts: self.start_ts,
                        commit_ts,
                        min_commit_ts: lock.min_commit_ts,
                        key: key.clone(),
                    });
                }
                let write = WriteRecord::new(
                    lock.kind.committed_kind(),
                    self.start_ts,
                    lock.short_value.clone(),
                );
                self.put_write(key, commit_ts, &write);
                self.unlock_key(key);
                Ok(())
            }
            _ => match self.reader.get_txn_commit_record(key, self.start_ts)? {
                Some((_, write)) if write.kind == WriteKind::Rollback => Err(Error::TxnRolledBack {
                    start_ts: self.start_ts,
                    key: key.clone(),
                }),
                // Committed by a concurrent retry.
                Some(_) => Ok(()),
                None => Err(Error::TxnLockNotFound {
                    start_ts: self.start_ts,
                    key: key.clone(),
                }),
            },
        }
    }

    fn put_rollback_record(&mut self, key: &Key) {
        let rollback = WriteRecord::new(WriteKind::Rollback, self.start_ts, None);
        self.put_write(key, self.start_ts, &rollback);
    }

    /// Rolls `key` back. Refuses if the transaction already committed.
    pub fn rollback(&mut self, key: &Key) -> Result<()> {
        match self.reader.load_lock(key)? {
            Some(lock) if lock.start_ts == self.start_ts => {
                if lock.short_value.is_none() && lock.kind == LockKind::Put {
                    self.delete_data(key, self.start_ts);
                }
                self.unlock_key(key);
                self.put_rollback_record(key);
                Ok(())
            }
            _ => match self.reader.get_txn_commit_record(key, self.start_ts)? {
                Some((_, write)) if write.kind == WriteKind::Rollback => Ok(()),
                Some((commit_ts, _)) => Err(Error::AlreadyCommitted {
                    start_ts: self.start_ts,
                    commit_ts,
                    key: key.clone(),
                }),
                None => {
                    // Nothing here yet; leave a tombstone so a straggling
                    // prewrite from this txn cannot take the key later.
                    self.put_rollback_record(key);
                    Ok(())
                }
            },
        }
    }

    /// Removes a pessimistic lock. Never touches optimistic locks or write
    /// records.
    pub fn pessimistic_rollback(&mut self, key: &Key, for_update_ts: TimeStamp) -> Result<()> {
        if let Some(lock) = self.reader.load_lock(key)? {
            if lock.start_ts == self.start_ts
                && lock.is_pessimistic()
                && lock.for_update_ts <= for_update_ts
            {
                self.unlock_key(key);
            }
        }
        Ok(())
    }

    /// Probes the primary lock and settles expired transactions, per the
    /// check-txn-status protocol.
    pub fn check_txn_status(
        &mut self,
        primary_key: &Key,
        caller_start_ts: TimeStamp,
        current_ts: TimeStamp,
    ) -> Result<TxnStatus> {
        match self.reader.load_lock(primary_key)? {
            Some(lock) if lock.start_ts == self.start_ts => {
                if lock.is_expired(current_ts) {
                    if lock.short_value.is_none() && lock.kind == LockKind::Put {
                        self.delete_data(primary_key, self.start_ts);
                    }
                    self.unlock_key(primary_key);
                    self.put_rollback_record(primary_key);
                    info!(
                        "rolled back expired primary lock of txn {} (ttl {}ms)",
                        self.start_ts, lock.ttl_ms
                    );
                    return Ok(TxnStatus::LockNotExist);
                }
                // A live large transaction: push min_commit_ts so waiting
                // readers are not starved by an eventual commit below them.
                let mut lock = lock;
                if !caller_start_ts.is_max()
                    && !caller_start_ts.is_zero()
                    && caller_start_ts.next() > lock.min_commit_ts
                {
                    lock.min_commit_ts = caller_start_ts.next();
                    self.put_lock(primary_key, &lock);
                }
                Ok(TxnStatus::Locked {
                    ttl_ms: lock.ttl_ms,
                    min_commit_ts: lock.min_commit_ts,
                })
            }
            _ => match self.reader.get_txn_commit_record(primary_key, self.start_ts)? {
                Some((_, write)) if write.kind == WriteKind::Rollback => Ok(TxnStatus::RolledBack),
                Some((commit_ts, _)) => Ok(TxnStatus::Committed { commit_ts }),
                None => {
                    // Protect the primary: a dead client's late prewrite must
                    // find the tombstone.
                    self.put_rollback_record(primary_key);
                    Ok(TxnStatus::LockNotExist)
                }
            },
        }
    }

    /// Bumps the primary lock's TTL to at least `advise_ttl_ms`. Returns the
    /// TTL now in effect.
    pub fn heart_beat(&mut self, primary_key: &Key, advise_ttl_ms: u64) -> Result<u64> {
        match self.reader.load_lock(primary_key)? {
            Some(mut lock) if lock.start_ts == self.start_ts => {
                if advise_ttl_ms > lock.ttl_ms {
                    lock.ttl_ms = advise_ttl_ms;
                    self.put_lock(primary_key, &lock);
                }
                Ok(lock.ttl_ms)
            }
            _ => Err(Error::TxnLockNotFound {
                start_ts: self.start_ts,
                key: primary_key.clone(),
            }),
        }
    }
}
