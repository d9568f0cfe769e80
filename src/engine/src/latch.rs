//! Per-region write serialization. Writers hash every touched key into a
//! slot, queue up FIFO per slot, and block until they head all of their
//! slots. Slots are always claimed in ascending order, so a parked writer
//! may keep heading slots it claimed earlier and the waits-for relation
//! still cannot cycle: whoever blocks it only waits on strictly higher
//! slots. That ordering rule, not release-on-contention, is the deadlock
//! guard here; giving claimed slots back would forfeit the writer's arrival
//! position and break per-key grant fairness. Readers never come here.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
};

use kernel::Key;

#[derive(Default)]
struct Slot {
    // command ids, front owns the slot
    waiting: VecDeque<u64>,
}

/// One writer's claim over its slots. `owned_count` slots at the front of
/// `required_slots` are held; the writer is parked on the next one.
pub struct Lock {
    required_slots: Vec<usize>,
    owned_count: usize,
}

impl Lock {
    pub fn acquired(&self) -> bool {
        self.owned_count == self.required_slots.len()
    }
}

#[derive(Default)]
struct Waiter {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    fn wait(&self) {
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            notified = self.cond.wait(notified).unwrap();
        }
        *notified = false;
    }

    fn notify(&self) {
        let mut notified = self.notified.lock().unwrap();
        *notified = true;
        self.cond.notify_one();
    }
}

pub struct Latches {
    slots: Vec<Mutex<Slot>>,
    waiters: Mutex<HashMap<u64, std::sync::Arc<Waiter>>>,
    next_cid: AtomicU64,
}

impl Latches {
    /// `size` is rounded up to a power of two.
    pub fn new(size: usize) -> Latches {
        let size = size.next_power_of_two().max(2);
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Mutex::default);
        Latches {
            slots,
            waiters: Mutex::new(HashMap::new()),
            next_cid: AtomicU64::new(1),
        }
    }

    fn gen_lock<'a>(&self, keys: impl Iterator<Item = &'a Key>) -> Lock {
        let mut required_slots: Vec<usize> = keys
            .map(|key| fxhash::hash64(key.as_encoded()) as usize & (self.slots.len() - 1))
            .collect();
        required_slots.sort_unstable();
        required_slots.dedup();
        Lock {
            required_slots,
            owned_count: 0,
        }
    }

    /// Tries to claim every remaining slot; enqueues at the first contended
    /// one and reports whether the claim is complete.
    fn acquire(&self, lock: &mut Lock, who: u64) -> bool {
        for &slot_index in &lock.required_slots[lock.owned_count..] {
            let mut slot = self.slots[slot_index].lock().unwrap();
            if !slot.waiting.contains(&who) {
                slot.waiting.push_back(who);
            }
            if *slot.waiting.front().unwrap() != who {
                return false;
            }
            lock.owned_count += 1;
        }
        true
    }

    /// Releases a fully acquired lock and returns the commands now at the
    /// front of a slot they were parked on.
    fn release(&self, lock: &Lock, who: u64) -> Vec<u64> {
        assert!(lock.acquired(), "release of a partially acquired latch lock");
        let mut wakeup = vec![];
        for &slot_index in &lock.required_slots {
            let mut slot = self.slots[slot_index].lock().unwrap();
            let front = slot.waiting.pop_front();
            assert_eq!(front, Some(who), "latch released by a non-owner");
            if let Some(&next) = slot.waiting.front() {
                wakeup.push(next);
            }
        }
        wakeup
    }

    /// Blocks until all of `keys` are owned, in arrival order per key.
    pub fn lock_keys<'a, 'k>(&'a self, keys: impl Iterator<Item = &'k Key>) -> LatchGuard<'a> {
        let who = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let mut lock = self.gen_lock(keys);
        if !self.acquire(&mut lock, who) {
            let waiter = {
                let mut waiters = self.waiters.lock().unwrap();
                waiters
                    .entry(who)
                    .or_insert_with(|| std::sync::Arc::new(Waiter::default()))
                    .clone()
            };
            loop {
                if self.acquire(&mut lock, who) {
                    break;
                }
                waiter.wait();
            }
            self.waiters.lock().unwrap().remove(&who);
        }
        LatchGuard {
            latches: self,
            lock: Some(lock),
            who,
        }
    }

    fn wake(&self, cids: &[u64]) {
        let waiters = self.waiters.lock().unwrap();
        for cid in cids {
            if let Some(waiter) = waiters.get(cid) {
                waiter.notify();
            }
        }
    }
}

/// Owns a set of latched keys; releasing wakes the next waiter on each slot.
pub struct LatchGuard<'a> {
    latches: &'a Latches,
    lock: Option<Lock>,
    who: u64,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let wakeup = self.latches.release(&lock, self.who);
            self.latches.wake(&wakeup);
        }
    }
}
