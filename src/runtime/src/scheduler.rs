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

//! Bounded worker pools. Request handlers enqueue closures instead of
//! blocking RPC threads; a full queue is reported back immediately so the
//! client can back off.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    sender: Sender<Task>,
    queued: Arc<AtomicUsize>,
    handle: Option<thread::JoinHandle<()>>,
}

/// A fixed set of named worker threads, each with its own bounded queue.
pub struct WorkerPool {
    name: String,
    workers: Vec<Worker>,
    rr: AtomicUsize,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize, queue_size: usize) -> WorkerPool {
        assert!(workers > 0, "a worker pool needs at least one worker");
        let workers = (0..workers)
            .map(|index| {
                let (sender, receiver): (Sender<Task>, Receiver<Task>) = bounded(queue_size);
                let queued = Arc::new(AtomicUsize::new(0));
                let worker_queued = queued.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", name, index))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            worker_queued.fetch_sub(1, Ordering::AcqRel);
                            task();
                        }
                    })
                    .unwrap();
                Worker {
                    sender,
                    queued,
                    handle: Some(handle),
                }
            })
            .collect();
        WorkerPool {
            name: name.to_owned(),
            workers,
            rr: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total tasks waiting across all queues.
    pub fn pending(&self) -> usize {
        self.workers
            .iter()
            .map(|worker| worker.queued.load(Ordering::Acquire))
            .sum()
    }

    fn submit(&self, index: usize, task: Task) -> Result<(), Task> {
        let worker = &self.workers[index];
        worker.queued.fetch_add(1, Ordering::AcqRel);
        match worker.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                worker.queued.fetch_sub(1, Ordering::AcqRel);
                debug!("worker pool {} queue {} is full", self.name, index);
                Err(task)
            }
        }
    }

    /// Round-robin dispatch. Gives the task back when the chosen queue is
    /// full, so the caller can fail the request with `RequestFull`.
    pub fn execute_rr(&self, task: Task) -> Result<(), Task> {
        let index = self.rr.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.submit(index, task)
    }

    /// Dispatch to the worker with the shortest queue, used for expensive
    /// reads such as index searches.
    pub fn execute_least_queue(&self, task: Task) -> Result<(), Task> {
        let index = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.queued.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .unwrap();
        self.submit(index, task)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Closing the channel ends the worker loop.
            let (closed, _) = bounded::<Task>(1);
            worker.sender = closed;
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc,
        },
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_tasks_run() {
        let pool = WorkerPool::new("test-read", 4, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..32 {
            let counter = counter.clone();
            let tx = tx.clone();
            assert!(pool
                .execute_rr(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                }))
                .is_ok());
        }
        for _ in 0..32 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_full_queue_returns_task() {
        let pool = WorkerPool::new("test-tiny", 1, 1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        // Occupy the single worker ...
        assert!(pool
            .execute_rr(Box::new(move || {
                release_rx.recv().unwrap();
            }))
            .is_ok());
        // ... fill its queue ...
        while pool.execute_rr(Box::new(|| {})).is_ok() {}
        // ... and the next enqueue bounces.
        assert!(pool.execute_rr(Box::new(|| {})).is_err());
        assert!(pool.pending() >= 1);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_least_queue_picks_idle_worker() {
        let pool = WorkerPool::new("test-least", 2, 8);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let block_rx = Arc::new(std::sync::Mutex::new(block_rx));

        // Pin one worker with a slow task plus queued work.
        let rx = block_rx.clone();
        pool.workers[0]
            .sender
            .send(Box::new(move || {
                rx.lock().unwrap().recv().unwrap();
            }))
            .unwrap();
        pool.workers[0].queued.fetch_add(1, Ordering::AcqRel);
        for _ in 0..3 {
            assert!(pool.submit(0, Box::new(|| {})).is_ok());
        }

        // Least-queue dispatch must choose the idle worker.
        let (tx, rx) = mpsc::channel();
        assert!(pool
            .execute_least_queue(Box::new(move || {
                tx.send(()).unwrap();
            }))
            .is_ok());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        block_tx.send(()).unwrap();
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let pool = WorkerPool::new("test-drop", 2, 4);
        let (tx, rx) = mpsc::channel();
        assert!(pool
            .execute_rr(Box::new(move || {
                tx.send(()).unwrap();
            }))
            .is_ok());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(pool);
    }
}
