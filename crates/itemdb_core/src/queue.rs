//! Prioritized pool for read transactions.

use crate::error::{DbError, DbResult};
use crate::gate::Job;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Scheduling priority of a read transaction.
///
/// Foreground reads are taken before any queued background read. Within one
/// priority, reads start in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Bulk or speculative work.
    #[default]
    Background,
    /// Work a user is waiting on.
    Foreground,
}

struct Queued {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Fixed set of reader threads draining a priority queue.
pub(crate) struct ReadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadPool {
    pub(crate) fn new(threads: usize) -> DbResult<Self> {
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("itemdb-reader-{index}"))
                .spawn(move || run_worker(&shared))
                .map_err(DbError::Io)?;
            workers.push(worker);
        }
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queues `job`. Returns false once the pool is shut down; the job is
    /// dropped in that case.
    pub(crate) fn submit(&self, priority: Priority, job: Job) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Queued { priority, seq, job });
        drop(state);
        self.shared.ready.notify_one();
        true
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stops the workers. Jobs still queued are dropped.
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.heap)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping queued reads on shutdown");
        }
        drop(dropped);
        self.shared.ready.notify_all();
        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for ReadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    return;
                }
                if let Some(queued) = state.heap.pop() {
                    break queued.job;
                }
                shared.ready.wait(&mut state);
            }
        };
        job();
    }
}
