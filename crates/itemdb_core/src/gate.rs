//! Execution contexts for callbacks.
//!
//! Every callback the store hands out (transaction completion, live query
//! events, change listeners) is delivered through a [`Gate`] the caller
//! picks. A [`ThreadGate`] runs jobs in order on one dedicated thread, which
//! is how a UI-affine or otherwise single-threaded consumer receives events.

use crate::error::{DbError, DbResult};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::warn;

/// A unit of work handed to a gate.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run callbacks.
pub trait Gate: Send + Sync {
    /// Runs or schedules `job`. Jobs submitted from one thread run in
    /// submission order.
    fn execute(&self, job: Job);
}

/// Runs jobs immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Straight;

impl Gate for Straight {
    fn execute(&self, job: Job) {
        job();
    }
}

/// A shared [`Straight`] gate.
#[must_use]
pub fn straight() -> Arc<dyn Gate> {
    Arc::new(Straight)
}

/// Runs jobs in FIFO order on a dedicated thread.
pub struct ThreadGate {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl ThreadGate {
    /// Spawns the gate thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(name: impl Into<String>) -> DbResult<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(DbError::Io)?;
        let thread_id = worker.thread().id();
        Ok(Arc::new(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            thread_id,
        }))
    }

    /// Returns true when called from the gate thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Gate thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting jobs, runs the queued ones and joins the thread.
    ///
    /// Called from the gate thread itself, this only stops accepting jobs.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if self.is_current() {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(gate = %self.name, "gate thread panicked");
            }
        }
    }
}

impl Gate for ThreadGate {
    fn execute(&self, job: Job) {
        let sent = match &*self.sender.lock() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            warn!(gate = %self.name, "gate is shut down, dropping job");
        }
    }
}

impl Drop for ThreadGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGate").field("name", &self.name).finish()
    }
}
