//! Transaction handles.
//!
//! Submitting a transaction returns a [`TxHandle`] immediately. The caller
//! may block on it, poll it, cancel it, or ask for a completion callback on
//! a gate of its choosing.

use crate::error::DbError;
use crate::gate::Gate;
use crate::types::Icn;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Errors a transaction procedure may return.
///
/// Store failures convert into the procedure's error type, and the store
/// asks the error whether it is the cancellation signal.
pub trait TxError: From<DbError> + Send + 'static {
    /// Returns true for the cancellation signal.
    fn is_cancelled(&self) -> bool;
}

impl TxError for DbError {
    fn is_cancelled(&self) -> bool {
        DbError::is_cancelled(self)
    }
}

/// Cooperative cancellation flag shared between a handle and its procedure.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails with [`DbError::Cancelled`] once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns the cancellation signal.
    pub fn check(&self) -> Result<(), DbError> {
        if self.is_cancelled() {
            Err(DbError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Outcome of a finished transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// A write committed at this ICN.
    Committed(Icn),
    /// A read finished successfully, or a write that changed nothing was
    /// skipped without using an ICN.
    Completed,
    /// The procedure was cancelled. Nothing was written.
    Cancelled,
    /// The procedure or the store failed. Nothing was written.
    Failed,
}

impl TxStatus {
    /// Returns true for `Committed` and `Completed`.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Committed(_) | Self::Completed)
    }

    /// The commit ICN of a successful write.
    #[must_use]
    pub const fn icn(self) -> Option<Icn> {
        match self {
            Self::Committed(icn) => Some(icn),
            _ => None,
        }
    }
}

type Completion = Box<dyn FnOnce(TxStatus) + Send>;

struct State<T, E> {
    status: Option<TxStatus>,
    outcome: Option<Result<T, E>>,
    callbacks: Vec<(Arc<dyn Gate>, Completion)>,
}

struct Shared<T, E> {
    cancel: CancellationToken,
    state: Mutex<State<T, E>>,
    done: Condvar,
}

/// Future-like result of a submitted transaction.
#[must_use = "dropping a handle does not cancel the transaction"]
pub struct TxHandle<T, E = DbError> {
    shared: Arc<Shared<T, E>>,
}

/// Producer side of a [`TxHandle`].
///
/// Dropping it without completing fails the transaction with
/// [`DbError::StoreClosed`], so a waiter never hangs on work the store
/// discarded during shutdown.
pub(crate) struct TxCompleter<T, E: TxError> {
    shared: Option<Arc<Shared<T, E>>>,
}

pub(crate) fn tx_pair<T, E: TxError>() -> (TxHandle<T, E>, TxCompleter<T, E>) {
    let shared = Arc::new(Shared {
        cancel: CancellationToken::new(),
        state: Mutex::new(State {
            status: None,
            outcome: None,
            callbacks: Vec::new(),
        }),
        done: Condvar::new(),
    });
    (
        TxHandle {
            shared: Arc::clone(&shared),
        },
        TxCompleter {
            shared: Some(shared),
        },
    )
}

impl<T, E> TxHandle<T, E> {
    /// Blocks until the transaction finishes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the procedure's error, the cancellation signal, or a store
    /// failure.
    pub fn wait(self) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let mut state = self.shared.state.lock();
        while state.status.is_none() {
            self.shared.done.wait(&mut state);
        }
        state
            .outcome
            .take()
            .unwrap_or_else(|| Err(E::from(DbError::StoreClosed)))
    }

    /// Blocks until the transaction finishes and returns its status.
    pub fn wait_status(&self) -> TxStatus {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(status) = state.status {
                return status;
            }
            self.shared.done.wait(&mut state);
        }
    }

    /// The status, if finished.
    #[must_use]
    pub fn status(&self) -> Option<TxStatus> {
        self.shared.state.lock().status
    }

    /// Returns true once finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status().is_some()
    }

    /// The commit ICN, once a write has committed.
    #[must_use]
    pub fn commit_icn(&self) -> Option<Icn> {
        self.status().and_then(TxStatus::icn)
    }

    /// Requests cancellation. A transaction that has not started is skipped;
    /// a running one sees the request at its next cancellation check.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// The token the procedure observes.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Runs `callback` on `gate` when the transaction finishes. If it has
    /// already finished, the callback is handed to the gate right away.
    pub fn on_complete(&self, gate: Arc<dyn Gate>, callback: impl FnOnce(TxStatus) + Send + 'static) {
        let status = {
            let mut state = self.shared.state.lock();
            match state.status {
                Some(status) => status,
                None => {
                    state.callbacks.push((gate, Box::new(callback)));
                    return;
                }
            }
        };
        gate.execute(Box::new(move || callback(status)));
    }
}

impl<T, E> std::fmt::Debug for TxHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle").field("status", &self.status()).finish()
    }
}

impl<T, E: TxError> TxCompleter<T, E> {
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.shared
            .as_ref()
            .map(|shared| shared.cancel.clone())
            .unwrap_or_default()
    }

    /// Publishes the outcome. `icn` is set for committed writes.
    pub(crate) fn complete(mut self, outcome: Result<T, E>, icn: Option<Icn>) {
        self.finish(outcome, icn);
    }

    fn finish(&mut self, outcome: Result<T, E>, icn: Option<Icn>) {
        let Some(shared) = self.shared.take() else { return };
        let status = match (&outcome, icn) {
            (Ok(_), Some(icn)) => TxStatus::Committed(icn),
            (Ok(_), None) => TxStatus::Completed,
            (Err(e), _) if e.is_cancelled() => TxStatus::Cancelled,
            (Err(_), _) => TxStatus::Failed,
        };
        let callbacks = {
            let mut state = shared.state.lock();
            state.status = Some(status);
            state.outcome = Some(outcome);
            std::mem::take(&mut state.callbacks)
        };
        shared.done.notify_all();
        for (gate, callback) in callbacks {
            gate.execute(Box::new(move || callback(status)));
        }
    }
}

impl<T, E: TxError> Drop for TxCompleter<T, E> {
    fn drop(&mut self) {
        if self.shared.is_some() {
            self.finish(Err(E::from(DbError::StoreClosed)), None);
        }
    }
}
