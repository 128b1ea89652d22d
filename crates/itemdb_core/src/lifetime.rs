//! Lifetimes for subscriptions.

use parking_lot::Mutex;
use std::sync::Arc;

type Detach = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    ended: bool,
    detach: Vec<Detach>,
}

/// Bounds how long a subscription stays registered.
///
/// Ending a lifetime runs every detach callback synchronously, once. A
/// callback registered after the end runs immediately. Clones share state.
#[derive(Clone, Default)]
pub struct Lifetime {
    inner: Option<Arc<Mutex<Inner>>>,
}

impl Lifetime {
    /// A lifetime that ends when [`Lifetime::end`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(Inner::default()))),
        }
    }

    /// A lifetime that never ends.
    #[must_use]
    pub fn forever() -> Self {
        Self { inner: None }
    }

    /// Ends the lifetime and detaches everything bound to it.
    pub fn end(&self) {
        let Some(inner) = &self.inner else { return };
        let detach = {
            let mut inner = inner.lock();
            if inner.ended {
                return;
            }
            inner.ended = true;
            std::mem::take(&mut inner.detach)
        };
        for callback in detach.into_iter().rev() {
            callback();
        }
    }

    /// Returns true once ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.lock().ended)
    }

    /// Registers a callback to run when the lifetime ends.
    pub fn on_end(&self, callback: impl FnOnce() + Send + 'static) {
        let Some(inner) = &self.inner else { return };
        {
            let mut inner = inner.lock();
            if !inner.ended {
                inner.detach.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifetime")
            .field("forever", &self.inner.is_none())
            .field("ended", &self.is_ended())
            .finish()
    }
}
