//! "Something changed" notifications.

use crate::gate::Gate;
use crate::lifetime::Lifetime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
    id: u64,
    gate: Arc<dyn Gate>,
    callback: Callback,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

/// A listener list for observers that only need to know that something
/// changed, not what.
///
/// Listeners are added with a [`Lifetime`] and a [`Gate`]; when the lifetime
/// ends the listener is removed and no queued notification reaches it.
#[derive(Clone, Default)]
pub struct SimpleModifiable {
    registry: Arc<Registry>,
}

impl SimpleModifiable {
    /// Creates an empty listener list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener for the duration of `lifetime`.
    pub fn add_listener(
        &self,
        lifetime: &Lifetime,
        gate: Arc<dyn Gate>,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        if lifetime.is_ended() {
            return;
        }
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        self.registry.listeners.lock().push(Listener {
            id,
            gate,
            callback: Arc::new(callback),
            alive: Arc::clone(&alive),
        });
        let registry = Arc::downgrade(&self.registry);
        lifetime.on_end(move || {
            alive.store(false, Ordering::Release);
            if let Some(registry) = registry.upgrade() {
                registry.listeners.lock().retain(|l| l.id != id);
            }
        });
    }

    /// Notifies every listener through its gate.
    pub fn fire_changed(&self) {
        let targets: Vec<(Arc<dyn Gate>, Callback, Arc<AtomicBool>)> = self
            .registry
            .listeners
            .lock()
            .iter()
            .map(|l| (Arc::clone(&l.gate), Arc::clone(&l.callback), Arc::clone(&l.alive)))
            .collect();
        for (gate, callback, alive) in targets {
            gate.execute(Box::new(move || {
                if alive.load(Ordering::Acquire) {
                    callback();
                }
            }));
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.listeners.lock().len()
    }
}

impl std::fmt::Debug for SimpleModifiable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleModifiable")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
