use crate::console::ConsoleLine;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback notified of each console line
pub type Observer = Arc<dyn Fn(&ConsoleLine) + Send + Sync>;

/// Registration token returned by [`ObserverRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Thread-safe list of console observers
///
/// Delivery works on a snapshot of the list, so observers may register,
/// unregister or call back into the supervisor from inside a callback.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Observer)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ConsoleLine) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        debug!(observer = id.0, "Registered console observer");
        id
    }

    /// Remove an observer; returns false if it was not registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    /// Channel-based subscription; the observer is dropped with the receiver
    pub fn subscribe(self: &Arc<Self>) -> (ObserverId, mpsc::UnboundedReceiver<ConsoleLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::downgrade(self);
        let id_cell = Arc::new(std::sync::OnceLock::new());
        let own_id = id_cell.clone();
        let id = self.register(move |line| {
            if tx.send(line.clone()).is_err() {
                if let (Some(registry), Some(id)) = (registry.upgrade(), own_id.get()) {
                    registry.unregister(*id);
                }
            }
        });
        let _ = id_cell.set(id);
        (id, rx)
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a line to every registered observer
    pub fn notify(&self, line: &ConsoleLine) {
        let snapshot: Vec<(ObserverId, Observer)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, observer) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| observer(line))).is_err() {
                warn!(observer = id.0, "Console observer panicked");
            }
        }
    }
}
