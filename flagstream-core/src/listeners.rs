use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::error;

/// Identity of a registered callback, returned by [`Listeners::add`] and
/// used to remove it later. Handles are never reused within one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of callbacks that all receive the same value type.
///
/// Notification happens synchronously on the caller's thread, iterating a
/// snapshot of the registry so that callbacks may add or remove listeners
/// without deadlocking. A panicking callback is logged and does not stop
/// the remaining callbacks.
pub struct Listeners<T> {
    listeners: RwLock<Vec<(ListenerHandle, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Listeners { listeners: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((handle, Arc::new(listener)));
        handle
    }

    /// Removing a handle that was never added (or already removed) is a
    /// no-op.
    pub fn remove(&self, handle: ListenerHandle) {
        self.listeners.write().retain(|(h, _)| *h != handle);
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> =
            self.listeners.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                error!(
                    "listener for {} panicked; continuing with remaining listeners",
                    std::any::type_name::<T>()
                );
            }
        }
    }
}

impl<T> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.listeners.read().len())
            .finish()
    }
}
