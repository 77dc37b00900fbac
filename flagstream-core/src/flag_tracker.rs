use std::sync::Arc;

use crate::listeners::{ListenerHandle, Listeners};

/// Notification that a flag's configuration changed, directly or through
/// something it depends on. Receiving one does not guarantee the flag now
/// evaluates differently for any particular context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    pub key: String,
}

impl FlagChange {
    pub fn new(key: impl Into<String>) -> Self {
        FlagChange { key: key.into() }
    }
}

/// Registration surface handed to evaluator callers that want to observe
/// flag changes.
#[derive(Debug, Clone)]
pub struct FlagTracker {
    listeners: Arc<Listeners<FlagChange>>,
}

impl FlagTracker {
    pub fn new(listeners: Arc<Listeners<FlagChange>>) -> Self {
        FlagTracker { listeners }
    }

    pub fn add_listener(&self, listener: impl Fn(&FlagChange) + Send + Sync + 'static) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.remove(handle);
    }
}
