use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::datasource::{DataSourceErrorInfo, DataSourceState, DataSourceStatus};
use crate::listeners::{ListenerHandle, Listeners};

/// Tracks the health of the active data source and broadcasts transitions
/// to registered listeners.
///
/// Two rules keep the state machine honest: an interruption that happens
/// before the source has ever been valid leaves it `Initializing`, and an
/// update that changes neither state nor error is swallowed so listeners
/// are not woken for no-ops.
#[derive(Debug)]
pub struct DataSourceStatusProvider {
    listeners: Arc<Listeners<DataSourceStatus>>,
    status: RwLock<StatusState>,
}

#[derive(Debug)]
struct StatusState {
    status: DataSourceStatus,
    /// Monotonic companion to `status.since`, used for age checks (and
    /// controllable by tokio's test clock).
    since_instant: tokio::time::Instant,
}

impl Default for DataSourceStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceStatusProvider {
    pub fn new() -> Self {
        DataSourceStatusProvider {
            listeners: Arc::new(Listeners::new()),
            status: RwLock::new(StatusState {
                status: DataSourceStatus::initializing(),
                since_instant: tokio::time::Instant::now(),
            }),
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.read().status.clone()
    }

    /// How long the source has been in its current state.
    pub fn status_age(&self) -> std::time::Duration {
        self.status.read().since_instant.elapsed()
    }

    pub fn update_status(&self, new_state: DataSourceState, new_error: Option<DataSourceErrorInfo>) {
        let status_to_broadcast = {
            let mut state = self.status.write();
            let mut new_state = new_state;

            if new_state == DataSourceState::Interrupted
                && state.status.state == DataSourceState::Initializing
            {
                new_state = DataSourceState::Initializing;
            }

            if new_state == state.status.state && new_error.is_none() {
                return;
            }

            let since = if new_state == state.status.state {
                state.status.since
            } else {
                state.since_instant = tokio::time::Instant::now();
                Utc::now()
            };
            let error = match new_error {
                Some(error) => Some(error),
                None => state.status.error.clone(),
            };
            state.status = DataSourceStatus { state: new_state, since, error };
            state.status.clone()
        };

        self.listeners.notify(&status_to_broadcast);
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(&DataSourceStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.remove(handle);
    }
}
