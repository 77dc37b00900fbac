use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long `stop()` waits for a background task to wind down before
/// abandoning the join.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A background task that runs a closure repeatedly at a fixed interval,
/// after an initial delay. Stopping is cooperative and idempotent.
pub struct RepeatingTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: &'static str, delay: Duration, interval: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            loop {
                body().await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        RepeatingTask { name, cancel, handle: Mutex::new(Some(handle)) }
    }

    /// Signals the task to stop and waits for it to finish, up to
    /// [`STOP_GRACE_PERIOD`].
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            debug!("stopping repeating task {}", self.name);
            if tokio::time::timeout(STOP_GRACE_PERIOD, handle).await.is_err() {
                warn!("repeating task {} did not stop within grace period", self.name);
            }
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RepeatingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatingTask").field("name", &self.name).finish()
    }
}

/// A set-once event. Used for the data systems' "ready" signal: set on the
/// first successful data load or on permanent failure, whichever comes
/// first. Cloning yields another handle to the same event.
#[derive(Clone, Debug)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Signal { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits for the signal with a timeout; returns whether it was set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
