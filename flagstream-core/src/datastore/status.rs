use std::sync::Arc;

use parking_lot::RwLock;

use crate::listeners::{ListenerHandle, Listeners};

/// Health of a persistent data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// Whether the store is reachable.
    pub available: bool,
    /// Whether writes were lost during an outage, leaving the store
    /// possibly behind the in-memory state.
    pub stale: bool,
}

impl Default for DataStoreStatus {
    fn default() -> Self {
        DataStoreStatus { available: true, stale: false }
    }
}

/// Broadcasts store availability transitions; listeners are only woken
/// when the status actually changes.
#[derive(Debug, Default)]
pub struct DataStoreStatusProvider {
    listeners: Arc<Listeners<DataStoreStatus>>,
    status: RwLock<DataStoreStatus>,
}

impl DataStoreStatusProvider {
    pub fn new() -> Self {
        DataStoreStatusProvider::default()
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.status.read()
    }

    pub fn update_status(&self, status: DataStoreStatus) {
        let old = {
            let mut current = self.status.write();
            std::mem::replace(&mut *current, status)
        };
        if old != status {
            self.listeners.notify(&status);
        }
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(&DataStoreStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.remove(handle);
    }
}

/// Wraps a store so that operation failures and recoveries surface as
/// [`DataStoreStatus`] transitions.
///
/// After an outage the store is reported stale, since writes may have been
/// lost while it was down; a subsequent full `init` clears the staleness.
pub struct MonitoredStore {
    inner: Arc<dyn crate::store::DataStore>,
    provider: Arc<DataStoreStatusProvider>,
}

impl MonitoredStore {
    pub fn new(
        inner: Arc<dyn crate::store::DataStore>,
        provider: Arc<DataStoreStatusProvider>,
    ) -> Self {
        MonitoredStore { inner, provider }
    }

    fn track<T>(
        &self,
        result: crate::error::Result<T>,
        refreshes: bool,
    ) -> crate::error::Result<T> {
        let current = self.provider.status();
        match &result {
            Ok(_) => {
                if !current.available {
                    self.provider
                        .update_status(DataStoreStatus { available: true, stale: !refreshes });
                } else if refreshes && current.stale {
                    self.provider.update_status(DataStoreStatus { available: true, stale: false });
                }
            }
            Err(_) => {
                self.provider.update_status(DataStoreStatus { available: false, stale: false });
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl crate::store::DataStore for MonitoredStore {
    async fn init(&self, all_data: flagstream_model::FullDataSet) -> crate::error::Result<()> {
        let result = self.inner.init(all_data).await;
        self.track(result, true)
    }

    async fn get(
        &self,
        kind: flagstream_model::DataKind,
        key: &str,
    ) -> crate::error::Result<Option<flagstream_model::StoreItem>> {
        let result = self.inner.get(kind, key).await;
        self.track(result, false)
    }

    async fn all(
        &self,
        kind: flagstream_model::DataKind,
    ) -> crate::error::Result<std::collections::HashMap<String, flagstream_model::StoreItem>> {
        let result = self.inner.all(kind).await;
        self.track(result, false)
    }

    async fn upsert(
        &self,
        kind: flagstream_model::DataKind,
        item: flagstream_model::StoreItem,
    ) -> crate::error::Result<()> {
        let result = self.inner.upsert(kind, item).await;
        self.track(result, false)
    }

    async fn delete(
        &self,
        kind: flagstream_model::DataKind,
        key: &str,
        version: u64,
    ) -> crate::error::Result<()> {
        let result = self.inner.delete(kind, key, version).await;
        self.track(result, false)
    }

    async fn initialized(&self) -> bool {
        self.inner.initialized().await
    }
}

impl std::fmt::Debug for MonitoredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredStore").field("status", &self.provider.status()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn notifies_only_on_change() {
        let provider = DataStoreStatusProvider::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        provider.add_listener(move |status| s.lock().push(*status));

        provider.update_status(DataStoreStatus { available: true, stale: false });
        assert!(seen.lock().is_empty());

        provider.update_status(DataStoreStatus { available: false, stale: false });
        provider.update_status(DataStoreStatus { available: false, stale: false });
        assert_eq!(seen.lock().len(), 1);

        provider.update_status(DataStoreStatus { available: true, stale: true });
        assert_eq!(seen.lock().len(), 2);
    }

    mod monitored {
        use super::*;
        use crate::error::{Result, StoreError};
        use crate::store::DataStore;
        use flagstream_model::{DataKind, FullDataSet, StoreItem};
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicBool, Ordering};

        #[derive(Default)]
        struct FlakyStore {
            failing: AtomicBool,
        }

        impl FlakyStore {
            fn result(&self) -> Result<()> {
                if self.failing.load(Ordering::SeqCst) {
                    Err(StoreError::Unavailable("down".into()))
                } else {
                    Ok(())
                }
            }
        }

        #[async_trait::async_trait]
        impl DataStore for FlakyStore {
            async fn init(&self, _all_data: FullDataSet) -> Result<()> {
                self.result()
            }
            async fn get(&self, _kind: DataKind, _key: &str) -> Result<Option<StoreItem>> {
                self.result().map(|_| None)
            }
            async fn all(&self, _kind: DataKind) -> Result<HashMap<String, StoreItem>> {
                self.result().map(|_| HashMap::new())
            }
            async fn upsert(&self, _kind: DataKind, _item: StoreItem) -> Result<()> {
                self.result()
            }
            async fn delete(&self, _kind: DataKind, _key: &str, _version: u64) -> Result<()> {
                self.result()
            }
            async fn initialized(&self) -> bool {
                true
            }
        }

        #[tokio::test]
        async fn outage_and_recovery_transitions() {
            let flaky = Arc::new(FlakyStore::default());
            let provider = Arc::new(DataStoreStatusProvider::new());
            let store = MonitoredStore::new(
                Arc::clone(&flaky) as Arc<dyn DataStore>,
                Arc::clone(&provider),
            );

            assert!(store.get(DataKind::Flag, "a").await.is_ok());
            assert!(provider.status().available);

            flaky.failing.store(true, Ordering::SeqCst);
            assert!(store.get(DataKind::Flag, "a").await.is_err());
            assert!(!provider.status().available);

            // recovery through a read leaves the store marked stale
            flaky.failing.store(false, Ordering::SeqCst);
            assert!(store.get(DataKind::Flag, "a").await.is_ok());
            let status = provider.status();
            assert!(status.available);
            assert!(status.stale);

            // a full init refreshes everything
            assert!(store.init(FullDataSet::new()).await.is_ok());
            let status = provider.status();
            assert!(status.available);
            assert!(!status.stale);
        }
    }
}
