use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::datasource::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus};
use crate::datasourcev2::status::DataSourceStatusProvider;
use crate::deps::DependencyTracker;
use crate::error::Result;
use crate::flag_tracker::FlagChange;
use crate::listeners::{ListenerHandle, Listeners};
use crate::store::DataStore;
use flagstream_model::{DataKind, FullDataSet, KindAndKey, StoreItem};

/// Bridge between a v1 update processor and the rest of the SDK: writes go
/// to the configured store, the dependency graph is kept current, and
/// flag-change events are fanned out for everything affected.
///
/// A store failure is converted into an `Interrupted`/`StoreError` status
/// before the error is handed back to the caller, so status listeners see
/// the outage even when the processor retries on its own.
pub struct DataSourceUpdateSink {
    store: Arc<dyn DataStore>,
    status: DataSourceStatusProvider,
    flag_change_listeners: Arc<Listeners<FlagChange>>,
    tracker: Mutex<DependencyTracker>,
}

impl DataSourceUpdateSink {
    pub fn new(store: Arc<dyn DataStore>, flag_change_listeners: Arc<Listeners<FlagChange>>) -> Self {
        DataSourceUpdateSink {
            store,
            status: DataSourceStatusProvider::new(),
            flag_change_listeners,
            tracker: Mutex::new(DependencyTracker::new()),
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.status()
    }

    pub fn add_status_listener(
        &self,
        listener: impl Fn(&DataSourceStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.status.add_listener(listener)
    }

    pub fn remove_status_listener(&self, handle: ListenerHandle) {
        self.status.remove_listener(handle);
    }

    pub async fn init(&self, all_data: FullDataSet) -> Result<()> {
        let old_data = if self.flag_change_listeners.has_listeners() {
            let mut old: HashMap<DataKind, HashMap<String, StoreItem>> = HashMap::new();
            for kind in DataKind::ALL {
                old.insert(kind, self.monitor(self.store.all(kind).await)?);
            }
            Some(old)
        } else {
            None
        };

        self.monitor(self.store.init(all_data.clone()).await)?;

        {
            let mut tracker = self.tracker.lock();
            tracker.reset();
            for (kind, items) in &all_data {
                for (key, item) in items {
                    tracker.update_dependencies_from(*kind, key, Some(item));
                }
            }
        }

        if let Some(old_data) = old_data {
            let affected = self.compute_changed_items_for_full_data_set(&old_data, &all_data);
            self.send_change_events(&affected);
        }
        Ok(())
    }

    pub async fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<()> {
        self.monitor(self.store.upsert(kind, item.clone()).await)?;
        self.update_dependencies_for_single_item(kind, item.key(), Some(&item));
        Ok(())
    }

    pub async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<()> {
        self.monitor(self.store.delete(kind, key, version).await)?;
        self.update_dependencies_for_single_item(kind, key, None);
        Ok(())
    }

    pub fn update_status(&self, new_state: DataSourceState, new_error: Option<DataSourceErrorInfo>) {
        self.status.update_status(new_state, new_error);
    }

    fn monitor<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            let info = DataSourceErrorInfo::new(DataSourceErrorKind::StoreError, error.to_string());
            self.update_status(DataSourceState::Interrupted, Some(info));
        }
        result
    }

    fn update_dependencies_for_single_item(&self, kind: DataKind, key: &str, item: Option<&StoreItem>) {
        let mut tracker = self.tracker.lock();
        tracker.update_dependencies_from(kind, key, item);
        if self.flag_change_listeners.has_listeners() {
            let mut affected = HashSet::new();
            tracker.add_affected_items(&mut affected, &KindAndKey::new(kind, key));
            drop(tracker);
            self.send_change_events(&affected);
        }
    }

    fn send_change_events(&self, affected: &HashSet<KindAndKey>) {
        for item in affected {
            if item.kind == DataKind::Flag {
                self.flag_change_listeners.notify(&FlagChange::new(&item.key));
            }
        }
    }

    fn compute_changed_items_for_full_data_set(
        &self,
        old_data: &HashMap<DataKind, HashMap<String, StoreItem>>,
        new_data: &FullDataSet,
    ) -> HashSet<KindAndKey> {
        let tracker = self.tracker.lock();
        let mut affected = HashSet::new();
        let empty = HashMap::new();

        for kind in DataKind::ALL {
            let old_items = old_data.get(&kind).unwrap_or(&empty);
            let new_items = new_data.get(&kind).unwrap_or(&empty);

            let keys: HashSet<&String> = old_items.keys().chain(new_items.keys()).collect();
            for key in keys {
                let old_item = old_items.get(key);
                let new_item = new_items.get(key);
                let changed = match (old_item, new_item) {
                    (None, None) => false,
                    (None, Some(_)) | (Some(_), None) => true,
                    (Some(old), Some(new)) => old.version() != new.version(),
                };
                if changed {
                    tracker.add_affected_items(&mut affected, &KindAndKey::new(kind, key));
                }
            }
        }
        affected
    }
}

impl std::fmt::Debug for DataSourceUpdateSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceUpdateSink").field("status", &self.status()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::InMemoryDataStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn flag_with_segment(key: &str, version: u64, segment: &str) -> StoreItem {
        StoreItem::from_json(
            DataKind::Flag,
            json!({
                "key": key,
                "version": version,
                "rules": [{"clauses": [{"op": "segmentMatch", "values": [segment]}]}],
            }),
        )
        .unwrap()
    }

    fn flag(key: &str, version: u64) -> StoreItem {
        StoreItem::from_json(DataKind::Flag, json!({"key": key, "version": version})).unwrap()
    }

    fn segment(key: &str, version: u64) -> StoreItem {
        StoreItem::from_json(DataKind::Segment, json!({"key": key, "version": version})).unwrap()
    }

    fn data_set(items: &[(DataKind, StoreItem)]) -> FullDataSet {
        let mut all = FullDataSet::new();
        all.insert(DataKind::Flag, HashMap::new());
        all.insert(DataKind::Segment, HashMap::new());
        for (kind, item) in items {
            all.get_mut(kind).unwrap().insert(item.key().to_owned(), item.clone());
        }
        all
    }

    fn collecting_sink() -> (Arc<DataSourceUpdateSink>, Arc<parking_lot::Mutex<Vec<String>>>) {
        let listeners = Arc::new(Listeners::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        listeners.add(move |change: &FlagChange| s.lock().push(change.key.clone()));
        let sink = Arc::new(DataSourceUpdateSink::new(Arc::new(InMemoryDataStore::new()), listeners));
        (sink, seen)
    }

    #[tokio::test]
    async fn upserting_referenced_segment_fires_flag_change() {
        let (sink, seen) = collecting_sink();
        sink.init(data_set(&[
            (DataKind::Flag, flag_with_segment("f1", 1, "s1")),
            (DataKind::Segment, segment("s1", 1)),
        ]))
        .await
        .unwrap();
        seen.lock().clear();

        sink.upsert(DataKind::Segment, segment("s1", 2)).await.unwrap();
        assert_eq!(*seen.lock(), vec!["f1".to_owned()]);
    }

    #[tokio::test]
    async fn init_diff_fires_events_for_changed_keys_only() {
        let (sink, seen) = collecting_sink();
        sink.init(data_set(&[
            (DataKind::Flag, flag("a", 1)),
            (DataKind::Flag, flag("b", 1)),
        ]))
        .await
        .unwrap();
        seen.lock().clear();

        // b bumped, a unchanged, c added
        sink.init(data_set(&[
            (DataKind::Flag, flag("a", 1)),
            (DataKind::Flag, flag("b", 2)),
            (DataKind::Flag, flag("c", 1)),
        ]))
        .await
        .unwrap();

        let mut events = seen.lock().clone();
        events.sort();
        assert_eq!(events, vec!["b".to_owned(), "c".to_owned()]);
        seen.lock().clear();

        // a full reinit that rolls b's version back is still a change
        sink.init(data_set(&[
            (DataKind::Flag, flag("a", 1)),
            (DataKind::Flag, flag("b", 1)),
            (DataKind::Flag, flag("c", 1)),
        ]))
        .await
        .unwrap();
        assert_eq!(*seen.lock(), vec!["b".to_owned()]);
    }

    #[tokio::test]
    async fn delete_fires_events_for_dependents() {
        let (sink, seen) = collecting_sink();
        sink.init(data_set(&[
            (DataKind::Flag, flag_with_segment("f1", 1, "s1")),
            (DataKind::Segment, segment("s1", 1)),
        ]))
        .await
        .unwrap();
        seen.lock().clear();

        sink.delete(DataKind::Segment, "s1", 2).await.unwrap();
        assert_eq!(*seen.lock(), vec!["f1".to_owned()]);
    }

    struct FailingStore;

    #[async_trait]
    impl DataStore for FailingStore {
        async fn init(&self, _all_data: FullDataSet) -> Result<()> {
            Err(StoreError::Unavailable("db down".into()))
        }
        async fn get(&self, _kind: DataKind, _key: &str) -> Result<Option<StoreItem>> {
            Ok(None)
        }
        async fn all(&self, _kind: DataKind) -> Result<HashMap<String, StoreItem>> {
            Ok(HashMap::new())
        }
        async fn upsert(&self, _kind: DataKind, _item: StoreItem) -> Result<()> {
            Err(StoreError::Unavailable("db down".into()))
        }
        async fn delete(&self, _kind: DataKind, _key: &str, _version: u64) -> Result<()> {
            Err(StoreError::Unavailable("db down".into()))
        }
        async fn initialized(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn store_failure_sets_store_error_status_and_propagates() {
        let sink =
            DataSourceUpdateSink::new(Arc::new(FailingStore), Arc::new(Listeners::new()));
        // first move to valid so the interruption is visible
        sink.update_status(DataSourceState::Valid, None);

        let result = sink.upsert(DataKind::Flag, flag("a", 1)).await;
        assert!(result.is_err());

        let status = sink.status();
        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(status.error.unwrap().kind, DataSourceErrorKind::StoreError);
    }
}
