//! Dual-mode store for the v2 data system.
//!
//! At any given moment one of two stores is active: in-memory, or
//! persistent. Once the memory store has data (from an initializer or a
//! synchronizer) the persistent store is no longer read from; from that
//! point forward it is only mirrored to, when so configured.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::datasource::SelectorSource;
use crate::deps::DependencyTracker;
use crate::error::Result;
use crate::flag_tracker::FlagChange;
use crate::listeners::Listeners;
use crate::protocol::{Change, ChangeAction, ChangeSet, IntentCode, Selector};
use crate::store::{DataStore, InMemoryDataStore};
use flagstream_model::{DataKind, FullDataSet, KindAndKey, StoreItem};

/// How a persistent store participates in the data system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStoreMode {
    /// The store is only read from (daemon mode; something else writes it).
    ReadOnly,
    /// The store is kept up to date with incoming data.
    ReadWrite,
}

struct SharedState {
    /// Identifies the data version currently held.
    selector: Option<Selector>,
    /// Whether the memory store has taken over as the read source.
    memory_active: bool,
    /// Whether the current payload may be mirrored to the persistent store.
    persist: bool,
}

pub struct Store {
    memory: Arc<InMemoryDataStore>,
    persistent: Option<Arc<dyn DataStore>>,
    persistent_writable: bool,
    state: RwLock<SharedState>,
    /// Serializes all mutations; reads go through the active store's own
    /// locking.
    apply_lock: tokio::sync::Mutex<DependencyTracker>,
    flag_change_listeners: Arc<Listeners<FlagChange>>,
    change_set_listeners: Arc<Listeners<ChangeSet>>,
}

impl Store {
    pub fn new(
        flag_change_listeners: Arc<Listeners<FlagChange>>,
        change_set_listeners: Arc<Listeners<ChangeSet>>,
    ) -> Self {
        Store {
            memory: Arc::new(InMemoryDataStore::new()),
            persistent: None,
            persistent_writable: false,
            state: RwLock::new(SharedState {
                selector: None,
                memory_active: true,
                persist: false,
            }),
            apply_lock: tokio::sync::Mutex::new(DependencyTracker::new()),
            flag_change_listeners,
            change_set_listeners,
        }
    }

    /// Adds a persistent store. Until the memory store receives data, the
    /// persistent store serves reads, so evaluations can use stale data
    /// while the first fetch is in flight.
    pub fn with_persistence(mut self, store: Arc<dyn DataStore>, mode: DataStoreMode) -> Self {
        self.persistent = Some(store);
        self.persistent_writable = mode == DataStoreMode::ReadWrite;
        self.state.get_mut().memory_active = false;
        self
    }

    pub fn selector(&self) -> Option<Selector> {
        self.state.read().selector.clone()
    }

    /// The store currently serving reads.
    pub fn get_active_store(&self) -> Arc<dyn DataStore> {
        if self.state.read().memory_active {
            Arc::clone(&self.memory) as Arc<dyn DataStore>
        } else {
            self.persistent
                .as_ref()
                .map(Arc::clone)
                .unwrap_or_else(|| Arc::clone(&self.memory) as Arc<dyn DataStore>)
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.get_active_store().initialized().await
    }

    /// Applies a change set. `persist` says whether this payload may be
    /// mirrored to a writable persistent store.
    pub async fn apply(&self, change_set: &ChangeSet, persist: bool) -> Result<()> {
        let mut tracker = self.apply_lock.lock().await;
        let result = match change_set.intent_code {
            IntentCode::TransferFull => self.set_basis(&mut tracker, change_set, persist).await,
            IntentCode::TransferChanges => self.apply_delta(&mut tracker, change_set, persist).await,
            IntentCode::TransferNone => Ok(()),
        };
        drop(tracker);
        result?;
        self.change_set_listeners.notify(change_set);
        Ok(())
    }

    /// Replaces all data with the contents of a full transfer.
    async fn set_basis(
        &self,
        tracker: &mut DependencyTracker,
        change_set: &ChangeSet,
        persist: bool,
    ) -> Result<()> {
        let old_data = if self.flag_change_listeners.has_listeners() {
            let mut old: HashMap<DataKind, HashMap<String, StoreItem>> = HashMap::new();
            for kind in DataKind::ALL {
                old.insert(kind, self.memory.all(kind).await?);
            }
            Some(old)
        } else {
            None
        };

        let all_data = changes_to_store_data(&change_set.changes);
        self.memory.init(all_data.clone()).await?;

        tracker.reset();
        for (kind, items) in &all_data {
            for (key, item) in items {
                tracker.update_dependencies_from(*kind, key, Some(item));
            }
        }

        if let Some(old_data) = old_data {
            let affected = compute_changed_items_for_full_data_set(tracker, &old_data, &all_data);
            self.send_change_events(&affected);
        }

        {
            let mut state = self.state.write();
            state.persist = persist;
            if let Some(selector) = &change_set.selector {
                state.selector = Some(selector.clone());
            }
            state.memory_active = true;
        }

        if self.should_persist() {
            if let Some(persistent) = &self.persistent {
                persistent.init(all_data).await?;
            }
        }
        Ok(())
    }

    /// Applies an incremental transfer item by item.
    async fn apply_delta(
        &self,
        tracker: &mut DependencyTracker,
        change_set: &ChangeSet,
        persist: bool,
    ) -> Result<()> {
        let has_listeners = self.flag_change_listeners.has_listeners();
        let mut affected: HashSet<KindAndKey> = HashSet::new();

        self.state.write().persist = persist;

        for change in &change_set.changes {
            match change.action {
                ChangeAction::Put => {
                    let Some(item) = &change.object else {
                        continue;
                    };
                    self.memory.upsert(change.kind, item.clone()).await?;
                    tracker.update_dependencies_from(change.kind, &change.key, Some(item));
                    if has_listeners {
                        tracker.add_affected_items(
                            &mut affected,
                            &KindAndKey::new(change.kind, &change.key),
                        );
                    }
                    if self.should_persist() {
                        if let Some(persistent) = &self.persistent {
                            persistent.upsert(change.kind, item.clone()).await?;
                        }
                    }
                }
                ChangeAction::Delete => {
                    self.memory.delete(change.kind, &change.key, change.version).await?;
                    tracker.update_dependencies_from(change.kind, &change.key, None);
                    if has_listeners {
                        tracker.add_affected_items(
                            &mut affected,
                            &KindAndKey::new(change.kind, &change.key),
                        );
                    }
                    if self.should_persist() {
                        if let Some(persistent) = &self.persistent {
                            persistent.delete(change.kind, &change.key, change.version).await?;
                        }
                    }
                }
            }
        }

        if !affected.is_empty() {
            self.send_change_events(&affected);
        }

        if let Some(selector) = &change_set.selector {
            self.state.write().selector = Some(selector.clone());
        }
        Ok(())
    }

    /// Mirrors the memory store's contents to the persistent store, if one
    /// is configured for writing.
    pub async fn commit(&self) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        if self.should_persist() {
            if let Some(persistent) = &self.persistent {
                let mut all_data = FullDataSet::new();
                for kind in DataKind::ALL {
                    all_data.insert(kind, self.memory.all(kind).await?);
                }
                persistent.init(all_data).await?;
            }
        }
        Ok(())
    }

    fn should_persist(&self) -> bool {
        self.state.read().persist && self.persistent.is_some() && self.persistent_writable
    }

    fn send_change_events(&self, affected: &HashSet<KindAndKey>) {
        for item in affected {
            if item.kind == DataKind::Flag {
                debug!("broadcasting flag change for {}", item.key);
                self.flag_change_listeners.notify(&FlagChange::new(&item.key));
            }
        }
    }
}

impl SelectorSource for Store {
    fn selector(&self) -> Option<Selector> {
        Store::selector(self)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Store")
            .field("selector", &state.selector)
            .field("memory_active", &state.memory_active)
            .field("persistent", &self.persistent.is_some())
            .finish()
    }
}

fn changes_to_store_data(changes: &[Change]) -> FullDataSet {
    let mut all_data = FullDataSet::new();
    for kind in DataKind::ALL {
        all_data.insert(kind, HashMap::new());
    }
    for change in changes {
        if change.action == ChangeAction::Put
            && let Some(item) = &change.object
        {
            all_data
                .entry(change.kind)
                .or_default()
                .insert(change.key.clone(), item.clone());
        }
    }
    all_data
}

fn compute_changed_items_for_full_data_set(
    tracker: &DependencyTracker,
    old_data: &HashMap<DataKind, HashMap<String, StoreItem>>,
    new_data: &FullDataSet,
) -> HashSet<KindAndKey> {
    let mut affected = HashSet::new();
    let empty = HashMap::new();

    for kind in DataKind::ALL {
        let old_items = old_data.get(&kind).unwrap_or(&empty);
        let new_items = new_data.get(&kind).unwrap_or(&empty);

        let keys: HashSet<&String> = old_items.keys().chain(new_items.keys()).collect();
        for key in keys {
            let changed = match (old_items.get(key), new_items.get(key)) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeSetBuilder;
    use parking_lot::Mutex;
    use serde_json::json;

    fn flag(key: &str, version: u64) -> StoreItem {
        StoreItem::from_json(DataKind::Flag, json!({"key": key, "version": version})).unwrap()
    }

    fn flag_with_prereq(key: &str, version: u64, prereq: &str) -> StoreItem {
        StoreItem::from_json(
            DataKind::Flag,
            json!({
                "key": key,
                "version": version,
                "prerequisites": [{"key": prereq, "variation": 0}],
            }),
        )
        .unwrap()
    }

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

    fn segment(key: &str, version: u64) -> StoreItem {
        StoreItem::from_json(DataKind::Segment, json!({"key": key, "version": version})).unwrap()
    }

    fn full_transfer(items: Vec<(DataKind, StoreItem)>, selector: &str) -> ChangeSet {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        for (kind, item) in items {
            let (key, version) = (item.key().to_owned(), item.version());
            builder.add_put(kind, key, version, item);
        }
        builder.finish(Some(Selector::new(selector, 1))).unwrap()
    }

    fn delta(changes: Vec<(DataKind, StoreItem)>, selector: &str) -> ChangeSet {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        for (kind, item) in changes {
            let (key, version) = (item.key().to_owned(), item.version());
            builder.add_put(kind, key, version, item);
        }
        builder.finish(Some(Selector::new(selector, 2))).unwrap()
    }

    fn store_with_listener() -> (Store, Arc<Mutex<Vec<String>>>) {
        let flag_listeners = Arc::new(Listeners::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        flag_listeners.add(move |change: &FlagChange| s.lock().push(change.key.clone()));
        let store = Store::new(flag_listeners, Arc::new(Listeners::new()));
        (store, seen)
    }

    #[tokio::test]
    async fn full_transfer_replaces_data_and_sets_selector() {
        let (store, _) = store_with_listener();
        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("a", 1))], "s1"), true)
            .await
            .unwrap();

        assert_eq!(store.selector(), Some(Selector::new("s1", 1)));
        assert!(store.is_initialized().await);
        let active = store.get_active_store();
        assert!(active.get(DataKind::Flag, "a").await.unwrap().is_some());

        // a second full transfer drops items that are absent from it
        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("b", 1))], "s2"), true)
            .await
            .unwrap();
        let active = store.get_active_store();
        assert!(active.get(DataKind::Flag, "a").await.unwrap().is_none());
        assert!(active.get(DataKind::Flag, "b").await.unwrap().is_some());
        assert_eq!(store.selector(), Some(Selector::new("s2", 1)));
    }

    #[tokio::test]
    async fn transfer_none_is_a_noop_but_notifies_change_set_listeners() {
        let flag_listeners = Arc::new(Listeners::new());
        let change_set_listeners = Arc::new(Listeners::new());
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        change_set_listeners.add(move |_: &ChangeSet| *c.lock() += 1);

        let store = Store::new(flag_listeners, change_set_listeners);
        store.apply(&ChangeSet::no_changes(), true).await.unwrap();

        assert_eq!(*count.lock(), 1);
        assert_eq!(store.selector(), None);
        assert!(!store.is_initialized().await);
    }

    #[tokio::test]
    async fn segment_update_fires_flag_change_for_referencing_flag_only() {
        let (store, seen) = store_with_listener();
        store
            .apply(
                &full_transfer(
                    vec![
                        (DataKind::Flag, flag_with_segment("f1", 1, "s1")),
                        (DataKind::Segment, segment("s1", 1)),
                    ],
                    "s1",
                ),
                true,
            )
            .await
            .unwrap();
        seen.lock().clear();

        store
            .apply(&delta(vec![(DataKind::Segment, segment("s1", 2))], "s2"), true)
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["f1".to_owned()]);
    }

    #[tokio::test]
    async fn prerequisite_chain_fires_cascading_changes_once_each() {
        let (store, seen) = store_with_listener();
        store
            .apply(
                &full_transfer(
                    vec![
                        (DataKind::Flag, flag_with_prereq("f1", 1, "f2")),
                        (DataKind::Flag, flag_with_prereq("f2", 1, "f3")),
                        (DataKind::Flag, flag("f3", 1)),
                    ],
                    "s1",
                ),
                true,
            )
            .await
            .unwrap();
        seen.lock().clear();

        store
            .apply(&delta(vec![(DataKind::Flag, flag("f3", 2))], "s2"), true)
            .await
            .unwrap();

        let mut events = seen.lock().clone();
        events.sort();
        assert_eq!(events, vec!["f1".to_owned(), "f2".to_owned(), "f3".to_owned()]);
    }

    #[tokio::test]
    async fn full_transfer_diff_expands_through_dependencies() {
        let (store, seen) = store_with_listener();
        store
            .apply(
                &full_transfer(
                    vec![
                        (DataKind::Flag, flag_with_segment("f1", 1, "s1")),
                        (DataKind::Segment, segment("s1", 1)),
                    ],
                    "s1",
                ),
                true,
            )
            .await
            .unwrap();
        seen.lock().clear();

        // same flag version, bumped segment version
        store
            .apply(
                &full_transfer(
                    vec![
                        (DataKind::Flag, flag_with_segment("f1", 1, "s1")),
                        (DataKind::Segment, segment("s1", 2)),
                    ],
                    "s2",
                ),
                true,
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["f1".to_owned()]);
    }

    #[tokio::test]
    async fn delta_deletes_write_tombstones() {
        let (store, seen) = store_with_listener();
        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("a", 1))], "s1"), true)
            .await
            .unwrap();
        seen.lock().clear();

        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        builder.add_delete(DataKind::Flag, "a", 2);
        let change_set = builder.finish(Some(Selector::new("s2", 2))).unwrap();
        store.apply(&change_set, true).await.unwrap();

        assert!(store.get_active_store().get(DataKind::Flag, "a").await.unwrap().is_none());
        assert_eq!(*seen.lock(), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn persistent_store_serves_reads_until_first_basis() {
        let persistent = Arc::new(InMemoryDataStore::new());
        let mut preload = FullDataSet::new();
        preload
            .entry(DataKind::Flag)
            .or_default()
            .insert("stale".into(), flag("stale", 1));
        persistent.init(preload).await.unwrap();

        let store = Store::new(Arc::new(Listeners::new()), Arc::new(Listeners::new()))
            .with_persistence(Arc::clone(&persistent) as Arc<dyn DataStore>, DataStoreMode::ReadWrite);

        // before any basis: reads come from the persistent store
        assert!(store.is_initialized().await);
        assert!(store.get_active_store().get(DataKind::Flag, "stale").await.unwrap().is_some());

        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("fresh", 1))], "s1"), true)
            .await
            .unwrap();

        // after the basis: memory is active and the persistent store was
        // rewritten with the new data
        assert!(store.get_active_store().get(DataKind::Flag, "fresh").await.unwrap().is_some());
        assert!(store.get_active_store().get(DataKind::Flag, "stale").await.unwrap().is_none());
        assert!(persistent.get(DataKind::Flag, "fresh").await.unwrap().is_some());
        assert!(persistent.get(DataKind::Flag, "stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unpersisted_basis_is_not_mirrored() {
        let persistent = Arc::new(InMemoryDataStore::new());
        let store = Store::new(Arc::new(Listeners::new()), Arc::new(Listeners::new()))
            .with_persistence(Arc::clone(&persistent) as Arc<dyn DataStore>, DataStoreMode::ReadWrite);

        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("a", 1))], "s1"), false)
            .await
            .unwrap();

        assert!(persistent.get(DataKind::Flag, "a").await.unwrap().is_none());
        assert!(store.get_active_store().get(DataKind::Flag, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn read_only_persistent_store_is_never_written() {
        let persistent = Arc::new(InMemoryDataStore::new());
        let store = Store::new(Arc::new(Listeners::new()), Arc::new(Listeners::new()))
            .with_persistence(Arc::clone(&persistent) as Arc<dyn DataStore>, DataStoreMode::ReadOnly);

        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("a", 1))], "s1"), true)
            .await
            .unwrap();

        assert!(persistent.get(DataKind::Flag, "a").await.unwrap().is_none());
        assert!(!persistent.initialized().await);
    }

    #[tokio::test]
    async fn commit_mirrors_memory_contents() {
        let persistent = Arc::new(InMemoryDataStore::new());
        let store = Store::new(Arc::new(Listeners::new()), Arc::new(Listeners::new()))
            .with_persistence(Arc::clone(&persistent) as Arc<dyn DataStore>, DataStoreMode::ReadWrite);

        store
            .apply(&full_transfer(vec![(DataKind::Flag, flag("a", 1))], "s1"), true)
            .await
            .unwrap();
        // wipe the persistent copy, then commit restores it
        persistent.init(FullDataSet::new()).await.unwrap();
        store.commit().await.unwrap();
        assert!(persistent.get(DataKind::Flag, "a").await.unwrap().is_some());
    }
}
