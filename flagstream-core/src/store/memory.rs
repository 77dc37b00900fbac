use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::store::DataStore;
use flagstream_model::{DataKind, FullDataSet, StoreItem, Tombstone};

/// In-memory implementation of [`DataStore`]: versioned key→item maps per
/// data kind, with deletion tombstones.
///
/// Reads proceed concurrently; writes take the exclusive side of the lock.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    items: HashMap<DataKind, HashMap<String, StoreItem>>,
    initialized: bool,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn init(&self, all_data: FullDataSet) -> Result<()> {
        let mut state = self.state.write();
        for (kind, items) in &all_data {
            debug!("initialized '{}' store with {} items", kind.namespace(), items.len());
        }
        state.items = all_data;
        state.initialized = true;
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        let state = self.state.read();
        let item = state.items.get(&kind).and_then(|items| items.get(key));
        match item {
            Some(item) if !item.is_deleted() => Ok(Some(item.clone())),
            _ => Ok(None),
        }
    }

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        let state = self.state.read();
        Ok(state
            .items
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, item)| !item.is_deleted())
                    .map(|(k, item)| (k.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<()> {
        let mut state = self.state.write();
        let items = state.items.entry(kind).or_default();
        let current_version = items.get(item.key()).map(StoreItem::version);
        if current_version.is_none_or(|v| v < item.version()) {
            debug!("updated {} in '{}' to version {}", item.key(), kind.namespace(), item.version());
            items.insert(item.key().to_owned(), item);
        }
        Ok(())
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<()> {
        let mut state = self.state.write();
        let items = state.items.entry(kind).or_default();
        let current_version = items.get(key).map(StoreItem::version);
        if current_version.is_none_or(|v| v < version) {
            items.insert(key.to_owned(), StoreItem::Tombstone(Tombstone::new(key, version)));
        }
        Ok(())
    }

    async fn initialized(&self) -> bool {
        self.state.read().initialized
    }
}
