use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;

use crate::error::Result;
use crate::store::DataStore;
use flagstream_model::{DataKind, FullDataSet, StoreItem, Tombstone};

/// The reduced interface a persistent store integration must implement.
///
/// Database drivers implement only these operations; [`CachingStoreWrapper`]
/// layers caching, tombstone filtering, and the full [`DataStore`] surface
/// on top so that the logic is not repeated per integration.
#[async_trait]
pub trait PersistentDataStoreCore: Send + Sync {
    async fn init_internal(&self, all_data: FullDataSet) -> Result<()>;

    async fn get_internal(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>>;

    async fn get_all_internal(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>>;

    /// Applies the item if newer and returns the state that won: the
    /// existing item when the incoming one was stale, otherwise the
    /// incoming item.
    async fn upsert_internal(&self, kind: DataKind, item: StoreItem) -> Result<StoreItem>;

    async fn initialized_internal(&self) -> Result<bool>;
}

/// Caching parameters for [`CachingStoreWrapper`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: u64,
    pub ttl: Duration,
}

impl CacheConfig {
    pub const DEFAULT_CAPACITY: u64 = 1000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

    pub fn enabled() -> Self {
        CacheConfig { enabled: true, capacity: Self::DEFAULT_CAPACITY, ttl: Self::DEFAULT_TTL }
    }

    pub fn disabled() -> Self {
        CacheConfig { enabled: false, capacity: 0, ttl: Duration::ZERO }
    }
}

const INITED_CACHE_KEY: &str = "$inited";

#[derive(Clone)]
enum CachedValue {
    /// A single-item lookup result. Caching the `None` distinguishes
    /// "known absent" from "not cached".
    Item(Option<StoreItem>),
    /// A whole-kind snapshot, tombstones already filtered.
    All(Arc<HashMap<String, StoreItem>>),
    Inited(bool),
}

/// LRU/TTL cache in front of a [`PersistentDataStoreCore`].
pub struct CachingStoreWrapper<C> {
    core: C,
    cache: Option<Cache<String, CachedValue>>,
    inited: AtomicBool,
}

impl<C: PersistentDataStoreCore> CachingStoreWrapper<C> {
    pub fn new(core: C, config: CacheConfig) -> Self {
        let cache = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .build()
        });
        CachingStoreWrapper { core, cache, inited: AtomicBool::new(false) }
    }

    fn item_cache_key(kind: DataKind, key: &str) -> String {
        format!("{}:{}", kind.namespace(), key)
    }

    fn all_cache_key(kind: DataKind) -> String {
        kind.namespace().to_owned()
    }

    fn item_if_not_deleted(item: Option<StoreItem>) -> Option<StoreItem> {
        item.filter(|item| !item.is_deleted())
    }

    fn items_if_not_deleted(items: HashMap<String, StoreItem>) -> HashMap<String, StoreItem> {
        items.into_iter().filter(|(_, item)| !item.is_deleted()).collect()
    }
}

#[async_trait]
impl<C: PersistentDataStoreCore> DataStore for CachingStoreWrapper<C> {
    async fn init(&self, all_data: FullDataSet) -> Result<()> {
        self.core.init_internal(all_data.clone()).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
            for (kind, items) in all_data {
                cache.insert(
                    Self::all_cache_key(kind),
                    CachedValue::All(Arc::new(Self::items_if_not_deleted(items.clone()))),
                );
                for (key, item) in items {
                    cache.insert(Self::item_cache_key(kind, &key), CachedValue::Item(Some(item)));
                }
            }
            cache.insert(INITED_CACHE_KEY.to_owned(), CachedValue::Inited(true));
        }
        self.inited.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        let cache_key = Self::item_cache_key(kind, key);
        if let Some(cache) = &self.cache
            && let Some(CachedValue::Item(item)) = cache.get(&cache_key)
        {
            return Ok(Self::item_if_not_deleted(item));
        }
        let item = self.core.get_internal(kind, key).await?;
        if let Some(cache) = &self.cache {
            cache.insert(cache_key, CachedValue::Item(item.clone()));
        }
        Ok(Self::item_if_not_deleted(item))
    }

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        let cache_key = Self::all_cache_key(kind);
        if let Some(cache) = &self.cache
            && let Some(CachedValue::All(items)) = cache.get(&cache_key)
        {
            return Ok(items.as_ref().clone());
        }
        let items = Self::items_if_not_deleted(self.core.get_all_internal(kind).await?);
        if let Some(cache) = &self.cache {
            cache.insert(cache_key, CachedValue::All(Arc::new(items.clone())));
        }
        Ok(items)
    }

    async fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<()> {
        let key = item.key().to_owned();
        let new_state = self.core.upsert_internal(kind, item).await?;
        if let Some(cache) = &self.cache {
            // Repopulate the item entry with whatever the core says won the
            // version race; the whole-kind snapshot is purged rather than
            // patched.
            cache.insert(Self::item_cache_key(kind, &key), CachedValue::Item(Some(new_state)));
            cache.invalidate(&Self::all_cache_key(kind));
        }
        Ok(())
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<()> {
        self.upsert(kind, StoreItem::Tombstone(Tombstone::new(key, version))).await
    }

    async fn initialized(&self) -> bool {
        if self.inited.load(Ordering::SeqCst) {
            return true;
        }
        let result = match &self.cache {
            None => self.core.initialized_internal().await.unwrap_or(false),
            Some(cache) => {
                if let Some(CachedValue::Inited(inited)) = cache.get(INITED_CACHE_KEY) {
                    inited
                } else {
                    let inited = self.core.initialized_internal().await.unwrap_or(false);
                    cache.insert(INITED_CACHE_KEY.to_owned(), CachedValue::Inited(inited));
                    inited
                }
            }
        };
        if result {
            self.inited.store(true, Ordering::SeqCst);
        }
        result
    }
}

impl<C> std::fmt::Debug for CachingStoreWrapper<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingStoreWrapper")
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn flag(key: &str, version: u64) -> StoreItem {
        StoreItem::from_json(DataKind::Flag, json!({"key": key, "version": version})).unwrap()
    }

    /// Core backed by a plain map, counting calls so tests can assert on
    /// cache hits.
    #[derive(Default)]
    struct FakeCore {
        data: Mutex<HashMap<DataKind, HashMap<String, StoreItem>>>,
        inited: AtomicBool,
        get_count: Mutex<usize>,
        all_count: Mutex<usize>,
    }

    #[async_trait]
    impl PersistentDataStoreCore for FakeCore {
        async fn init_internal(&self, all_data: FullDataSet) -> Result<()> {
            *self.data.lock() = all_data;
            self.inited.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn get_internal(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
            *self.get_count.lock() += 1;
            Ok(self.data.lock().get(&kind).and_then(|m| m.get(key)).cloned())
        }

        async fn get_all_internal(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
            *self.all_count.lock() += 1;
            Ok(self.data.lock().get(&kind).cloned().unwrap_or_default())
        }

        async fn upsert_internal(&self, kind: DataKind, item: StoreItem) -> Result<StoreItem> {
            let mut data = self.data.lock();
            let items = data.entry(kind).or_default();
            match items.get(item.key()) {
                Some(existing) if existing.version() >= item.version() => Ok(existing.clone()),
                _ => {
                    items.insert(item.key().to_owned(), item.clone());
                    Ok(item)
                }
            }
        }

        async fn initialized_internal(&self) -> Result<bool> {
            Ok(self.inited.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn get_caches_results_including_absent() {
        let wrapper = CachingStoreWrapper::new(FakeCore::default(), CacheConfig::enabled());

        assert!(wrapper.get(DataKind::Flag, "missing").await.unwrap().is_none());
        assert!(wrapper.get(DataKind::Flag, "missing").await.unwrap().is_none());
        // second lookup served from the cached None
        assert_eq!(*wrapper.core.get_count.lock(), 1);
    }

    #[tokio::test]
    async fn all_snapshot_is_cached_until_upsert() {
        let wrapper = CachingStoreWrapper::new(FakeCore::default(), CacheConfig::enabled());
        wrapper.upsert(DataKind::Flag, flag("a", 1)).await.unwrap();

        let _ = wrapper.all(DataKind::Flag).await.unwrap();
        let _ = wrapper.all(DataKind::Flag).await.unwrap();
        assert_eq!(*wrapper.core.all_count.lock(), 1);

        wrapper.upsert(DataKind::Flag, flag("b", 1)).await.unwrap();
        let all = wrapper.all(DataKind::Flag).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(*wrapper.core.all_count.lock(), 2);
    }

    #[tokio::test]
    async fn stale_upsert_refreshes_cache_with_winning_state() {
        let wrapper = CachingStoreWrapper::new(FakeCore::default(), CacheConfig::enabled());
        wrapper.upsert(DataKind::Flag, flag("a", 5)).await.unwrap();
        wrapper.upsert(DataKind::Flag, flag("a", 3)).await.unwrap();

        let item = wrapper.get(DataKind::Flag, "a").await.unwrap().unwrap();
        assert_eq!(item.version(), 5);
        // served from cache, repopulated by the losing upsert
        assert_eq!(*wrapper.core.get_count.lock(), 0);
    }

    #[tokio::test]
    async fn delete_is_an_upsert_of_a_tombstone() {
        let wrapper = CachingStoreWrapper::new(FakeCore::default(), CacheConfig::enabled());
        wrapper.upsert(DataKind::Flag, flag("a", 1)).await.unwrap();
        wrapper.delete(DataKind::Flag, "a", 2).await.unwrap();

        assert!(wrapper.get(DataKind::Flag, "a").await.unwrap().is_none());
        assert!(wrapper.all(DataKind::Flag).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_populates_cache_and_initialized() {
        let wrapper = CachingStoreWrapper::new(FakeCore::default(), CacheConfig::enabled());
        assert!(!wrapper.initialized().await);

        let mut all: FullDataSet = FullDataSet::new();
        all.entry(DataKind::Flag).or_default().insert("a".into(), flag("a", 1));
        wrapper.init(all).await.unwrap();

        assert!(wrapper.initialized().await);
        assert!(wrapper.get(DataKind::Flag, "a").await.unwrap().is_some());
        assert_eq!(*wrapper.core.get_count.lock(), 0);
    }

    #[tokio::test]
    async fn uncached_wrapper_delegates_every_call() {
        let wrapper = CachingStoreWrapper::new(FakeCore::default(), CacheConfig::disabled());
        let _ = wrapper.get(DataKind::Flag, "a").await.unwrap();
        let _ = wrapper.get(DataKind::Flag, "a").await.unwrap();
        assert_eq!(*wrapper.core.get_count.lock(), 2);
    }
}
