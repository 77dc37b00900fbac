use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use flagstream_model::{DataKind, FullDataSet, StoreItem};

pub mod cache;
pub mod memory;

pub use cache::{CacheConfig, CachingStoreWrapper, PersistentDataStoreCore};
pub use memory::InMemoryDataStore;

/// Storage for versioned flag and segment data.
///
/// Implementations must preserve version monotonicity: an upsert or delete
/// whose version is not strictly greater than the stored item's version is
/// a no-op. `get` and `all` never return deleted items.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Replaces the entire contents with the given data set.
    async fn init(&self, all_data: FullDataSet) -> Result<()>;

    /// Returns the live item for a key, or `None` if missing or deleted.
    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>>;

    /// Returns all live items of a kind.
    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>>;

    /// Inserts or updates an item if its version is newer than what is
    /// stored.
    async fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<()>;

    /// Writes a deletion tombstone if `version` is newer than what is
    /// stored.
    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<()>;

    /// Whether the store has ever been initialized with a full data set.
    async fn initialized(&self) -> bool;
}
