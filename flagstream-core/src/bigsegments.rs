//! Big segment support: a caching layer over an external membership store,
//! plus a poller that watches the store's metadata for staleness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::config::BigSegmentsConfig;
use crate::error::Result;
use crate::listeners::{ListenerHandle, Listeners};
use crate::task::RepeatingTask;

/// Membership for one context: segment ref → explicitly included/excluded.
/// A ref absent from the map means the segment's rules decide.
pub type BigSegmentMembership = HashMap<String, bool>;

/// Metadata reported by a big segment store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreMetadata {
    /// When the store was last brought up to date, if ever.
    pub last_up_to_date: Option<DateTime<Utc>>,
}

/// The external store holding big segment memberships, keyed by a hash of
/// the context key.
#[async_trait]
pub trait BigSegmentStore: Send + Sync {
    async fn get_metadata(&self) -> Result<BigSegmentStoreMetadata>;

    async fn get_membership(&self, context_hash: &str) -> Result<Option<BigSegmentMembership>>;

    async fn stop(&self);
}

/// Health of the big segment store as seen by evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    /// The store has not been updated within the configured tolerance.
    pub stale: bool,
}

/// Outcome classification attached to every big-segment membership query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    NotConfigured,
    StoreError,
}

/// Broadcasts store status transitions. Listeners fire only when
/// `available` or `stale` actually changes.
#[derive(Debug, Default)]
pub struct BigSegmentStoreStatusProvider {
    listeners: Listeners<BigSegmentStoreStatus>,
    last_status: RwLock<Option<BigSegmentStoreStatus>>,
}

impl BigSegmentStoreStatusProvider {
    /// Last polled status; unavailable until the first poll completes.
    pub fn status(&self) -> BigSegmentStoreStatus {
        self.last_status
            .read()
            .unwrap_or(BigSegmentStoreStatus { available: false, stale: false })
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(&BigSegmentStoreStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.remove(handle);
    }

    fn record(&self, new_status: BigSegmentStoreStatus) {
        let mut last = self.last_status.write();
        match *last {
            None => *last = Some(new_status),
            Some(previous) => {
                if previous != new_status {
                    *last = Some(new_status);
                    drop(last);
                    self.listeners.notify(&new_status);
                }
            }
        }
    }
}

/// Decorates the big segment store with per-context caching and drives the
/// status poller. Must be created inside a tokio runtime.
pub struct BigSegmentStoreManager {
    store: Option<Arc<dyn BigSegmentStore>>,
    stale_after: Duration,
    status_provider: Arc<BigSegmentStoreStatusProvider>,
    cache: Option<moka::sync::Cache<String, Arc<BigSegmentMembership>>>,
    poll_task: Mutex<Option<RepeatingTask>>,
    empty_membership: Arc<BigSegmentMembership>,
}

impl BigSegmentStoreManager {
    pub fn new(config: BigSegmentsConfig) -> Arc<Self> {
        let store = config.store.map(Arc::from);
        let manager = Arc::new(BigSegmentStoreManager {
            store: store.clone(),
            stale_after: config.stale_after,
            status_provider: Arc::new(BigSegmentStoreStatusProvider::default()),
            cache: store.as_ref().map(|_| {
                moka::sync::Cache::builder()
                    .max_capacity(config.context_cache_size)
                    .time_to_live(config.context_cache_time)
                    .build()
            }),
            poll_task: Mutex::new(None),
            empty_membership: Arc::new(BigSegmentMembership::new()),
        });

        if manager.store.is_some() {
            let poller = Arc::clone(&manager);
            let task = RepeatingTask::spawn(
                "bigsegment.status-poll",
                Duration::ZERO,
                config.status_poll_interval,
                move || {
                    let poller = Arc::clone(&poller);
                    async move {
                        poller.poll_store_and_update_status().await;
                    }
                },
            );
            *manager.poll_task.lock() = Some(task);
        }
        manager
    }

    pub async fn stop(&self) {
        let task = self.poll_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        if let Some(store) = &self.store {
            store.stop().await;
        }
    }

    pub fn status_provider(&self) -> Arc<BigSegmentStoreStatusProvider> {
        Arc::clone(&self.status_provider)
    }

    /// Looks up (and caches) the membership for a context key, returning
    /// the membership and a status describing how trustworthy it is.
    pub async fn get_user_membership(
        &self,
        user_key: &str,
    ) -> (Option<Arc<BigSegmentMembership>>, BigSegmentsStatus) {
        let (Some(store), Some(cache)) = (&self.store, &self.cache) else {
            return (None, BigSegmentsStatus::NotConfigured);
        };

        let membership = match cache.get(user_key) {
            Some(membership) => membership,
            None => {
                let context_hash = hash_for_context_key(user_key);
                match store.get_membership(&context_hash).await {
                    Ok(membership) => {
                        let membership = match membership {
                            Some(membership) => Arc::new(membership),
                            None => Arc::clone(&self.empty_membership),
                        };
                        cache.insert(user_key.to_owned(), Arc::clone(&membership));
                        membership
                    }
                    Err(e) => {
                        error!("big segment store membership query returned error: {e}");
                        return (None, BigSegmentsStatus::StoreError);
                    }
                }
            }
        };

        let status = match *self.status_provider.last_status.read() {
            Some(status) => status,
            None => self.poll_store_and_update_status().await,
        };
        if !status.available {
            return (Some(membership), BigSegmentsStatus::StoreError);
        }
        let status = if status.stale { BigSegmentsStatus::Stale } else { BigSegmentsStatus::Healthy };
        (Some(membership), status)
    }

    pub async fn get_status(&self) -> BigSegmentStoreStatus {
        match *self.status_provider.last_status.read() {
            Some(status) => status,
            None => self.poll_store_and_update_status().await,
        }
    }

    pub async fn poll_store_and_update_status(&self) -> BigSegmentStoreStatus {
        // default to unavailable unless the metadata query succeeds
        let mut new_status = BigSegmentStoreStatus { available: false, stale: false };
        if let Some(store) = &self.store {
            match store.get_metadata().await {
                Ok(metadata) => {
                    new_status = BigSegmentStoreStatus {
                        available: true,
                        stale: self.is_stale(metadata.last_up_to_date),
                    };
                }
                Err(e) => {
                    error!("big segment store status query returned error: {e}");
                }
            }
        }
        self.status_provider.record(new_status);
        new_status
    }

    fn is_stale(&self, last_up_to_date: Option<DateTime<Utc>>) -> bool {
        match last_up_to_date {
            None => true,
            Some(timestamp) => {
                let age = Utc::now() - timestamp;
                age.to_std().map(|age| age >= self.stale_after).unwrap_or(false)
            }
        }
    }
}

impl std::fmt::Debug for BigSegmentStoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSegmentStoreManager")
            .field("configured", &self.store.is_some())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

/// The hash under which a context's membership is stored: the base64 of
/// the SHA-256 of the UTF-8 context key.
pub fn hash_for_context_key(user_key: &str) -> String {
    BASE64.encode(Sha256::digest(user_key.as_bytes()))
}
