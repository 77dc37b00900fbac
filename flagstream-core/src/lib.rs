//! Flag data acquisition and distribution core for the flagstream SDK.
//!
//! This crate obtains flag and segment definitions from the flag delivery
//! services (streaming or polling, over either protocol generation), keeps
//! an in-process store synchronized, exposes data source and store health
//! to observers, and recomputes dependency-aware flag-change notifications
//! for evaluator callers.

pub mod backoff;
pub mod bigsegments;
pub mod config;
pub mod datasource;
pub mod datasourcev2;
pub mod datastore;
pub mod datasystem;
pub mod deps;
pub mod error;
pub mod flag_tracker;
pub mod http;
pub mod integrations;
pub mod listeners;
pub mod protocol;
pub mod store;
pub mod task;

pub use backoff::{BackoffStrategy, JitterStrategy, RetryDelay};
pub use bigsegments::{
    BigSegmentMembership, BigSegmentStore, BigSegmentStoreManager, BigSegmentStoreMetadata,
    BigSegmentStoreStatus, BigSegmentStoreStatusProvider, BigSegmentsStatus,
};
pub use config::{BigSegmentsConfig, Config, HttpConfig, ServiceEndpoints};
pub use datasource::{
    Basis, DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus,
    Initializer, InitializerBuilder, SelectorSource, Synchronizer, SynchronizerBuilder, Update,
};
pub use datasourcev2::status::DataSourceStatusProvider;
pub use datastore::status::{DataStoreStatus, DataStoreStatusProvider};
pub use datasystem::config::{DataSystemConfig, DataSystemConfigBuilder};
pub use datasystem::fdv1::FDv1;
pub use datasystem::fdv2::FDv2;
pub use datasystem::store::DataStoreMode;
pub use datasystem::DataAvailability;
pub use deps::DependencyTracker;
pub use error::{Result, StoreError};
pub use flag_tracker::{FlagChange, FlagTracker};
pub use listeners::{ListenerHandle, Listeners};
pub use protocol::{
    Change, ChangeAction, ChangeSet, ChangeSetBuilder, IntentCode, Selector,
};
pub use store::{CacheConfig, CachingStoreWrapper, DataStore, InMemoryDataStore, PersistentDataStoreCore};
pub use task::{RepeatingTask, Signal};

pub use flagstream_model as model;
