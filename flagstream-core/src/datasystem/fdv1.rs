//! Coordinator for the legacy v1 data system: one update processor
//! (streaming, polling, or none at all in offline/daemon modes) writing
//! into the configured store through the update sink.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::config::Config;
use crate::datasource::polling::{FeatureRequester, PollingUpdateProcessor};
use crate::datasource::status::DataSourceUpdateSink;
use crate::datasource::streaming::StreamingUpdateProcessor;
use crate::datasource::{DataSourceState, DataSourceStatus};
use crate::datastore::status::DataStoreStatusProvider;
use crate::datasystem::DataAvailability;
use crate::flag_tracker::{FlagChange, FlagTracker};
use crate::listeners::{ListenerHandle, Listeners};
use crate::store::{DataStore, InMemoryDataStore};
use crate::task::Signal;

enum Processor {
    Streaming(StreamingUpdateProcessor),
    Polling(PollingUpdateProcessor),
    /// Offline and daemon modes run no processor at all.
    Null,
}

/// Data system speaking the v1 protocol.
pub struct FDv1 {
    config: Config,
    store: Arc<dyn DataStore>,
    sink: Arc<DataSourceUpdateSink>,
    flag_tracker: FlagTracker,
    store_status_provider: Arc<DataStoreStatusProvider>,
    processor: Mutex<Option<Processor>>,
    data_availability: Arc<RwLock<DataAvailability>>,
}

impl FDv1 {
    /// Builds the v1 data system around the given feature store, or a
    /// fresh in-memory store if none is supplied.
    pub fn new(config: Config, feature_store: Option<Arc<dyn DataStore>>) -> Self {
        let store_status_provider = Arc::new(DataStoreStatusProvider::new());
        let inner = feature_store.unwrap_or_else(|| Arc::new(InMemoryDataStore::new()));
        let store: Arc<dyn DataStore> = Arc::new(crate::datastore::status::MonitoredStore::new(
            inner,
            Arc::clone(&store_status_provider),
        ));

        let flag_change_listeners = Arc::new(Listeners::<FlagChange>::new());
        let sink = Arc::new(DataSourceUpdateSink::new(
            Arc::clone(&store),
            Arc::clone(&flag_change_listeners),
        ));

        let data_availability = Arc::new(RwLock::new(DataAvailability::Defaults));
        let availability = Arc::clone(&data_availability);
        sink.add_status_listener(move |status| {
            if status.state == DataSourceState::Valid {
                *availability.write() = DataAvailability::Refreshed;
            }
        });

        FDv1 {
            config,
            store,
            sink,
            flag_tracker: FlagTracker::new(flag_change_listeners),
            store_status_provider,
            processor: Mutex::new(None),
            data_availability,
        }
    }

    /// Starts the update processor selected by the configuration. `ready`
    /// is set on first successful initialization or permanent failure; in
    /// offline and daemon modes it is set immediately.
    pub async fn start(&self, ready: Signal) {
        if self.store.initialized().await {
            let mut availability = self.data_availability.write();
            if *availability == DataAvailability::Defaults {
                *availability = DataAvailability::Cached;
            }
        }

        let processor = if self.config.offline || self.config.use_ldd {
            info!("data acquisition is disabled (offline or daemon mode)");
            ready.set();
            Processor::Null
        } else if self.config.stream {
            let streaming =
                StreamingUpdateProcessor::new(self.config.clone(), Arc::clone(&self.sink));
            streaming.start(ready);
            Processor::Streaming(streaming)
        } else {
            match FeatureRequester::new(&self.config) {
                Ok(requester) => {
                    let polling = PollingUpdateProcessor::new(
                        self.config.poll_interval,
                        Arc::new(requester),
                        Arc::clone(&self.sink),
                    );
                    polling.start(ready);
                    Processor::Polling(polling)
                }
                Err(e) => {
                    tracing::error!("failed to build polling requester: {e}");
                    self.sink.update_status(DataSourceState::Off, None);
                    ready.set();
                    Processor::Null
                }
            }
        };
        *self.processor.lock() = Some(processor);
    }

    pub async fn stop(&self) {
        let processor = self.processor.lock().take();
        match processor {
            Some(Processor::Streaming(streaming)) => streaming.stop().await,
            Some(Processor::Polling(polling)) => polling.stop().await,
            Some(Processor::Null) | None => {}
        }
    }

    /// The store to evaluate flags against.
    pub fn store(&self) -> Arc<dyn DataStore> {
        Arc::clone(&self.store)
    }

    pub fn data_source_status(&self) -> DataSourceStatus {
        self.sink.status()
    }

    pub fn add_data_source_status_listener(
        &self,
        listener: impl Fn(&DataSourceStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.sink.add_status_listener(listener)
    }

    pub fn remove_data_source_status_listener(&self, handle: ListenerHandle) {
        self.sink.remove_status_listener(handle);
    }

    pub fn data_store_status_provider(&self) -> Arc<DataStoreStatusProvider> {
        Arc::clone(&self.store_status_provider)
    }

    pub fn flag_tracker(&self) -> &FlagTracker {
        &self.flag_tracker
    }

    pub fn data_availability(&self) -> DataAvailability {
        *self.data_availability.read()
    }

    pub fn target_availability(&self) -> DataAvailability {
        if self.config.offline {
            DataAvailability::Defaults
        } else {
            // daemon mode and connected modes both aim for current data
            DataAvailability::Refreshed
        }
    }
}

impl std::fmt::Debug for FDv1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FDv1")
            .field("offline", &self.config.offline)
            .field("use_ldd", &self.config.use_ldd)
            .field("stream", &self.config.stream)
            .finish()
    }
}
