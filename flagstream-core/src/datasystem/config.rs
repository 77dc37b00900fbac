//! Configuration of the data acquisition strategy: which initializers run
//! at startup, which synchronizers keep data current, and how a persistent
//! store participates.

use std::sync::Arc;

use crate::config::Config;
use crate::datasource::{InitializerBuilder, SynchronizerBuilder};
use crate::datasourcev2::polling::{
    PollingDataSource, PollingError, PollingRequester, PollingResponse,
    ReqwestFdv1PollingRequester, ReqwestPollingRequester,
};
use crate::datasourcev2::streaming::StreamingDataSource;
use crate::datasystem::store::DataStoreMode;
use crate::store::DataStore;

/// Everything the FDv2 coordinator needs to run.
pub struct DataSystemConfig {
    pub initializers: Vec<InitializerBuilder>,
    pub primary_synchronizer: Option<SynchronizerBuilder>,
    pub secondary_synchronizer: Option<SynchronizerBuilder>,
    /// Built when the service instructs the client to downgrade protocols.
    pub fdv1_fallback_synchronizer: Option<SynchronizerBuilder>,
    pub data_store: Option<Arc<dyn DataStore>>,
    pub data_store_mode: DataStoreMode,
    /// Offline mode: the data system starts nothing and reports ready at
    /// once.
    pub disabled: bool,
}

impl std::fmt::Debug for DataSystemConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSystemConfig")
            .field("initializers", &self.initializers.len())
            .field("primary_synchronizer", &self.primary_synchronizer.is_some())
            .field("secondary_synchronizer", &self.secondary_synchronizer.is_some())
            .field("fdv1_fallback_synchronizer", &self.fdv1_fallback_synchronizer.is_some())
            .field("data_store", &self.data_store.is_some())
            .field("data_store_mode", &self.data_store_mode)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// Builder for [`DataSystemConfig`].
#[derive(Default)]
pub struct DataSystemConfigBuilder {
    initializers: Vec<InitializerBuilder>,
    primary_synchronizer: Option<SynchronizerBuilder>,
    secondary_synchronizer: Option<SynchronizerBuilder>,
    fdv1_fallback_synchronizer: Option<SynchronizerBuilder>,
    data_store: Option<Arc<dyn DataStore>>,
    data_store_mode: Option<DataStoreMode>,
    disabled: bool,
}

impl DataSystemConfigBuilder {
    pub fn new() -> Self {
        DataSystemConfigBuilder::default()
    }

    pub fn initializers(mut self, initializers: Vec<InitializerBuilder>) -> Self {
        self.initializers = initializers;
        self
    }

    pub fn synchronizers(
        mut self,
        primary: SynchronizerBuilder,
        secondary: Option<SynchronizerBuilder>,
    ) -> Self {
        self.primary_synchronizer = Some(primary);
        self.secondary_synchronizer = secondary;
        self
    }

    pub fn fdv1_fallback(mut self, fallback: SynchronizerBuilder) -> Self {
        self.fdv1_fallback_synchronizer = Some(fallback);
        self
    }

    pub fn data_store(mut self, store: Arc<dyn DataStore>, mode: DataStoreMode) -> Self {
        self.data_store = Some(store);
        self.data_store_mode = Some(mode);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn build(self) -> DataSystemConfig {
        DataSystemConfig {
            initializers: self.initializers,
            primary_synchronizer: self.primary_synchronizer,
            secondary_synchronizer: self.secondary_synchronizer,
            fdv1_fallback_synchronizer: self.fdv1_fallback_synchronizer,
            data_store: self.data_store,
            data_store_mode: self.data_store_mode.unwrap_or(DataStoreMode::ReadOnly),
            disabled: self.disabled,
        }
    }
}

fn polling_requester(config: &Config, v1: bool) -> Arc<dyn PollingRequester> {
    let base_uri = &config.service_endpoints.polling_base_uri;
    let built: Result<Arc<dyn PollingRequester>, PollingError> = if v1 {
        ReqwestFdv1PollingRequester::new(config, base_uri)
            .map(|r| Arc::new(r) as Arc<dyn PollingRequester>)
    } else {
        ReqwestPollingRequester::new(config, base_uri)
            .map(|r| Arc::new(r) as Arc<dyn PollingRequester>)
    };
    built.unwrap_or_else(|e| {
        // A client build failure shows up as a network error on the first
        // fetch, which the coordinator handles like any other.
        tracing::error!("failed to build polling requester: {e}");
        Arc::new(FailedRequester(e.to_string()))
    })
}

fn polling_builder(config: &Config) -> SynchronizerBuilder {
    let config = config.clone();
    Arc::new(move || {
        let requester = polling_requester(&config, false);
        Box::new(PollingDataSource::new(config.poll_interval, requester))
            as Box<dyn crate::datasource::Synchronizer>
    })
}

fn polling_initializer_builder(config: &Config) -> InitializerBuilder {
    let config = config.clone();
    Box::new(move || {
        let requester = polling_requester(&config, false);
        Box::new(PollingDataSource::new(config.poll_interval, requester))
            as Box<dyn crate::datasource::Initializer>
    })
}

fn streaming_builder(config: &Config) -> SynchronizerBuilder {
    let config = config.clone();
    Arc::new(move || {
        Box::new(StreamingDataSource::new(config.clone()))
            as Box<dyn crate::datasource::Synchronizer>
    })
}

fn fdv1_polling_builder(config: &Config) -> SynchronizerBuilder {
    let config = config.clone();
    Arc::new(move || {
        let requester = polling_requester(&config, true);
        Box::new(PollingDataSource::new(config.poll_interval, requester))
            as Box<dyn crate::datasource::Synchronizer>
    })
}

/// Requester standing in for one whose HTTP client could not be built;
/// every fetch fails with the original error.
struct FailedRequester(String);

#[async_trait::async_trait]
impl PollingRequester for FailedRequester {
    async fn fetch(
        &self,
        _selector: Option<crate::protocol::Selector>,
    ) -> Result<PollingResponse, PollingError> {
        Err(PollingError::Network(self.0.clone()))
    }
}

/// The recommended strategy: fetch a first basis from the polling endpoint,
/// then stream updates, falling back to polling if streaming stays down.
pub fn default(config: &Config) -> DataSystemConfigBuilder {
    DataSystemConfigBuilder::new()
        .initializers(vec![polling_initializer_builder(config)])
        .synchronizers(streaming_builder(config), Some(polling_builder(config)))
        .fdv1_fallback(fdv1_polling_builder(config))
        .disabled(config.offline)
}

/// Streaming only, no initializer phase.
pub fn streaming(config: &Config) -> DataSystemConfigBuilder {
    DataSystemConfigBuilder::new()
        .synchronizers(streaming_builder(config), None)
        .fdv1_fallback(fdv1_polling_builder(config))
        .disabled(config.offline)
}

/// Polling only, for network environments where streaming is not viable.
pub fn polling(config: &Config) -> DataSystemConfigBuilder {
    DataSystemConfigBuilder::new()
        .synchronizers(polling_builder(config), None)
        .fdv1_fallback(fdv1_polling_builder(config))
        .disabled(config.offline)
}

/// A blank slate for fully custom acquisition strategies.
pub fn custom() -> DataSystemConfigBuilder {
    DataSystemConfigBuilder::new()
}

/// Reads from a persistent store populated by another process; never
/// connects to the control plane and never writes the store.
pub fn daemon(config: &Config, store: Arc<dyn DataStore>) -> DataSystemConfigBuilder {
    DataSystemConfigBuilder::new()
        .data_store(store, DataStoreMode::ReadOnly)
        .disabled(config.offline)
}

/// Like [`default`], with a persistent store serving stale data until the
/// control plane answers, then kept up to date.
pub fn persistent_store(config: &Config, store: Arc<dyn DataStore>) -> DataSystemConfigBuilder {
    default(config).data_store(store, DataStoreMode::ReadWrite)
}
