//! Coordinator for the v2 data system: runs initializers to get a first
//! basis, then drives the synchronizer failover loop.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::datasource::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, SelectorSource, Synchronizer,
};
use crate::datasourcev2::status::DataSourceStatusProvider;
use crate::datasystem::DataAvailability;
use crate::datasystem::config::DataSystemConfig;
use crate::datasystem::store::Store;
use crate::flag_tracker::{FlagChange, FlagTracker};
use crate::listeners::Listeners;
use crate::protocol::ChangeSet;
use crate::store::DataStore;
use crate::task::{STOP_GRACE_PERIOD, Signal};

/// A primary synchronizer that has been interrupted this long yields to the
/// secondary; a secondary interrupted this long yields back.
const INTERRUPTED_THRESHOLD: Duration = Duration::from_secs(60);

/// A synchronizer that cannot finish initializing within this window is
/// given up on.
const INITIALIZING_THRESHOLD: Duration = Duration::from_secs(10);

/// Once the secondary has been healthy this long, it is safe to try the
/// primary again.
const RECOVERY_HEALTHY_THRESHOLD: Duration = Duration::from_secs(300);

/// How often the fallback/recovery conditions are re-evaluated while the
/// synchronizer is silent.
const CONDITION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Data system speaking the v2 protocol: an ordered list of initializers
/// feeding a first basis, then a primary/secondary synchronizer pair with
/// automatic failover, recovery, and downgrade to the v1 protocol when the
/// service requests it.
pub struct FDv2 {
    store: Arc<Store>,
    status_provider: Arc<DataSourceStatusProvider>,
    flag_tracker: FlagTracker,
    config: Mutex<Option<DataSystemConfig>>,
    configured_with_data_sources: bool,
    disabled: bool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FDv2 {
    pub fn new(config: DataSystemConfig) -> Self {
        let flag_change_listeners = Arc::new(Listeners::<FlagChange>::new());
        let change_set_listeners = Arc::new(Listeners::<ChangeSet>::new());

        let mut store =
            Store::new(Arc::clone(&flag_change_listeners), Arc::clone(&change_set_listeners));
        if let Some(persistent) = &config.data_store {
            store = store.with_persistence(Arc::clone(persistent), config.data_store_mode);
        }

        let configured_with_data_sources =
            !config.initializers.is_empty() || config.primary_synchronizer.is_some();
        let disabled = config.disabled;

        FDv2 {
            store: Arc::new(store),
            status_provider: Arc::new(DataSourceStatusProvider::new()),
            flag_tracker: FlagTracker::new(flag_change_listeners),
            config: Mutex::new(Some(config)),
            configured_with_data_sources,
            disabled,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts the background acquisition tasks. `ready` is set on the first
    /// successful data load or on permanent failure, whichever comes first.
    pub fn start(&self, ready: Signal) {
        if self.disabled {
            info!("data system is disabled, SDK will return application-defined default values");
            ready.set();
            return;
        }

        let Some(config) = self.config.lock().take() else {
            // start() was already called; nothing left to run
            return;
        };

        let store = Arc::clone(&self.store);
        let status_provider = Arc::clone(&self.status_provider);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let coordinator = Coordinator { store, status_provider, cancel };
            coordinator.run(config, ready.clone()).await;
            if !ready.is_set() {
                ready.set();
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stops all background tasks, waiting up to the standard grace period.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(STOP_GRACE_PERIOD, task).await.is_err() {
                warn!("data system task did not stop within grace period");
            }
        }
    }

    /// The store to evaluate flags against.
    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.get_active_store()
    }

    pub fn data_source_status_provider(&self) -> &DataSourceStatusProvider {
        &self.status_provider
    }

    pub fn flag_tracker(&self) -> &FlagTracker {
        &self.flag_tracker
    }

    pub async fn data_availability(&self) -> DataAvailability {
        if self.store.selector().is_some() {
            return DataAvailability::Refreshed;
        }
        if !self.configured_with_data_sources || self.store.is_initialized().await {
            return DataAvailability::Cached;
        }
        DataAvailability::Defaults
    }

    pub fn target_availability(&self) -> DataAvailability {
        if self.configured_with_data_sources {
            DataAvailability::Refreshed
        } else {
            DataAvailability::Cached
        }
    }
}

impl std::fmt::Debug for FDv2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FDv2")
            .field("disabled", &self.disabled)
            .field("configured_with_data_sources", &self.configured_with_data_sources)
            .finish()
    }
}

struct Coordinator {
    store: Arc<Store>,
    status_provider: Arc<DataSourceStatusProvider>,
    cancel: CancellationToken,
}

/// Outcome of consuming one synchronizer until it quit or a condition hit.
struct ConsumeOutcome {
    /// The synchronizer is done for good and must be discarded.
    remove: bool,
    /// The service asked us to downgrade to the v1 protocol.
    fallback_to_v1: bool,
}

impl Coordinator {
    async fn run(&self, mut config: DataSystemConfig, ready: Signal) {
        self.status_provider.update_status(DataSourceState::Initializing, None);

        self.run_initializers(&mut config, &ready).await;
        if self.cancel.is_cancelled() {
            return;
        }
        self.run_synchronizers(config, ready).await;
    }

    async fn run_initializers(&self, config: &mut DataSystemConfig, ready: &Signal) {
        for builder in config.initializers.drain(..) {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut initializer = builder();
            info!("attempting to initialize via {}", initializer.name());
            match initializer.fetch().await {
                Ok(basis) => {
                    info!("initialized via {}", initializer.name());
                    if let Err(e) = self.store.apply(&basis.change_set, basis.persist).await {
                        error!("couldn't apply initializer result: {e}");
                        continue;
                    }
                    if !ready.is_set() {
                        ready.set();
                    }
                    return;
                }
                Err(e) => {
                    warn!("initializer {} failed: {}", initializer.name(), e.message);
                }
            }
        }
    }

    async fn run_synchronizers(&self, config: DataSystemConfig, ready: Signal) {
        let mut primary = match config.primary_synchronizer {
            Some(primary) => Some(primary),
            None => {
                // nothing keeps data current; whatever the initializers
                // produced is all there is
                if !ready.is_set() {
                    ready.set();
                }
                return;
            }
        };
        let mut secondary = config.secondary_synchronizer;
        let fdv1_fallback = config.fdv1_fallback_synchronizer;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(primary_builder) = &primary else {
                return;
            };
            let synchronizer = primary_builder();
            info!("primary synchronizer {} is starting", synchronizer.name());

            let outcome =
                self.consume_synchronizer(synchronizer, &ready, Self::fallback_condition).await;
            if self.cancel.is_cancelled() {
                return;
            }

            if outcome.remove {
                primary = secondary.take();
                if outcome.fallback_to_v1 {
                    primary = fdv1_fallback.clone();
                }
                if primary.is_none() {
                    info!("no more synchronizers available");
                    self.shut_off();
                    return;
                }
                continue;
            }

            info!("fallback condition met");
            let Some(secondary_builder) = &secondary else {
                continue;
            };
            let synchronizer = secondary_builder();
            info!("secondary synchronizer {} is starting", synchronizer.name());

            let outcome =
                self.consume_synchronizer(synchronizer, &ready, Self::recovery_condition).await;
            if self.cancel.is_cancelled() {
                return;
            }

            if outcome.remove {
                secondary = None;
                if outcome.fallback_to_v1 {
                    primary = fdv1_fallback.clone();
                }
                if primary.is_none() {
                    info!("no more synchronizers available");
                    self.shut_off();
                    return;
                }
            } else {
                info!("recovery condition met, returning to primary synchronizer");
            }
        }
    }

    fn shut_off(&self) {
        let error = self.status_provider.status().error;
        self.status_provider.update_status(DataSourceState::Off, error);
    }

    fn condition_met(&self, condition: fn(DataSourceState, Duration) -> bool) -> bool {
        condition(self.status_provider.status().state, self.status_provider.status_age())
    }

    /// Consumes a synchronizer's updates until it quits, the stop token
    /// fires, or `condition` is met. The condition is also re-checked on a
    /// timer so a silently stalled synchronizer still fails over.
    async fn consume_synchronizer(
        &self,
        synchronizer: Box<dyn Synchronizer>,
        ready: &Signal,
        condition: fn(DataSourceState, Duration) -> bool,
    ) -> ConsumeOutcome {
        let mut updates =
            synchronizer.sync(Arc::clone(&self.store) as Arc<dyn SelectorSource>);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return ConsumeOutcome { remove: false, fallback_to_v1: false };
                }
                update = updates.next() => {
                    let Some(update) = update else {
                        return ConsumeOutcome { remove: true, fallback_to_v1: false };
                    };

                    if let Some(change_set) = &update.change_set
                        && let Err(e) = self.store.apply(change_set, true).await
                    {
                        error!("couldn't apply change set: {e}");
                        self.status_provider.update_status(
                            DataSourceState::Interrupted,
                            Some(DataSourceErrorInfo::new(
                                DataSourceErrorKind::StoreError,
                                e.to_string(),
                            )),
                        );
                        continue;
                    }

                    if update.state == DataSourceState::Valid && !ready.is_set() {
                        ready.set();
                    }
                    self.status_provider.update_status(update.state, update.error.clone());

                    if update.state == DataSourceState::Off {
                        return ConsumeOutcome {
                            remove: true,
                            fallback_to_v1: update.revert_to_fdv1,
                        };
                    }
                    if self.condition_met(condition) {
                        return ConsumeOutcome { remove: false, fallback_to_v1: false };
                    }
                }
                _ = tokio::time::sleep(CONDITION_CHECK_INTERVAL) => {
                    if self.condition_met(condition) {
                        return ConsumeOutcome { remove: false, fallback_to_v1: false };
                    }
                }
            }
        }
    }

    /// Whether the primary should yield to the secondary.
    fn fallback_condition(state: DataSourceState, age: Duration) -> bool {
        let interrupted_at_runtime =
            state == DataSourceState::Interrupted && age > INTERRUPTED_THRESHOLD;
        let cannot_initialize =
            state == DataSourceState::Initializing && age > INITIALIZING_THRESHOLD;
        interrupted_at_runtime || cannot_initialize
    }

    /// Whether the secondary should hand control back to the primary.
    fn recovery_condition(state: DataSourceState, age: Duration) -> bool {
        let interrupted_at_runtime =
            state == DataSourceState::Interrupted && age > INTERRUPTED_THRESHOLD;
        let healthy_long_enough =
            state == DataSourceState::Valid && age > RECOVERY_HEALTHY_THRESHOLD;
        let cannot_initialize =
            state == DataSourceState::Initializing && age > INITIALIZING_THRESHOLD;
        interrupted_at_runtime || healthy_long_enough || cannot_initialize
    }
}
