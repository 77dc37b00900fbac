//! End-to-end tests for the v2 data system coordinator: initializer
//! handoff, synchronizer failover and recovery, protocol downgrade, and
//! availability reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::json;

use flagstream_core::datasystem::config::DataSystemConfigBuilder;
use flagstream_core::model::{DataKind, StoreItem};
use flagstream_core::protocol::{ChangeSet, ChangeSetBuilder, IntentCode, Selector};
use flagstream_core::{
    Basis, DataAvailability, DataSourceErrorInfo, DataSourceErrorKind, DataSourceState,
    DataSourceStatus, FDv2, Initializer, InitializerBuilder, SelectorSource, Signal, Synchronizer,
    SynchronizerBuilder, Update,
};

fn flag(key: &str, version: u64) -> StoreItem {
    StoreItem::from_json(DataKind::Flag, json!({"key": key, "version": version})).unwrap()
}

fn full_transfer(items: Vec<StoreItem>, selector: &str) -> ChangeSet {
    let mut builder = ChangeSetBuilder::new();
    builder.start(IntentCode::TransferFull);
    for item in items {
        let (key, version) = (item.key().to_owned(), item.version());
        builder.add_put(DataKind::Flag, key, version, item);
    }
    builder.finish(Some(Selector::new(selector, 1))).unwrap()
}

fn delta(items: Vec<StoreItem>, selector: &str) -> ChangeSet {
    let mut builder = ChangeSetBuilder::new();
    builder.start(IntentCode::TransferChanges);
    for item in items {
        let (key, version) = (item.key().to_owned(), item.version());
        builder.add_put(DataKind::Flag, key, version, item);
    }
    builder.finish(Some(Selector::new(selector, 2))).unwrap()
}

#[derive(Clone)]
enum Step {
    Yield(Update),
    Hang,
}

struct ScriptedSynchronizer {
    name: &'static str,
    steps: Vec<Step>,
}

impl Synchronizer for ScriptedSynchronizer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn sync(self: Box<Self>, _selectors: Arc<dyn SelectorSource>) -> BoxStream<'static, Update> {
        Box::pin(async_stream::stream! {
            for step in self.steps {
                match step {
                    Step::Yield(update) => yield update,
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        })
    }
}

fn scripted(name: &'static str, steps: Vec<Step>) -> SynchronizerBuilder {
    let builds = Arc::new(Mutex::new(0usize));
    scripted_counting(name, steps, builds)
}

fn scripted_counting(
    name: &'static str,
    steps: Vec<Step>,
    builds: Arc<Mutex<usize>>,
) -> SynchronizerBuilder {
    Arc::new(move || {
        *builds.lock() += 1;
        Box::new(ScriptedSynchronizer { name, steps: steps.clone() })
    })
}

struct ScriptedInitializer {
    basis: Option<Basis>,
}

#[async_trait]
impl Initializer for ScriptedInitializer {
    fn name(&self) -> &'static str {
        "scripted-initializer"
    }

    async fn fetch(&mut self) -> Result<Basis, DataSourceErrorInfo> {
        self.basis.take().ok_or_else(|| {
            DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, "no basis available")
        })
    }
}

fn initializer_with(change_set: ChangeSet) -> InitializerBuilder {
    Box::new(move || {
        Box::new(ScriptedInitializer {
            basis: Some(Basis {
                change_set: change_set.clone(),
                persist: true,
                environment_id: None,
            }),
        })
    })
}

fn failing_initializer() -> InitializerBuilder {
    Box::new(|| Box::new(ScriptedInitializer { basis: None }))
}

fn status_recorder(fdv2: &FDv2) -> Arc<Mutex<Vec<DataSourceState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&states);
    fdv2.data_source_status_provider()
        .add_listener(move |status: &DataSourceStatus| s.lock().push(status.state));
    states
}

async fn flag_version(fdv2: &FDv2, key: &str) -> Option<u64> {
    fdv2.store()
        .get(DataKind::Flag, key)
        .await
        .unwrap()
        .map(|item| item.version())
}

#[tokio::test]
async fn two_phase_init_applies_initializer_then_synchronizer_updates() {
    let config = DataSystemConfigBuilder::new()
        .initializers(vec![initializer_with(full_transfer(vec![flag("f1", 1)], "s1"))])
        .synchronizers(
            scripted(
                "sync",
                vec![
                    Step::Yield(Update::valid(Some(delta(vec![flag("f1", 2)], "s2")), None)),
                    Step::Hang,
                ],
            ),
            None,
        )
        .build();

    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await, "data system did not become ready");

    // the synchronizer's delta eventually supersedes the initializer's data
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if flag_version(&fdv2, "f1").await == Some(2) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delta was never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(fdv2.data_availability().await, DataAvailability::Refreshed);
    fdv2.stop().await;
}

#[tokio::test]
async fn initializer_failures_are_tolerated_in_order() {
    let config = DataSystemConfigBuilder::new()
        .initializers(vec![
            failing_initializer(),
            initializer_with(full_transfer(vec![flag("f1", 7)], "s1")),
        ])
        .build();

    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(flag_version(&fdv2, "f1").await, Some(7));
    fdv2.stop().await;
}

#[tokio::test]
async fn no_synchronizers_still_signals_ready() {
    let config = DataSystemConfigBuilder::new().initializers(vec![failing_initializer()]).build();
    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(fdv2.data_availability().await, DataAvailability::Defaults);
    assert_eq!(fdv2.target_availability(), DataAvailability::Refreshed);
    fdv2.stop().await;
}

#[tokio::test]
async fn disabled_data_system_is_ready_and_serves_defaults() {
    let config = DataSystemConfigBuilder::new().disabled(true).build();
    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.is_set());
    assert_eq!(fdv2.data_availability().await, DataAvailability::Cached);
    fdv2.stop().await;
}

#[tokio::test]
async fn primary_off_promotes_secondary() {
    let config = DataSystemConfigBuilder::new()
        .synchronizers(
            scripted("primary", vec![Step::Yield(Update::off(None, None))]),
            Some(scripted(
                "secondary",
                vec![
                    Step::Yield(Update::valid(
                        Some(full_transfer(vec![flag("from-secondary", 1)], "s1")),
                        None,
                    )),
                    Step::Hang,
                ],
            )),
        )
        .build();

    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(flag_version(&fdv2, "from-secondary").await, Some(1));
    fdv2.stop().await;
}

#[tokio::test]
async fn all_synchronizers_exhausted_turns_off() {
    let config = DataSystemConfigBuilder::new()
        .synchronizers(
            scripted(
                "primary",
                vec![Step::Yield(Update::off(
                    Some(DataSourceErrorInfo::http(401, "HTTP error 401")),
                    None,
                ))],
            ),
            None,
        )
        .build();

    let fdv2 = FDv2::new(config);
    let states = status_recorder(&fdv2);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fdv2.data_source_status_provider().status().state != DataSourceState::Off {
        assert!(tokio::time::Instant::now() < deadline, "never reached Off");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(states.lock().contains(&DataSourceState::Off));
    // terminal error details are preserved on the final status
    let status = fdv2.data_source_status_provider().status();
    assert_eq!(status.error.unwrap().status_code, 401);
    fdv2.stop().await;
}

#[tokio::test]
async fn fdv1_downgrade_replaces_primary_and_clears_secondary() {
    let secondary_builds = Arc::new(Mutex::new(0usize));
    let config = DataSystemConfigBuilder::new()
        .synchronizers(
            scripted(
                "primary",
                vec![Step::Yield(Update::fallback_to_fdv1(None, Some("env-1".into())))],
            ),
            Some(scripted_counting("secondary", vec![Step::Hang], Arc::clone(&secondary_builds))),
        )
        .fdv1_fallback(scripted(
            "fdv1-fallback",
            vec![
                Step::Yield(Update::valid(
                    Some(full_transfer(vec![flag("from-v1", 3)], "s-v1")),
                    None,
                )),
                Step::Hang,
            ],
        ))
        .build();

    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(flag_version(&fdv2, "from-v1").await, Some(3));
    assert_eq!(*secondary_builds.lock(), 0, "secondary must not run after a v1 downgrade");
    fdv2.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_interrupted_primary_fails_over_after_a_minute() {
    let started = tokio::time::Instant::now();
    let config = DataSystemConfigBuilder::new()
        .synchronizers(
            scripted(
                "primary",
                vec![
                    Step::Yield(Update::valid(
                        Some(full_transfer(vec![flag("f1", 1)], "s1")),
                        None,
                    )),
                    Step::Yield(Update::interrupted(
                        DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, "conn reset"),
                        None,
                    )),
                    Step::Hang,
                ],
            ),
            Some(scripted(
                "secondary",
                vec![
                    Step::Yield(Update::valid(
                        Some(delta(vec![flag("f1", 2)], "s2")),
                        None,
                    )),
                    Step::Hang,
                ],
            )),
        )
        .build();

    let fdv2 = FDv2::new(config);
    let states = status_recorder(&fdv2);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(5)).await);

    // the secondary's delta only lands once the fallback condition trips
    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    loop {
        if flag_version(&fdv2, "f1").await == Some(2) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "failover never happened");
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // the interruption had to age past the one-minute threshold first
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(
        *states.lock(),
        vec![DataSourceState::Valid, DataSourceState::Interrupted, DataSourceState::Valid]
    );
    fdv2.stop().await;
}

#[tokio::test(start_paused = true)]
async fn primary_that_cannot_initialize_yields_within_seconds() {
    let started = tokio::time::Instant::now();
    let config = DataSystemConfigBuilder::new()
        .synchronizers(
            scripted("primary", vec![Step::Hang]),
            Some(scripted(
                "secondary",
                vec![
                    Step::Yield(Update::valid(
                        Some(full_transfer(vec![flag("f1", 1)], "s1")),
                        None,
                    )),
                    Step::Hang,
                ],
            )),
        )
        .build();

    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    assert!(ready.wait_timeout(Duration::from_secs(60)).await);
    assert_eq!(flag_version(&fdv2, "f1").await, Some(1));
    // initializing stall is bounded by the ten-second threshold, not the
    // one-minute interrupted threshold
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(60));
    fdv2.stop().await;
}

#[tokio::test]
async fn test_data_source_drives_flag_changes_end_to_end() {
    use flagstream_core::integrations::test_data::TestData;

    let td = TestData::new();
    td.update(td.flag("feature-flag").on(true));

    let config = DataSystemConfigBuilder::new()
        .initializers(vec![td.initializer_builder()])
        .synchronizers(td.synchronizer_builder(), None)
        .build();
    let fdv2 = FDv2::new(config);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&changes);
    fdv2.flag_tracker()
        .add_listener(move |change: &flagstream_core::FlagChange| seen.lock().push(change.key.clone()));

    let ready = Signal::new();
    fdv2.start(ready.clone());
    assert!(ready.wait_timeout(Duration::from_secs(5)).await);

    td.update(td.flag("feature-flag").on(false));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while changes.lock().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "flag change listener was not called");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(changes.lock().iter().all(|key| key == "feature-flag"));

    fdv2.stop().await;
}

#[tokio::test]
async fn stop_terminates_promptly() {
    let config = DataSystemConfigBuilder::new()
        .synchronizers(scripted("primary", vec![Step::Hang]), None)
        .build();

    let fdv2 = FDv2::new(config);
    let ready = Signal::new();
    fdv2.start(ready.clone());

    tokio::time::timeout(Duration::from_secs(10), fdv2.stop())
        .await
        .expect("stop did not complete in time");
}
