//! Wires the real polling data source (with a canned requester) into the
//! v2 coordinator and checks the 304 steady state: one full transfer, then
//! no-op change sets that neither touch the store nor wake listeners.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use flagstream_core::datasourcev2::polling::{
    PollingDataSource, PollingError, PollingRequester, PollingResponse,
};
use flagstream_core::datasystem::config::DataSystemConfigBuilder;
use flagstream_core::model::DataKind;
use flagstream_core::protocol::{ChangeSet, Selector};
use flagstream_core::{FDv2, FlagChange, Signal, Synchronizer, SynchronizerBuilder};

/// First fetch returns a full transfer; every later fetch acts like a 304.
struct OnceThenNotModified {
    payload: Mutex<Option<ChangeSet>>,
    fetches: Arc<Mutex<usize>>,
}

#[async_trait]
impl PollingRequester for OnceThenNotModified {
    async fn fetch(&self, _selector: Option<Selector>) -> Result<PollingResponse, PollingError> {
        *self.fetches.lock() += 1;
        let change_set = self.payload.lock().take().unwrap_or_else(ChangeSet::no_changes);
        Ok(PollingResponse { change_set, environment_id: None, fallback: false })
    }
}

fn first_payload() -> ChangeSet {
    use flagstream_core::model::StoreItem;
    use flagstream_core::protocol::{ChangeSetBuilder, IntentCode};

    let mut builder = ChangeSetBuilder::new();
    builder.start(IntentCode::TransferFull);
    let item = StoreItem::from_json(DataKind::Flag, json!({"key": "a", "version": 1})).unwrap();
    builder.add_put(DataKind::Flag, "a", 1, item);
    builder.finish(Some(Selector::new("e1", 1))).unwrap()
}

#[tokio::test]
async fn not_modified_polls_do_not_disturb_the_store_or_listeners() {
    let fetches = Arc::new(Mutex::new(0usize));
    let fetch_count = Arc::clone(&fetches);

    let builder: SynchronizerBuilder = Arc::new(move || {
        let requester = Arc::new(OnceThenNotModified {
            payload: Mutex::new(Some(first_payload())),
            fetches: Arc::clone(&fetch_count),
        });
        Box::new(PollingDataSource::new(Duration::from_millis(10), requester))
            as Box<dyn Synchronizer>
    });

    let config = DataSystemConfigBuilder::new().synchronizers(builder, None).build();
    let fdv2 = FDv2::new(config);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&changes);
    fdv2.flag_tracker().add_listener(move |change: &FlagChange| seen.lock().push(change.key.clone()));

    let ready = Signal::new();
    fdv2.start(ready.clone());
    assert!(ready.wait_timeout(Duration::from_secs(5)).await);

    // let several 304-style polls go by
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while *fetches.lock() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "polling stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let store = fdv2.store();
    let item = store.get(DataKind::Flag, "a").await.unwrap().unwrap();
    assert_eq!(item.version(), 1);

    // exactly one notification from the initial transfer; the no-op polls
    // must not add anything
    assert_eq!(*changes.lock(), vec!["a".to_owned()]);

    fdv2.stop().await;
}
