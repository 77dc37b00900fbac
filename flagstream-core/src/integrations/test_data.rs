//! A programmatic data source for tests: flags are defined and mutated in
//! code, and every attached synchronizer sees the changes immediately.
//!
//! One `TestData` instance can feed any number of data systems; an update
//! made after attachment is delivered as an incremental change set, so
//! listener and dependency behavior can be exercised without a server.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::datasource::{
    Basis, DataSourceErrorInfo, Initializer, InitializerBuilder, SelectorSource, Synchronizer,
    SynchronizerBuilder, Update,
};
use crate::protocol::{ChangeSet, ChangeSetBuilder, IntentCode, Selector};
use flagstream_model::{DataKind, FeatureFlag, StoreItem};

/// Builder for one test flag. Fields left unset keep their previous values
/// when the flag already exists.
#[derive(Debug, Clone)]
pub struct FlagBuilder {
    key: String,
    on: bool,
    variations: Vec<Value>,
    extra: serde_json::Map<String, Value>,
}

impl FlagBuilder {
    fn new(key: &str) -> Self {
        FlagBuilder {
            key: key.to_owned(),
            on: true,
            // boolean true/false variations by default
            variations: vec![json!(true), json!(false)],
            extra: serde_json::Map::new(),
        }
    }

    pub fn on(mut self, on: bool) -> Self {
        self.on = on;
        self
    }

    pub fn variations(mut self, variations: Vec<Value>) -> Self {
        self.variations = variations;
        self
    }

    /// Sets an arbitrary property on the generated flag JSON, for shapes
    /// the builder does not model (prerequisites, rules, and so on).
    pub fn property(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_owned(), value);
        self
    }

    fn build(&self, version: u64) -> FeatureFlag {
        let mut object = json!({
            "key": self.key,
            "version": version,
            "on": self.on,
            "variations": self.variations,
            "fallthrough": {"variation": 0},
        });
        if let Some(map) = object.as_object_mut() {
            for (name, value) in &self.extra {
                map.insert(name.clone(), value.clone());
            }
        }
        serde_json::from_value(object).unwrap_or_else(|_| FeatureFlag::always_on(&self.key, json!(true)))
    }
}

struct Shared {
    flags: HashMap<String, (FlagBuilder, u64)>,
    next_version: u64,
    payload_version: u64,
    channels: Vec<mpsc::UnboundedSender<Update>>,
}

impl Shared {
    fn selector(&self) -> Selector {
        Selector::new(format!("test-data-{}", self.payload_version), self.payload_version)
    }

    fn full_change_set(&self) -> ChangeSet {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        for (builder_def, version) in self.flags.values() {
            let flag = builder_def.build(*version);
            builder.add_put(
                DataKind::Flag,
                flag.key.clone(),
                *version,
                StoreItem::Flag(flag),
            );
        }
        builder.finish(Some(self.selector())).unwrap_or_else(|_| ChangeSet::no_changes())
    }
}

/// Shared handle for a programmatic flag data source.
pub struct TestData {
    shared: Arc<Mutex<Shared>>,
}

impl Default for TestData {
    fn default() -> Self {
        Self::new()
    }
}

impl TestData {
    pub fn new() -> Self {
        TestData {
            shared: Arc::new(Mutex::new(Shared {
                flags: HashMap::new(),
                next_version: 0,
                payload_version: 0,
                channels: Vec::new(),
            })),
        }
    }

    /// Starts building a flag. If the key is already defined, the builder
    /// starts from its current configuration.
    pub fn flag(&self, key: &str) -> FlagBuilder {
        let shared = self.shared.lock();
        match shared.flags.get(key) {
            Some((builder, _)) => builder.clone(),
            None => FlagBuilder::new(key),
        }
    }

    /// Applies a flag definition, bumping its version and broadcasting the
    /// change to every attached synchronizer. Synchronizers that have been
    /// dropped are pruned as a side effect.
    pub fn update(&self, flag: FlagBuilder) {
        let mut shared = self.shared.lock();
        shared.next_version += 1;
        shared.payload_version += 1;
        let version = shared.next_version;
        let key = flag.key.clone();
        shared.flags.insert(key.clone(), (flag.clone(), version));

        let built = flag.build(version);
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        builder.add_put(DataKind::Flag, key, version, StoreItem::Flag(built));
        let change_set = builder
            .finish(Some(shared.selector()))
            .unwrap_or_else(|_| ChangeSet::no_changes());

        let update = Update::valid(Some(change_set), None);
        shared.channels.retain(|channel| channel.send(update.clone()).is_ok());
    }

    /// A builder producing initializers that serve the current data.
    pub fn initializer_builder(&self) -> InitializerBuilder {
        let shared = Arc::clone(&self.shared);
        Box::new(move || {
            Box::new(TestDataInitializer { shared: Arc::clone(&shared) }) as Box<dyn Initializer>
        })
    }

    /// A builder producing synchronizers that serve the current data, then
    /// stream every subsequent update.
    pub fn synchronizer_builder(&self) -> SynchronizerBuilder {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            Box::new(TestDataSynchronizer { shared: Arc::clone(&shared) }) as Box<dyn Synchronizer>
        })
    }
}

impl std::fmt::Debug for TestData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestData").field("flags", &self.shared.lock().flags.len()).finish()
    }
}

struct TestDataInitializer {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl Initializer for TestDataInitializer {
    fn name(&self) -> &'static str {
        "test-data"
    }

    async fn fetch(&mut self) -> Result<Basis, DataSourceErrorInfo> {
        let change_set = self.shared.lock().full_change_set();
        Ok(Basis { change_set, persist: false, environment_id: None })
    }
}

struct TestDataSynchronizer {
    shared: Arc<Mutex<Shared>>,
}

impl Synchronizer for TestDataSynchronizer {
    fn name(&self) -> &'static str {
        "test-data"
    }

    fn sync(self: Box<Self>, _selectors: Arc<dyn SelectorSource>) -> BoxStream<'static, Update> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let initial = {
            let mut shared = self.shared.lock();
            let change_set = shared.full_change_set();
            shared.channels.push(tx);
            Update::valid(Some(change_set), None)
        };

        Box::pin(stream! {
            yield initial;
            while let Some(update) = rx.recv().await {
                yield update;
            }
        })
    }
}
