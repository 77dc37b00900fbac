//! Local-file data source, for development and testing against flag data
//! kept in JSON or YAML files instead of a control plane.
//!
//! Files may define full `flags`, short-form `flagValues` (promoted to
//! single-variation always-on flags), and `segments`. Using the same key
//! twice across the file set is a hard error. As a synchronizer the source
//! can watch the files and re-emit a fresh change set on every modification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::datasource::{
    Basis, DataSourceErrorInfo, DataSourceErrorKind, Initializer, SelectorSource, Synchronizer,
    Update,
};
use crate::protocol::{ChangeSet, ChangeSetBuilder, IntentCode};
use flagstream_model::{DataKind, FeatureFlag, StoreItem};

#[derive(Error, Debug)]
pub enum FileDataError {
    #[error("unable to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("in \"{namespace}\", key \"{key}\" was used more than once")]
    DuplicateKey { namespace: &'static str, key: String },
}

/// Configures a [`FileDataSource`].
#[derive(Debug, Clone)]
pub struct FileDataSourceBuilder {
    paths: Vec<PathBuf>,
    auto_update: bool,
    poll_interval: Duration,
    force_polling: bool,
}

impl FileDataSourceBuilder {
    pub fn new() -> Self {
        FileDataSourceBuilder {
            paths: Vec::new(),
            auto_update: false,
            poll_interval: Duration::from_secs(1),
            force_polling: false,
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.paths.extend(paths);
        self
    }

    /// Watch the files and re-emit data when they change (synchronizer
    /// mode only).
    pub fn auto_update(mut self, auto_update: bool) -> Self {
        self.auto_update = auto_update;
        self
    }

    /// Interval for the modification-time fallback when native filesystem
    /// notifications are unavailable.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Use modification-time polling even if native notifications work.
    pub fn force_polling(mut self, force_polling: bool) -> Self {
        self.force_polling = force_polling;
        self
    }

    pub fn build(self) -> FileDataSource {
        FileDataSource {
            paths: self.paths,
            auto_update: self.auto_update,
            poll_interval: self.poll_interval,
            force_polling: self.force_polling,
        }
    }
}

impl Default for FileDataSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads flag data from local files; works as a one-shot initializer or as
/// an auto-reloading synchronizer.
#[derive(Debug, Clone)]
pub struct FileDataSource {
    paths: Vec<PathBuf>,
    auto_update: bool,
    poll_interval: Duration,
    force_polling: bool,
}

#[async_trait]
impl Initializer for FileDataSource {
    fn name(&self) -> &'static str {
        "file-data-source"
    }

    async fn fetch(&mut self) -> Result<Basis, DataSourceErrorInfo> {
        match load_all(&self.paths) {
            Ok(change_set) => Ok(Basis { change_set, persist: false, environment_id: None }),
            Err(e) => {
                Err(DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, e.to_string()))
            }
        }
    }
}

impl Synchronizer for FileDataSource {
    fn name(&self) -> &'static str {
        "file-data-source"
    }

    fn sync(self: Box<Self>, _selectors: Arc<dyn SelectorSource>) -> BoxStream<'static, Update> {
        Box::pin(stream! {
            yield load_update(&self.paths);

            if !self.auto_update {
                // stay alive so the coordinator does not treat a static
                // file source as a dead synchronizer
                std::future::pending::<()>().await;
                return;
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            let watcher = if self.force_polling {
                None
            } else {
                match build_watcher(&self.paths, tx.clone()) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        warn!("cannot watch data files natively ({e}), falling back to polling");
                        None
                    }
                }
            };

            if watcher.is_some() {
                // hold the watcher for the life of the stream
                let _watcher = watcher;
                while rx.recv().await.is_some() {
                    // coalesce bursts of events from one save
                    while rx.try_recv().is_ok() {}
                    debug!("data file changed, reloading");
                    yield load_update(&self.paths);
                }
            } else {
                let mut known_times = file_times(&self.paths);
                loop {
                    tokio::time::sleep(self.poll_interval).await;
                    let new_times = file_times(&self.paths);
                    let changed = known_times.iter().any(|(path, time)| {
                        new_times.get(path).is_some_and(|new| new.is_some() && new != time)
                    });
                    known_times = new_times;
                    if changed {
                        debug!("data file changed, reloading");
                        yield load_update(&self.paths);
                    }
                }
            }
        })
    }
}

fn load_update(paths: &[PathBuf]) -> Update {
    match load_all(paths) {
        Ok(change_set) => Update::valid(Some(change_set), None),
        Err(e) => {
            error!("unable to load flag data: {e}");
            Update::interrupted(
                DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, e.to_string()),
                None,
            )
        }
    }
}

/// Parses every file and merges the results into one full-transfer change
/// set with no selector.
pub fn load_all(paths: &[PathBuf]) -> Result<ChangeSet, FileDataError> {
    let mut flags: HashMap<String, StoreItem> = HashMap::new();
    let mut segments: HashMap<String, StoreItem> = HashMap::new();

    for path in paths {
        load_file(path, &mut flags, &mut segments)?;
    }

    let mut builder = ChangeSetBuilder::new();
    builder.start(IntentCode::TransferFull);
    for (key, item) in flags {
        let version = item.version();
        builder.add_put(DataKind::Flag, key, version, item);
    }
    for (key, item) in segments {
        let version = item.version();
        builder.add_put(DataKind::Segment, key, version, item);
    }
    builder.finish(None).map_err(|e| FileDataError::Parse {
        path: PathBuf::new(),
        message: e.to_string(),
    })
}

fn load_file(
    path: &Path,
    flags: &mut HashMap<String, StoreItem>,
    segments: &mut HashMap<String, StoreItem>,
) -> Result<(), FileDataError> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| FileDataError::Io { path: path.to_owned(), source })?;
    let parsed = parse_content(path, &content)?;

    let parse_error = |message: String| FileDataError::Parse { path: path.to_owned(), message };

    if let Some(file_flags) = parsed.get("flags").and_then(serde_json::Value::as_object) {
        for (key, value) in file_flags {
            let item = StoreItem::from_json(DataKind::Flag, sanitize_item(value.clone()))
                .map_err(|e| parse_error(format!("bad flag \"{key}\": {e}")))?;
            add_item(flags, DataKind::Flag, key, item)?;
        }
    }
    if let Some(flag_values) = parsed.get("flagValues").and_then(serde_json::Value::as_object) {
        for (key, value) in flag_values {
            let flag = FeatureFlag::always_on(key, value.clone());
            add_item(flags, DataKind::Flag, key, StoreItem::Flag(flag))?;
        }
    }
    if let Some(file_segments) = parsed.get("segments").and_then(serde_json::Value::as_object) {
        for (key, value) in file_segments {
            let item = StoreItem::from_json(DataKind::Segment, sanitize_item(value.clone()))
                .map_err(|e| parse_error(format!("bad segment \"{key}\": {e}")))?;
            add_item(segments, DataKind::Segment, key, item)?;
        }
    }
    Ok(())
}

/// Parses a file body as YAML or JSON by extension. YAML is loaded through
/// a safe deserializer into plain JSON values; custom tags are rejected.
fn parse_content(path: &Path, content: &str) -> Result<serde_json::Value, FileDataError> {
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    let parse_error = |message: String| FileDataError::Parse { path: path.to_owned(), message };

    if is_yaml {
        serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))
    } else {
        serde_json::from_str(content).map_err(|e| parse_error(e.to_string()))
    }
}

fn sanitize_item(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(object) = value.as_object_mut()
        && !object.contains_key("version")
    {
        object.insert("version".to_owned(), serde_json::json!(1));
    }
    value
}

fn add_item(
    items: &mut HashMap<String, StoreItem>,
    kind: DataKind,
    key: &str,
    item: StoreItem,
) -> Result<(), FileDataError> {
    if items.insert(key.to_owned(), item).is_some() {
        return Err(FileDataError::DuplicateKey { namespace: kind.namespace(), key: key.to_owned() });
    }
    Ok(())
}

fn file_times(paths: &[PathBuf]) -> HashMap<PathBuf, Option<SystemTime>> {
    paths
        .iter()
        .map(|path| {
            let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            (path.clone(), mtime)
        })
        .collect()
}

fn build_watcher(
    paths: &[PathBuf],
    tx: mpsc::UnboundedSender<()>,
) -> notify::Result<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let watched: std::collections::HashSet<PathBuf> = paths
        .iter()
        .map(|path| path.canonicalize().unwrap_or_else(|_| path.clone()))
        .collect();

    let files = watched.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        if let Ok(event) = result
            && event.paths.iter().any(|path| files.contains(path))
        {
            let _ = tx.send(());
        }
    })?;

    let dirs: std::collections::HashSet<PathBuf> = watched
        .iter()
        .filter_map(|path| path.parent().map(Path::to_owned))
        .collect();
    for dir in dirs {
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    }
    Ok(watcher)
}
