use std::collections::HashMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::flag::FeatureFlag;
use crate::segment::Segment;

/// The kinds of versioned data the store can hold.
///
/// The serde representation matches the v2 wire protocol's object kind
/// (`"flag"` / `"segment"`); [`DataKind::namespace`] gives the storage
/// namespace used by persistent stores and the v1 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Flag,
    Segment,
}

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::Flag, DataKind::Segment];

    /// Storage namespace for this kind.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Flag => "features",
            DataKind::Segment => "segments",
        }
    }

    /// Path prefix used by v1 streaming `patch`/`delete` events.
    pub fn stream_api_path(&self) -> &'static str {
        match self {
            DataKind::Flag => "/flags/",
            DataKind::Segment => "/segments/",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace())
    }
}

/// A `(kind, key)` pair identifying one stored item; the node type of the
/// dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindAndKey {
    pub kind: DataKind,
    pub key: String,
}

impl KindAndKey {
    pub fn new(kind: DataKind, key: impl Into<String>) -> Self {
        KindAndKey { kind, key: key.into() }
    }
}

/// Placeholder written by `delete` so that stale upserts for the same key
/// cannot resurrect the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: String,
    pub version: u64,
    pub deleted: bool,
}

impl Tombstone {
    pub fn new(key: impl Into<String>, version: u64) -> Self {
        Tombstone { key: key.into(), version, deleted: true }
    }
}

/// One versioned item in the store: a flag, a segment, or a deletion
/// tombstone.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
    Tombstone(Tombstone),
}

impl StoreItem {
    pub fn key(&self) -> &str {
        match self {
            StoreItem::Flag(f) => &f.key,
            StoreItem::Segment(s) => &s.key,
            StoreItem::Tombstone(t) => &t.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(f) => f.version,
            StoreItem::Segment(s) => s.version,
            StoreItem::Tombstone(t) => t.version,
        }
    }

    /// True for tombstones and for items delivered with a `deleted` marker.
    pub fn is_deleted(&self) -> bool {
        match self {
            StoreItem::Flag(f) => f.deleted,
            StoreItem::Segment(s) => s.deleted,
            StoreItem::Tombstone(_) => true,
        }
    }

    /// Decodes an item of the given kind from its JSON representation.
    /// Objects marked `deleted` decode as tombstones regardless of kind.
    pub fn from_json(kind: DataKind, value: Value) -> Result<StoreItem, serde_json::Error> {
        let deleted = value
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if deleted {
            return Ok(StoreItem::Tombstone(serde_json::from_value(value)?));
        }
        match kind {
            DataKind::Flag => Ok(StoreItem::Flag(serde_json::from_value(value)?)),
            DataKind::Segment => Ok(StoreItem::Segment(serde_json::from_value(value)?)),
        }
    }
}

impl Serialize for StoreItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StoreItem::Flag(f) => f.serialize(serializer),
            StoreItem::Segment(s) => s.serialize(serializer),
            StoreItem::Tombstone(t) => t.serialize(serializer),
        }
    }
}

impl From<FeatureFlag> for StoreItem {
    fn from(flag: FeatureFlag) -> Self {
        StoreItem::Flag(flag)
    }
}

impl From<Segment> for StoreItem {
    fn from(segment: Segment) -> Self {
        StoreItem::Segment(segment)
    }
}

/// A complete data set, as handed to `init`: all items of every kind.
pub type FullDataSet = HashMap<DataKind, HashMap<String, StoreItem>>;
