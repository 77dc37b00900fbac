//! Wire model for the v2 flag delivery protocol.
//!
//! Both the streaming and polling transports deliver the same logical event
//! sequence: a server intent announcing what kind of transfer follows, a
//! series of object-level changes, and a payload-transferred marker naming
//! the selector for the data version just completed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use flagstream_model::{DataKind, StoreItem};

/// SSE / polling event names used by the v2 protocol.
pub mod event_names {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SERVER_INTENT: &str = "server-intent";
    pub const PUT_OBJECT: &str = "put-object";
    pub const DELETE_OBJECT: &str = "delete-object";
    pub const PAYLOAD_TRANSFERRED: &str = "payload-transferred";
    pub const GOODBYE: &str = "goodbye";
    pub const ERROR: &str = "error";
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid protocol JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server intent carried no payloads")]
    EmptyServerIntent,

    #[error("received changes without a server intent")]
    MissingIntent,
}

/// What the server intends to transfer on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentCode {
    #[serde(rename = "xfer-full")]
    TransferFull,
    #[serde(rename = "xfer-changes")]
    TransferChanges,
    #[serde(rename = "none")]
    TransferNone,
}

/// Opaque token identifying a point-in-time data version. Echoed back to
/// the server on reconnect so it can serve a delta instead of a full basis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub state: String,
    pub version: u64,
}

impl Selector {
    pub fn new(state: impl Into<String>, version: u64) -> Self {
        Selector { state: state.into(), version }
    }
}

/// One payload entry inside a server intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentPayload {
    pub id: String,
    pub target: u64,
    #[serde(rename = "intentCode")]
    pub code: IntentCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The `server-intent` event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerIntent {
    pub payloads: Vec<IntentPayload>,
}

impl ServerIntent {
    /// The active payload; the protocol currently always sends exactly one.
    pub fn payload(&self) -> Result<&IntentPayload, ProtocolError> {
        self.payloads.first().ok_or(ProtocolError::EmptyServerIntent)
    }
}

/// The `put-object` event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutObject {
    pub kind: DataKind,
    pub key: String,
    pub version: u64,
    pub object: Value,
}

/// The `delete-object` event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteObject {
    pub kind: DataKind,
    pub key: String,
    pub version: u64,
}

/// The `error` event body: the in-flight payload is invalid and must be
/// discarded, though the connection stays up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default)]
    pub payload_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The `goodbye` event body: the server is about to drop the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goodbye {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub catastrophe: bool,
}

/// A protocol event parsed out of either transport. The streaming source
/// sees these one SSE message at a time; the polling source reads a whole
/// list from the response body.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadEvent {
    ServerIntent(ServerIntent),
    Put(PutObject),
    Delete(DeleteObject),
    PayloadTransferred(Selector),
    Goodbye(Goodbye),
    Error(ErrorEvent),
}

impl PayloadEvent {
    /// Parses an event by name. Heartbeats and unrecognized event names
    /// yield `None`; they are legal and ignored.
    pub fn parse(name: &str, data: Value) -> Result<Option<PayloadEvent>, ProtocolError> {
        let event = match name {
            event_names::SERVER_INTENT => {
                PayloadEvent::ServerIntent(serde_json::from_value(data)?)
            }
            event_names::PUT_OBJECT => PayloadEvent::Put(serde_json::from_value(data)?),
            event_names::DELETE_OBJECT => PayloadEvent::Delete(serde_json::from_value(data)?),
            event_names::PAYLOAD_TRANSFERRED => {
                PayloadEvent::PayloadTransferred(serde_json::from_value(data)?)
            }
            event_names::GOODBYE => PayloadEvent::Goodbye(serde_json::from_value(data)?),
            event_names::ERROR => PayloadEvent::Error(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Parses an event whose data is still JSON text (the SSE `data:`
    /// field).
    pub fn parse_str(name: &str, data: &str) -> Result<Option<PayloadEvent>, ProtocolError> {
        match name {
            event_names::HEARTBEAT => Ok(None),
            event_names::SERVER_INTENT
            | event_names::PUT_OBJECT
            | event_names::DELETE_OBJECT
            | event_names::PAYLOAD_TRANSFERRED
            | event_names::GOODBYE
            | event_names::ERROR => Self::parse(name, serde_json::from_str(data)?),
            _ => Ok(None),
        }
    }
}

/// The action carried by one [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Put,
    Delete,
}

/// One object-level change inside a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub action: ChangeAction,
    pub kind: DataKind,
    pub key: String,
    pub version: u64,
    /// Present for puts, absent for deletes.
    pub object: Option<StoreItem>,
}

/// An ordered batch of changes crossing the data-source → store boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub intent_code: IntentCode,
    pub changes: Vec<Change>,
    pub selector: Option<Selector>,
}

impl ChangeSet {
    /// The change set produced when the server reports no new data
    /// (`TRANSFER_NONE` intent, or a 304 on the polling endpoint).
    pub fn no_changes() -> ChangeSet {
        ChangeSet { intent_code: IntentCode::TransferNone, changes: Vec::new(), selector: None }
    }
}

/// Accumulates protocol events into a [`ChangeSet`], finished off by the
/// payload-transferred marker.
#[derive(Debug, Default)]
pub struct ChangeSetBuilder {
    intent: Option<IntentCode>,
    changes: Vec<Change>,
}

impl ChangeSetBuilder {
    pub fn new() -> Self {
        ChangeSetBuilder::default()
    }

    /// Begins a new change set under the given intent, discarding any
    /// partial accumulation.
    pub fn start(&mut self, intent: IntentCode) {
        self.intent = Some(intent);
        self.changes.clear();
    }

    /// After a `TRANSFER_NONE` intent, any changes that do arrive are
    /// deltas.
    pub fn expect_changes(&mut self) {
        self.intent = Some(IntentCode::TransferChanges);
    }

    /// Discards accumulated changes but keeps the last server intent. The
    /// protocol's `error` event triggers this; receiving it before any
    /// intent is a no-op.
    pub fn reset(&mut self) {
        self.changes.clear();
    }

    pub fn add_put(&mut self, kind: DataKind, key: impl Into<String>, version: u64, object: StoreItem) {
        self.changes.push(Change {
            action: ChangeAction::Put,
            kind,
            key: key.into(),
            version,
            object: Some(object),
        });
    }

    pub fn add_delete(&mut self, kind: DataKind, key: impl Into<String>, version: u64) {
        self.changes.push(Change {
            action: ChangeAction::Delete,
            kind,
            key: key.into(),
            version,
            object: None,
        });
    }

    /// Completes the current change set. Subsequent batches on the same
    /// connection are deltas unless the server says otherwise.
    pub fn finish(&mut self, selector: Option<Selector>) -> Result<ChangeSet, ProtocolError> {
        let intent = self.intent.ok_or(ProtocolError::MissingIntent)?;
        let changes = std::mem::take(&mut self.changes);
        self.intent = Some(IntentCode::TransferChanges);
        Ok(ChangeSet { intent_code: intent, changes, selector })
    }
}
