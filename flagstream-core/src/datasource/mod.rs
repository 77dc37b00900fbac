use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::protocol::{ChangeSet, Selector};

pub mod polling;
pub mod status;
pub mod streaming;

/// Connection lifecycle state of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    /// Starting up; no data received yet.
    Initializing,
    /// Connected and current.
    Valid,
    /// Temporarily unable to receive updates; last known data still served.
    Interrupted,
    /// Permanently stopped.
    Off,
}

/// Classification of a data source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    /// Connection or socket level failure.
    NetworkError,
    /// The service returned an HTTP error status.
    ErrorResponse,
    /// A payload could not be parsed.
    InvalidData,
    /// The backing store rejected an update.
    StoreError,
    Unknown,
}

/// Details of the most recent data source failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceErrorInfo {
    pub kind: DataSourceErrorKind,
    /// HTTP status for `ErrorResponse` errors; zero otherwise.
    pub status_code: u16,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl DataSourceErrorInfo {
    pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> Self {
        DataSourceErrorInfo { kind, status_code: 0, time: Utc::now(), message: message.into() }
    }

    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        DataSourceErrorInfo {
            kind: DataSourceErrorKind::ErrorResponse,
            status_code,
            time: Utc::now(),
            message: message.into(),
        }
    }
}

/// Snapshot of a data source's health, as exposed to status listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When the source entered the current state.
    pub since: DateTime<Utc>,
    pub error: Option<DataSourceErrorInfo>,
}

impl DataSourceStatus {
    pub fn initializing() -> Self {
        DataSourceStatus { state: DataSourceState::Initializing, since: Utc::now(), error: None }
    }
}

/// One result yielded by a synchronizer.
#[derive(Debug, Clone)]
pub struct Update {
    pub state: DataSourceState,
    pub change_set: Option<ChangeSet>,
    pub error: Option<DataSourceErrorInfo>,
    /// The service has signalled that this client should downgrade to the
    /// v1 protocol.
    pub revert_to_fdv1: bool,
    pub environment_id: Option<String>,
}

impl Update {
    pub fn valid(change_set: Option<ChangeSet>, environment_id: Option<String>) -> Self {
        Update {
            state: DataSourceState::Valid,
            change_set,
            error: None,
            revert_to_fdv1: false,
            environment_id,
        }
    }

    pub fn interrupted(error: DataSourceErrorInfo, environment_id: Option<String>) -> Self {
        Update {
            state: DataSourceState::Interrupted,
            change_set: None,
            error: Some(error),
            revert_to_fdv1: false,
            environment_id,
        }
    }

    pub fn off(error: Option<DataSourceErrorInfo>, environment_id: Option<String>) -> Self {
        Update {
            state: DataSourceState::Off,
            change_set: None,
            error,
            revert_to_fdv1: false,
            environment_id,
        }
    }

    pub fn fallback_to_fdv1(
        error: Option<DataSourceErrorInfo>,
        environment_id: Option<String>,
    ) -> Self {
        Update {
            state: DataSourceState::Off,
            change_set: None,
            error,
            revert_to_fdv1: true,
            environment_id,
        }
    }

    pub fn with_environment_id(mut self, environment_id: Option<String>) -> Update {
        self.environment_id = environment_id;
        self
    }
}

/// A complete initial data set plus the selector identifying its version.
#[derive(Debug, Clone)]
pub struct Basis {
    pub change_set: ChangeSet,
    /// Whether the data may be mirrored to a persistent store.
    pub persist: bool,
    pub environment_id: Option<String>,
}

/// Read access to the store's current selector, handed to data sources so
/// reconnects can request deltas.
pub trait SelectorSource: Send + Sync {
    fn selector(&self) -> Option<Selector>;
}

/// A [`SelectorSource`] that never has a selector; used when a data source
/// runs without a v2 store behind it.
#[derive(Debug, Default)]
pub struct NoSelector;

impl SelectorSource for NoSelector {
    fn selector(&self) -> Option<Selector> {
        None
    }
}

/// A component that fetches a complete basis exactly once. Initializers do
/// not retry; the coordinator decides what to do with a failure.
#[async_trait]
pub trait Initializer: Send {
    fn name(&self) -> &'static str;

    async fn fetch(&mut self) -> Result<Basis, DataSourceErrorInfo>;
}

/// A component that yields a stream of updates (an initial basis plus
/// deltas) for the lifetime of a connection. Dropping the stream cancels
/// the connection.
pub trait Synchronizer: Send {
    fn name(&self) -> &'static str;

    fn sync(self: Box<Self>, selectors: Arc<dyn SelectorSource>) -> BoxStream<'static, Update>;
}

/// Factory for initializers; the coordinator builds each one lazily, in
/// configuration order.
pub type InitializerBuilder = Box<dyn Fn() -> Box<dyn Initializer> + Send + Sync>;

/// Factory for synchronizers; the failover loop may build the same
/// synchronizer several times over the life of the data system.
pub type SynchronizerBuilder = Arc<dyn Fn() -> Box<dyn Synchronizer> + Send + Sync>;
