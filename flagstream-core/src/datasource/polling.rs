//! Legacy v1 polling update processor: periodically fetches the complete
//! flag/segment data set and reinitializes the store with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::datasource::status::DataSourceUpdateSink;
use crate::datasource::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use crate::datasourcev2::polling::PollingError;
use crate::http::{self, http_error_message, is_http_error_recoverable};
use crate::task::{STOP_GRACE_PERIOD, Signal};
use flagstream_model::{DataKind, FullDataSet, StoreItem};

pub const LATEST_ALL_PATH: &str = "/sdk/latest-all";

struct CacheEntry {
    data: FullDataSet,
    etag: String,
}

/// Fetches the complete v1 data set, with ETag-based conditional requests;
/// a 304 serves the previously parsed data back out of the cache.
pub struct FeatureRequester {
    client: reqwest::Client,
    poll_uri: Url,
    cache: Mutex<Option<CacheEntry>>,
}

impl FeatureRequester {
    pub fn new(config: &Config) -> Result<Self, PollingError> {
        let client = http::http_client(config).map_err(|e| PollingError::Network(e.to_string()))?;
        let mut poll_uri = Url::parse(&format!(
            "{}{}",
            config.service_endpoints.polling_base_uri.trim_end_matches('/'),
            LATEST_ALL_PATH
        ))
        .map_err(|e| PollingError::Network(e.to_string()))?;
        if let Some(filter) = &config.payload_filter_key {
            poll_uri.query_pairs_mut().append_pair("filter", filter);
        }
        Ok(FeatureRequester { client, poll_uri, cache: Mutex::new(None) })
    }

    pub async fn get_all_data(&self) -> Result<FullDataSet, PollingError> {
        let mut request = self
            .client
            .get(self.poll_uri.clone())
            .header(reqwest::header::ACCEPT_ENCODING, "gzip");
        if let Some(entry) = self.cache.lock().as_ref() {
            request = request.header(reqwest::header::IF_NONE_MATCH, entry.etag.clone());
        }

        let response =
            request.send().await.map_err(|e| PollingError::Network(e.to_string()))?;
        let status = response.status();

        if status.as_u16() >= 400 {
            return Err(PollingError::Http {
                status: status.as_u16(),
                message: format!("HTTP error {status}"),
                fallback: false,
                environment_id: None,
            });
        }

        if status == reqwest::StatusCode::NOT_MODIFIED {
            if let Some(entry) = self.cache.lock().as_ref() {
                debug!("{} response status:[304], using cached data", self.poll_uri);
                return Ok(entry.data.clone());
            }
            return Err(PollingError::InvalidData("304 with no cached data".into()));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        debug!("{} response status:[{}] ETag:[{:?}]", self.poll_uri, status, etag);

        let body: Value =
            response.json().await.map_err(|e| PollingError::InvalidData(e.to_string()))?;
        let data = parse_all_data(&body)?;

        if let Some(etag) = etag {
            *self.cache.lock() = Some(CacheEntry { data: data.clone(), etag });
        }
        Ok(data)
    }
}

impl std::fmt::Debug for FeatureRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRequester").field("poll_uri", &self.poll_uri.as_str()).finish()
    }
}

fn parse_all_data(body: &Value) -> Result<FullDataSet, PollingError> {
    let mut all_data = FullDataSet::new();
    for (kind, json_key) in [(DataKind::Flag, "flags"), (DataKind::Segment, "segments")] {
        let mut items = HashMap::new();
        if let Some(object) = body.get(json_key).and_then(Value::as_object) {
            for (key, value) in object {
                let item = StoreItem::from_json(kind, value.clone())
                    .map_err(|e| PollingError::InvalidData(format!("bad item {key}: {e}")))?;
                items.insert(key.clone(), item);
            }
        }
        all_data.insert(kind, items);
    }
    Ok(all_data)
}

/// v1 polling processor: one background task alternating fetch and sleep.
pub struct PollingUpdateProcessor {
    poll_interval: Duration,
    requester: Arc<FeatureRequester>,
    sink: Arc<DataSourceUpdateSink>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingUpdateProcessor {
    pub fn new(
        poll_interval: Duration,
        requester: Arc<FeatureRequester>,
        sink: Arc<DataSourceUpdateSink>,
    ) -> Self {
        PollingUpdateProcessor {
            poll_interval,
            requester,
            sink,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(&self, ready: Signal) {
        info!("starting v1 polling update processor");
        let poll_interval = self.poll_interval;
        let requester = Arc::clone(&self.requester);
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                if !poll_once(&requester, &sink, &ready).await {
                    ready.set();
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        info!("stopping v1 polling update processor");
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(STOP_GRACE_PERIOD, task).await.is_err()
        {
            warn!("polling update processor did not stop within grace period");
        }
        self.sink.update_status(DataSourceState::Off, None);
    }
}

impl std::fmt::Debug for PollingUpdateProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingUpdateProcessor")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Returns false when polling must stop permanently.
async fn poll_once(
    requester: &FeatureRequester,
    sink: &DataSourceUpdateSink,
    ready: &Signal,
) -> bool {
    match requester.get_all_data().await {
        Ok(all_data) => {
            if let Err(e) = sink.init(all_data).await {
                // the sink has already recorded the store error status
                error!("failed to store polled data: {e}");
                return true;
            }
            sink.update_status(DataSourceState::Valid, None);
            if !ready.is_set() {
                info!("polling update processor initialized ok");
                ready.set();
            }
            true
        }
        Err(PollingError::Http { status, .. }) => {
            let message = http_error_message(status, "polling request");
            let error_info = DataSourceErrorInfo::http(status, message.clone());
            if is_http_error_recoverable(status) {
                warn!("{message}");
                sink.update_status(DataSourceState::Interrupted, Some(error_info));
                true
            } else {
                error!("{message}");
                sink.update_status(DataSourceState::Off, Some(error_info));
                false
            }
        }
        Err(PollingError::Network(message)) => {
            warn!("polling request failed: {message}, will retry");
            sink.update_status(
                DataSourceState::Interrupted,
                Some(DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, message)),
            );
            true
        }
        Err(PollingError::InvalidData(message)) => {
            warn!("polling response invalid: {message}, will retry");
            sink.update_status(
                DataSourceState::Interrupted,
                Some(DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, message)),
            );
            true
        }
    }
}
