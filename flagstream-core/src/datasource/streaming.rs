//! Legacy v1 streaming update processor: consumes the monolithic
//! `put`/`patch`/`delete` event stream and writes directly into the store
//! through the update sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryDelay;
use crate::config::Config;
use crate::datasource::status::DataSourceUpdateSink;
use crate::datasource::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use crate::http::{self, http_error_message, is_http_error_recoverable};
use crate::task::{STOP_GRACE_PERIOD, Signal};
use flagstream_model::{DataKind, FullDataSet, StoreItem};

pub const STREAM_ALL_PATH: &str = "/all";

const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const BACKOFF_RESET_INTERVAL: Duration = Duration::from_secs(60);
const JITTER_RATIO: f64 = 0.5;

/// v1 streaming processor. Runs one background task owning the SSE
/// connection; reconnects with backoff on recoverable failures, turns off
/// permanently on terminal ones.
pub struct StreamingUpdateProcessor {
    config: Config,
    sink: Arc<DataSourceUpdateSink>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingUpdateProcessor {
    pub fn new(config: Config, sink: Arc<DataSourceUpdateSink>) -> Self {
        StreamingUpdateProcessor {
            config,
            sink,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(&self, ready: Signal) {
        let config = self.config.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            run_stream_loop(config, sink, ready, cancel).await;
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        info!("stopping v1 streaming update processor");
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(STOP_GRACE_PERIOD, task).await.is_err()
        {
            warn!("streaming update processor did not stop within grace period");
        }
        self.sink.update_status(DataSourceState::Off, None);
    }
}

impl std::fmt::Debug for StreamingUpdateProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingUpdateProcessor").finish()
    }
}

async fn run_stream_loop(
    config: Config,
    sink: Arc<DataSourceUpdateSink>,
    ready: Signal,
    cancel: CancellationToken,
) {
    let uri = match stream_uri(&config) {
        Ok(uri) => uri,
        Err(e) => {
            error!("invalid stream URI: {e}");
            sink.update_status(
                DataSourceState::Off,
                Some(DataSourceErrorInfo::new(DataSourceErrorKind::Unknown, e.to_string())),
            );
            ready.set();
            return;
        }
    };
    info!("starting v1 streaming update processor connecting to {uri}");

    let client = match http::stream_client(&config, STREAM_READ_TIMEOUT) {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build streaming HTTP client: {e}");
            sink.update_status(
                DataSourceState::Off,
                Some(DataSourceErrorInfo::new(DataSourceErrorKind::Unknown, e.to_string())),
            );
            ready.set();
            return;
        }
    };

    let mut retry = RetryDelay::standard(
        config.initial_reconnect_delay,
        MAX_RETRY_DELAY,
        JITTER_RATIO,
        BACKOFF_RESET_INTERVAL,
    );

    loop {
        let request = client
            .get(uri.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(e) => {
                error!("failed to open stream connection: {e}");
                sink.update_status(
                    DataSourceState::Off,
                    Some(DataSourceErrorInfo::new(DataSourceErrorKind::Unknown, e.to_string())),
                );
                ready.set();
                return;
            }
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                event = source.next() => event,
            };
            let Some(event) = event else {
                source.close();
                if cancel.is_cancelled() {
                    return;
                }
                debug!("stream closed, reconnecting");
                break;
            };
            match event {
                Ok(Event::Open) => {
                    debug!("stream connection opened");
                    retry.set_good_since(Instant::now());
                }
                Ok(Event::Message(message)) => {
                    match process_message(&sink, &message.event, &message.data).await {
                        Ok(true) => {
                            sink.update_status(DataSourceState::Valid, None);
                            if !ready.is_set() {
                                info!("streaming update processor initialized ok");
                                ready.set();
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            info!("error while handling stream event; will restart stream: {e:?}");
                            sink.update_status(DataSourceState::Interrupted, Some(e));
                            break;
                        }
                    }
                }
                Err(e) => {
                    // take over reconnection entirely from the event source
                    source.close();
                    if !handle_stream_error(&sink, &ready, e) {
                        return;
                    }
                    break;
                }
            }
        }

        let delay = retry.next_retry_delay(Instant::now());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Returns true when the processor should reconnect, false when the error
/// is terminal.
fn handle_stream_error(
    sink: &DataSourceUpdateSink,
    ready: &Signal,
    error: reqwest_eventsource::Error,
) -> bool {
    match error {
        reqwest_eventsource::Error::StreamEnded => {
            debug!("stream ended, reconnecting");
            true
        }
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => {
            let status = status.as_u16();
            let message = http_error_message(status, "stream connection");
            let error_info = DataSourceErrorInfo::http(status, message.clone());
            if is_http_error_recoverable(status) {
                warn!("{message}");
                sink.update_status(DataSourceState::Interrupted, Some(error_info));
                true
            } else {
                error!("{message}");
                // if a caller is waiting on initialization, stop the wait
                ready.set();
                sink.update_status(DataSourceState::Off, Some(error_info));
                false
            }
        }
        other => {
            warn!("unexpected error on stream connection: {other}, will retry");
            sink.update_status(
                DataSourceState::Interrupted,
                Some(DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, other.to_string())),
            );
            true
        }
    }
}

/// Handles one v1 stream event; returns whether the store was (re)initialized.
async fn process_message(
    sink: &DataSourceUpdateSink,
    event: &str,
    data: &str,
) -> Result<bool, DataSourceErrorInfo> {
    let invalid =
        |e: String| DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, e);

    match event {
        "put" => {
            let body: Value = serde_json::from_str(data).map_err(|e| invalid(e.to_string()))?;
            let all_data = parse_put_data(&body).map_err(invalid)?;
            debug!(
                "received put event with {} flags and {} segments",
                all_data.get(&DataKind::Flag).map_or(0, HashMap::len),
                all_data.get(&DataKind::Segment).map_or(0, HashMap::len),
            );
            sink.init(all_data).await.map_err(|e| {
                DataSourceErrorInfo::new(DataSourceErrorKind::StoreError, e.to_string())
            })?;
            Ok(true)
        }
        "patch" => {
            let body: Value = serde_json::from_str(data).map_err(|e| invalid(e.to_string()))?;
            let path = body.get("path").and_then(Value::as_str).unwrap_or_default();
            let Some((kind, _key)) = parse_path(path) else {
                warn!("patch for unknown path: {path}");
                return Ok(false);
            };
            let object = body
                .get("data")
                .cloned()
                .ok_or_else(|| invalid("patch event has no data".into()))?;
            let item =
                StoreItem::from_json(kind, object).map_err(|e| invalid(e.to_string()))?;
            debug!("received patch event for {path}, new version [{}]", item.version());
            sink.upsert(kind, item).await.map_err(|e| {
                DataSourceErrorInfo::new(DataSourceErrorKind::StoreError, e.to_string())
            })?;
            Ok(false)
        }
        "delete" => {
            let body: Value = serde_json::from_str(data).map_err(|e| invalid(e.to_string()))?;
            let path = body.get("path").and_then(Value::as_str).unwrap_or_default();
            let version = body
                .get("version")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid("delete event has no version".into()))?;
            let Some((kind, key)) = parse_path(path) else {
                warn!("delete for unknown path: {path}");
                return Ok(false);
            };
            debug!("received delete event for {path}, new version [{version}]");
            sink.delete(kind, key, version).await.map_err(|e| {
                DataSourceErrorInfo::new(DataSourceErrorKind::StoreError, e.to_string())
            })?;
            Ok(false)
        }
        other => {
            warn!("unhandled event in stream processor: {other}");
            Ok(false)
        }
    }
}

/// Parses the v1 data set shape `{"data": {"flags": {...}, "segments": {...}}}`.
fn parse_put_data(body: &Value) -> Result<FullDataSet, String> {
    let data = body.get("data").ok_or("put event has no data")?;
    let mut all_data = FullDataSet::new();
    for (kind, json_key) in [(DataKind::Flag, "flags"), (DataKind::Segment, "segments")] {
        let mut items = HashMap::new();
        if let Some(object) = data.get(json_key).and_then(Value::as_object) {
            for (key, value) in object {
                let item = StoreItem::from_json(kind, value.clone())
                    .map_err(|e| format!("bad item {key}: {e}"))?;
                items.insert(key.clone(), item);
            }
        }
        all_data.insert(kind, items);
    }
    Ok(all_data)
}

/// Resolves a v1 event path like `/flags/my-flag` to a kind and key by
/// explicit prefix match; anything else is rejected rather than sliced.
fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    for kind in DataKind::ALL {
        if let Some(key) = path.strip_prefix(kind.stream_api_path())
            && !key.is_empty()
        {
            return Some((kind, key));
        }
    }
    None
}

fn stream_uri(config: &Config) -> Result<url::Url, url::ParseError> {
    let mut url = url::Url::parse(&format!(
        "{}{}",
        config.service_endpoints.streaming_base_uri.trim_end_matches('/'),
        STREAM_ALL_PATH
    ))?;
    if let Some(filter) = &config.payload_filter_key {
        url.query_pairs_mut().append_pair("filter", filter);
    }
    Ok(url)
}
