//! Polling data source for the v2 protocol, usable both as a one-shot
//! initializer and as a synchronizer. Also provides the v1-compatibility
//! requester used when the service asks clients to downgrade.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::datasource::{
    Basis, DataSourceErrorInfo, DataSourceErrorKind, Initializer, SelectorSource, Synchronizer,
    Update,
};
use crate::http::{self, ENV_ID_HEADER, FALLBACK_HEADER, http_error_message, is_http_error_recoverable};
use crate::protocol::{ChangeSet, ChangeSetBuilder, IntentCode, PayloadEvent, Selector};
use flagstream_model::StoreItem;

pub const FDV2_POLLING_ENDPOINT: &str = "/sdk/poll";
pub const FDV1_POLLING_ENDPOINT: &str = "/sdk/latest-all";

/// A successful polling fetch: the parsed change set plus the metadata
/// headers that rode along with it.
#[derive(Debug, Clone)]
pub struct PollingResponse {
    pub change_set: ChangeSet,
    pub environment_id: Option<String>,
    pub fallback: bool,
}

#[derive(Error, Debug)]
pub enum PollingError {
    #[error("{message}")]
    Http {
        status: u16,
        message: String,
        fallback: bool,
        environment_id: Option<String>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid payload: {0}")]
    InvalidData(String),
}

/// Fetches one polling payload. The production implementation talks HTTP;
/// tests substitute a canned one.
#[async_trait]
pub trait PollingRequester: Send + Sync {
    async fn fetch(&self, selector: Option<Selector>) -> Result<PollingResponse, PollingError>;
}

/// Data source that periodically GETs the polling endpoint. As an
/// [`Initializer`] it performs exactly one fetch and never retries; as a
/// [`Synchronizer`] it loops until an unrecoverable error or cancellation.
pub struct PollingDataSource {
    poll_interval: Duration,
    requester: Arc<dyn PollingRequester>,
}

impl PollingDataSource {
    pub fn new(poll_interval: Duration, requester: Arc<dyn PollingRequester>) -> Self {
        PollingDataSource { poll_interval, requester }
    }
}

#[async_trait]
impl Initializer for PollingDataSource {
    fn name(&self) -> &'static str {
        "polling-initializer"
    }

    async fn fetch(&mut self) -> Result<Basis, DataSourceErrorInfo> {
        match self.requester.fetch(None).await {
            Ok(response) => {
                let persist = response.change_set.selector.is_some();
                Ok(Basis {
                    change_set: response.change_set,
                    persist,
                    environment_id: response.environment_id,
                })
            }
            Err(PollingError::Http { status, .. }) => {
                let message = http_error_message(status, "polling request");
                warn!("{message}");
                Err(DataSourceErrorInfo::http(status, message))
            }
            Err(PollingError::Network(message)) => {
                Err(DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, message))
            }
            Err(PollingError::InvalidData(message)) => {
                Err(DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, message))
            }
        }
    }
}

impl Synchronizer for PollingDataSource {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn sync(self: Box<Self>, selectors: Arc<dyn SelectorSource>) -> BoxStream<'static, Update> {
        let requester = Arc::clone(&self.requester);
        let poll_interval = self.poll_interval;
        Box::pin(stream! {
            info!("starting polling synchronizer");
            loop {
                match requester.fetch(selectors.selector()).await {
                    Ok(response) => {
                        if response.fallback {
                            yield Update::fallback_to_fdv1(None, response.environment_id);
                            break;
                        }
                        yield Update::valid(Some(response.change_set), response.environment_id);
                    }
                    Err(PollingError::Http { status, fallback, environment_id, .. }) => {
                        let message = http_error_message(status, "polling request");
                        let error_info = DataSourceErrorInfo::http(status, message.clone());

                        if fallback {
                            yield Update::fallback_to_fdv1(Some(error_info), environment_id);
                            break;
                        }
                        if is_http_error_recoverable(status) {
                            warn!("{message}");
                            yield Update::interrupted(error_info, environment_id);
                        } else {
                            tracing::error!("{message}");
                            yield Update::off(Some(error_info), environment_id);
                            break;
                        }
                    }
                    Err(PollingError::Network(message)) => {
                        warn!("polling request failed: {message}, will retry");
                        yield Update::interrupted(
                            DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, message),
                            None,
                        );
                    }
                    Err(PollingError::InvalidData(message)) => {
                        warn!("polling payload invalid: {message}, will retry");
                        yield Update::interrupted(
                            DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, message),
                            None,
                        );
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
            info!("polling synchronizer stopped");
        })
    }
}

/// Shared HTTP mechanics for the v2 and v1 requesters: conditional GETs
/// with an ETag cache, gzip, and metadata header extraction.
struct HttpRequester {
    client: reqwest::Client,
    poll_uri: String,
    payload_filter_key: Option<String>,
    etag: Mutex<Option<String>>,
}

impl HttpRequester {
    fn new(config: &Config, base_uri: &str, endpoint: &str) -> Result<Self, PollingError> {
        let client = http::http_client(config)
            .map_err(|e| PollingError::Network(e.to_string()))?;
        Ok(HttpRequester {
            client,
            poll_uri: format!("{}{}", base_uri.trim_end_matches('/'), endpoint),
            payload_filter_key: config.payload_filter_key.clone(),
            etag: Mutex::new(None),
        })
    }

    /// Returns the body and response metadata, or `Ok(None)` body on a 304.
    async fn request(
        &self,
        selector: Option<Selector>,
        with_selector_param: bool,
    ) -> Result<(Option<Value>, Option<String>, bool), PollingError> {
        let mut url = Url::parse(&self.poll_uri)
            .map_err(|e| PollingError::Network(e.to_string()))?;
        if let Some(filter) = &self.payload_filter_key {
            url.query_pairs_mut().append_pair("filter", filter);
        }
        if with_selector_param && let Some(selector) = &selector {
            url.query_pairs_mut().append_pair("selector", &selector.state);
        }

        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT_ENCODING, "gzip");
        if let Some(etag) = self.etag.lock().clone() {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PollingError::Network(e.to_string()))?;

        let status = response.status();
        let environment_id = header_string(&response, ENV_ID_HEADER);
        let fallback = header_string(&response, FALLBACK_HEADER).as_deref() == Some("true");

        if status.as_u16() >= 400 {
            return Err(PollingError::Http {
                status: status.as_u16(),
                message: format!("HTTP error {status}"),
                fallback,
                environment_id,
            });
        }

        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok((None, environment_id, fallback));
        }

        let etag = header_string(&response, "etag");
        debug!("{} response status:[{}] ETag:[{:?}]", url, status, etag);
        if let Some(etag) = etag {
            *self.etag.lock() = Some(etag);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PollingError::InvalidData(e.to_string()))?;
        Ok((Some(body), environment_id, fallback))
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Requester for the v2 polling endpoint.
pub struct ReqwestPollingRequester {
    inner: HttpRequester,
}

impl ReqwestPollingRequester {
    pub fn new(config: &Config, base_uri: &str) -> Result<Self, PollingError> {
        Ok(ReqwestPollingRequester {
            inner: HttpRequester::new(config, base_uri, FDV2_POLLING_ENDPOINT)?,
        })
    }
}

#[async_trait]
impl PollingRequester for ReqwestPollingRequester {
    async fn fetch(&self, selector: Option<Selector>) -> Result<PollingResponse, PollingError> {
        let (body, environment_id, fallback) = self.inner.request(selector, true).await?;
        let change_set = match body {
            None => ChangeSet::no_changes(),
            Some(body) => polling_payload_to_change_set(&body)?,
        };
        Ok(PollingResponse { change_set, environment_id, fallback })
    }
}

/// Requester for the v1 polling endpoint, used as the automatic downgrade
/// path. The monolithic `{flags, segments}` body becomes one full-transfer
/// change set with no selector.
pub struct ReqwestFdv1PollingRequester {
    inner: HttpRequester,
}

impl ReqwestFdv1PollingRequester {
    pub fn new(config: &Config, base_uri: &str) -> Result<Self, PollingError> {
        Ok(ReqwestFdv1PollingRequester {
            inner: HttpRequester::new(config, base_uri, FDV1_POLLING_ENDPOINT)?,
        })
    }
}

#[async_trait]
impl PollingRequester for ReqwestFdv1PollingRequester {
    async fn fetch(&self, _selector: Option<Selector>) -> Result<PollingResponse, PollingError> {
        let (body, environment_id, fallback) = self.inner.request(None, false).await?;
        let change_set = match body {
            None => ChangeSet::no_changes(),
            Some(body) => fdv1_polling_payload_to_change_set(&body)?,
        };
        Ok(PollingResponse { change_set, environment_id, fallback })
    }
}

/// Converts a v2 polling payload (`{"events": [...]}`) into a change set.
pub fn polling_payload_to_change_set(data: &Value) -> Result<ChangeSet, PollingError> {
    let events = data
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| PollingError::InvalidData("'events' key is missing or not a list".into()))?;

    let mut builder = ChangeSetBuilder::new();
    for event in events {
        let Some(name) = event.get("event").and_then(Value::as_str) else {
            continue;
        };
        let data = event.get("data").cloned().unwrap_or(Value::Null);
        let parsed = PayloadEvent::parse(name, data)
            .map_err(|e| PollingError::InvalidData(e.to_string()))?;
        match parsed {
            Some(PayloadEvent::ServerIntent(intent)) => {
                let payload = intent
                    .payload()
                    .map_err(|e| PollingError::InvalidData(e.to_string()))?;
                if payload.code == IntentCode::TransferNone {
                    return Ok(ChangeSet::no_changes());
                }
                builder.start(payload.code);
            }
            Some(PayloadEvent::Put(put)) => {
                let item = StoreItem::from_json(put.kind, put.object)
                    .map_err(|e| PollingError::InvalidData(e.to_string()))?;
                builder.add_put(put.kind, put.key, put.version, item);
            }
            Some(PayloadEvent::Delete(delete)) => {
                builder.add_delete(delete.kind, delete.key, delete.version);
            }
            Some(PayloadEvent::PayloadTransferred(selector)) => {
                return builder
                    .finish(Some(selector))
                    .map_err(|e| PollingError::InvalidData(e.to_string()));
            }
            Some(PayloadEvent::Goodbye(_)) | Some(PayloadEvent::Error(_)) | None => {}
        }
    }

    Err(PollingError::InvalidData(
        "didn't receive any known protocol events in polling payload".into(),
    ))
}

/// Converts a v1 polling body (`{"flags": {...}, "segments": {...}}`) into
/// a full-transfer change set with no selector.
pub fn fdv1_polling_payload_to_change_set(data: &Value) -> Result<ChangeSet, PollingError> {
    use flagstream_model::DataKind;

    let mut builder = ChangeSetBuilder::new();
    builder.start(IntentCode::TransferFull);

    for (kind, json_key) in [(DataKind::Flag, "flags"), (DataKind::Segment, "segments")] {
        let Some(kind_data) = data.get(json_key) else {
            continue;
        };
        let items = kind_data.as_object().ok_or_else(|| {
            PollingError::InvalidData(format!("invalid format: {json_key} is not an object"))
        })?;
        for (key, value) in items {
            let version = value.get("version").and_then(Value::as_u64).ok_or_else(|| {
                PollingError::InvalidData(format!("invalid format: {key} does not have a version set"))
            })?;
            let item = StoreItem::from_json(kind, value.clone())
                .map_err(|e| PollingError::InvalidData(format!("invalid item {key}: {e}")))?;
            builder.add_put(kind, key, version, item);
        }
    }

    builder.finish(None).map_err(|e| PollingError::InvalidData(e.to_string()))
}
