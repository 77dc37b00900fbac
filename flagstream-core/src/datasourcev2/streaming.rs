//! Streaming synchronizer for the v2 protocol: a long-lived SSE connection
//! whose events accumulate into change sets, with reconnect backoff and an
//! error classifier that distinguishes transient trouble from terminal
//! failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::RetryDelay;
use crate::config::Config;
use crate::datasource::{
    DataSourceErrorInfo, DataSourceErrorKind, SelectorSource, Synchronizer, Update,
};
use crate::http::{self, ENV_ID_HEADER, FALLBACK_HEADER, http_error_message, is_http_error_recoverable};
use crate::protocol::{ChangeSetBuilder, IntentCode, PayloadEvent, ProtocolError};
use flagstream_model::StoreItem;

pub const STREAMING_ENDPOINT: &str = "/sdk/stream";

/// Up to five minutes may elapse without data on the stream; the comment
/// heartbeats the server sends keep a healthy connection under this.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const BACKOFF_RESET_INTERVAL: Duration = Duration::from_secs(60);
const JITTER_RATIO: f64 = 0.5;

/// Streaming data source. Connects to the SSE endpoint, carrying the
/// store's current selector as `?basis=` so reconnects receive deltas.
pub struct StreamingDataSource {
    config: Config,
    base_uri: String,
    initial_reconnect_delay: Duration,
}

impl StreamingDataSource {
    pub fn new(config: Config) -> Self {
        let base_uri = config.service_endpoints.streaming_base_uri.clone();
        let initial_reconnect_delay = config.initial_reconnect_delay;
        StreamingDataSource { config, base_uri, initial_reconnect_delay }
    }

    pub fn with_base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.base_uri = base_uri.into();
        self
    }

    fn stream_url(&self, selectors: &dyn SelectorSource) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!(
            "{}{}",
            self.base_uri.trim_end_matches('/'),
            STREAMING_ENDPOINT
        ))?;
        if let Some(filter) = &self.config.payload_filter_key {
            url.query_pairs_mut().append_pair("filter", filter);
        }
        if let Some(selector) = selectors.selector() {
            url.query_pairs_mut().append_pair("basis", &selector.state);
        }
        Ok(url)
    }
}

impl Synchronizer for StreamingDataSource {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn sync(self: Box<Self>, selectors: Arc<dyn SelectorSource>) -> BoxStream<'static, Update> {
        Box::pin(stream! {
            let client = match http::stream_client(&self.config, STREAM_READ_TIMEOUT) {
                Ok(client) => client,
                Err(e) => {
                    error!("failed to build streaming HTTP client: {e}");
                    yield Update::off(
                        Some(DataSourceErrorInfo::new(DataSourceErrorKind::Unknown, e.to_string())),
                        None,
                    );
                    return;
                }
            };

            let mut retry = RetryDelay::standard(
                self.initial_reconnect_delay,
                MAX_RETRY_DELAY,
                JITTER_RATIO,
                BACKOFF_RESET_INTERVAL,
            );
            let mut environment_id: Option<String> = None;

            loop {
                let url = match self.stream_url(selectors.as_ref()) {
                    Ok(url) => url,
                    Err(e) => {
                        error!("invalid stream URI: {e}");
                        yield Update::off(
                            Some(DataSourceErrorInfo::new(DataSourceErrorKind::Unknown, e.to_string())),
                            environment_id.clone(),
                        );
                        return;
                    }
                };
                info!("connecting to stream at {url}");

                let response = client
                    .get(url)
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .header(reqwest::header::CACHE_CONTROL, "no-cache")
                    .send()
                    .await;

                match response {
                    Err(e) => {
                        warn!("stream connection failed: {e}, will retry");
                        yield Update::interrupted(
                            DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, e.to_string()),
                            environment_id.clone(),
                        );
                    }
                    Ok(response) => {
                        if let Some(envid) = header_string(&response, ENV_ID_HEADER) {
                            environment_id = Some(envid);
                        }
                        let fallback =
                            header_string(&response, FALLBACK_HEADER).as_deref() == Some("true");
                        let status = response.status().as_u16();

                        if status >= 400 {
                            let message = http_error_message(status, "stream connection");
                            let error_info = DataSourceErrorInfo::http(status, message.clone());
                            if fallback {
                                yield Update::fallback_to_fdv1(
                                    Some(error_info),
                                    environment_id.clone(),
                                );
                                return;
                            }
                            if is_http_error_recoverable(status) {
                                warn!("{message}");
                                yield Update::interrupted(error_info, environment_id.clone());
                            } else {
                                error!("{message}");
                                yield Update::off(Some(error_info), environment_id.clone());
                                return;
                            }
                        } else if fallback {
                            yield Update::fallback_to_fdv1(None, environment_id.clone());
                            return;
                        } else {
                            retry.set_good_since(Instant::now());
                            let mut builder = ChangeSetBuilder::new();
                            let mut events = response.bytes_stream().eventsource();

                            loop {
                                let Some(event) = events.next().await else {
                                    // graceful close: reconnect without an error update
                                    debug!("stream closed by server, reconnecting");
                                    break;
                                };
                                match event {
                                    Ok(event) => {
                                        match process_event(&event.event, &event.data, &mut builder) {
                                            Ok(Some(update)) => {
                                                yield update.with_environment_id(environment_id.clone());
                                            }
                                            Ok(None) => {}
                                            Err(e) => {
                                                warn!(
                                                    "error while handling stream event; will restart stream: {e}"
                                                );
                                                yield Update::interrupted(
                                                    DataSourceErrorInfo::new(
                                                        DataSourceErrorKind::InvalidData,
                                                        e.to_string(),
                                                    ),
                                                    environment_id.clone(),
                                                );
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        warn!("unexpected error on stream connection: {e}, will retry");
                                        yield Update::interrupted(
                                            DataSourceErrorInfo::new(
                                                DataSourceErrorKind::NetworkError,
                                                e.to_string(),
                                            ),
                                            environment_id.clone(),
                                        );
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }

                let delay = retry.next_retry_delay(Instant::now());
                debug!("waiting {delay:?} before reconnecting stream");
                tokio::time::sleep(delay).await;
            }
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Handles one SSE event, mutating the change-set builder and returning an
/// update when one is due. Malformed JSON surfaces as an error so the
/// caller can restart the stream.
fn process_event(
    name: &str,
    data: &str,
    builder: &mut ChangeSetBuilder,
) -> Result<Option<Update>, ProtocolError> {
    match PayloadEvent::parse_str(name, data)? {
        Some(PayloadEvent::ServerIntent(intent)) => {
            let payload = intent.payload()?;
            builder.start(payload.code);
            if payload.code == IntentCode::TransferNone {
                builder.expect_changes();
                return Ok(Some(Update::valid(None, None)));
            }
            Ok(None)
        }
        Some(PayloadEvent::Put(put)) => {
            let item = StoreItem::from_json(put.kind, put.object)?;
            builder.add_put(put.kind, put.key, put.version, item);
            Ok(None)
        }
        Some(PayloadEvent::Delete(delete)) => {
            builder.add_delete(delete.kind, delete.key, delete.version);
            Ok(None)
        }
        Some(PayloadEvent::Goodbye(goodbye)) => {
            if !goodbye.silent {
                error!(
                    "SSE server received error: {:?} (catastrophe: {})",
                    goodbye.reason, goodbye.catastrophe
                );
            }
            Ok(None)
        }
        Some(PayloadEvent::Error(event)) => {
            error!("error on {:?}: {:?}", event.payload_id, event.reason);
            // Discard any partial change set but keep operating under the
            // last server intent; a fresh intent may follow.
            builder.reset();
            Ok(None)
        }
        Some(PayloadEvent::PayloadTransferred(selector)) => {
            let change_set = builder.finish(Some(selector))?;
            Ok(Some(Update::valid(Some(change_set), None)))
        }
        None => {
            if name != crate::protocol::event_names::HEARTBEAT {
                info!("unexpected event found in stream: {name}");
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSourceState;
    use crate::protocol::Selector;

    fn full_transfer_intent() -> String {
        r#"{"payloads": [{"id": "p", "target": 1, "intentCode": "xfer-full"}]}"#.to_owned()
    }

    #[test]
    fn heartbeat_is_ignored() {
        let mut builder = ChangeSetBuilder::new();
        assert!(process_event("heartbeat", "", &mut builder).unwrap().is_none());
    }

    #[test]
    fn full_cycle_emits_valid_update_with_change_set() {
        let mut builder = ChangeSetBuilder::new();
        assert!(
            process_event("server-intent", &full_transfer_intent(), &mut builder)
                .unwrap()
                .is_none()
        );
        assert!(
            process_event(
                "put-object",
                r#"{"kind": "flag", "key": "a", "version": 1, "object": {"key": "a", "version": 1}}"#,
                &mut builder,
            )
            .unwrap()
            .is_none()
        );
        assert!(
            process_event(
                "delete-object",
                r#"{"kind": "segment", "key": "s", "version": 2}"#,
                &mut builder,
            )
            .unwrap()
            .is_none()
        );

        let update = process_event(
            "payload-transferred",
            r#"{"state": "s1", "version": 5}"#,
            &mut builder,
        )
        .unwrap()
        .unwrap();

        assert_eq!(update.state, DataSourceState::Valid);
        let change_set = update.change_set.unwrap();
        assert_eq!(change_set.intent_code, IntentCode::TransferFull);
        assert_eq!(change_set.changes.len(), 2);
        assert_eq!(change_set.selector, Some(Selector::new("s1", 5)));
    }

    #[test]
    fn transfer_none_intent_is_immediately_valid() {
        let mut builder = ChangeSetBuilder::new();
        let update = process_event(
            "server-intent",
            r#"{"payloads": [{"id": "p", "target": 1, "intentCode": "none"}]}"#,
            &mut builder,
        )
        .unwrap()
        .unwrap();
        assert_eq!(update.state, DataSourceState::Valid);
        assert!(update.change_set.is_none());

        // later deltas still work under the implied changes intent
        process_event(
            "put-object",
            r#"{"kind": "flag", "key": "a", "version": 2, "object": {"key": "a", "version": 2}}"#,
            &mut builder,
        )
        .unwrap();
        let update = process_event(
            "payload-transferred",
            r#"{"state": "s2", "version": 6}"#,
            &mut builder,
        )
        .unwrap()
        .unwrap();
        assert_eq!(update.change_set.unwrap().intent_code, IntentCode::TransferChanges);
    }

    #[test]
    fn error_event_discards_partial_change_set() {
        let mut builder = ChangeSetBuilder::new();
        process_event("server-intent", &full_transfer_intent(), &mut builder).unwrap();
        process_event(
            "put-object",
            r#"{"kind": "flag", "key": "a", "version": 1, "object": {"key": "a", "version": 1}}"#,
            &mut builder,
        )
        .unwrap();

        assert!(
            process_event("error", r#"{"payloadId": "p", "reason": "oops"}"#, &mut builder)
                .unwrap()
                .is_none()
        );

        let update = process_event(
            "payload-transferred",
            r#"{"state": "s1", "version": 5}"#,
            &mut builder,
        )
        .unwrap()
        .unwrap();
        assert!(update.change_set.unwrap().changes.is_empty());
    }

    #[test]
    fn error_event_before_intent_is_harmless() {
        let mut builder = ChangeSetBuilder::new();
        assert!(
            process_event("error", r#"{"payloadId": "p", "reason": "oops"}"#, &mut builder)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn goodbye_and_unknown_events_are_ignored() {
        let mut builder = ChangeSetBuilder::new();
        assert!(
            process_event("goodbye", r#"{"reason": "bye", "silent": true}"#, &mut builder)
                .unwrap()
                .is_none()
        );
        assert!(process_event("new-fangled", "{}", &mut builder).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut builder = ChangeSetBuilder::new();
        assert!(process_event("server-intent", "{not json", &mut builder).is_err());
    }

    #[test]
    fn payload_transferred_without_intent_is_an_error() {
        let mut builder = ChangeSetBuilder::new();
        assert!(
            process_event(
                "payload-transferred",
                r#"{"state": "s1", "version": 5}"#,
                &mut builder,
            )
            .is_err()
        );
    }
}
