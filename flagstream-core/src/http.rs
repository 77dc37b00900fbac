use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::{Config, HttpConfig};

/// Response header carrying the environment id for the authenticated key.
pub const ENV_ID_HEADER: &str = "x-ld-envid";

/// Response header instructing the client to downgrade to the v1 protocol.
/// The value must be exactly `"true"`.
pub const FALLBACK_HEADER: &str = "x-ld-fd-fallback";

const USER_AGENT: &str = concat!("FlagstreamClient/", env!("CARGO_PKG_VERSION"));

/// Whether an HTTP error status is worth retrying. Client errors other
/// than 400/408/429 mean the request itself is bad (unauthorized, unknown
/// resource) and will not get better; everything else is transient.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

/// Log/status message for an HTTP error, in the standard form used by all
/// data sources.
pub fn http_error_message(status: u16, context: &str) -> String {
    let explanation = if status == 401 || status == 403 {
        " (invalid SDK key)"
    } else {
        ""
    };
    let outcome = if is_http_error_recoverable(status) {
        "will retry"
    } else {
        "giving up permanently"
    };
    format!("HTTP error {status}{explanation} for {context} - {outcome}")
}

/// Headers sent on every request to the flag delivery services.
pub fn base_headers(config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&config.sdk_key) {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

    if let Some(wrapper) = wrapper_header_value(&config.http)
        && let Ok(value) = HeaderValue::from_str(&wrapper)
    {
        headers.insert("X-LaunchDarkly-Wrapper", value);
    }
    if let Some(tags) = tags_header_value(&config.http)
        && let Ok(value) = HeaderValue::from_str(&tags)
    {
        headers.insert("X-LaunchDarkly-Tags", value);
    }
    headers
}

fn wrapper_header_value(http: &HttpConfig) -> Option<String> {
    let name = http.wrapper_name.as_ref()?;
    match &http.wrapper_version {
        Some(version) => Some(format!("{name}/{version}")),
        None => Some(name.clone()),
    }
}

fn tags_header_value(http: &HttpConfig) -> Option<String> {
    let mut tags = Vec::new();
    if let Some(id) = &http.application_id {
        tags.push(format!("application-id/{id}"));
    }
    if let Some(version) = &http.application_version {
        tags.push(format!("application-version/{version}"));
    }
    if tags.is_empty() { None } else { Some(tags.join(" ")) }
}

/// Builds the shared HTTP client used by polling requesters.
pub fn http_client(config: &Config) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .default_headers(base_headers(config))
        .connect_timeout(config.http.connect_timeout)
        .read_timeout(config.http.read_timeout)
        .build()
}

/// Builds the client used for streaming connections, whose read timeout is
/// long enough to ride out heartbeat gaps.
pub fn stream_client(config: &Config, read_timeout: std::time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .default_headers(base_headers(config))
        .connect_timeout(config.http.connect_timeout)
        .read_timeout(read_timeout)
        .build()
}
