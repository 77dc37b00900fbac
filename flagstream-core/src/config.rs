use std::time::Duration;

/// Base URIs for the flag delivery services. Only needs overriding for
/// relay proxies or test servers.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub streaming_base_uri: String,
    pub polling_base_uri: String,
}

impl ServiceEndpoints {
    pub const DEFAULT_STREAMING: &'static str = "https://stream.launchdarkly.com";
    pub const DEFAULT_POLLING: &'static str = "https://sdk.launchdarkly.com";

    /// Routes both services through a single relay-proxy base URI.
    pub fn relay_proxy(base_uri: &str) -> Self {
        let base = base_uri.trim_end_matches('/');
        ServiceEndpoints { streaming_base_uri: base.to_owned(), polling_base_uri: base.to_owned() }
    }
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        ServiceEndpoints {
            streaming_base_uri: Self::DEFAULT_STREAMING.to_owned(),
            polling_base_uri: Self::DEFAULT_POLLING.to_owned(),
        }
    }
}

/// HTTP-level options shared by every outbound connection.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Set by wrapper SDKs so the service can attribute traffic.
    pub wrapper_name: Option<String>,
    pub wrapper_version: Option<String>,
    /// Application metadata forwarded as `X-LaunchDarkly-Tags`.
    pub application_id: Option<String>,
    pub application_version: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            wrapper_name: None,
            wrapper_version: None,
            application_id: None,
            application_version: None,
        }
    }
}

/// Top-level configuration consumed by the data systems. The public SDK
/// facade builds one of these; everything here has a sensible default
/// except the SDK key.
#[derive(Debug, Clone)]
pub struct Config {
    pub sdk_key: String,
    pub service_endpoints: ServiceEndpoints,
    pub http: HttpConfig,
    /// Restricts delivered data to one payload filter.
    pub payload_filter_key: Option<String>,
    pub poll_interval: Duration,
    pub initial_reconnect_delay: Duration,
    /// FDv1 mode selection: use streaming (default) or polling.
    pub stream: bool,
    /// Offline mode: no network activity, defaults served for everything.
    pub offline: bool,
    /// Daemon mode: read flags from a persistent store populated by
    /// another process; no connection of our own.
    pub use_ldd: bool,
}

impl Config {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

    pub fn new(sdk_key: impl Into<String>) -> Self {
        Config {
            sdk_key: sdk_key.into(),
            service_endpoints: ServiceEndpoints::default(),
            http: HttpConfig::default(),
            payload_filter_key: None,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            initial_reconnect_delay: Self::DEFAULT_INITIAL_RECONNECT_DELAY,
            stream: true,
            offline: false,
            use_ldd: false,
        }
    }
}

/// Configuration for big segment support.
pub struct BigSegmentsConfig {
    pub store: Option<Box<dyn crate::bigsegments::BigSegmentStore>>,
    /// Max distinct context keys held in the membership cache.
    pub context_cache_size: u64,
    /// How long a cached membership stays usable.
    pub context_cache_time: Duration,
    pub status_poll_interval: Duration,
    /// How old the store's metadata may be before it is considered stale.
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    pub fn new(store: Option<Box<dyn crate::bigsegments::BigSegmentStore>>) -> Self {
        BigSegmentsConfig {
            store,
            context_cache_size: 1000,
            context_cache_time: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

impl std::fmt::Debug for BigSegmentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSegmentsConfig")
            .field("store", &self.store.is_some())
            .field("context_cache_size", &self.context_cache_size)
            .field("context_cache_time", &self.context_cache_time)
            .field("status_poll_interval", &self.status_poll_interval)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}
