//! Client configuration
//!
//! `ClientConfig` carries every tunable the connection core honors:
//! seed brokers, timeouts, the response size ceiling, produce acks, SASL
//! mechanisms, per-key version pins, hooks, and an optional dial override.

pub mod defaults;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::hooks::Hook;
use crate::sasl::Mechanism;

use defaults::{
    DEFAULT_CLIENT_ID, DEFAULT_CONN_IDLE_TIMEOUT, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_MAX_BROKER_READ_BYTES, DEFAULT_PRODUCE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT_OVERHEAD,
    DEFAULT_SOFTWARE_NAME, DEFAULT_SOFTWARE_VERSION,
};

/// Custom dial function: address in, connected TCP stream out.
pub type DialFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>> + Send + Sync,
>;

/// Produce request acknowledgement level.
///
/// `None` switches produce connections to fire-and-forget: the caller's
/// promise is fulfilled as soon as the write completes, and a discard
/// worker drains anything a nonconforming broker replies with anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acks {
    /// acks=0, fire-and-forget
    None,
    /// acks=1, leader acknowledgement
    Leader,
    /// acks=-1, full ISR acknowledgement
    #[default]
    All,
}

impl Acks {
    /// Wire value written into produce requests
    pub fn to_i16(self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

/// Per-api-key version bounds.
///
/// Used as `max_versions` (keys absent from the pin set are rejected with
/// `UnknownRequestKey`; present keys cap the negotiated version) or as
/// `min_versions` (present keys put a floor under the negotiated version,
/// failing with `BrokerTooOld` when the broker cannot reach it).
#[derive(Debug, Clone, Default)]
pub struct VersionPins {
    pins: HashMap<i16, i16>,
}

impl VersionPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `key` to `version`
    pub fn pin(mut self, key: i16, version: i16) -> Self {
        self.pins.insert(key, version);
        self
    }

    /// Whether this pin set mentions `key` at all
    pub fn has_key(&self, key: i16) -> bool {
        self.pins.contains_key(&key)
    }

    /// The pinned version for `key`, if any
    pub fn lookup(&self, key: i16) -> Option<i16> {
        self.pins.get(&key).copied()
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    /// Bootstrap broker addresses (`host:port`)
    pub seed_brokers: Vec<String>,

    /// Client id sent in every request header; `None` omits it
    pub client_id: Option<String>,

    /// Software name reported in ApiVersionsRequest v3+
    pub software_name: String,

    /// Software version reported in ApiVersionsRequest v3+
    pub software_version: String,

    /// Time allowed for a dial to complete
    pub dial_timeout: Duration,

    /// Write deadline for every request, and the slack granted on top of
    /// a request's own timeout when waiting for its response
    pub request_timeout_overhead: Duration,

    /// Timeout written into produce requests
    pub produce_timeout: Duration,

    /// Idle threshold for the connection reaper
    pub conn_idle_timeout: Duration,

    /// Ceiling on a single response frame; larger prefixes produce a
    /// descriptive error (with HTTP/TLS hints where they apply)
    pub max_broker_read_bytes: i32,

    /// Acks written into produce requests
    pub acks: Acks,

    /// SASL mechanisms in preference order; the first one acceptable to
    /// the broker wins
    pub sasls: Vec<Arc<dyn Mechanism>>,

    /// Per-key version ceilings; also acts as an allow-list of keys
    pub max_versions: Option<VersionPins>,

    /// Per-key version floors
    pub min_versions: Option<VersionPins>,

    /// Observability hooks
    pub hooks: Vec<Arc<dyn Hook>>,

    /// Custom dial function; defaults to a plain TCP connect
    pub dial_fn: Option<DialFn>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seed_brokers: Vec::new(),
            client_id: Some(DEFAULT_CLIENT_ID.to_string()),
            software_name: DEFAULT_SOFTWARE_NAME.to_string(),
            software_version: DEFAULT_SOFTWARE_VERSION.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout_overhead: DEFAULT_REQUEST_TIMEOUT_OVERHEAD,
            produce_timeout: DEFAULT_PRODUCE_TIMEOUT,
            conn_idle_timeout: DEFAULT_CONN_IDLE_TIMEOUT,
            max_broker_read_bytes: DEFAULT_MAX_BROKER_READ_BYTES,
            acks: Acks::default(),
            sasls: Vec::new(),
            max_versions: None,
            min_versions: None,
            hooks: Vec::new(),
            dial_fn: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("seed_brokers", &self.seed_brokers)
            .field("client_id", &self.client_id)
            .field("software_name", &self.software_name)
            .field("software_version", &self.software_version)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout_overhead", &self.request_timeout_overhead)
            .field("produce_timeout", &self.produce_timeout)
            .field("conn_idle_timeout", &self.conn_idle_timeout)
            .field("max_broker_read_bytes", &self.max_broker_read_bytes)
            .field("acks", &self.acks)
            .field("sasls", &self.sasls.len())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Create a configuration with the given seed brokers
    pub fn new<S: Into<String>>(seed_brokers: impl IntoIterator<Item = S>) -> Self {
        Self {
            seed_brokers: seed_brokers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the client id sent in request headers
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the software name/version reported to brokers
    pub fn with_software(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.software_name = name.into();
        self.software_version = version.into();
        self
    }

    /// Set the produce acknowledgement level
    pub fn with_acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }

    /// Set the SASL mechanism preference list
    pub fn with_sasls(mut self, sasls: Vec<Arc<dyn Mechanism>>) -> Self {
        self.sasls = sasls;
        self
    }

    /// Set the idle threshold for the connection reaper
    pub fn with_conn_idle_timeout(mut self, timeout: Duration) -> Self {
        self.conn_idle_timeout = timeout;
        self
    }

    /// Set the response frame size ceiling
    pub fn with_max_broker_read_bytes(mut self, max: i32) -> Self {
        self.max_broker_read_bytes = max;
        self
    }

    /// Set per-key version ceilings (also an allow-list of keys)
    pub fn with_max_versions(mut self, pins: VersionPins) -> Self {
        self.max_versions = Some(pins);
        self
    }

    /// Set per-key version floors
    pub fn with_min_versions(mut self, pins: VersionPins) -> Self {
        self.min_versions = Some(pins);
        self
    }

    /// Add an observability hook
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Override how sockets are dialed
    pub fn with_dial_fn(mut self, dial: DialFn) -> Self {
        self.dial_fn = Some(dial);
        self
    }

    /// Set the timeouts that derive per-request deadlines
    pub fn with_timeouts(
        mut self,
        request_timeout_overhead: Duration,
        produce_timeout: Duration,
    ) -> Self {
        self.request_timeout_overhead = request_timeout_overhead;
        self.produce_timeout = produce_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client_id.as_deref(), Some("kaflink"));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.conn_idle_timeout, Duration::from_secs(20));
        assert_eq!(config.max_broker_read_bytes, 100 * 1024 * 1024);
        assert_eq!(config.acks, Acks::All);
        assert!(config.sasls.is_empty());
    }

    #[test]
    fn acks_wire_values() {
        assert_eq!(Acks::None.to_i16(), 0);
        assert_eq!(Acks::Leader.to_i16(), 1);
        assert_eq!(Acks::All.to_i16(), -1);
    }

    #[test]
    fn version_pins_lookup() {
        let pins = VersionPins::new().pin(0, 7).pin(18, 2);
        assert!(pins.has_key(0));
        assert!(!pins.has_key(1));
        assert_eq!(pins.lookup(18), Some(2));
        assert_eq!(pins.lookup(3), None);
    }

    #[test]
    fn builder_chain() {
        let config = ClientConfig::new(["localhost:9092"])
            .with_acks(Acks::None)
            .with_max_broker_read_bytes(1 << 20)
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(config.seed_brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(config.acks, Acks::None);
        assert_eq!(config.max_broker_read_bytes, 1 << 20);
        assert_eq!(config.produce_timeout, Duration::from_secs(30));
    }
}
