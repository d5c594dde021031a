//! [Client](crate::Client) configuration.
//!
//! Settings are immutable once a client is built. They can be assembled with
//! [`ClientBuilder`](crate::ClientBuilder) or loaded from JSON:
//!
//! ```
//! use blockquery_client::ClientSettings;
//!
//! let settings = ClientSettings::from_json(
//!     r#"{ "endpoint": "tcp://127.0.0.1:9091", "query_expire_time_ms": 5000 }"#,
//! )
//! .unwrap();
//! assert_eq!(settings.endpoint().port(), 9091);
//! ```
//!
//! Durations are expressed in milliseconds. A `null` `query_expire_time_ms`
//! disables query expiry entirely.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backpressure;
use crate::error::{QueryError, Result};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Default time a query may wait for its reply.
pub const DEFAULT_QUERY_EXPIRE_TIME: Duration = Duration::from_secs(30);

/// Default cadence of the timeout sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Default capacity of the writer's frame channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default capacity of the inbound event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default size of a single socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Server address, `tcp://host:port` or bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for dialing.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => {
                return Err(QueryError::InvalidEndpoint(format!(
                    "unsupported scheme '{scheme}' in {s}"
                )))
            }
            None => s,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| QueryError::InvalidEndpoint(format!("missing port in {s}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(QueryError::InvalidEndpoint(format!("missing host in {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| QueryError::InvalidEndpoint(format!("bad port in {s}: {e}")))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.authority())
    }
}

/// Configuration for Socks5
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socks5Config {
    /// The address of the socks5 service
    pub addr: String,
    /// Optional credential for the service
    #[serde(default)]
    pub credentials: Option<Socks5Credential>,
}

/// Credential for the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socks5Credential {
    pub username: String,
    pub password: String,
}

impl Socks5Config {
    /// Socks5Config constructor without credentials
    pub fn new(addr: impl ToString) -> Self {
        let addr = addr.to_string().replacen("socks5://", "", 1);
        Socks5Config {
            addr,
            credentials: None,
        }
    }

    /// Socks5Config constructor if we have credentials
    pub fn with_credentials(addr: impl ToString, username: String, password: String) -> Self {
        let mut config = Socks5Config::new(addr);
        config.credentials = Some(Socks5Credential { username, password });
        config
    }
}

/// Tuning for one transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum queued frames before senders are suspended.
    pub max_pending_frames: usize,
    /// Writer channel capacity.
    pub channel_capacity: usize,
    /// How long a suspended sender waits before failing.
    #[serde(rename = "backpressure_timeout_ms", with = "millis")]
    pub backpressure_timeout: Duration,
    /// Inbound event channel capacity.
    pub event_capacity: usize,
    /// Largest payload sent to or accepted from the server.
    pub max_payload_size: u32,
    /// Size of a single socket read.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: backpressure::DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: backpressure::DEFAULT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    endpoint: Endpoint,
    /// `None` waits forever.
    #[serde(
        rename = "query_expire_time_ms",
        default = "default_query_expire_time",
        with = "millis_opt"
    )]
    query_expire_time: Option<Duration>,
    #[serde(default)]
    socks5: Option<Socks5Config>,
    #[serde(rename = "connect_timeout_ms", default, with = "millis_opt")]
    connect_timeout: Option<Duration>,
    #[serde(
        rename = "sweep_interval_ms",
        default = "default_sweep_interval",
        with = "millis"
    )]
    sweep_interval: Duration,
    #[serde(default)]
    transport: TransportConfig,
}

fn default_query_expire_time() -> Option<Duration> {
    Some(DEFAULT_QUERY_EXPIRE_TIME)
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

impl ClientSettings {
    /// Settings for `endpoint` with every other option at its default.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            query_expire_time: default_query_expire_time(),
            socks5: None,
            connect_timeout: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            transport: TransportConfig::default(),
        }
    }

    /// Parse settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(QueryError::Protocol(
                "sweep interval must be non-zero".to_string(),
            ));
        }
        if self.transport.max_pending_frames == 0 || self.transport.channel_capacity == 0 {
            return Err(QueryError::Protocol(
                "writer queue bounds must be non-zero".to_string(),
            ));
        }
        if self.transport.event_capacity == 0 || self.transport.read_buffer_size == 0 {
            return Err(QueryError::Protocol(
                "reader buffers must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Time a query may wait for its reply; `None` means forever.
    pub fn query_expire_time(&self) -> Option<Duration> {
        self.query_expire_time
    }

    pub fn socks5(&self) -> Option<&Socks5Config> {
        self.socks5.as_ref()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub(crate) fn set_query_expire_time(&mut self, expire: Option<Duration>) {
        self.query_expire_time = expire;
    }

    pub(crate) fn set_socks5(&mut self, socks5: Option<Socks5Config>) {
        self.socks5 = socks5;
    }

    pub(crate) fn set_connect_timeout(&mut self, timeout: Option<Duration>) {
        self.connect_timeout = timeout;
    }

    pub(crate) fn set_sweep_interval(&mut self, interval: Duration) {
        self.sweep_interval = interval;
    }

    pub(crate) fn transport_mut(&mut self) -> &mut TransportConfig {
        &mut self.transport
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        let ep: Endpoint = "tcp://gateway.example.net:9091".parse().unwrap();
        assert_eq!(ep.host(), "gateway.example.net");
        assert_eq!(ep.port(), 9091);
        assert_eq!(ep.authority(), "gateway.example.net:9091");

        let bare: Endpoint = "127.0.0.1:9091".parse().unwrap();
        assert_eq!(bare, Endpoint::new("127.0.0.1", 9091));

        let v6: Endpoint = "tcp://[::1]:9091".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "tcp://[::1]:9091");
    }

    #[test]
    fn test_endpoint_rejects_bad_input() {
        assert!(matches!(
            "ssl://host:1".parse::<Endpoint>(),
            Err(QueryError::InvalidEndpoint(_))
        ));
        assert!("tcp://host".parse::<Endpoint>().is_err());
        assert!("tcp://:9091".parse::<Endpoint>().is_err());
        assert!("tcp://host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_onion_endpoint() {
        let ep: Endpoint = "tcp://55k4e2eaeucf3omt.onion:9091".parse().unwrap();
        assert_eq!(ep.host(), "55k4e2eaeucf3omt.onion");
    }

    #[test]
    fn test_socks5_prefix_stripped() {
        let cfg = Socks5Config::new("socks5://127.0.0.1:9150");
        assert_eq!(cfg.addr, "127.0.0.1:9150");
        assert!(cfg.credentials.is_none());

        let cfg = Socks5Config::with_credentials("127.0.0.1:9050", "u".into(), "p".into());
        assert_eq!(cfg.credentials.unwrap().username, "u");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ClientSettings::new(Endpoint::new("localhost", 9091));
        assert_eq!(settings.query_expire_time(), Some(DEFAULT_QUERY_EXPIRE_TIME));
        assert_eq!(settings.sweep_interval(), DEFAULT_SWEEP_INTERVAL);
        assert!(settings.socks5().is_none());
        assert_eq!(settings.transport(), &TransportConfig::default());
    }

    #[test]
    fn test_settings_from_json() {
        let settings = ClientSettings::from_json(
            r#"{
                "endpoint": "tcp://5.135.30.59:9091",
                "query_expire_time_ms": null,
                "socks5": { "addr": "127.0.0.1:9150" },
                "sweep_interval_ms": 100,
                "transport": { "max_pending_frames": 8 }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.endpoint(), &Endpoint::new("5.135.30.59", 9091));
        assert_eq!(settings.query_expire_time(), None);
        assert_eq!(settings.socks5().unwrap().addr, "127.0.0.1:9150");
        assert_eq!(settings.sweep_interval(), Duration::from_millis(100));
        assert_eq!(settings.transport().max_pending_frames, 8);
        assert_eq!(
            settings.transport().channel_capacity,
            DEFAULT_CHANNEL_CAPACITY
        );
    }

    #[test]
    fn test_settings_json_defaults_expiry() {
        let settings = ClientSettings::from_json(r#"{ "endpoint": "host:1" }"#).unwrap();
        assert_eq!(settings.query_expire_time(), Some(DEFAULT_QUERY_EXPIRE_TIME));
    }

    #[test]
    fn test_settings_json_round_trip() {
        let mut settings = ClientSettings::new(Endpoint::new("host", 1));
        settings.set_connect_timeout(Some(Duration::from_secs(3)));
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(ClientSettings::from_json(&json).unwrap(), settings);
    }

    #[test]
    fn test_settings_rejects_zero_sweep_interval() {
        let result = ClientSettings::from_json(r#"{ "endpoint": "host:1", "sweep_interval_ms": 0 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_rejects_bad_endpoint() {
        let result = ClientSettings::from_json(r#"{ "endpoint": "udp://host:1" }"#);
        assert!(matches!(result, Err(QueryError::Json(_))));
    }
}
