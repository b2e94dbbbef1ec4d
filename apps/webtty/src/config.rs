use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use tracing::warn;
use url::Url;

use crate::error::ConnectionError;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "terminal";
/// Shortest period accepted for the flush and keepalive timers.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

/// How a session treats the peer-to-peer upgrade path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PeerMode {
    /// Plain WebSocket bridge; remote offers are rejected.
    Disabled,
    /// Accept offers from the remote side.
    #[default]
    Respond,
    /// Offer a peer channel as soon as signaling is up.
    Initiate,
}

impl PeerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerMode::Disabled => "disabled",
            PeerMode::Respond => "respond",
            PeerMode::Initiate => "initiate",
        }
    }
}

impl fmt::Display for PeerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(PeerMode::Disabled),
            "respond" | "answer" => Ok(PeerMode::Respond),
            "initiate" | "offer" => Ok(PeerMode::Initiate),
            other => Err(format!("unknown peer mode '{other}'")),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Coordinating endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub endpoint: String,
    pub peer_mode: PeerMode,
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Upper bound on one offer/answer exchange, measured from leaving `Idle`
    pub negotiation_timeout: Duration,
    pub retry_queue_capacity: usize,
    pub signaling_capacity: usize,
    pub flush_interval: Duration,
    pub keepalive_interval: Duration,
    /// ICE server URLs; empty means host candidates only
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            peer_mode: PeerMode::default(),
            connect_timeout: Duration::from_millis(5_000),
            negotiation_timeout: Duration::from_millis(10_000),
            retry_queue_capacity: 256,
            signaling_capacity: 1024,
            flush_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(30),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn to_builder(&self) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: self.clone(),
        }
    }

    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("WEBTTY_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            config.endpoint = endpoint.trim().to_string();
        }
        if let Some(mode) = lookup("WEBTTY_PEER_MODE") {
            match mode.parse() {
                Ok(mode) => config.peer_mode = mode,
                Err(err) => warn!(target: "webtty::config", error = %err, "ignoring WEBTTY_PEER_MODE"),
            }
        }
        if let Some(timeout) = parse_millis(&lookup, "WEBTTY_NEGOTIATION_TIMEOUT_MS") {
            config.negotiation_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(&lookup, "WEBTTY_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        if let Some(capacity) = parse_positive(&lookup, "WEBTTY_RETRY_QUEUE") {
            config.retry_queue_capacity = capacity as usize;
        }
        if let Some(servers) = lookup("WEBTTY_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if lookup("WEBTTY_DISABLE_STUN").is_some_and(|v| truthy(&v)) {
            config.ice_servers.clear();
        }

        config
    }

    /// Resolve `endpoint` into a WebSocket URL.
    ///
    /// Bare `host:port/path` values get `ws://` for loopback hosts and `wss://`
    /// otherwise; `http(s)` is mapped onto `ws(s)`. `localhost` is rewritten to
    /// `127.0.0.1` to avoid resolving to `::1` first.
    pub fn endpoint_url(&self) -> Result<Url, ConnectionError> {
        let raw = self.endpoint.trim();
        let invalid = |reason: String| ConnectionError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("endpoint is empty".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else if raw.starts_with("localhost") || raw.starts_with("127.0.0.1") {
            format!("ws://{raw}")
        } else {
            format!("wss://{raw}")
        };

        let mut url = Url::parse(&with_scheme).map_err(|err| invalid(err.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        };
        if url.scheme() != scheme {
            // Url refuses some special-to-special swaps; rebuild from the tail instead.
            let rest = &with_scheme[with_scheme.find("://").map_or(0, |i| i + 3)..];
            url = Url::parse(&format!("{scheme}://{rest}")).map_err(|err| invalid(err.to_string()))?;
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".into()));
        }
        if url.host_str() == Some("localhost") {
            url.set_host(Some("127.0.0.1"))
                .map_err(|err| invalid(err.to_string()))?;
        }
        Ok(url)
    }
}

fn truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

fn parse_positive<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(target: "webtty::config", key, value = %raw, "ignoring non-positive integer");
            None
        }
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_positive(lookup, key).map(Duration::from_millis)
}

/// Builder for session configuration
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn peer_mode(mut self, mode: PeerMode) -> Self {
        self.config.peer_mode = mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    pub fn retry_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.retry_queue_capacity = capacity.max(1);
        self
    }

    pub fn signaling_capacity(mut self, capacity: usize) -> Self {
        self.config.signaling_capacity = capacity.max(1);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval.max(MIN_TIMER_INTERVAL);
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval.max(MIN_TIMER_INTERVAL);
        self
    }

    pub fn ice_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.ice_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.config.data_channel_label = label.into();
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.peer_mode, PeerMode::Respond);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_queue_capacity, 256);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn builder_clamps_timer_periods() {
        let config = SessionConfig::builder()
            .flush_interval(Duration::ZERO)
            .keepalive_interval(Duration::ZERO)
            .build();
        assert_eq!(config.flush_interval, MIN_TIMER_INTERVAL);
        assert_eq!(config.keepalive_interval, MIN_TIMER_INTERVAL);
    }

    #[test]
    fn test_config_from_env_custom() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("WEBTTY_ENDPOINT", "ws://relay.example.com/ws/room1"),
            ("WEBTTY_PEER_MODE", "initiate"),
            ("WEBTTY_NEGOTIATION_TIMEOUT_MS", "2500"),
            ("WEBTTY_RETRY_QUEUE", "8"),
            ("WEBTTY_ICE_SERVERS", "stun:a.example:3478, turn:b.example:3478"),
        ]));
        assert_eq!(config.endpoint, "ws://relay.example.com/ws/room1");
        assert_eq!(config.peer_mode, PeerMode::Initiate);
        assert_eq!(config.negotiation_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry_queue_capacity, 8);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example:3478".to_string()]
        );
    }

    #[test]
    fn invalid_env_values_fall_back_to_defaults() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("WEBTTY_PEER_MODE", "sideways"),
            ("WEBTTY_CONNECT_TIMEOUT_MS", "0"),
            ("WEBTTY_RETRY_QUEUE", "lots"),
        ]));
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn disable_stun_clears_ice_servers() {
        let config = SessionConfig::from_lookup(lookup_from(&[("WEBTTY_DISABLE_STUN", "1")]));
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn endpoint_url_normalizes_scheme_and_localhost() {
        let url = |endpoint: &str| {
            SessionConfig::builder()
                .endpoint(endpoint)
                .build()
                .endpoint_url()
                .map(|u| u.to_string())
        };
        assert_eq!(url("localhost:8080/ws").unwrap(), "ws://127.0.0.1:8080/ws");
        assert_eq!(url("http://localhost:8080/ws").unwrap(), "ws://127.0.0.1:8080/ws");
        assert_eq!(url("https://relay.example.com/ws").unwrap(), "wss://relay.example.com/ws");
        assert_eq!(url("relay.example.com/ws").unwrap(), "wss://relay.example.com/ws");
    }

    #[test]
    fn endpoint_url_rejects_garbage() {
        let err = SessionConfig::builder()
            .endpoint("ftp://relay.example.com")
            .build()
            .endpoint_url()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidEndpoint { .. }));
        assert!(SessionConfig::builder().endpoint("  ").build().endpoint_url().is_err());
    }
}
