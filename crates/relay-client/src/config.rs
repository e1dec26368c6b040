//! client config
//!
//! Shared by the delivery worker and the registry (custom labels).

use std::time::Duration;

use relay_protocol::Labels;
use relay_protocol::DEFAULT_MAX_FRAME_LENGTH;

/// Environment variable holding the collector host.
pub const HOST_ENV: &str = "METRICS_RELAY_HOST";
/// Environment variable holding the collector ingest port.
pub const PORT_ENV: &str = "METRICS_RELAY_PORT";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9394;

/// Metrics client config.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// collector ingest address, `host:port`
    pub collector_addr: String,
    /// observations buffered while disconnected; the oldest are dropped beyond this
    pub max_queue_size: usize,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// socket write timeout
    pub write_timeout: Duration,
    /// how long the worker idles before re-checking the queue
    pub flush_interval: Duration,
    /// pause after a failed connect or write
    pub reconnect_delay: Duration,
    /// largest record the worker will send
    pub max_frame_length: usize,
    /// labels merged into every observation, caller keys take precedence
    pub custom_labels: Labels,
}

impl ClientConfig {
    /// create new client config with default parameters.
    pub fn new(collector_addr: impl Into<String>) -> Self {
        Self {
            collector_addr: collector_addr.into(),
            max_queue_size: 10_000,
            connect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            flush_interval: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(500),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            custom_labels: Labels::new(),
        }
    }

    /// config pointing at `METRICS_RELAY_HOST:METRICS_RELAY_PORT`, falling back to `localhost:9394`.
    pub fn from_env() -> Self {
        let host = std::env::var(HOST_ENV).unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        Self::new(format!("{host}:{port}"))
    }

    /// set max queue size.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size.max(1);
        self
    }

    /// set connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// set write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// set flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// set reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// set max frame length.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// set custom labels.
    pub fn with_custom_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.custom_labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(format!("{DEFAULT_HOST}:{DEFAULT_PORT}"))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ClientConfig::new("127.0.0.1:9000")
            .with_max_queue_size(5)
            .with_flush_interval(Duration::from_millis(50))
            .with_reconnect_delay(Duration::from_millis(20))
            .with_custom_labels([("service", "web")]);

        assert_eq!(config.collector_addr, "127.0.0.1:9000");
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert_eq!(config.reconnect_delay, Duration::from_millis(20));
        assert_eq!(config.custom_labels.get("service").map(String::as_str), Some("web"));
    }

    #[test]
    fn default_points_at_local_collector() {
        let config = ClientConfig::default();
        assert_eq!(config.collector_addr, "localhost:9394");
        assert_eq!(config.max_queue_size, 10_000);
    }

    #[test]
    fn queue_size_is_never_zero() {
        assert_eq!(ClientConfig::default().with_max_queue_size(0).max_queue_size, 1);
    }
}
