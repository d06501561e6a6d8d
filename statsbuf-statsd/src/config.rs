use std::time::Duration;

use serde::{Deserialize, Serialize};
use statsbuf_metrics::DEFAULT_PERCENTILES;

/// The token in metric keys and the prefix which is replaced with the local hostname.
pub const HOST_PLACEHOLDER: &str = "%HOST%";

/// Behavior of producers when the collector inbox is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Block the calling thread until the collector makes room.
    #[default]
    Block,
    /// Discard the observation.
    Drop,
}

/// Where and how aggregated metrics are sent.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Address of the statsd server.
    ///
    /// Either `host:port`, `udp://host:port`, or `unixgram:///path/to/socket`.
    pub upstream: String,

    /// Prefix prepended to every metric name.
    ///
    /// The first occurrence of `%HOST%` is replaced with the hostname.
    pub prefix: String,

    /// Overrides the hostname substituted for `%HOST%`.
    ///
    /// Defaults to the hostname reported by the operating system.
    pub hostname: Option<String>,
}

impl UpstreamConfig {
    /// Returns the configured hostname, or the system hostname if none is configured.
    ///
    /// Returns an empty string if the system hostname cannot be determined.
    pub fn hostname(&self) -> String {
        if let Some(ref hostname) = self.hostname {
            return hostname.clone();
        }

        system_hostname()
    }
}

/// Returns the hostname reported by the operating system.
///
/// Returns an empty string if the hostname cannot be determined.
pub(crate) fn system_hostname() -> String {
    match hostname::get() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            statsbuf_log::warn!(
                error = &error as &dyn std::error::Error,
                "failed to resolve hostname"
            );
            String::new()
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            upstream: "127.0.0.1:8125".to_owned(),
            prefix: String::new(),
            hostname: None,
        }
    }
}

/// Parameters of the [`BufferedClient`](crate::BufferedClient).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Interval between two flushes in milliseconds.
    ///
    /// Defaults to `1000`. This is also the epoch length used for per-second rates.
    pub flush_interval: u64,

    /// Number of events that can wait in the collector inbox.
    ///
    /// Defaults to `100`. See [`backpressure`](Self::backpressure) for the behavior once the inbox
    /// is full.
    pub queue_size: usize,

    /// Maximum size of a single datagram in bytes.
    ///
    /// Defaults to `512`. Lines longer than this are sent in a datagram on their own.
    pub max_packet_size: usize,

    /// Keep keys across flushes and reset them instead of removing them.
    ///
    /// Defaults to `false`. With retained keys, idle counters are sent as explicit zeros.
    pub retain_keys: bool,

    /// Reconnect the upstream socket before every flush.
    ///
    /// Defaults to `false`. This picks up DNS changes of the upstream host.
    pub recycle_connection: bool,

    /// Behavior when the collector inbox is full.
    pub backpressure: Backpressure,

    /// Sample rate for all observations except timings, between 0.0 (= 0%) and 1.0 (= 100%).
    pub sample_rate: f64,

    /// Sample rate for timings, between 0.0 (= 0%) and 1.0 (= 100%).
    pub timer_sample_rate: f64,

    /// Track the latest values in an in-process [`Telemetry`](crate::Telemetry) snapshot.
    pub telemetry: bool,

    /// Percentiles emitted for timings as `.upper_<p>`.
    pub percentiles: Vec<f64>,
}

impl BufferConfig {
    /// Returns the flush interval as duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: 1000,
            queue_size: 100,
            max_packet_size: 512,
            retain_keys: false,
            recycle_connection: false,
            backpressure: Backpressure::Block,
            sample_rate: 1.0,
            timer_sample_rate: 1.0,
            telemetry: true,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
        }
    }
}

/// Replaces the first occurrence of [`HOST_PLACEHOLDER`] in `s`.
pub fn replace_host(s: &str, hostname: &str) -> String {
    s.replacen(HOST_PLACEHOLDER, hostname, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_host_once() {
        assert_eq!(replace_host("a.%HOST%.b", "web1"), "a.web1.b");
        assert_eq!(replace_host("%HOST%.%HOST%", "web1"), "web1.%HOST%");
        assert_eq!(replace_host("plain", "web1"), "plain");
    }

    #[test]
    fn test_configured_hostname() {
        let config = UpstreamConfig {
            hostname: Some("web1".to_owned()),
            ..Default::default()
        };
        assert_eq!(config.hostname(), "web1");
    }

    #[test]
    fn test_buffer_config_defaults() {
        let config: BufferConfig = serde_json::from_str("{}").unwrap();
        insta::assert_debug_snapshot!(config, @r###"
        BufferConfig {
            flush_interval: 1000,
            queue_size: 100,
            max_packet_size: 512,
            retain_keys: false,
            recycle_connection: false,
            backpressure: Block,
            sample_rate: 1.0,
            timer_sample_rate: 1.0,
            telemetry: true,
            percentiles: [
                90.0,
                99.0,
            ],
        }
        "###);
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_backpressure_deserialize() {
        let config: BufferConfig = serde_json::from_str(r#"{"backpressure": "drop"}"#).unwrap();
        assert_eq!(config.backpressure, Backpressure::Drop);
    }
}
