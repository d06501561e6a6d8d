//! A statsd client that aggregates metrics in memory and flushes them periodically.
//!
//! This crate wires the configuration, logging and the buffered client together. Applications
//! construct a client once at startup and pass it to all call sites. There is no global client.
//!
//! ```no_run
//! use statsbuf::Statsd;
//!
//! let config = statsbuf::load_config("statsbuf.yml").unwrap();
//! statsbuf_log::init(&config.logging);
//!
//! let client = statsbuf::client_or_noop(&config);
//! client.incr("app.started", 1).unwrap();
//! client.close().unwrap();
//! ```
//!
//! The individual parts are available from their own crates:
//!
//! - `statsbuf-config`: loading and validating configuration files.
//! - `statsbuf-log`: logging setup and macros.
//! - `statsbuf-metrics`: the event model and wire format.
//! - `statsbuf-statsd`: clients, the collector and transports.

#![warn(missing_docs)]

mod setup;

pub use self::setup::*;
pub use statsbuf_config::{Config, ConfigError, OverridableConfig};
pub use statsbuf_statsd::{BufferedClient, ClientError, EchoClient, NoopClient, Statsd};
