//! Configuration for the statsbuf statsd client.
//!
//! The configuration is loaded from a single YAML file with three sections. All fields are
//! optional and fall back to their defaults:
//!
//! ```yaml
//! logging:
//!   level: info
//!   format: auto
//! upstream:
//!   upstream: "127.0.0.1:8125"
//!   prefix: "myapp.%HOST%."
//! buffer:
//!   flush_interval: 1000
//!   max_packet_size: 512
//!   sample_rate: 1.0
//! ```
//!
//! Individual values can be overridden from the environment or the command line through
//! [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
