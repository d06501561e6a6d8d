//! A buffering statsd client.
//!
//! Application code reports counters, gauges and timers through the [`Statsd`] trait. The
//! [`BufferedClient`] folds repeated reports for the same metric into a single accumulator and
//! periodically emits the aggregates as statsd datagrams, shielding a high-frequency event source
//! from per-event network overhead.
//!
//! ## Architecture
//!
//! ```text
//! producer ──▶ Sampler ──▶ Collector inbox ──▶ Collector ──tick──▶ Flusher ──▶ Transport
//! ```
//!
//! - The [`Sampler`] decides whether an observation is recorded at all.
//! - The [`Collector`](collector::Collector) service owns the map of accumulated events on a
//!   dedicated thread. It is the only place that merges, flushes, or resets events, so there is no
//!   locking around the map.
//! - The [`Flusher`] renders accumulated events into wire lines and packs them into datagrams
//!   of bounded size.
//! - A [`Transport`] delivers datagrams, usually to a UDP [`Upstream`].
//!
//! ## Example
//!
//! ```no_run
//! use statsbuf_statsd::{BufferConfig, BufferedClient, Statsd, UpstreamConfig};
//!
//! let upstream = UpstreamConfig {
//!     upstream: "127.0.0.1:8125".to_owned(),
//!     prefix: "myapp.%HOST%.".to_owned(),
//!     hostname: None,
//! };
//!
//! let client = BufferedClient::new(&upstream, &BufferConfig::default()).unwrap();
//! client.incr("requests", 1).unwrap();
//! client.timing("request.duration", 42).unwrap();
//! client.close().unwrap();
//! ```

#![warn(missing_docs)]

mod client;
pub mod collector;
mod config;
mod flush;
mod sampler;
mod telemetry;
mod upstream;

pub use self::client::*;
pub use self::config::*;
pub use self::flush::*;
pub use self::sampler::*;
pub use self::telemetry::*;
pub use self::upstream::*;
