//! Metric events and their statsd wire representation.
//!
//! Every call on a client produces exactly one [`Event`] describing a single observation. Events
//! with the same key are folded into one accumulator with [`Event::merge`], and at the end of a
//! flush epoch the accumulator is turned into [wire lines](WireLine) with [`Event::render`].
//!
//! # Event Types
//!
//! | Kind               | Merge             | Wire type | Stat class |
//! |--------------------|-------------------|-----------|------------|
//! | `Counter`          | sum               | `c`       | counter    |
//! | `Total`            | sum               | `t`       | counter    |
//! | `Gauge`            | replace           | `g`       | gauge      |
//! | `GaugeAbsolute`    | replace           | `g`       | gauge      |
//! | `GaugeAvg`         | running average   | `g`       | gauge      |
//! | `GaugeDelta`       | sum, signed       | `g`       | gauge      |
//! | `FGauge`           | replace           | `g`       | gauge      |
//! | `FGaugeDelta`      | sum, signed       | `g`       | gauge      |
//! | `Absolute`         | append            | `a`       | counter    |
//! | `FAbsolute`        | append            | `a`       | counter    |
//! | `Timing`           | statistics        | `c`, `ms` | timer      |
//! | `PrecisionTiming`  | statistics        | `c`, `ms` | timer      |
//!
//! # Wire Format
//!
//! Each rendered line follows the statsd text protocol:
//!
//! ```text
//! <key>:<value>|<type>[|@<rate>]
//! ```
//!
//! Gauges with a leading `+` or `-` are interpreted as a delta by the receiving server. A
//! negative absolute gauge is therefore sent as two lines, first setting the gauge to zero and
//! then applying the negative value.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use statsbuf_metrics::Event;
//!
//! let mut event = Event::counter("requests", 5);
//! event.merge(Event::counter("requests", -2)).unwrap();
//!
//! let lines = event.render(Duration::from_secs(1), 1.0);
//! assert_eq!(lines[0].to_string(), "requests:3|c");
//! ```

#![warn(missing_docs)]

mod event;
mod protocol;
mod timing;

pub use self::event::*;
pub use self::protocol::*;
pub use self::timing::*;
