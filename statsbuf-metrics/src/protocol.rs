use std::fmt;

use serde::{Deserialize, Serialize};

/// The statsd type suffix of a [`WireLine`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricType {
    /// Counts instances of an event, suffix `c`.
    Counter,
    /// Sets or adjusts a gauge, suffix `g`.
    ///
    /// A leading `+` or `-` on the value marks a delta.
    Gauge,
    /// A duration in milliseconds, suffix `ms`.
    Timer,
    /// A continuously increasing total, suffix `t`.
    Total,
    /// An individual value which is not aggregated, suffix `a`.
    Absolute,
}

impl MetricType {
    /// Return the shortcode for this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Timer => "ms",
            MetricType::Total => "t",
            MetricType::Absolute => "a",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The class of an event, used to group exported telemetry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatClass {
    /// Counters, totals and absolute values.
    Counter,
    /// All gauge kinds.
    Gauge,
    /// Timings.
    Timer,
}

impl StatClass {
    /// Returns the lowercase name of this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatClass::Counter => "counter",
            StatClass::Gauge => "gauge",
            StatClass::Timer => "timer",
        }
    }
}

impl fmt::Display for StatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a float with at most six fractional digits and no trailing zeros.
///
/// Negative zero is written as `0`.
///
/// # Example
///
/// ```
/// assert_eq!(statsbuf_metrics::format_float(8.4), "8.4");
/// assert_eq!(statsbuf_metrics::format_float(3.0), "3");
/// assert_eq!(statsbuf_metrics::format_float(-0.0000001), "0");
/// ```
pub fn format_float(value: f64) -> String {
    let mut formatted = format!("{value:.6}");

    if formatted.contains('.') {
        let len = formatted.trim_end_matches('0').trim_end_matches('.').len();
        formatted.truncate(len);
    }

    if formatted == "-0" {
        formatted.remove(0);
    }

    formatted
}

/// The value part of a [`WireLine`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WireValue {
    /// An integer, written as is.
    Int(i64),
    /// A float, written with [`format_float`].
    Float(f64),
    /// An integer delta, always written with an explicit sign.
    IntDelta(i64),
    /// A float delta, always written with an explicit sign.
    FloatDelta(f64),
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WireValue::Int(value) => write!(f, "{value}"),
            WireValue::Float(value) => f.write_str(&format_float(value)),
            WireValue::IntDelta(value) => write!(f, "{value:+}"),
            WireValue::FloatDelta(value) => {
                let formatted = format_float(value);
                if !formatted.starts_with('-') {
                    f.write_str("+")?;
                }
                f.write_str(&formatted)
            }
        }
    }
}

/// A single record of the statsd text protocol.
///
/// The line is rendered without the client prefix and without a trailing newline. Both are added
/// when lines are packed into datagrams.
#[derive(Clone, Debug, PartialEq)]
pub struct WireLine {
    /// The full metric name, including sub-stat suffixes such as `.count`.
    pub name: String,
    /// The value.
    pub value: WireValue,
    /// The protocol type.
    pub ty: MetricType,
    /// The sample rate annotation, present only for rates below `1.0`.
    pub sample_rate: Option<f64>,
}

impl WireLine {
    /// Creates a line without sample rate annotation.
    pub fn new(name: impl Into<String>, value: WireValue, ty: MetricType) -> Self {
        Self {
            name: name.into(),
            value,
            ty,
            sample_rate: None,
        }
    }

    /// Annotates the line with the sample rate if it is below `1.0`.
    pub fn sampled(mut self, sample_rate: f64) -> Self {
        self.sample_rate = (sample_rate < 1.0).then_some(sample_rate);
        self
    }

    /// Returns the line with the given prefix prepended to its name.
    pub fn to_wire(&self, prefix: &str) -> String {
        format!("{prefix}{self}")
    }
}

impl fmt::Display for WireLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}|{}", self.name, self.value, self.ty)?;
        if let Some(rate) = self.sample_rate {
            write!(f, "|@{rate}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(20.200000000000003), "20.2");
        assert_eq!(format_float(-3.4), "-3.4");
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(-0.0), "0");
        assert_eq!(format_float(1234.5678901), "1234.56789");
        assert_eq!(format_float(100.0), "100");
    }

    #[test]
    fn test_delta_sign() {
        assert_eq!(WireValue::IntDelta(20).to_string(), "+20");
        assert_eq!(WireValue::IntDelta(0).to_string(), "+0");
        assert_eq!(WireValue::IntDelta(-20).to_string(), "-20");
        assert_eq!(WireValue::FloatDelta(20.2).to_string(), "+20.2");
        assert_eq!(WireValue::FloatDelta(-20.2).to_string(), "-20.2");
        // Rounds to zero, which must not turn into an absolute set.
        assert_eq!(WireValue::FloatDelta(-0.0000001).to_string(), "+0");
    }

    #[test]
    fn test_wire_line_sample_rate() {
        let line = WireLine::new("hits", WireValue::Int(3), MetricType::Counter);
        assert_eq!(line.clone().sampled(1.0).to_string(), "hits:3|c");
        assert_eq!(line.clone().sampled(0.5).to_string(), "hits:3|c|@0.5");
        assert_eq!(line.sampled(0.1).to_wire("app."), "app.hits:3|c|@0.1");
    }

    #[test]
    fn test_stat_class_serialize() {
        let json = serde_json::to_string(&[StatClass::Counter, StatClass::Timer]).unwrap();
        assert_eq!(json, r#"["counter","timer"]"#);
    }
}
