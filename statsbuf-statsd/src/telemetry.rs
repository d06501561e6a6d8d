use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use statsbuf_metrics::{Event, EventValue, StatClass};

/// A value in the [`Telemetry`] snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// An integer value.
    Int(i64),
    /// A floating point value.
    Float(f64),
}

impl TelemetryValue {
    fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Self::Int(a.saturating_add(b)),
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }

    /// Returns the value as float.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

/// Latest metric values grouped by [`StatClass`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Accumulated sums of counters, totals and absolute values.
    pub counters: BTreeMap<String, TelemetryValue>,
    /// The most recent value of every gauge.
    pub gauges: BTreeMap<String, TelemetryValue>,
    /// The most recent duration of every timer in milliseconds.
    pub timers: BTreeMap<String, TelemetryValue>,
}

impl TelemetrySnapshot {
    fn class_mut(&mut self, class: StatClass) -> &mut BTreeMap<String, TelemetryValue> {
        match class {
            StatClass::Counter => &mut self.counters,
            StatClass::Gauge => &mut self.gauges,
            StatClass::Timer => &mut self.timers,
        }
    }

    fn class(&self, class: StatClass) -> &BTreeMap<String, TelemetryValue> {
        match class {
            StatClass::Counter => &self.counters,
            StatClass::Gauge => &self.gauges,
            StatClass::Timer => &self.timers,
        }
    }
}

/// How a single ingested event changes the snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Observation {
    /// Add to the existing value.
    Add(TelemetryValue),
    /// Replace the existing value.
    Set(TelemetryValue),
}

impl Observation {
    /// Derives the observation carried by a single, not yet merged event.
    ///
    /// Returns `None` for events that carry no value.
    pub fn from_event(event: &Event) -> Option<Self> {
        use TelemetryValue::*;

        Some(match event.value() {
            EventValue::Counter(value) | EventValue::Total(value) => Self::Add(Int(*value)),
            EventValue::Absolute(values) => Self::Add(Int(
                values.iter().fold(0i64, |sum, v| sum.saturating_add(*v)),
            )),
            EventValue::FAbsolute(values) => Self::Add(Float(values.iter().sum())),
            EventValue::Gauge(value)
            | EventValue::GaugeAbsolute(value)
            | EventValue::GaugeDelta(value) => Self::Set(Int(*value)),
            EventValue::GaugeAvg(avg) => Self::Set(Int(avg.as_ref()?.avg())),
            EventValue::FGauge(value) | EventValue::FGaugeDelta(value) => Self::Set(Float(*value)),
            EventValue::Timing(timing) => Self::Set(Int(timing.last()?)),
            EventValue::PrecisionTiming(timing) => Self::Set(Float(timing.last()?)),
        })
    }
}

/// An in-process view of the latest metric values.
///
/// The collector is the only writer. Clones share the same snapshot, so a handle can be passed to
/// a status endpoint or a debugging page.
///
/// Keys are never evicted. Values outlive the flush that removes them from the aggregation map,
/// so the snapshot holds one entry for every distinct key ingested over the lifetime of the
/// client. Enable telemetry only for a bounded key set.
///
/// # Example
///
/// ```
/// use statsbuf_statsd::Telemetry;
///
/// let telemetry = Telemetry::new();
/// assert_eq!(telemetry.to_json().unwrap(), r#"{"counters":{},"gauges":{},"timers":{}}"#);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Telemetry {
    inner: Arc<RwLock<TelemetrySnapshot>>,
}

impl Telemetry {
    /// Creates an empty telemetry snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current values.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.read().clone()
    }

    /// Returns the current value of a single metric.
    pub fn get(&self, class: StatClass, key: &str) -> Option<TelemetryValue> {
        self.inner.read().class(class).get(key).copied()
    }

    /// Serializes the current values as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.inner.read())
    }

    pub(crate) fn record(&self, class: StatClass, key: &str, observation: Observation) {
        let mut snapshot = self.inner.write();
        let values = snapshot.class_mut(class);

        match observation {
            Observation::Set(value) => {
                values.insert(key.to_owned(), value);
            }
            Observation::Add(value) => match values.get_mut(key) {
                Some(existing) => *existing = existing.add(value),
                None => {
                    values.insert(key.to_owned(), value);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn observe(telemetry: &Telemetry, event: Event) {
        if let Some(observation) = Observation::from_event(&event) {
            telemetry.record(event.stat_class(), event.key(), observation);
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let telemetry = Telemetry::new();
        observe(&telemetry, Event::counter("hits", 5));
        observe(&telemetry, Event::counter("hits", -2));
        observe(&telemetry, Event::absolute("sizes", 10));
        observe(&telemetry, Event::absolute("sizes", 4));

        assert_eq!(
            telemetry.get(StatClass::Counter, "hits"),
            Some(TelemetryValue::Int(3))
        );
        assert_eq!(
            telemetry.get(StatClass::Counter, "sizes"),
            Some(TelemetryValue::Int(14))
        );
    }

    #[test]
    fn test_gauges_and_timers_keep_latest() {
        let telemetry = Telemetry::new();
        observe(&telemetry, Event::gauge("level", 5));
        observe(&telemetry, Event::gauge("level", 2));
        observe(&telemetry, Event::timing("req", 30));
        observe(&telemetry, Event::timing("req", 10));
        observe(
            &telemetry,
            Event::precision_timing("fast", Duration::from_micros(1500)),
        );

        assert_eq!(
            telemetry.get(StatClass::Gauge, "level"),
            Some(TelemetryValue::Int(2))
        );
        assert_eq!(
            telemetry.get(StatClass::Timer, "req"),
            Some(TelemetryValue::Int(10))
        );
        assert_eq!(
            telemetry.get(StatClass::Timer, "fast"),
            Some(TelemetryValue::Float(1.5))
        );
    }

    #[test]
    fn test_mixed_numeric_add() {
        let telemetry = Telemetry::new();
        observe(&telemetry, Event::absolute("x", 1));
        observe(&telemetry, Event::fabsolute("x", 0.5));

        assert_eq!(
            telemetry.get(StatClass::Counter, "x"),
            Some(TelemetryValue::Float(1.5))
        );
    }

    #[test]
    fn test_json_export() {
        let telemetry = Telemetry::new();
        observe(&telemetry, Event::counter("hits", 3));
        observe(&telemetry, Event::fgauge("load", 0.25));

        assert_eq!(
            telemetry.to_json().unwrap(),
            r#"{"counters":{"hits":3},"gauges":{"load":0.25},"timers":{}}"#
        );
    }

    #[test]
    fn test_clones_share_snapshot() {
        let telemetry = Telemetry::new();
        let other = telemetry.clone();
        observe(&telemetry, Event::counter("hits", 1));

        assert_eq!(other.snapshot().counters.len(), 1);
    }
}
