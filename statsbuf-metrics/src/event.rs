use std::fmt;
use std::time::Duration;

use crate::protocol::{MetricType, StatClass, WireLine, WireValue};
use crate::timing::{DEFAULT_PERCENTILES, TimingValue};

/// The discriminant of an [`EventValue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// See [`EventValue::Counter`].
    Counter,
    /// See [`EventValue::Total`].
    Total,
    /// See [`EventValue::Gauge`].
    Gauge,
    /// See [`EventValue::GaugeAbsolute`].
    GaugeAbsolute,
    /// See [`EventValue::GaugeAvg`].
    GaugeAvg,
    /// See [`EventValue::GaugeDelta`].
    GaugeDelta,
    /// See [`EventValue::FGauge`].
    FGauge,
    /// See [`EventValue::FGaugeDelta`].
    FGaugeDelta,
    /// See [`EventValue::Absolute`].
    Absolute,
    /// See [`EventValue::FAbsolute`].
    FAbsolute,
    /// See [`EventValue::Timing`].
    Timing,
    /// See [`EventValue::PrecisionTiming`].
    PrecisionTiming,
}

impl EventKind {
    /// Returns the name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Counter => "counter",
            EventKind::Total => "total",
            EventKind::Gauge => "gauge",
            EventKind::GaugeAbsolute => "gauge_absolute",
            EventKind::GaugeAvg => "gauge_avg",
            EventKind::GaugeDelta => "gauge_delta",
            EventKind::FGauge => "fgauge",
            EventKind::FGaugeDelta => "fgauge_delta",
            EventKind::Absolute => "absolute",
            EventKind::FAbsolute => "fabsolute",
            EventKind::Timing => "timing",
            EventKind::PrecisionTiming => "precision_timing",
        }
    }

    /// Returns the telemetry class of this kind.
    pub fn stat_class(&self) -> StatClass {
        match self {
            EventKind::Counter | EventKind::Total | EventKind::Absolute | EventKind::FAbsolute => {
                StatClass::Counter
            }
            EventKind::Gauge
            | EventKind::GaugeAbsolute
            | EventKind::GaugeAvg
            | EventKind::GaugeDelta
            | EventKind::FGauge
            | EventKind::FGaugeDelta => StatClass::Gauge,
            EventKind::Timing | EventKind::PrecisionTiming => StatClass::Timer,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running sum and observation count of a [`EventValue::GaugeAvg`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GaugeAvgValue {
    /// Sum of all observed values.
    pub sum: i64,
    /// Number of observed values.
    pub count: u64,
}

impl GaugeAvgValue {
    /// Creates an average from a single observation.
    pub fn single(value: i64) -> Self {
        Self {
            sum: value,
            count: 1,
        }
    }

    /// Merges two averages.
    pub fn merge(&mut self, other: Self) {
        self.sum = self.sum.saturating_add(other.sum);
        self.count += other.count;
    }

    /// Returns the truncated average of all observations.
    pub fn avg(&self) -> i64 {
        match i64::try_from(self.count) {
            Ok(count) if count > 0 => self.sum / count,
            _ => self.sum,
        }
    }
}

/// The accumulated state of an [`Event`].
#[derive(Clone, Debug, PartialEq)]
pub enum EventValue {
    /// Sum of signed counter deltas.
    Counter(i64),
    /// Sum of deltas of a continuously increasing total.
    Total(i64),
    /// The latest gauge value.
    Gauge(i64),
    /// The latest gauge value, kept across idle epochs.
    GaugeAbsolute(i64),
    /// The average of all gauge observations, or `None` if there were none since the last reset.
    GaugeAvg(Option<GaugeAvgValue>),
    /// Sum of signed gauge adjustments.
    GaugeDelta(i64),
    /// The latest floating point gauge value.
    FGauge(f64),
    /// Sum of signed floating point gauge adjustments.
    FGaugeDelta(f64),
    /// Individual values, sent one line each.
    Absolute(Vec<i64>),
    /// Individual floating point values, sent one line each.
    FAbsolute(Vec<f64>),
    /// Durations in whole milliseconds.
    Timing(TimingValue<i64>),
    /// Durations in fractional milliseconds.
    PrecisionTiming(TimingValue<f64>),
}

impl EventValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Counter(_) => EventKind::Counter,
            Self::Total(_) => EventKind::Total,
            Self::Gauge(_) => EventKind::Gauge,
            Self::GaugeAbsolute(_) => EventKind::GaugeAbsolute,
            Self::GaugeAvg(_) => EventKind::GaugeAvg,
            Self::GaugeDelta(_) => EventKind::GaugeDelta,
            Self::FGauge(_) => EventKind::FGauge,
            Self::FGaugeDelta(_) => EventKind::FGaugeDelta,
            Self::Absolute(_) => EventKind::Absolute,
            Self::FAbsolute(_) => EventKind::FAbsolute,
            Self::Timing(_) => EventKind::Timing,
            Self::PrecisionTiming(_) => EventKind::PrecisionTiming,
        }
    }

    /// Merges the given `other` value into `self`.
    ///
    /// Returns `Ok(())` if the two values can be merged. This is the case when both values are of
    /// the same variant. Otherwise, this returns `Err(other)` and leaves `self` untouched.
    pub fn merge(&mut self, other: Self) -> Result<(), Self> {
        match (self, other) {
            (Self::Counter(slf), Self::Counter(other)) => *slf = slf.saturating_add(other),
            (Self::Total(slf), Self::Total(other)) => *slf = slf.saturating_add(other),
            (Self::Gauge(slf), Self::Gauge(other)) => *slf = other,
            (Self::GaugeAbsolute(slf), Self::GaugeAbsolute(other)) => *slf = other,
            (Self::GaugeAvg(slf), Self::GaugeAvg(Some(other))) => match slf {
                Some(avg) => avg.merge(other),
                None => *slf = Some(other),
            },
            (Self::GaugeAvg(_), Self::GaugeAvg(None)) => (),
            (Self::GaugeDelta(slf), Self::GaugeDelta(other)) => *slf = slf.saturating_add(other),
            (Self::FGauge(slf), Self::FGauge(other)) => *slf = other,
            (Self::FGaugeDelta(slf), Self::FGaugeDelta(other)) => *slf += other,
            (Self::Absolute(slf), Self::Absolute(other)) => slf.extend(other),
            (Self::FAbsolute(slf), Self::FAbsolute(other)) => slf.extend(other),
            (Self::Timing(slf), Self::Timing(other)) => slf.merge(other),
            (Self::PrecisionTiming(slf), Self::PrecisionTiming(other)) => slf.merge(other),
            (_, other) => return Err(other),
        }

        Ok(())
    }

    /// Resets the value at the end of an epoch when keys are retained.
    pub fn reset(&mut self) {
        match self {
            Self::Counter(value)
            | Self::Total(value)
            | Self::Gauge(value)
            | Self::GaugeDelta(value) => *value = 0,
            // Absolute gauges keep their value while idle.
            Self::GaugeAbsolute(_) => (),
            Self::GaugeAvg(value) => *value = None,
            Self::FGauge(value) | Self::FGaugeDelta(value) => *value = 0.0,
            Self::Absolute(values) => values.clear(),
            Self::FAbsolute(values) => values.clear(),
            Self::Timing(value) => value.reset(),
            Self::PrecisionTiming(value) => value.reset(),
        }
    }
}

/// A merge of two events with different kinds for the same key.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("statsd event type conflict for {key:?}: {existing} vs {incoming}")]
pub struct TypeConflict {
    /// The key both events share.
    pub key: String,
    /// The kind of the accumulated event.
    pub existing: EventKind,
    /// The kind of the rejected event.
    pub incoming: EventKind,
}

/// Parameters for rendering events into wire lines.
#[derive(Clone, Copy, Debug)]
pub struct RenderContext<'a> {
    /// The length of the flush epoch, used for per-second rates.
    pub epoch: Duration,
    /// The sample rate observations were recorded at.
    pub sample_rate: f64,
    /// Percentiles emitted for timings.
    pub percentiles: &'a [f64],
}

impl RenderContext<'static> {
    /// Creates a context with the default timing percentiles.
    pub fn new(epoch: Duration, sample_rate: f64) -> Self {
        Self {
            epoch,
            sample_rate,
            percentiles: DEFAULT_PERCENTILES,
        }
    }
}

/// A metric observation or the accumulation of many observations for the same key.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    key: String,
    value: EventValue,
}

impl Event {
    /// Creates an event from a key and value.
    pub fn new(key: impl Into<String>, value: EventValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Creates a counter event adding `delta`.
    pub fn counter(key: impl Into<String>, delta: i64) -> Self {
        Self::new(key, EventValue::Counter(delta))
    }

    /// Creates a total event adding `delta`.
    pub fn total(key: impl Into<String>, delta: i64) -> Self {
        Self::new(key, EventValue::Total(delta))
    }

    /// Creates a gauge event.
    pub fn gauge(key: impl Into<String>, value: i64) -> Self {
        Self::new(key, EventValue::Gauge(value))
    }

    /// Creates an absolute gauge event.
    pub fn gauge_absolute(key: impl Into<String>, value: i64) -> Self {
        Self::new(key, EventValue::GaugeAbsolute(value))
    }

    /// Creates an averaged gauge event.
    pub fn gauge_avg(key: impl Into<String>, value: i64) -> Self {
        Self::new(key, EventValue::GaugeAvg(Some(GaugeAvgValue::single(value))))
    }

    /// Creates a gauge delta event.
    pub fn gauge_delta(key: impl Into<String>, delta: i64) -> Self {
        Self::new(key, EventValue::GaugeDelta(delta))
    }

    /// Creates a floating point gauge event.
    pub fn fgauge(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, EventValue::FGauge(value))
    }

    /// Creates a floating point gauge delta event.
    pub fn fgauge_delta(key: impl Into<String>, delta: f64) -> Self {
        Self::new(key, EventValue::FGaugeDelta(delta))
    }

    /// Creates an absolute event.
    pub fn absolute(key: impl Into<String>, value: i64) -> Self {
        Self::new(key, EventValue::Absolute(vec![value]))
    }

    /// Creates a floating point absolute event.
    pub fn fabsolute(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, EventValue::FAbsolute(vec![value]))
    }

    /// Creates a timing event in whole milliseconds.
    pub fn timing(key: impl Into<String>, millis: i64) -> Self {
        Self::new(key, EventValue::Timing(TimingValue::single(millis)))
    }

    /// Creates a timing event from a duration, kept with sub-millisecond precision.
    pub fn precision_timing(key: impl Into<String>, delta: Duration) -> Self {
        let millis = delta.as_nanos() as f64 / 1_000_000.0;
        Self::new(key, EventValue::PrecisionTiming(TimingValue::single(millis)))
    }

    /// Returns the metric key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Replaces the metric key.
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    /// Returns the accumulated value.
    pub fn value(&self) -> &EventValue {
        &self.value
    }

    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        self.value.kind()
    }

    /// Returns the telemetry class of this event.
    pub fn stat_class(&self) -> StatClass {
        self.kind().stat_class()
    }

    /// Returns `true` for timing events, which are rendered with the timer sample rate.
    pub fn is_timer(&self) -> bool {
        self.stat_class() == StatClass::Timer
    }

    /// Merges an observation for the same key into this event.
    ///
    /// On a [`TypeConflict`], neither event is modified and `other` is dropped.
    pub fn merge(&mut self, other: Event) -> Result<(), TypeConflict> {
        self.value.merge(other.value).map_err(|other| TypeConflict {
            key: self.key.clone(),
            existing: self.kind(),
            incoming: other.kind(),
        })
    }

    /// Resets the accumulated value for the next epoch. See [`EventValue::reset`].
    pub fn reset(&mut self) {
        self.value.reset();
    }

    /// Renders the event into wire lines with default timing percentiles.
    pub fn render(&self, epoch: Duration, sample_rate: f64) -> Vec<WireLine> {
        let mut lines = Vec::new();
        self.render_into(&RenderContext::new(epoch, sample_rate), &mut lines);
        lines
    }

    /// Renders the event and appends the wire lines to `out`.
    pub fn render_into(&self, context: &RenderContext<'_>, out: &mut Vec<WireLine>) {
        let key = self.key.as_str();
        let rate = context.sample_rate;

        match &self.value {
            EventValue::Counter(value) => {
                out.push(WireLine::new(key, WireValue::Int(*value), MetricType::Counter).sampled(rate))
            }
            EventValue::Total(value) => {
                out.push(WireLine::new(key, WireValue::Int(*value), MetricType::Total).sampled(rate))
            }
            EventValue::Gauge(value) | EventValue::GaugeAbsolute(value) => {
                render_gauge(key, WireValue::Int(*value), *value < 0, rate, out)
            }
            EventValue::GaugeAvg(None) => (),
            EventValue::GaugeAvg(Some(avg)) => {
                let value = avg.avg();
                render_gauge(key, WireValue::Int(value), value < 0, rate, out)
            }
            EventValue::GaugeDelta(value) => out.push(
                WireLine::new(key, WireValue::IntDelta(*value), MetricType::Gauge).sampled(rate),
            ),
            EventValue::FGauge(value) => {
                render_gauge(key, WireValue::Float(*value), *value < 0.0, rate, out)
            }
            EventValue::FGaugeDelta(value) => out.push(
                WireLine::new(key, WireValue::FloatDelta(*value), MetricType::Gauge)
                    .sampled(rate),
            ),
            EventValue::Absolute(values) => out.extend(values.iter().map(|value| {
                WireLine::new(key, WireValue::Int(*value), MetricType::Absolute).sampled(rate)
            })),
            EventValue::FAbsolute(values) => out.extend(values.iter().map(|value| {
                WireLine::new(key, WireValue::Float(*value), MetricType::Absolute).sampled(rate)
            })),
            EventValue::Timing(value) => {
                value.render_into(key, context.epoch, rate, context.percentiles, out)
            }
            EventValue::PrecisionTiming(value) => {
                value.render_into(key, context.epoch, rate, context.percentiles, out)
            }
        }
    }
}

/// Renders an absolute gauge value.
///
/// A leading sign marks a delta on the wire, so negative values are sent as a reset to zero
/// followed by the value.
fn render_gauge(key: &str, value: WireValue, negative: bool, rate: f64, out: &mut Vec<WireLine>) {
    if negative {
        out.push(WireLine::new(key, WireValue::Int(0), MetricType::Gauge).sampled(rate));
    }
    out.push(WireLine::new(key, value, MetricType::Gauge).sampled(rate));
}
