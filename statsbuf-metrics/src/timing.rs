use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use crate::protocol::{MetricType, WireLine, WireValue, format_float};

/// Percentiles rendered for timings unless configured otherwise.
pub const DEFAULT_PERCENTILES: &[f64] = &[90.0, 99.0];

/// A numeric type that timings can be accumulated in.
///
/// Implemented for `i64` (whole milliseconds) and `f64` (fractional milliseconds).
pub trait TimingType: Copy + PartialOrd + fmt::Debug + Send + 'static {
    /// The additive identity.
    const ZERO: Self;

    /// Adds two values, saturating at the numeric bounds where applicable.
    fn add(self, other: Self) -> Self;

    /// Converts the value to a float for statistical computations.
    fn as_f64(self) -> f64;

    /// Computes `sum / count`. Integers use truncating division.
    fn mean(sum: Self, count: u64) -> Self;

    /// Computes the midpoint of two values. Integers use truncating division.
    fn midpoint(a: Self, b: Self) -> Self;

    /// Converts a computed statistic back into this type. Integers truncate.
    fn from_f64(value: f64) -> Self;

    /// Returns the wire representation of this value.
    fn to_wire(self) -> WireValue;
}

impl TimingType for i64 {
    const ZERO: Self = 0;

    fn add(self, other: Self) -> Self {
        self.saturating_add(other)
    }

    fn as_f64(self) -> f64 {
        self as f64
    }

    fn mean(sum: Self, count: u64) -> Self {
        match i64::try_from(count) {
            Ok(count) if count > 0 => sum / count,
            _ => 0,
        }
    }

    fn midpoint(a: Self, b: Self) -> Self {
        ((i128::from(a) + i128::from(b)) / 2) as i64
    }

    fn from_f64(value: f64) -> Self {
        value as i64
    }

    fn to_wire(self) -> WireValue {
        WireValue::Int(self)
    }
}

impl TimingType for f64 {
    const ZERO: Self = 0.0;

    fn add(self, other: Self) -> Self {
        self + other
    }

    fn as_f64(self) -> f64 {
        self
    }

    fn mean(sum: Self, count: u64) -> Self {
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    fn midpoint(a: Self, b: Self) -> Self {
        (a + b) / 2.0
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_wire(self) -> WireValue {
        WireValue::Float(self)
    }
}

/// Accumulated timing observations within one flush epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct TimingValue<T> {
    /// The sum of all observations.
    pub sum: T,
    /// The number of observations.
    pub count: u64,
    /// The smallest observation, or zero if there are none.
    pub min: T,
    /// The largest observation, or zero if there are none.
    pub max: T,
    /// All observations in insertion order.
    pub values: Vec<T>,
}

impl<T: TimingType> TimingValue<T> {
    /// Creates an accumulator from a single observation.
    pub fn single(value: T) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
            values: vec![value],
        }
    }

    /// Creates an accumulator without observations.
    pub fn empty() -> Self {
        Self {
            sum: T::ZERO,
            count: 0,
            min: T::ZERO,
            max: T::ZERO,
            values: Vec::new(),
        }
    }

    /// Returns `true` if no observations were recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the most recent observation.
    pub fn last(&self) -> Option<T> {
        self.values.last().copied()
    }

    /// Merges observations from another accumulator.
    ///
    /// An empty accumulator adopts the extrema of `other` instead of comparing against its zeros.
    pub fn merge(&mut self, other: Self) {
        if other.is_empty() {
            return;
        }

        if self.is_empty() {
            self.min = other.min;
            self.max = other.max;
        } else {
            if other.min < self.min {
                self.min = other.min;
            }
            if other.max > self.max {
                self.max = other.max;
            }
        }

        self.sum = self.sum.add(other.sum);
        self.count += other.count;
        self.values.extend(other.values);
    }

    /// Clears all observations.
    pub fn reset(&mut self) {
        self.sum = T::ZERO;
        self.count = 0;
        self.min = T::ZERO;
        self.max = T::ZERO;
        self.values.clear();
    }

    /// Computes the derived statistics, or `None` if there are no observations.
    pub fn stats(&self, percentiles: &[f64]) -> Option<TimingStats<T>> {
        if self.is_empty() || self.values.is_empty() {
            return None;
        }

        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let len = sorted.len();
        let mid = len / 2;
        let median = if len % 2 == 1 {
            sorted[mid]
        } else {
            T::midpoint(sorted[mid - 1], sorted[mid])
        };

        let avg = sorted.iter().map(|v| v.as_f64()).sum::<f64>() / len as f64;
        let variance = sorted
            .iter()
            .map(|v| (v.as_f64() - avg).powi(2))
            .sum::<f64>()
            / len as f64;

        let upper = percentiles
            .iter()
            .map(|&p| {
                let rank = ((p / 100.0) * len as f64).round() as usize;
                (p, sorted[rank.clamp(1, len) - 1])
            })
            .collect();

        Some(TimingStats {
            mean: T::mean(self.sum, self.count),
            median,
            std: T::from_f64(variance.sqrt()),
            upper,
        })
    }

    pub(crate) fn render_into(
        &self,
        key: &str,
        epoch: Duration,
        sample_rate: f64,
        percentiles: &[f64],
        out: &mut Vec<WireLine>,
    ) {
        let per_second = match epoch.as_secs_f64() {
            secs if secs > 0.0 => self.count as f64 / secs,
            _ => self.count as f64,
        };

        let count = i64::try_from(self.count).unwrap_or(i64::MAX);

        out.push(
            WireLine::new(
                format!("{key}.count"),
                WireValue::Int(count),
                MetricType::Counter,
            )
            .sampled(sample_rate),
        );
        out.push(
            WireLine::new(
                format!("{key}.count_ps"),
                WireValue::Float(per_second),
                MetricType::Counter,
            )
            .sampled(sample_rate),
        );
        out.push(WireLine::new(
            format!("{key}.min"),
            self.min.to_wire(),
            MetricType::Timer,
        ));
        out.push(WireLine::new(
            format!("{key}.max"),
            self.max.to_wire(),
            MetricType::Timer,
        ));
        out.push(WireLine::new(
            format!("{key}.sum"),
            self.sum.to_wire(),
            MetricType::Counter,
        ));

        let Some(stats) = self.stats(percentiles) else {
            return;
        };

        out.push(WireLine::new(
            format!("{key}.mean"),
            stats.mean.to_wire(),
            MetricType::Timer,
        ));
        out.push(WireLine::new(
            format!("{key}.median"),
            stats.median.to_wire(),
            MetricType::Timer,
        ));
        out.push(WireLine::new(
            format!("{key}.std"),
            stats.std.to_wire(),
            MetricType::Timer,
        ));

        for (percentile, value) in stats.upper {
            let name = format_float(percentile).replace('.', "_");
            out.push(WireLine::new(
                format!("{key}.upper_{name}"),
                value.to_wire(),
                MetricType::Timer,
            ));
        }
    }
}

/// Statistics derived from a non-empty [`TimingValue`].
#[derive(Clone, Debug, PartialEq)]
pub struct TimingStats<T> {
    /// `sum / count`.
    pub mean: T,
    /// The middle observation, or the midpoint of the two middle observations.
    pub median: T,
    /// The population standard deviation.
    pub std: T,
    /// The nearest-rank value for each requested percentile.
    pub upper: Vec<(f64, T)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(values: &[i64]) -> TimingValue<i64> {
        let mut iter = values.iter().copied();
        let mut value = iter.next().map_or_else(TimingValue::empty, TimingValue::single);
        for v in iter {
            value.merge(TimingValue::single(v));
        }
        value
    }

    #[test]
    fn test_merge_tracks_extrema() {
        let value = timing(&[20, 10, 30]);
        assert_eq!(value.min, 10);
        assert_eq!(value.max, 30);
        assert_eq!(value.sum, 60);
        assert_eq!(value.count, 3);
        assert_eq!(value.values, vec![20, 10, 30]);
    }

    #[test]
    fn test_merge_after_reset() {
        let mut value = timing(&[1, 2]);
        value.reset();
        value.merge(TimingValue::single(50));

        assert_eq!(value.min, 50);
        assert_eq!(value.max, 50);
        assert_eq!(value.count, 1);
    }

    #[test]
    fn test_stats_odd() {
        let stats = timing(&[30, 10, 20]).stats(DEFAULT_PERCENTILES).unwrap();
        assert_eq!(stats.mean, 20);
        assert_eq!(stats.median, 20);
        // Population standard deviation of 10, 20, 30 is ~8.16.
        assert_eq!(stats.std, 8);
        assert_eq!(stats.upper, vec![(90.0, 30), (99.0, 30)]);
    }

    #[test]
    fn test_stats_even() {
        let stats = timing(&[4, 1, 3, 2]).stats(&[50.0]).unwrap();
        assert_eq!(stats.mean, 2);
        assert_eq!(stats.median, 2);
        assert_eq!(stats.upper, vec![(50.0, 2)]);
    }

    #[test]
    fn test_stats_float() {
        let mut value = TimingValue::single(1.5);
        value.merge(TimingValue::single(2.5));

        let stats = value.stats(&[]).unwrap();
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.median, 2.0);
        assert_eq!(stats.std, 0.5);
    }

    #[test]
    fn test_stats_empty() {
        assert_eq!(TimingValue::<i64>::empty().stats(DEFAULT_PERCENTILES), None);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let value = timing(&(1..=100).collect::<Vec<_>>());
        let stats = value.stats(&[90.0, 99.0, 99.9]).unwrap();
        assert_eq!(stats.upper, vec![(90.0, 90), (99.0, 99), (99.9, 100)]);
    }
}
