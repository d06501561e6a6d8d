use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use statsbuf_metrics::{Event, format_float};
use statsbuf_system::{Addr, Service, TrySendError};

use crate::collector::{Close, Collector, CollectorService, Flush, Ticker};
use crate::config::{Backpressure, BufferConfig, UpstreamConfig, replace_host, system_hostname};
use crate::flush::{FlushReport, Flusher};
use crate::sampler::{RandomSampler, Sampler};
use crate::telemetry::Telemetry;
use crate::upstream::{Transport, TransportError, Upstream};

/// An error returned by a [`Statsd`] client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client has been closed.
    #[error("statsd client is closed")]
    Closed,
    /// The collector thread panicked.
    #[error("statsd collector panicked: {0}")]
    CollectorPanicked(String),
    /// The collector thread could not be started.
    #[error("failed to spawn statsd collector")]
    Spawn(#[source] io::Error),
    /// The upstream could not be set up.
    #[error("failed to set up statsd upstream")]
    Transport(#[from] TransportError),
}

/// The capabilities of a statsd client.
///
/// All clients share this interface, so call sites can be written against `&dyn Statsd` or a
/// generic parameter and receive a [`NoopClient`] when metrics are not configured.
pub trait Statsd: Send + Sync {
    /// Increments a counter by `count`. A count of zero is ignored.
    fn incr(&self, key: &str, count: i64) -> Result<(), ClientError>;

    /// Decrements a counter by `count`. A count of zero is ignored.
    fn decr(&self, key: &str, count: i64) -> Result<(), ClientError>;

    /// Records a duration in whole milliseconds.
    fn timing(&self, key: &str, millis: i64) -> Result<(), ClientError>;

    /// Records a duration in whole milliseconds at the given sample rate.
    fn timing_sampled(&self, key: &str, millis: i64, rate: f64) -> Result<(), ClientError>;

    /// Records a duration with sub-millisecond precision.
    fn precision_timing(&self, key: &str, delta: Duration) -> Result<(), ClientError>;

    /// Records a duration with sub-millisecond precision at the given sample rate.
    fn precision_timing_sampled(
        &self,
        key: &str,
        delta: Duration,
        rate: f64,
    ) -> Result<(), ClientError>;

    /// Sets a gauge. The latest value within an epoch wins.
    fn gauge(&self, key: &str, value: i64) -> Result<(), ClientError>;

    /// Sets a gauge that keeps its value across idle epochs.
    fn gauge_absolute(&self, key: &str, value: i64) -> Result<(), ClientError>;

    /// Reports a gauge observation that is averaged within an epoch.
    fn gauge_avg(&self, key: &str, value: i64) -> Result<(), ClientError>;

    /// Adjusts a gauge by a signed delta.
    fn gauge_delta(&self, key: &str, delta: i64) -> Result<(), ClientError>;

    /// Sets a floating point gauge.
    fn fgauge(&self, key: &str, value: f64) -> Result<(), ClientError>;

    /// Adjusts a floating point gauge by a signed delta.
    fn fgauge_delta(&self, key: &str, delta: f64) -> Result<(), ClientError>;

    /// Reports a value that is sent individually rather than aggregated.
    fn absolute(&self, key: &str, value: i64) -> Result<(), ClientError>;

    /// Reports a floating point value that is sent individually rather than aggregated.
    fn fabsolute(&self, key: &str, value: f64) -> Result<(), ClientError>;

    /// Adds to a continuously increasing total.
    fn total(&self, key: &str, delta: i64) -> Result<(), ClientError>;

    /// Flushes pending metrics and shuts the client down.
    ///
    /// Blocks until the final flush has completed.
    fn close(&self) -> Result<(), ClientError>;
}

/// Builds a [`BufferedClient`] with a custom transport, sampler, or ticker.
///
/// # Example
///
/// ```
/// use statsbuf_statsd::{BufferConfig, BufferedClient, SinkTransport, Statsd};
///
/// let (rx, sink) = cadence::SpyMetricSink::new();
/// let client = BufferedClient::builder(SinkTransport::new(sink))
///     .config(BufferConfig::default())
///     .prefix("myapp.")
///     .build()
///     .unwrap();
///
/// client.incr("requests", 1).unwrap();
/// client.close().unwrap();
///
/// assert_eq!(rx.try_recv().unwrap(), b"myapp.requests:1|c\n");
/// ```
pub struct BufferedClientBuilder {
    config: BufferConfig,
    transport: Box<dyn Transport>,
    prefix: String,
    hostname: Option<String>,
    sampler: Arc<dyn Sampler>,
    ticker: Option<Ticker>,
}

impl BufferedClientBuilder {
    /// Sets the buffer configuration.
    pub fn config(mut self, config: BufferConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the prefix prepended to every metric name.
    ///
    /// The first occurrence of `%HOST%` is replaced with the hostname.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the hostname substituted for `%HOST%`.
    ///
    /// Defaults to the hostname reported by the operating system.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the sampler deciding which observations are recorded.
    ///
    /// Defaults to [`RandomSampler`].
    pub fn sampler(mut self, sampler: impl Sampler) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    /// Sets the source of flush ticks.
    ///
    /// Defaults to ticking at the configured flush interval.
    pub fn ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Starts the collector and returns the client.
    pub fn build(self) -> Result<BufferedClient, ClientError> {
        let Self {
            config,
            transport,
            prefix,
            hostname,
            sampler,
            ticker,
        } = self;

        let hostname = hostname.unwrap_or_else(system_hostname);
        let ticker = ticker.unwrap_or(Ticker::Interval(config.flush_interval()));
        let telemetry = config.telemetry.then(Telemetry::new);

        let flusher = Flusher::new(
            replace_host(&prefix, &hostname),
            config.flush_interval(),
            config.max_packet_size,
        )
        .sample_rates(config.sample_rate, config.timer_sample_rate)
        .percentiles(config.percentiles.clone())
        .retain_keys(config.retain_keys);

        let service = CollectorService::new(flusher, transport)
            .hostname(hostname)
            .ticker(ticker)
            .recycle_connection(config.recycle_connection)
            .telemetry(telemetry.clone());

        let (addr, handle) = service.start(config.queue_size).map_err(ClientError::Spawn)?;

        Ok(BufferedClient {
            addr,
            handle: Mutex::new(Some(handle)),
            sampler,
            sample_rate: config.sample_rate,
            timer_sample_rate: config.timer_sample_rate,
            backpressure: config.backpressure,
            telemetry,
        })
    }
}

impl fmt::Debug for BufferedClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedClientBuilder")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .field("hostname", &self.hostname)
            .field("ticker", &self.ticker)
            .finish_non_exhaustive()
    }
}

/// A statsd client aggregating metrics in memory before sending them.
///
/// Every call is sampled, turned into a single [`Event`], and sent to a collector thread. The
/// collector merges events with the same key and flushes the aggregates on every tick. Calls
/// never wait for the network, but may block while the collector inbox is full, see
/// [`Backpressure`].
///
/// The client is `Send + Sync` and can be shared between threads through an `Arc`. Dropping the
/// client without closing it flushes pending metrics in the background.
pub struct BufferedClient {
    addr: Addr<Collector>,
    handle: Mutex<Option<JoinHandle<()>>>,
    sampler: Arc<dyn Sampler>,
    sample_rate: f64,
    timer_sample_rate: f64,
    backpressure: Backpressure,
    telemetry: Option<Telemetry>,
}

impl BufferedClient {
    /// Connects to the configured upstream and starts the collector.
    pub fn new(upstream: &UpstreamConfig, config: &BufferConfig) -> Result<Self, ClientError> {
        let transport = Upstream::connect(&upstream.upstream)?;

        Self::builder(transport)
            .config(config.clone())
            .prefix(upstream.prefix.as_str())
            .hostname(upstream.hostname())
            .build()
    }

    /// Returns a builder sending datagrams through the given transport.
    pub fn builder(transport: impl Transport) -> BufferedClientBuilder {
        BufferedClientBuilder {
            config: BufferConfig::default(),
            transport: Box::new(transport),
            prefix: String::new(),
            hostname: None,
            sampler: Arc::new(RandomSampler),
            ticker: None,
        }
    }

    /// Flushes all accumulated metrics and waits for the datagrams to be sent.
    pub fn flush(&self) -> Result<FlushReport, ClientError> {
        let request = self.addr.send(Flush).map_err(|_| self.collector_gone())?;
        request.wait().map_err(|_| self.collector_gone())
    }

    /// Returns the telemetry snapshot maintained by the collector, if enabled.
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_ref()
    }

    fn submit(&self, rate: f64, event: impl FnOnce() -> Event) -> Result<(), ClientError> {
        if !self.sampler.should_fire(rate) {
            return Ok(());
        }

        let event = event();
        match self.backpressure {
            Backpressure::Block => self.addr.send(event).map_err(|_| self.collector_gone()),
            Backpressure::Drop => match self.addr.try_send(event) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full) => {
                    statsbuf_log::debug!("statsd collector inbox full, dropping event");
                    Ok(())
                }
                Err(TrySendError::Disconnected) => Err(self.collector_gone()),
            },
        }
    }

    /// Determines why the collector stopped accepting messages.
    fn collector_gone(&self) -> ClientError {
        let Some(handle) = self.handle.lock().take() else {
            return ClientError::Closed;
        };

        match handle.join() {
            Ok(()) => ClientError::Closed,
            Err(payload) => ClientError::CollectorPanicked(panic_message(payload)),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "unknown panic".to_owned(),
        },
    }
}

impl Statsd for BufferedClient {
    fn incr(&self, key: &str, count: i64) -> Result<(), ClientError> {
        if count == 0 {
            return Ok(());
        }
        self.submit(self.sample_rate, || Event::counter(key, count))
    }

    fn decr(&self, key: &str, count: i64) -> Result<(), ClientError> {
        if count == 0 {
            return Ok(());
        }
        self.submit(self.sample_rate, || {
            Event::counter(key, count.saturating_neg())
        })
    }

    fn timing(&self, key: &str, millis: i64) -> Result<(), ClientError> {
        self.submit(self.timer_sample_rate, || Event::timing(key, millis))
    }

    fn timing_sampled(&self, key: &str, millis: i64, rate: f64) -> Result<(), ClientError> {
        self.submit(rate, || Event::timing(key, millis))
    }

    fn precision_timing(&self, key: &str, delta: Duration) -> Result<(), ClientError> {
        self.submit(self.timer_sample_rate, || Event::precision_timing(key, delta))
    }

    fn precision_timing_sampled(
        &self,
        key: &str,
        delta: Duration,
        rate: f64,
    ) -> Result<(), ClientError> {
        self.submit(rate, || Event::precision_timing(key, delta))
    }

    fn gauge(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::gauge(key, value))
    }

    fn gauge_absolute(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::gauge_absolute(key, value))
    }

    fn gauge_avg(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::gauge_avg(key, value))
    }

    fn gauge_delta(&self, key: &str, delta: i64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::gauge_delta(key, delta))
    }

    fn fgauge(&self, key: &str, value: f64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::fgauge(key, value))
    }

    fn fgauge_delta(&self, key: &str, delta: f64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::fgauge_delta(key, delta))
    }

    fn absolute(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::absolute(key, value))
    }

    fn fabsolute(&self, key: &str, value: f64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::fabsolute(key, value))
    }

    fn total(&self, key: &str, delta: i64) -> Result<(), ClientError> {
        self.submit(self.sample_rate, || Event::total(key, delta))
    }

    fn close(&self) -> Result<(), ClientError> {
        let request = self.addr.send(Close).map_err(|_| self.collector_gone())?;

        match request.wait() {
            Ok(report) => {
                statsbuf_log::debug!(
                    events = report.events,
                    packets = report.packets,
                    "statsd client closed"
                );
                // The collector exits right after responding. Wait for it, so that a
                // subsequent call reliably fails with `Closed`.
                match self.collector_gone() {
                    ClientError::Closed => Ok(()),
                    error => Err(error),
                }
            }
            Err(_) => Err(self.collector_gone()),
        }
    }
}

impl fmt::Debug for BufferedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedClient")
            .field("addr", &self.addr)
            .field("sample_rate", &self.sample_rate)
            .field("timer_sample_rate", &self.timer_sample_rate)
            .field("backpressure", &self.backpressure)
            .finish_non_exhaustive()
    }
}

/// A client that accepts every call and does nothing.
///
/// Use this where metrics are optional and have not been configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClient;

impl Statsd for NoopClient {
    fn incr(&self, _key: &str, _count: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn decr(&self, _key: &str, _count: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn timing(&self, _key: &str, _millis: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn timing_sampled(&self, _key: &str, _millis: i64, _rate: f64) -> Result<(), ClientError> {
        Ok(())
    }

    fn precision_timing(&self, _key: &str, _delta: Duration) -> Result<(), ClientError> {
        Ok(())
    }

    fn precision_timing_sampled(
        &self,
        _key: &str,
        _delta: Duration,
        _rate: f64,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    fn gauge(&self, _key: &str, _value: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn gauge_absolute(&self, _key: &str, _value: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn gauge_avg(&self, _key: &str, _value: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn gauge_delta(&self, _key: &str, _delta: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn fgauge(&self, _key: &str, _value: f64) -> Result<(), ClientError> {
        Ok(())
    }

    fn fgauge_delta(&self, _key: &str, _delta: f64) -> Result<(), ClientError> {
        Ok(())
    }

    fn absolute(&self, _key: &str, _value: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn fabsolute(&self, _key: &str, _value: f64) -> Result<(), ClientError> {
        Ok(())
    }

    fn total(&self, _key: &str, _delta: i64) -> Result<(), ClientError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// A client that logs every call as `key:value` at info level.
///
/// Nothing is aggregated or sent. Useful to inspect instrumentation during development.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoClient;

impl EchoClient {
    fn echo(&self, key: &str, value: impl fmt::Display) -> Result<(), ClientError> {
        statsbuf_log::info!("{key}:{value}");
        Ok(())
    }
}

impl Statsd for EchoClient {
    fn incr(&self, key: &str, count: i64) -> Result<(), ClientError> {
        self.echo(key, count)
    }

    fn decr(&self, key: &str, count: i64) -> Result<(), ClientError> {
        self.echo(key, count.saturating_neg())
    }

    fn timing(&self, key: &str, millis: i64) -> Result<(), ClientError> {
        self.echo(key, millis)
    }

    fn timing_sampled(&self, key: &str, millis: i64, _rate: f64) -> Result<(), ClientError> {
        self.echo(key, millis)
    }

    fn precision_timing(&self, key: &str, delta: Duration) -> Result<(), ClientError> {
        self.echo(key, format_float(delta.as_secs_f64() * 1000.0))
    }

    fn precision_timing_sampled(
        &self,
        key: &str,
        delta: Duration,
        _rate: f64,
    ) -> Result<(), ClientError> {
        self.precision_timing(key, delta)
    }

    fn gauge(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.echo(key, value)
    }

    fn gauge_absolute(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.echo(key, value)
    }

    fn gauge_avg(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.echo(key, value)
    }

    fn gauge_delta(&self, key: &str, delta: i64) -> Result<(), ClientError> {
        self.echo(key, format_args!("{delta:+}"))
    }

    fn fgauge(&self, key: &str, value: f64) -> Result<(), ClientError> {
        self.echo(key, format_float(value))
    }

    fn fgauge_delta(&self, key: &str, delta: f64) -> Result<(), ClientError> {
        self.echo(key, format_float(delta))
    }

    fn absolute(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.echo(key, value)
    }

    fn fabsolute(&self, key: &str, value: f64) -> Result<(), ClientError> {
        self.echo(key, format_float(value))
    }

    fn total(&self, key: &str, delta: i64) -> Result<(), ClientError> {
        self.echo(key, delta)
    }

    fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// A call captured by the [`RecordingClient`].
#[cfg(any(test, feature = "test"))]
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum RecordedCall {
    Incr(String, i64),
    Decr(String, i64),
    Timing(String, i64),
    TimingSampled(String, i64, f64),
    PrecisionTiming(String, Duration),
    PrecisionTimingSampled(String, Duration, f64),
    Gauge(String, i64),
    GaugeAbsolute(String, i64),
    GaugeAvg(String, i64),
    GaugeDelta(String, i64),
    FGauge(String, f64),
    FGaugeDelta(String, f64),
    Absolute(String, i64),
    FAbsolute(String, f64),
    Total(String, i64),
    Close,
}

/// A client that records every call for assertions in tests.
///
/// # Example
///
/// ```
/// use statsbuf_statsd::{RecordedCall, RecordingClient, Statsd};
///
/// let client = RecordingClient::new();
/// client.incr("requests", 1).unwrap();
///
/// assert_eq!(client.take(), vec![RecordedCall::Incr("requests".to_owned(), 1)]);
/// ```
#[cfg(any(test, feature = "test"))]
#[derive(Debug, Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<RecordedCall>>,
}

#[cfg(any(test, feature = "test"))]
impl RecordingClient {
    /// Creates a client without recorded calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all calls recorded so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns all calls recorded so far and clears the record.
    pub fn take(&self) -> Vec<RecordedCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: RecordedCall) -> Result<(), ClientError> {
        self.calls.lock().push(call);
        Ok(())
    }
}

#[cfg(any(test, feature = "test"))]
impl Statsd for RecordingClient {
    fn incr(&self, key: &str, count: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::Incr(key.to_owned(), count))
    }

    fn decr(&self, key: &str, count: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::Decr(key.to_owned(), count))
    }

    fn timing(&self, key: &str, millis: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::Timing(key.to_owned(), millis))
    }

    fn timing_sampled(&self, key: &str, millis: i64, rate: f64) -> Result<(), ClientError> {
        self.record(RecordedCall::TimingSampled(key.to_owned(), millis, rate))
    }

    fn precision_timing(&self, key: &str, delta: Duration) -> Result<(), ClientError> {
        self.record(RecordedCall::PrecisionTiming(key.to_owned(), delta))
    }

    fn precision_timing_sampled(
        &self,
        key: &str,
        delta: Duration,
        rate: f64,
    ) -> Result<(), ClientError> {
        self.record(RecordedCall::PrecisionTimingSampled(
            key.to_owned(),
            delta,
            rate,
        ))
    }

    fn gauge(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::Gauge(key.to_owned(), value))
    }

    fn gauge_absolute(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::GaugeAbsolute(key.to_owned(), value))
    }

    fn gauge_avg(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::GaugeAvg(key.to_owned(), value))
    }

    fn gauge_delta(&self, key: &str, delta: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::GaugeDelta(key.to_owned(), delta))
    }

    fn fgauge(&self, key: &str, value: f64) -> Result<(), ClientError> {
        self.record(RecordedCall::FGauge(key.to_owned(), value))
    }

    fn fgauge_delta(&self, key: &str, delta: f64) -> Result<(), ClientError> {
        self.record(RecordedCall::FGaugeDelta(key.to_owned(), delta))
    }

    fn absolute(&self, key: &str, value: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::Absolute(key.to_owned(), value))
    }

    fn fabsolute(&self, key: &str, value: f64) -> Result<(), ClientError> {
        self.record(RecordedCall::FAbsolute(key.to_owned(), value))
    }

    fn total(&self, key: &str, delta: i64) -> Result<(), ClientError> {
        self.record(RecordedCall::Total(key.to_owned(), delta))
    }

    fn close(&self) -> Result<(), ClientError> {
        self.record(RecordedCall::Close)
    }
}
