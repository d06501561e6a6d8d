//! The service owning all accumulated events.
//!
//! Producers never touch the aggregation map. Every observation is sent as a message to the
//! [`CollectorService`], which merges it on its own thread and periodically hands the map to the
//! [`Flusher`]. Flushes run synchronously within the service loop, so the map is never mutated
//! while it is being rendered.

use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use statsbuf_metrics::Event;
use statsbuf_system::{
    BlockingResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
};

use crate::config::{HOST_PLACEHOLDER, replace_host};
use crate::flush::{FlushReport, Flusher};
use crate::telemetry::{Observation, Telemetry};
use crate::upstream::Transport;

/// Flushes all accumulated events immediately.
///
/// The response is sent after all datagrams have been handed to the transport.
#[derive(Clone, Copy, Debug)]
pub struct Flush;

/// Flushes all accumulated events and stops the collector.
///
/// Events sent before the close are merged before the final flush. The response is sent once
/// the final flush has completed.
#[derive(Clone, Copy, Debug)]
pub struct Close;

/// The interface of the [`CollectorService`].
#[derive(Debug)]
pub enum Collector {
    /// Merges a single observation.
    Ingest(Event),
    /// Flushes immediately. See [`Flush`].
    Flush(Flush, Sender<FlushReport>),
    /// Flushes and shuts down. See [`Close`].
    Close(Close, Sender<FlushReport>),
}

impl Interface for Collector {}

impl FromMessage<Event> for Collector {
    type Response = NoResponse;

    fn from_message(message: Event, _: ()) -> Self {
        Self::Ingest(message)
    }
}

impl FromMessage<Flush> for Collector {
    type Response = BlockingResponse<FlushReport>;

    fn from_message(message: Flush, sender: Sender<FlushReport>) -> Self {
        Self::Flush(message, sender)
    }
}

impl FromMessage<Close> for Collector {
    type Response = BlockingResponse<FlushReport>;

    fn from_message(message: Close, sender: Sender<FlushReport>) -> Self {
        Self::Close(message, sender)
    }
}

/// The source of flush ticks.
#[derive(Debug)]
pub enum Ticker {
    /// Ticks at a fixed interval.
    ///
    /// Ticks that elapse during a slow flush are coalesced. A zero interval never ticks.
    Interval(Duration),
    /// Ticks whenever a value is sent on the channel.
    ///
    /// Dropping the sending half stops ticking. Flushes can still be requested with [`Flush`].
    Manual(crossbeam_channel::Receiver<Instant>),
}

impl Ticker {
    fn into_receiver(self) -> crossbeam_channel::Receiver<Instant> {
        match self {
            Self::Interval(interval) if interval.is_zero() => crossbeam_channel::never(),
            Self::Interval(interval) => crossbeam_channel::tick(interval),
            Self::Manual(rx) => rx,
        }
    }
}

/// Accumulates events and flushes them on every tick.
///
/// If the service panics, it attempts one last flush of all pending events before the panic
/// continues to unwind. Events emitted before the panic have already left the map and are not
/// sent again.
pub struct CollectorService {
    events: HashMap<String, Event>,
    flusher: Flusher,
    transport: Box<dyn Transport>,
    ticker: Ticker,
    hostname: String,
    recycle_connection: bool,
    telemetry: Option<Telemetry>,
}

impl CollectorService {
    /// Creates a new collector sending through `transport`.
    ///
    /// Without further configuration, the collector flushes once per second.
    pub fn new(flusher: Flusher, transport: impl Transport) -> Self {
        Self {
            events: HashMap::new(),
            flusher,
            transport: Box::new(transport),
            ticker: Ticker::Interval(Duration::from_secs(1)),
            hostname: String::new(),
            recycle_connection: false,
            telemetry: None,
        }
    }

    /// Sets the hostname substituted for `%HOST%` in event keys.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the source of flush ticks.
    pub fn ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = ticker;
        self
    }

    /// Reconnects the transport before every flush.
    pub fn recycle_connection(mut self, recycle_connection: bool) -> Self {
        self.recycle_connection = recycle_connection;
        self
    }

    /// Records every merged observation into the given telemetry.
    pub fn telemetry(mut self, telemetry: Option<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn ingest(&mut self, mut event: Event) {
        if event.key().contains(HOST_PLACEHOLDER) {
            let key = replace_host(event.key(), &self.hostname);
            event.set_key(key);
        }

        let observation = match self.telemetry {
            Some(_) => Observation::from_event(&event),
            None => None,
        };
        let class = event.stat_class();
        let key = event.key().to_owned();

        match self.events.get_mut(&key) {
            Some(existing) => {
                if let Err(conflict) = existing.merge(event) {
                    statsbuf_log::error!(
                        error = &conflict as &dyn std::error::Error,
                        "dropping statsd event"
                    );
                    return;
                }
            }
            None => {
                self.events.insert(key.clone(), event);
            }
        }

        if let (Some(telemetry), Some(observation)) = (&self.telemetry, observation) {
            telemetry.record(class, &key, observation);
        }
    }

    fn flush(&mut self) -> FlushReport {
        if self.events.is_empty() && !self.flusher.has_pending() {
            return FlushReport::default();
        }

        if self.recycle_connection {
            if let Err(error) = self.transport.reconnect() {
                statsbuf_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to reconnect to statsd upstream"
                );
            }
        }

        let report = self.flusher.flush(&mut self.events, self.transport.as_mut());

        statsbuf_log::trace!(
            events = report.events,
            lines = report.lines,
            packets = report.packets,
            failed_packets = report.failed_packets,
            "flushed statsd events"
        );

        report
    }

    fn handle_message(&mut self, message: Collector) -> ControlFlow<()> {
        match message {
            Collector::Ingest(event) => self.ingest(event),
            Collector::Flush(Flush, sender) => sender.send(self.flush()),
            Collector::Close(Close, sender) => {
                let report = self.flush();
                statsbuf_log::debug!(events = report.events, "statsd collector closed");
                sender.send(report);
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    fn run(&mut self, rx: &Receiver<Collector>, mut ticks: crossbeam_channel::Receiver<Instant>) {
        loop {
            let flow = crossbeam_channel::select! {
                recv(rx.inner()) -> message => match message {
                    Ok(message) => self.handle_message(message),
                    Err(_) => {
                        // All clients are gone without closing.
                        self.flush();
                        ControlFlow::Break(())
                    }
                },
                recv(ticks) -> tick => {
                    match tick {
                        Ok(_) => {
                            self.flush();
                        }
                        Err(_) => ticks = crossbeam_channel::never(),
                    }
                    ControlFlow::Continue(())
                },
            };

            if flow.is_break() {
                break;
            }
        }
    }
}

impl Service for CollectorService {
    type Interface = Collector;

    fn spawn_handler(mut self, rx: Receiver<Self::Interface>) -> io::Result<JoinHandle<()>> {
        let ticker = std::mem::replace(&mut self.ticker, Ticker::Manual(crossbeam_channel::never()));

        thread::Builder::new()
            .name("statsbuf-collector".to_owned())
            .spawn(move || {
                let ticks = ticker.into_receiver();
                let result = panic::catch_unwind(AssertUnwindSafe(|| self.run(&rx, ticks)));

                if let Err(payload) = result {
                    statsbuf_log::error!(
                        pending = self.events.len(),
                        "statsd collector panicked, flushing pending events"
                    );
                    let flushed = panic::catch_unwind(AssertUnwindSafe(|| self.flush()));
                    if flushed.is_err() {
                        statsbuf_log::error!("failed to flush pending events after panic");
                    }
                    panic::resume_unwind(payload);
                }
            })
    }

    fn name() -> &'static str {
        "collector"
    }
}

impl std::fmt::Debug for CollectorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorService")
            .field("events", &self.events.len())
            .field("flusher", &self.flusher)
            .field("ticker", &self.ticker)
            .field("hostname", &self.hostname)
            .field("recycle_connection", &self.recycle_connection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use statsbuf_metrics::StatClass;
    use statsbuf_system::Addr;

    use crate::telemetry::TelemetryValue;
    use crate::upstream::TransportError;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedTransport {
        packets: Arc<Mutex<Vec<String>>>,
        reconnects: Arc<Mutex<usize>>,
    }

    impl SharedTransport {
        fn lines(&self) -> Vec<String> {
            let mut lines: Vec<_> = self
                .packets
                .lock()
                .iter()
                .flat_map(|packet| packet.lines().map(str::to_owned).collect::<Vec<_>>())
                .collect();
            lines.sort();
            lines
        }
    }

    impl Transport for SharedTransport {
        fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
            self.packets
                .lock()
                .push(String::from_utf8_lossy(packet).into_owned());
            Ok(())
        }

        fn reconnect(&mut self) -> Result<(), TransportError> {
            *self.reconnects.lock() += 1;
            Ok(())
        }
    }

    fn start(service: CollectorService) -> (Addr<Collector>, JoinHandle<()>) {
        service
            .ticker(Ticker::Manual(crossbeam_channel::never()))
            .start(16)
            .unwrap()
    }

    fn flusher() -> Flusher {
        Flusher::new("", Duration::from_secs(1), 512)
    }

    #[test]
    fn test_merge_and_flush() {
        statsbuf_log::init_test!();

        let transport = SharedTransport::default();
        let (addr, handle) = start(CollectorService::new(flusher(), transport.clone()));

        addr.send(Event::counter("a", 5)).unwrap();
        addr.send(Event::counter("a", -2)).unwrap();
        addr.send(Event::counter("b", 1)).unwrap();
        let report = addr.send(Flush).unwrap().wait().unwrap();

        assert_eq!(report.events, 2);
        assert_eq!(transport.lines(), ["a:3|c", "b:1|c"]);

        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_type_conflict_keeps_existing() {
        statsbuf_log::init_test!();

        let transport = SharedTransport::default();
        let (addr, handle) = start(CollectorService::new(flusher(), transport.clone()));

        addr.send(Event::counter("a", 2)).unwrap();
        addr.send(Event::gauge("a", 100)).unwrap();
        addr.send(Event::counter("a", 1)).unwrap();
        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();

        assert_eq!(transport.lines(), ["a:3|c"]);
    }

    #[test]
    fn test_host_placeholder_resolved_once() {
        let transport = SharedTransport::default();
        let service = CollectorService::new(flusher(), transport.clone()).hostname("web1");
        let (addr, handle) = start(service);

        addr.send(Event::counter("req.%HOST%.%HOST%", 1)).unwrap();
        addr.send(Event::counter("req.%HOST%.%HOST%", 1)).unwrap();
        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();

        assert_eq!(transport.lines(), ["req.web1.%HOST%:2|c"]);
    }

    #[test]
    fn test_ticks_flush() {
        let transport = SharedTransport::default();
        let (tick_tx, tick_rx) = crossbeam_channel::bounded(1);
        let (addr, handle) = CollectorService::new(flusher(), transport.clone())
            .ticker(Ticker::Manual(tick_rx))
            .start(16)
            .unwrap();

        addr.send(Event::gauge("level", 7)).unwrap();

        // The tick may be handled before the event, so keep ticking until something is sent.
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.packets.lock().is_empty() {
            assert!(Instant::now() < deadline, "tick did not flush");
            tick_tx.try_send(Instant::now()).ok();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(transport.lines(), ["level:7|g"]);

        // Closed ticker, the collector keeps handling messages.
        drop(tick_tx);
        addr.send(Event::gauge("level", 8)).unwrap();
        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();

        assert_eq!(transport.lines(), ["level:7|g", "level:8|g"]);
    }

    #[test]
    fn test_dropped_addr_flushes() {
        let transport = SharedTransport::default();
        let (addr, handle) = start(CollectorService::new(flusher(), transport.clone()));

        addr.send(Event::total("bytes", 42)).unwrap();
        drop(addr);
        handle.join().unwrap();

        assert_eq!(transport.lines(), ["bytes:42|t"]);
    }

    #[test]
    fn test_recycle_connection() {
        let transport = SharedTransport::default();
        let service = CollectorService::new(flusher(), transport.clone()).recycle_connection(true);
        let (addr, handle) = start(service);

        // Empty flushes do not reconnect.
        addr.send(Flush).unwrap().wait().unwrap();
        addr.send(Event::counter("a", 1)).unwrap();
        addr.send(Flush).unwrap().wait().unwrap();
        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();

        assert_eq!(*transport.reconnects.lock(), 1);
    }

    #[test]
    fn test_telemetry() {
        let telemetry = Telemetry::new();
        let service = CollectorService::new(flusher(), SharedTransport::default())
            .telemetry(Some(telemetry.clone()));
        let (addr, handle) = start(service);

        addr.send(Event::counter("hits", 2)).unwrap();
        addr.send(Event::counter("hits", 3)).unwrap();
        // Conflicting events are not recorded.
        addr.send(Event::gauge("hits", 100)).unwrap();
        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();

        assert_eq!(
            telemetry.get(StatClass::Counter, "hits"),
            Some(TelemetryValue::Int(5))
        );
        assert_eq!(telemetry.get(StatClass::Gauge, "hits"), None);
    }

    #[test]
    fn test_telemetry_outlives_flush() {
        let telemetry = Telemetry::new();
        let service = CollectorService::new(flusher(), SharedTransport::default())
            .telemetry(Some(telemetry.clone()));
        let (addr, handle) = start(service);

        addr.send(Event::gauge("level", 4)).unwrap();
        addr.send(Flush).unwrap().wait().unwrap();
        addr.send(Event::counter("hits", 1)).unwrap();
        addr.send(Close).unwrap().wait().unwrap();
        handle.join().unwrap();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.gauges.get("level"), Some(&TelemetryValue::Int(4)));
        assert_eq!(snapshot.counters.get("hits"), Some(&TelemetryValue::Int(1)));
    }

    #[test]
    fn test_panic_flushes_pending() {
        #[derive(Clone, Default)]
        struct PanicOnce {
            inner: SharedTransport,
            panicked: Arc<Mutex<bool>>,
        }

        impl Transport for PanicOnce {
            fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
                let mut panicked = self.panicked.lock();
                if !*panicked {
                    *panicked = true;
                    drop(panicked);
                    panic!("transport exploded");
                }
                drop(panicked);
                self.inner.send(packet)
            }
        }

        let transport = PanicOnce::default();
        let (addr, handle) = start(CollectorService::new(flusher(), transport.clone()));

        addr.send(Event::counter("a", 1)).unwrap();
        let request = addr.send(Flush).unwrap();
        assert!(request.wait().is_err());

        let payload = handle.join().unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"transport exploded"));
        assert_eq!(transport.inner.lines(), ["a:1|c"]);
    }

    #[test]
    fn test_panic_mid_flush_sends_each_line_once() {
        #[derive(Clone, Default)]
        struct PanicOnSecondSend {
            inner: SharedTransport,
            sends: Arc<Mutex<usize>>,
        }

        impl Transport for PanicOnSecondSend {
            fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
                let sends = {
                    let mut sends = self.sends.lock();
                    *sends += 1;
                    *sends
                };
                if sends == 2 {
                    panic!("transport exploded");
                }
                self.inner.send(packet)
            }
        }

        let transport = PanicOnSecondSend::default();
        // Every line fills a packet on its own.
        let flusher = Flusher::new("", Duration::from_secs(1), 7);
        let (addr, handle) = start(CollectorService::new(flusher, transport.clone()));

        for key in ["k0", "k1", "k2"] {
            addr.send(Event::counter(key, 1)).unwrap();
        }
        assert!(addr.send(Flush).unwrap().wait().is_err());
        assert!(handle.join().is_err());

        assert_eq!(transport.inner.lines(), ["k0:1|c", "k1:1|c", "k2:1|c"]);
    }

    #[test]
    fn test_failed_reconnect_still_flushes() {
        #[derive(Clone, Default)]
        struct Unreachable {
            inner: SharedTransport,
        }

        impl Transport for Unreachable {
            fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
                self.inner.send(packet)
            }

            fn reconnect(&mut self) -> Result<(), TransportError> {
                *self.inner.reconnects.lock() += 1;
                Err(TransportError::NotConnected)
            }
        }

        let transport = Unreachable::default();
        let service = CollectorService::new(flusher(), transport.clone()).recycle_connection(true);
        let (addr, handle) = start(service);

        addr.send(Event::counter("a", 1)).unwrap();
        addr.send(Event::gauge("b", 2)).unwrap();
        let report = addr.send(Flush).unwrap().wait().unwrap();

        assert_eq!(*transport.inner.reconnects.lock(), 1);
        assert_eq!(report.events, 2);
        assert_eq!(report.packets, 1);
        assert_eq!(report.failed_packets, 0);
        assert_eq!(transport.inner.lines(), ["a:1|c", "b:2|g"]);

        // Entries were evicted, so closing has nothing left to send.
        let report = addr.send(Close).unwrap().wait().unwrap();
        assert_eq!(report, FlushReport::default());
        handle.join().unwrap();
        assert_eq!(*transport.inner.reconnects.lock(), 1);
    }
}
