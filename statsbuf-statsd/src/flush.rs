use std::collections::HashMap;
use std::time::Duration;

use statsbuf_metrics::{Event, RenderContext, WireLine};

use crate::upstream::Transport;

/// Summary of a single flush.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushReport {
    /// Number of accumulated events that were rendered.
    pub events: usize,
    /// Number of wire lines produced.
    pub lines: usize,
    /// Number of datagrams handed to the transport.
    pub packets: usize,
    /// Number of datagrams the transport failed to send.
    pub failed_packets: usize,
}

/// Renders accumulated events and packs the wire lines into datagrams.
///
/// Every line is written as `<prefix><line>\n`. Lines are appended to the current datagram until
/// the next line would exceed `max_packet_size`, at which point the datagram is sent and a new one
/// is started. A single line larger than the limit is sent in a datagram on its own.
#[derive(Debug)]
pub struct Flusher {
    prefix: String,
    epoch: Duration,
    max_packet_size: usize,
    sample_rate: f64,
    timer_sample_rate: f64,
    percentiles: Vec<f64>,
    retain_keys: bool,
    buffer: Vec<u8>,
    lines: Vec<WireLine>,
}

impl Flusher {
    /// Creates a new flusher.
    ///
    /// The prefix is used as given, placeholders must already be resolved.
    pub fn new(prefix: impl Into<String>, epoch: Duration, max_packet_size: usize) -> Self {
        Self {
            prefix: prefix.into(),
            epoch,
            max_packet_size,
            sample_rate: 1.0,
            timer_sample_rate: 1.0,
            percentiles: statsbuf_metrics::DEFAULT_PERCENTILES.to_vec(),
            retain_keys: false,
            buffer: Vec::with_capacity(max_packet_size),
            lines: Vec::new(),
        }
    }

    /// Sets the sample rates annotated on non-timing and timing lines.
    pub fn sample_rates(mut self, sample_rate: f64, timer_sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self.timer_sample_rate = timer_sample_rate;
        self
    }

    /// Sets the percentiles emitted for timings.
    pub fn percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.percentiles = percentiles;
        self
    }

    /// Resets events after a flush instead of removing them.
    pub fn retain_keys(mut self, retain_keys: bool) -> Self {
        self.retain_keys = retain_keys;
        self
    }

    /// Renders and sends all events, removing or resetting each one once its lines are handed to
    /// the transport.
    ///
    /// Send failures are logged and counted in the report. They never abort the flush. If the
    /// flush is interrupted by a panic, every emitted event has already been removed or reset, so a
    /// subsequent flush never repeats an accumulated value.
    pub fn flush<T>(&mut self, events: &mut HashMap<String, Event>, transport: &mut T) -> FlushReport
    where
        T: Transport + ?Sized,
    {
        let mut report = FlushReport {
            events: events.len(),
            ..Default::default()
        };

        let retain_keys = self.retain_keys;
        events.retain(|_, event| {
            self.flush_event(event, transport, &mut report);

            if retain_keys {
                event.reset();
            }
            retain_keys
        });

        self.send_buffer(transport, &mut report);
        report
    }

    /// Returns `true` if lines of an interrupted flush are still waiting to be sent.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn flush_event<T>(&mut self, event: &Event, transport: &mut T, report: &mut FlushReport)
    where
        T: Transport + ?Sized,
    {
        let sample_rate = match event.is_timer() {
            true => self.timer_sample_rate,
            false => self.sample_rate,
        };

        let context = RenderContext {
            epoch: self.epoch,
            sample_rate,
            percentiles: &self.percentiles,
        };

        self.lines.clear();
        event.render_into(&context, &mut self.lines);
        report.lines += self.lines.len();

        for index in 0..self.lines.len() {
            let line = self.lines[index].to_wire(&self.prefix);
            self.submit(line.as_bytes(), transport, report);
        }
    }

    fn submit<T>(&mut self, line: &[u8], transport: &mut T, report: &mut FlushReport)
    where
        T: Transport + ?Sized,
    {
        let line_len = line.len() + 1;

        if self.buffer.len() + line_len > self.max_packet_size {
            // Line does not fit into the remaining space. Flush the buffer.
            self.send_buffer(transport, report);
        }

        self.buffer.extend_from_slice(line);
        self.buffer.push(b'\n');

        if self.buffer.len() >= self.max_packet_size {
            // Line too big for a datagram on its own, or exactly filling it.
            self.send_buffer(transport, report);
        }
    }

    fn send_buffer<T>(&mut self, transport: &mut T, report: &mut FlushReport)
    where
        T: Transport + ?Sized,
    {
        if self.buffer.is_empty() {
            return;
        }

        // The packet leaves the buffer before the send, so it is never sent twice.
        let mut packet = std::mem::take(&mut self.buffer);

        report.packets += 1;
        if let Err(error) = transport.send(&packet) {
            report.failed_packets += 1;
            statsbuf_log::warn!(
                error = &error as &dyn std::error::Error,
                packet_size = packet.len(),
                "failed to send metrics packet"
            );
        }

        packet.clear();
        self.buffer = packet;
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use similar_asserts::assert_eq;

    use crate::upstream::TransportError;

    use super::*;

    #[derive(Default)]
    struct TestTransport {
        packets: Vec<String>,
        fail: usize,
        panic_on: Option<usize>,
        sends: usize,
    }

    impl Transport for TestTransport {
        fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
            self.sends += 1;
            if self.panic_on == Some(self.sends) {
                panic!("transport exploded");
            }

            if self.fail > 0 {
                self.fail -= 1;
                return Err(TransportError::NotConnected);
            }

            self.packets
                .push(String::from_utf8_lossy(packet).into_owned());
            Ok(())
        }
    }

    fn events(list: impl IntoIterator<Item = Event>) -> HashMap<String, Event> {
        list.into_iter()
            .map(|event| (event.key().to_owned(), event))
            .collect()
    }

    #[test]
    fn test_prefix_and_newline() {
        let mut flusher = Flusher::new("app.", Duration::from_secs(1), 512);
        let mut transport = TestTransport::default();
        let mut map = events([Event::counter("hits", 3)]);

        let report = flusher.flush(&mut map, &mut transport);

        assert_eq!(transport.packets, vec!["app.hits:3|c\n".to_owned()]);
        assert_eq!(
            report,
            FlushReport {
                events: 1,
                lines: 1,
                packets: 1,
                failed_packets: 0,
            }
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_packets_are_bounded() {
        // Each line is "kN:1|c\n", 7 bytes. Two lines fit into 16 bytes, three do not.
        let mut flusher = Flusher::new("", Duration::from_secs(1), 16);
        let mut transport = TestTransport::default();
        let mut map = events((0..5).map(|i| Event::counter(format!("k{i}"), 1)));

        let report = flusher.flush(&mut map, &mut transport);

        assert_eq!(report.lines, 5);
        assert_eq!(report.packets, 3);
        for packet in &transport.packets {
            assert!(packet.len() <= 16, "packet too large: {packet:?}");
        }

        let mut lines: Vec<_> = transport
            .packets
            .iter()
            .flat_map(|packet| packet.lines())
            .collect();
        lines.sort();
        assert_eq!(lines, ["k0:1|c", "k1:1|c", "k2:1|c", "k3:1|c", "k4:1|c"]);
    }

    #[test]
    fn test_oversized_line() {
        let mut flusher = Flusher::new("", Duration::from_secs(1), 8);
        let mut transport = TestTransport::default();
        let mut map = events([Event::counter("a_rather_long_metric_name", 1)]);

        flusher.flush(&mut map, &mut transport);

        assert_eq!(
            transport.packets,
            vec!["a_rather_long_metric_name:1|c\n".to_owned()]
        );
    }

    #[test]
    fn test_send_failure_continues() {
        let mut flusher = Flusher::new("", Duration::from_secs(1), 7);
        let mut transport = TestTransport {
            fail: 1,
            ..Default::default()
        };
        let mut map = events([Event::counter("a", 1), Event::counter("b", 1)]);

        let report = flusher.flush(&mut map, &mut transport);

        assert_eq!(report.packets, 2);
        assert_eq!(report.failed_packets, 1);
        assert_eq!(transport.packets.len(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_retain_keys_resets() {
        let mut flusher = Flusher::new("", Duration::from_secs(1), 512).retain_keys(true);
        let mut transport = TestTransport::default();
        let mut map = events([Event::counter("hits", 3), Event::gauge_absolute("level", 4)]);

        flusher.flush(&mut map, &mut transport);
        flusher.flush(&mut map, &mut transport);

        assert_eq!(map.len(), 2);
        let mut second: Vec<_> = transport.packets[1].lines().collect();
        second.sort();
        assert_eq!(second, ["hits:0|c", "level:4|g"]);
    }

    #[test]
    fn test_timer_sample_rate() {
        let mut flusher =
            Flusher::new("", Duration::from_secs(1), 512).sample_rates(0.5, 0.25).percentiles(vec![]);
        let mut transport = TestTransport::default();
        let mut map = events([Event::counter("hits", 1)]);
        flusher.flush(&mut map, &mut transport);

        let mut map = events([Event::timing("req", 5)]);
        flusher.flush(&mut map, &mut transport);

        assert_eq!(transport.packets[0], "hits:1|c|@0.5\n");
        let lines: Vec<_> = transport.packets[1].lines().collect();
        assert_eq!(
            lines,
            [
                "req.count:1|c|@0.25",
                "req.count_ps:1|c|@0.25",
                "req.min:5|ms",
                "req.max:5|ms",
                "req.sum:5|c",
                "req.mean:5|ms",
                "req.median:5|ms",
                "req.std:0|ms",
            ]
        );
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let mut flusher = Flusher::new("", Duration::from_secs(1), 512);
        let mut transport = TestTransport::default();
        let report = flusher.flush(&mut HashMap::new(), &mut transport);

        assert_eq!(report, FlushReport::default());
        assert!(transport.packets.is_empty());
    }

    #[test]
    fn test_interrupted_flush_resumes() {
        // Every line fills a packet on its own.
        let mut flusher = Flusher::new("", Duration::from_secs(1), 7);
        let mut transport = TestTransport {
            panic_on: Some(2),
            ..Default::default()
        };
        let mut map = events((0..3).map(|i| Event::counter(format!("k{i}"), 1)));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            flusher.flush(&mut map, &mut transport);
        }));
        assert!(result.is_err());

        // The event sent before the panic is gone, the one in the failed packet is kept.
        assert_eq!(transport.packets.len(), 1);
        assert_eq!(map.len(), 2);
        assert!(!flusher.has_pending());

        let report = flusher.flush(&mut map, &mut transport);
        assert_eq!(report.events, 2);
        assert!(map.is_empty());

        let mut lines: Vec<_> = transport
            .packets
            .iter()
            .flat_map(|packet| packet.lines())
            .collect();
        lines.sort();
        assert_eq!(lines, ["k0:1|c", "k1:1|c", "k2:1|c"]);
    }
}
