//! Helpers for testing statsd clients end to end.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`statsbuf_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!  - Use a [`UdpCapture`] as upstream to inspect the datagrams a client sends.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     statsbuf_test::setup();
//!
//!     let capture = statsbuf_test::UdpCapture::bind();
//!     // Point a client at `capture.addr()` ...
//!     let lines = capture.wait_for_lines(1);
//! }
//! ```

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

/// Time to wait for datagrams before giving up.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    statsbuf_log::init_test!();
}

/// A local UDP socket collecting the datagrams sent to it.
///
/// The socket binds to an ephemeral port on the loopback interface.
#[derive(Debug)]
pub struct UdpCapture {
    socket: UdpSocket,
}

impl UdpCapture {
    /// Binds a new socket on `127.0.0.1` with an ephemeral port.
    ///
    /// # Panics
    ///
    /// Panics if the socket cannot be bound.
    pub fn bind() -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind udp capture socket");
        Self { socket }
    }

    /// Returns the address to send datagrams to, as `host:port`.
    pub fn addr(&self) -> String {
        match self.socket.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(error) => panic!("udp capture has no local address: {error}"),
        }
    }

    /// Receives a single datagram, or `None` if none arrives within `timeout`.
    pub fn recv_packet(&self, timeout: Duration) -> Option<String> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .ok()?;

        let mut buf = vec![0; 65_535];
        match self.socket.recv(&mut buf) {
            Ok(len) => Some(String::from_utf8_lossy(&buf[..len]).into_owned()),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                None
            }
            Err(error) => panic!("failed to receive datagram: {error}"),
        }
    }

    /// Receives datagrams until none arrives within `timeout`, and returns all their lines.
    pub fn recv_lines(&self, timeout: Duration) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(packet) = self.recv_packet(timeout) {
            lines.extend(packet.lines().map(str::to_owned));
        }
        lines
    }

    /// Receives datagrams until at least `count` lines have arrived.
    ///
    /// Lines are returned sorted, since datagrams are not ordered.
    ///
    /// # Panics
    ///
    /// Panics if fewer lines arrive within five seconds.
    pub fn wait_for_lines(&self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        let mut lines = Vec::new();

        while lines.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(
                !remaining.is_zero(),
                "expected {count} lines, received {lines:?}"
            );

            if let Some(packet) = self.recv_packet(remaining) {
                lines.extend(packet.lines().map(str::to_owned));
            }
        }

        lines.sort();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_lines() {
        setup();

        let capture = UdpCapture::bind();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.send_to(b"b:1|c\na:1|c\n", capture.addr()).unwrap();
        socket.send_to(b"c:1|c\n", capture.addr()).unwrap();

        assert_eq!(capture.wait_for_lines(3), ["a:1|c", "b:1|c", "c:1|c"]);
        assert!(capture.recv_lines(Duration::from_millis(50)).is_empty());
    }
}
