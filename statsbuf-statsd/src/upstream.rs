use std::fmt;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

use cadence::MetricSink;

/// An error sending a datagram to the upstream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport has no open connection.
    #[error("not connected to upstream")]
    NotConnected,
    /// The upstream address uses an unsupported scheme.
    #[error("invalid scheme '{0}', expected one of 'udp', 'unixgram'")]
    InvalidScheme(String),
    /// The socket reported an error.
    #[error("failed to send metrics to upstream")]
    Io(#[from] io::Error),
}

/// Delivers packed datagrams to a statsd server.
///
/// Sends are unordered and unacknowledged. Implementations must not retry failed sends.
pub trait Transport: Send + 'static {
    /// Sends a single datagram.
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Re-establishes the connection to the upstream.
    ///
    /// Transports without a connection do nothing.
    fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Transport for Box<dyn Transport> {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        (**self).send(packet)
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        (**self).reconnect()
    }
}

/// A connected, non-blocking datagram socket.
pub enum Remote {
    /// A UDP socket.
    Udp(UdpSocket),
    /// A Unix datagram socket.
    #[cfg(unix)]
    UnixDatagram(UnixDatagram),
}

impl Remote {
    /// Connects to the given address.
    ///
    /// The address is either `udp://host:port`, `unixgram:///path`, or a plain `host:port` which
    /// is treated as UDP.
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        // Try treating the address as a fully-qualified URL, where the scheme is the transport identifier.
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                "udp" => Self::connect_udp(path),
                #[cfg(unix)]
                "unixgram" => {
                    let socket = UnixDatagram::unbound()?;
                    socket.connect(path)?;
                    socket.set_nonblocking(true)?;

                    Ok(Self::UnixDatagram(socket))
                }
                _ => Err(TransportError::InvalidScheme(scheme.to_owned())),
            };
        }

        // If there is no scheme, fall back to a UDP socket
        Self::connect_udp(addr)
    }

    fn connect_udp(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self::Udp(socket))
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => socket.send(buf),
            #[cfg(unix)]
            Self::UnixDatagram(socket) => socket.send(buf),
        }
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(socket) => f.debug_tuple("Udp").field(&socket.peer_addr().ok()).finish(),
            #[cfg(unix)]
            Self::UnixDatagram(_) => f.write_str("UnixDatagram"),
        }
    }
}

/// A [`Transport`] sending to a statsd server over a datagram socket.
///
/// If a [reconnect](Transport::reconnect) fails, the upstream stays disconnected and the next send
/// tries to connect again.
#[derive(Debug)]
pub struct Upstream {
    addr: String,
    remote: Option<Remote>,
}

impl Upstream {
    /// Connects to the upstream at `addr`.
    ///
    /// See [`Remote::connect`] for supported address formats.
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        Ok(Self {
            addr: addr.to_owned(),
            remote: Some(Remote::connect(addr)?),
        })
    }
}

impl Transport for Upstream {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if self.remote.is_none() {
            self.remote = Some(Remote::connect(&self.addr)?);
        }

        let Some(ref remote) = self.remote else {
            return Err(TransportError::NotConnected);
        };

        remote.send(packet)?;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        // Drop the old socket first, so a failed reconnect leaves the upstream disconnected.
        self.remote = None;
        self.remote = Some(Remote::connect(&self.addr)?);
        statsbuf_log::trace!(upstream = %self.addr, "reconnected to upstream");
        Ok(())
    }
}

/// A [`Transport`] emitting datagrams through a cadence [`MetricSink`].
///
/// Each datagram is emitted as a single payload, so multi-line packets stay intact.
///
/// # Example
///
/// ```
/// use statsbuf_statsd::{SinkTransport, Transport};
///
/// let (rx, sink) = cadence::SpyMetricSink::new();
/// let mut transport = SinkTransport::new(sink);
///
/// transport.send(b"a:1|c\n").unwrap();
/// assert_eq!(rx.try_recv().unwrap(), b"a:1|c\n");
/// ```
#[derive(Debug)]
pub struct SinkTransport<S> {
    sink: S,
}

impl<S> SinkTransport<S> {
    /// Wraps the given sink.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S> Transport for SinkTransport<S>
where
    S: MetricSink + Send + 'static,
{
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let payload = std::str::from_utf8(packet)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        self.sink.emit(payload)?;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.sink.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn listener() -> (UdpSocket, String) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        (socket, addr)
    }

    fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0; 1024];
        let len = socket.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    #[test]
    fn test_udp_upstream() {
        let (socket, addr) = listener();

        let mut upstream = Upstream::connect(&addr).unwrap();
        upstream.send(b"a:1|c\n").unwrap();
        assert_eq!(recv(&socket), "a:1|c\n");

        let mut upstream = Upstream::connect(&format!("udp://{addr}")).unwrap();
        upstream.send(b"b:2|c\n").unwrap();
        assert_eq!(recv(&socket), "b:2|c\n");
    }

    #[test]
    fn test_reconnect_upstream() {
        let (socket, addr) = listener();

        let mut upstream = Upstream::connect(&addr).unwrap();
        upstream.send(b"a:1|c\n").unwrap();
        upstream.reconnect().unwrap();
        upstream.send(b"b:1|c\n").unwrap();

        assert_eq!(recv(&socket), "a:1|c\n");
        assert_eq!(recv(&socket), "b:1|c\n");
    }

    #[test]
    fn test_invalid_scheme() {
        let error = Upstream::connect("tcp://127.0.0.1:8125").unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid scheme 'tcp', expected one of 'udp', 'unixgram'"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_unixgram_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statsd.sock");
        let socket = UnixDatagram::bind(&path).unwrap();

        let mut upstream = Upstream::connect(&format!("unixgram://{}", path.display())).unwrap();
        upstream.send(b"a:1|c\n").unwrap();

        let mut buf = [0; 64];
        let len = socket.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"a:1|c\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statsd.sock");
        let addr = format!("unixgram://{}", path.display());

        let socket = UnixDatagram::bind(&path).unwrap();
        let mut upstream = Upstream::connect(&addr).unwrap();

        // Nothing is listening at the path anymore.
        drop(socket);
        std::fs::remove_file(&path).unwrap();

        assert!(upstream.reconnect().is_err());
        assert!(upstream.send(b"a:1|c\n").is_err());

        // The next send connects again once the upstream is back.
        let socket = UnixDatagram::bind(&path).unwrap();
        upstream.send(b"b:1|c\n").unwrap();

        let mut buf = [0; 64];
        let len = socket.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"b:1|c\n");
    }

    #[test]
    fn test_sink_transport() {
        let (rx, sink) = cadence::SpyMetricSink::new();
        let mut transport = SinkTransport::new(sink);

        transport.send(b"a:1|c\nb:2|c\n").unwrap();
        transport.reconnect().unwrap();

        let packets: Vec<_> = rx.try_iter().collect();
        assert_eq!(packets, vec![b"a:1|c\nb:2|c\n".to_vec()]);
    }
}
