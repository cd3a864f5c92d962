//! Opening real outbound sockets
//!
//! A dial is a single non-blocking connect attempt on a freshly opened, protected
//! socket. Retrying belongs to the coordinator, which knows the attempt bound and how
//! to classify failures.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::net::{TcpStream, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::SessionConfig;
use crate::error::ConnectFailure;
use crate::metrics::Metrics;
use crate::protect::SocketProtector;

/// Outcome of a successful dial
#[derive(Debug)]
pub enum Dialed<S> {
    /// The connect completed immediately
    Connected(S),
    /// The connect is in flight; writable readiness reports completion
    Pending(S),
}

impl<S> Dialed<S> {
    /// Split into the socket and whether it is already connected
    pub fn into_parts(self) -> (S, bool) {
        match self {
            Dialed::Connected(s) => (s, true),
            Dialed::Pending(s) => (s, false),
        }
    }
}

/// Opens non-blocking sockets toward a destination
pub trait Dialer: Send + Sync {
    fn dial_tcp(&self, dest: SocketAddr) -> io::Result<Dialed<TcpStream>>;
    fn dial_udp(&self, dest: SocketAddr) -> io::Result<Dialed<UdpSocket>>;
}

/// Dialer for real sockets: socket2 setup, protect, then non-blocking connect
pub struct SystemDialer {
    protector: Arc<dyn SocketProtector>,
    keepalive: bool,
    nodelay: bool,
    metrics: Option<Arc<Metrics>>,
}

impl SystemDialer {
    pub fn new(protector: Arc<dyn SocketProtector>, config: &SessionConfig) -> Self {
        SystemDialer {
            protector,
            keepalive: config.tcp_keepalive,
            nodelay: config.tcp_nodelay,
            metrics: None,
        }
    }

    /// Count protect failures in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn protect(&self, socket: &Socket, dest: SocketAddr) {
        if !self.protector.protect(socket) {
            log::warn!(
                "Failed to protect socket toward {}, its traffic may loop through the VPN",
                dest
            );
            if let Some(metrics) = &self.metrics {
                metrics.protect_failures_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn check_destination(dest: SocketAddr) -> io::Result<()> {
    if dest.ip().is_unspecified() || dest.port() == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unroutable destination {}", dest),
        ));
    }
    Ok(())
}

impl Dialer for SystemDialer {
    fn dial_tcp(&self, dest: SocketAddr) -> io::Result<Dialed<TcpStream>> {
        check_destination(dest)?;

        let socket = Socket::new(Domain::for_address(dest), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(self.nodelay)?;
        socket.set_keepalive(self.keepalive)?;
        self.protect(&socket, dest);
        socket.set_nonblocking(true)?;

        let connected = match socket.connect(&dest.into()) {
            Ok(()) => true,
            Err(e) if ConnectFailure::classify(&e) == ConnectFailure::Pending => false,
            Err(e) => return Err(e),
        };

        let stream = TcpStream::from_std(std::net::TcpStream::from(socket));
        Ok(if connected {
            Dialed::Connected(stream)
        } else {
            Dialed::Pending(stream)
        })
    }

    fn dial_udp(&self, dest: SocketAddr) -> io::Result<Dialed<UdpSocket>> {
        check_destination(dest)?;

        let socket = Socket::new(Domain::for_address(dest), Type::DGRAM, Some(Protocol::UDP))?;
        self.protect(&socket, dest);
        socket.set_nonblocking(true)?;

        // Connecting a datagram socket only fixes the peer; no packets are sent
        socket.connect(&dest.into())?;

        Ok(Dialed::Connected(UdpSocket::from_std(std::net::UdpSocket::from(socket))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::AllowAll;

    fn dialer() -> SystemDialer {
        SystemDialer::new(Arc::new(AllowAll), &SessionConfig::default())
    }

    #[test]
    fn test_dial_tcp_loopback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dest = listener.local_addr().unwrap();

        let (stream, _connected) = dialer().dial_tcp(dest).unwrap().into_parts();
        // Either finished immediately or still in flight; both are usable
        assert_eq!(stream.take_error().unwrap().map(|e| e.kind()), None);
    }

    #[test]
    fn test_dial_udp_is_connected() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = peer.local_addr().unwrap();

        let dialed = dialer().dial_udp(dest).unwrap();
        assert!(matches!(dialed, Dialed::Connected(_)));
    }

    #[test]
    fn test_unspecified_destination_rejected() {
        let err = dialer().dial_tcp("0.0.0.0:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(ConnectFailure::classify(&err), ConnectFailure::Permanent);
    }

    #[test]
    fn test_protect_failure_counted() {
        struct Deny;
        impl SocketProtector for Deny {
            fn protect(&self, _socket: &Socket) -> bool {
                false
            }
        }

        let metrics = Arc::new(Metrics::new());
        let dialer = SystemDialer::new(Arc::new(Deny), &SessionConfig::default())
            .with_metrics(Arc::clone(&metrics));
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        dialer.dial_udp(peer.local_addr().unwrap()).unwrap();
        assert_eq!(metrics.protect_failures_total.load(Ordering::Relaxed), 1);
    }
}
