//! Integration tests for the session layer
//!
//! Drives real loopback TCP and UDP peers through the coordinator and a running
//! reactor thread. Flows are addressed to public destinations (93.184.216.34:443,
//! 8.8.8.8:53) and a redirecting dialer sends the real sockets to local peers.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use session_core::{
    AllowAll, Dialed, Dialer, FlowEvent, IpHeader, Reactor, ReactorHandle, SessionConfig,
    SessionCoordinator, SystemDialer, TcpFlags, TcpHeader, UdpHeader,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Harness
// ============================================================================

/// Real sockets, but always toward the given local peers
struct RedirectDialer {
    inner: SystemDialer,
    tcp_target: SocketAddr,
    udp_target: SocketAddr,
}

impl Dialer for RedirectDialer {
    fn dial_tcp(&self, _dest: SocketAddr) -> io::Result<Dialed<mio::net::TcpStream>> {
        self.inner.dial_tcp(self.tcp_target)
    }

    fn dial_udp(&self, _dest: SocketAddr) -> io::Result<Dialed<mio::net::UdpSocket>> {
        self.inner.dial_udp(self.udp_target)
    }
}

struct Harness {
    coordinator: Arc<SessionCoordinator>,
    handle: ReactorHandle,
    events: Receiver<FlowEvent>,
    reactor_thread: Option<JoinHandle<()>>,
}

impl Harness {
    fn start(config: SessionConfig, tcp_target: SocketAddr, udp_target: SocketAddr) -> Self {
        let dialer = RedirectDialer {
            inner: SystemDialer::new(Arc::new(AllowAll), &config),
            tcp_target,
            udp_target,
        };
        let (mut reactor, handle) = Reactor::new(&config).unwrap();
        let coordinator = Arc::new(SessionCoordinator::new(
            config,
            Arc::new(dialer),
            handle.clone(),
        ));

        let (tx, rx) = mpsc::channel();
        let reactor_coordinator = Arc::clone(&coordinator);
        let reactor_thread = thread::spawn(move || {
            reactor.run(&reactor_coordinator, &tx).unwrap();
        });

        Harness {
            coordinator,
            handle,
            events: rx,
            reactor_thread: Some(reactor_thread),
        }
    }

    /// Wait for the first event matching `pred`, skipping others
    fn wait_for(&self, pred: impl Fn(&FlowEvent) -> bool) -> FlowEvent {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("no matching flow event: {}", e),
            }
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(t) = self.reactor_thread.take() {
            let _ = t.join();
        }
    }
}

fn remote() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))
}

fn client() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
}

fn tcp_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let t = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, t)
}

fn udp_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    let t = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        if let Ok((n, from)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], from);
        }
    });
    (addr, t)
}

fn unused_udp_addr() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

fn tcp_segment(sequence: u32, payload: &[u8]) -> (IpHeader, TcpHeader, Vec<u8>) {
    let ip = IpHeader {
        header_len: 20,
        source: client(),
        destination: remote(),
    };
    let tcp = TcpHeader {
        header_len: 20,
        source_port: 51000,
        destination_port: 443,
        sequence,
        acknowledgment: 1,
        flags: TcpFlags {
            ack: true,
            psh: true,
            ..TcpFlags::default()
        },
        window: 65535,
        window_scale: None,
        mss: None,
        timestamp: None,
    };
    let mut frame = vec![0u8; 40];
    frame.extend_from_slice(payload);
    (ip, tcp, frame)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_tcp_echo_through_reactor() {
    let (echo, _server) = tcp_echo_server();
    let harness = Harness::start(SessionConfig::default(), echo, unused_udp_addr());

    let session = harness
        .coordinator
        .create_tcp_session(remote(), 443, client(), 51000, 1000, 0)
        .expect("session created");
    assert_eq!(session.key().as_str(), "93.184.216.34:443-10.0.0.2:51000");
    harness.wait_for(|e| matches!(e, FlowEvent::Connected(_)));
    assert!(session.is_connected());

    let request = b"GET / HTTP/1.1\r\n\r\n";
    let (ip, tcp, frame) = tcp_segment(1000, request);
    assert_eq!(
        harness.coordinator.ingest_client_segment(&ip, &tcp, &frame),
        request.len()
    );
    harness.coordinator.request_flush(&session);

    let mut echoed = Vec::new();
    while echoed.len() < request.len() {
        harness.wait_for(|e| matches!(e, FlowEvent::InboundData(_)));
        echoed.extend(session.drain_inbound(usize::MAX));
    }
    assert_eq!(echoed, request);
    assert!(!session.has_outbound_data());
}

#[test]
fn test_udp_round_trip_through_reactor() {
    let (echo, _server) = udp_echo_server();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let harness = Harness::start(
        SessionConfig::default(),
        listener.local_addr().unwrap(),
        echo,
    );

    let dns = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
    let session = harness
        .coordinator
        .create_udp_session(dns, 53, client(), 40000)
        .expect("session created");

    let ip = IpHeader {
        header_len: 20,
        source: client(),
        destination: dns,
    };
    let udp = UdpHeader {
        length: 16,
        source_port: 40000,
        destination_port: 53,
    };
    let mut frame = vec![0u8; 28];
    frame.extend_from_slice(b"dnsquery");

    assert_eq!(
        harness
            .coordinator
            .ingest_client_datagram(&ip, &udp, &frame, &session),
        8
    );
    harness.coordinator.request_flush(&session);

    harness.wait_for(|e| matches!(e, FlowEvent::InboundData(_)));
    assert_eq!(session.drain_inbound_datagram().unwrap(), b"dnsquery");
}

#[test]
fn test_fifty_first_session_refused() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let harness = Harness::start(
        SessionConfig::default(),
        listener.local_addr().unwrap(),
        peer.local_addr().unwrap(),
    );
    let dns = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

    for port in 0..50u16 {
        assert!(harness
            .coordinator
            .create_udp_session(dns, 53, client(), 40000 + port)
            .is_some());
    }
    assert!(harness
        .coordinator
        .create_udp_session(dns, 53, client(), 41000)
        .is_none());
    assert_eq!(harness.coordinator.session_count(), 50);

    let rendered = harness.coordinator.metrics().render();
    assert!(rendered.contains("vpn_collector_refused_sessions_total 1"));
    assert!(rendered.contains("vpn_collector_active_sessions 50"));
}

#[test]
fn test_remote_close_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"bye").unwrap();
    });

    let harness = Harness::start(SessionConfig::default(), addr, unused_udp_addr());
    let session = harness
        .coordinator
        .create_tcp_session(remote(), 443, client(), 51000, 1, 0)
        .unwrap();
    server.join().unwrap();

    harness.wait_for(|e| matches!(e, FlowEvent::RemoteClosed(_)));
    assert!(session.has_received_last_segment());
    assert_eq!(session.drain_inbound(usize::MAX), b"bye");
}

#[test]
fn test_close_session_closes_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let harness = Harness::start(SessionConfig::default(), addr, unused_udp_addr());

    let session = harness
        .coordinator
        .create_tcp_session(remote(), 443, client(), 51000, 1, 0)
        .unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
    harness.wait_for(|e| matches!(e, FlowEvent::Connected(_)));

    assert!(harness.coordinator.close_by_key(session.key()));
    assert!(harness.coordinator.lookup_by_key(session.key()).is_none());

    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_refused_connect_leaves_no_session() {
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let harness = Harness::start(SessionConfig::default(), closed, unused_udp_addr());

    // Loopback may refuse synchronously (retried, then abandoned) or report the
    // refusal through the reactor
    if harness
        .coordinator
        .create_tcp_session(remote(), 443, client(), 51000, 1, 0)
        .is_some()
    {
        harness.wait_for(|e| matches!(e, FlowEvent::ConnectFailed(_)));
    }
    assert_eq!(harness.coordinator.session_count(), 0);
}

#[test]
fn test_reactor_sweeps_idle_sessions() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let config = SessionConfig {
        udp_idle_timeout_secs: 0,
        sweep_interval_ms: 20,
        poll_interval_ms: 10,
        ..SessionConfig::default()
    };
    let target = listener.local_addr().unwrap();
    let harness = Harness::start(config, target, peer.local_addr().unwrap());

    let session = harness
        .coordinator
        .create_udp_session(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53, client(), 40000)
        .unwrap();

    let closed = harness.wait_for(|e| matches!(e, FlowEvent::Closed(_)));
    assert_eq!(closed, FlowEvent::Closed(session.key().clone()));
    assert_eq!(harness.coordinator.session_count(), 0);
}
