//! Readiness reactor
//!
//! A single thread owns the `mio::Poll` and every registration in it. Other threads
//! never touch the registry: they send a `ReactorCommand` through a `ReactorHandle`,
//! which queues the command and wakes the poll. Commands are drained only between
//! poll iterations, so the registration set never changes while events are being
//! dispatched.
//!
//! The reactor services real sockets only. What happens on the client side of a flow
//! (acknowledging, re-encapsulating, sending FIN) is left to whoever consumes the
//! `FlowEvent`s it publishes.

use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::SessionConfig;
use crate::coordinator::SessionCoordinator;
use crate::error::SessionError;
use crate::session::{FlowSession, RealSocket, SessionKey, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Token reserved for the waker; session tokens start at 1
pub const WAKER_TOKEN: Token = Token(0);

/// Largest UDP payload we read in one go
const MAX_DATAGRAM_SIZE: usize = 65_535;

// ============================================================================
// Commands and Events
// ============================================================================

/// Requests handed to the reactor thread
#[derive(Debug)]
pub enum ReactorCommand {
    /// Register the session's real socket for read and write readiness
    Register(SessionKey),
    /// Write whatever is buffered toward the remote
    Flush(SessionKey),
    /// Restart reading after the inbound buffer was full
    ResumeRead(SessionKey),
    /// Deregister and drop a socket taken out of a closed session
    Retire(Token, RealSocket),
    Shutdown,
}

/// What the reactor observed on a real socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// The real connection is established
    Connected(SessionKey),
    /// The real connection could not be established; the session is gone
    ConnectFailed(SessionKey),
    /// New bytes are waiting in the inbound buffer
    InboundData(SessionKey),
    /// The remote finished sending
    RemoteClosed(SessionKey),
    /// The session was torn down by the reactor (socket error or sweep)
    Closed(SessionKey),
}

/// Consumer of reactor events
pub trait FlowEventSink: Send + Sync {
    fn publish(&self, event: FlowEvent);
}

impl FlowEventSink for Sender<FlowEvent> {
    fn publish(&self, event: FlowEvent) {
        if self.send(event).is_err() {
            log::trace!("Flow event dropped, receiver is gone");
        }
    }
}

// ============================================================================
// Reactor Handle
// ============================================================================

/// Cloneable sender side of the reactor's command queue
#[derive(Clone)]
pub struct ReactorHandle {
    commands: Sender<ReactorCommand>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Queue a command and wake the poll
    pub fn send(&self, command: ReactorCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ReactorClosed)?;
        self.waker.wake()?;
        Ok(())
    }

    pub fn register(&self, key: SessionKey) -> Result<(), SessionError> {
        self.send(ReactorCommand::Register(key))
    }

    pub fn flush(&self, key: SessionKey) -> Result<(), SessionError> {
        self.send(ReactorCommand::Flush(key))
    }

    pub fn resume_read(&self, key: SessionKey) -> Result<(), SessionError> {
        self.send(ReactorCommand::ResumeRead(key))
    }

    /// Hand a socket back for deregistration. If the reactor is gone the socket is
    /// simply dropped, which closes it.
    pub fn retire(&self, token: Token, socket: RealSocket) {
        if let Err(e) = self.send(ReactorCommand::Retire(token, socket)) {
            log::trace!("Retire for {:?} not delivered: {}", token, e);
        }
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(ReactorCommand::Shutdown)
    }
}

// ============================================================================
// Reactor
// ============================================================================

/// Result of one read pass over a real socket
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    /// Bytes appended to the inbound buffer (possibly zero)
    Read { bytes: usize, eof: bool },
    /// Another worker holds the read claim
    Busy,
    Failed(io::ErrorKind),
}

/// Owner of the poll and of every socket registration
pub struct Reactor {
    poll: Poll,
    events: Events,
    commands: Receiver<ReactorCommand>,
    poll_interval: Duration,
    sweep_interval: Duration,
    read_chunk: usize,
}

impl Reactor {
    /// Build the reactor and the handle other threads use to reach it
    pub fn new(config: &SessionConfig) -> io::Result<(Reactor, ReactorHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = mpsc::channel();

        let reactor = Reactor {
            poll,
            events: Events::with_capacity(1024),
            commands: rx,
            poll_interval: config.poll_interval(),
            sweep_interval: config.sweep_interval(),
            read_chunk: config.read_chunk_size,
        };
        Ok((reactor, ReactorHandle { commands: tx, waker }))
    }

    /// Run until a `Shutdown` command arrives or every handle is dropped
    pub fn run(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
    ) -> io::Result<()> {
        log::info!("Reactor running");
        let mut last_sweep = Instant::now();

        loop {
            match self.poll.poll(&mut self.events, Some(self.poll_interval)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .filter(|e| e.token() != WAKER_TOKEN)
                .map(|e| {
                    (
                        e.token(),
                        e.is_readable() || e.is_read_closed() || e.is_error(),
                        e.is_writable() || e.is_write_closed(),
                    )
                })
                .collect();

            for (token, readable, writable) in ready {
                self.handle_ready(coordinator, sink, token, readable, writable);
            }

            if !self.drain_commands(coordinator, sink) {
                break;
            }

            if last_sweep.elapsed() >= self.sweep_interval {
                last_sweep = Instant::now();
                for key in coordinator.sweep() {
                    sink.publish(FlowEvent::Closed(key));
                }
            }
        }

        // Sockets retired during shutdown still need to leave the registry
        while let Ok(command) = self.commands.try_recv() {
            if let ReactorCommand::Retire(token, socket) = command {
                self.retire(token, socket);
            }
        }
        log::info!("Reactor stopped");
        Ok(())
    }

    /// Process queued commands; `false` once the reactor should stop
    fn drain_commands(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
    ) -> bool {
        loop {
            let command = match self.commands.try_recv() {
                Ok(c) => c,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };

            match command {
                ReactorCommand::Register(key) => self.register(coordinator, sink, &key),
                ReactorCommand::Flush(key) => {
                    if let Some(session) = coordinator.lookup_by_key(&key) {
                        self.flush(coordinator, sink, &session);
                    }
                }
                ReactorCommand::ResumeRead(key) => {
                    if let Some(session) = coordinator.lookup_by_key(&key) {
                        if session.is_read_stalled() {
                            session.set_read_stalled(false);
                            self.read(coordinator, sink, &session);
                        }
                    }
                }
                ReactorCommand::Retire(token, socket) => self.retire(token, socket),
                ReactorCommand::Shutdown => return false,
            }
        }
    }

    fn register(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
        key: &SessionKey,
    ) {
        let session = match coordinator.lookup_by_key(key) {
            Some(s) => s,
            None => {
                log::debug!("Register for {} skipped, session already gone", key);
                return;
            }
        };

        let registry = self.poll.registry();
        let token = session.token();
        let result = session.with_socket(|socket| {
            registry.register(socket, token, Interest::READABLE | Interest::WRITABLE)
        });

        match result {
            Some(Ok(())) => {
                log::debug!("Registered {} as {:?}", key, token);
                if session.is_connected() {
                    sink.publish(FlowEvent::Connected(key.clone()));
                }
            }
            Some(Err(e)) => {
                log::warn!("Failed to register {}: {}", key, e);
                session.abort();
                coordinator.close_session(&session);
                sink.publish(FlowEvent::ConnectFailed(key.clone()));
            }
            None => log::debug!("Register for {} skipped, socket already taken", key),
        }
    }

    fn retire(&mut self, token: Token, mut socket: RealSocket) {
        if let Err(e) = self.poll.registry().deregister(&mut socket) {
            log::trace!("Deregister {:?}: {}", token, e);
        }
        drop(socket);
    }

    fn handle_ready(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
        token: Token,
        readable: bool,
        writable: bool,
    ) {
        let session = match coordinator.lookup_by_token(token) {
            Some(s) => s,
            None => return,
        };
        if session.is_aborting() {
            return;
        }

        if !session.is_connected() {
            match finish_connect(&session) {
                Ok(true) => {
                    log::debug!("Connected {}", session.key());
                    session.set_connected(true);
                    sink.publish(FlowEvent::Connected(session.key().clone()));
                }
                Ok(false) => return,
                Err(e) => {
                    log::warn!("Connect to {} failed: {}", session.destination(), e);
                    coordinator
                        .metrics()
                        .connect_failures_total
                        .fetch_add(1, Ordering::Relaxed);
                    session.abort();
                    coordinator.close_session(&session);
                    sink.publish(FlowEvent::ConnectFailed(session.key().clone()));
                    return;
                }
            }
        }

        if writable {
            self.flush(coordinator, sink, &session);
        }
        if readable && !session.is_read_stalled() {
            self.read(coordinator, sink, &session);
        }
    }

    fn read(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
        session: &Arc<FlowSession>,
    ) {
        if session.is_aborting() || session.has_received_last_segment() {
            return;
        }

        match read_into_session(session, self.read_chunk) {
            ReadOutcome::Read { bytes, eof } => {
                if bytes > 0 {
                    coordinator
                        .metrics()
                        .bytes_from_remote_total
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                    session.touch();
                    sink.publish(FlowEvent::InboundData(session.key().clone()));
                }
                if eof {
                    log::debug!("Remote closed {}", session.key());
                    session.set_received_last_segment();
                    sink.publish(FlowEvent::RemoteClosed(session.key().clone()));
                }
            }
            ReadOutcome::Busy => {}
            ReadOutcome::Failed(kind) => {
                log::debug!("Read on {} failed: {:?}", session.key(), kind);
                self.teardown(coordinator, sink, session);
            }
        }
    }

    fn flush(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
        session: &Arc<FlowSession>,
    ) {
        if session.is_aborting() || !session.is_connected() {
            return;
        }

        match write_from_session(session) {
            Ok(bytes) => {
                if bytes > 0 {
                    coordinator
                        .metrics()
                        .bytes_to_remote_total
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                    session.touch();
                }
                // Client FIN: pass it on once everything before it has been written
                if session.is_acked_to_fin()
                    && !session.has_outbound_data()
                    && session.claim_write_shutdown()
                {
                    let result = session.with_socket(|s| s.shutdown_write());
                    if let Some(Err(e)) = result {
                        log::debug!("Half-close of {} failed: {}", session.key(), e);
                    }
                }
            }
            Err(e) => {
                log::debug!("Write on {} failed: {}", session.key(), e);
                self.teardown(coordinator, sink, session);
            }
        }
    }

    fn teardown(
        &mut self,
        coordinator: &SessionCoordinator,
        sink: &dyn FlowEventSink,
        session: &Arc<FlowSession>,
    ) {
        session.abort();
        coordinator.close_session(session);
        sink.publish(FlowEvent::Closed(session.key().clone()));
    }
}

// ============================================================================
// Socket Servicing
// ============================================================================

/// Whether a pending TCP connect has completed; errors mean it failed
fn finish_connect(session: &FlowSession) -> io::Result<bool> {
    session
        .with_socket(|socket| match socket {
            RealSocket::Tcp(stream) => {
                if let Some(e) = stream.take_error()? {
                    return Err(e);
                }
                match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                }
            }
            RealSocket::Udp(_) => Ok(true),
        })
        .unwrap_or(Ok(false))
}

/// Read until `WouldBlock`, EOF, or the inbound buffer is full (read-stall)
fn read_into_session(session: &FlowSession, chunk: usize) -> ReadOutcome {
    let _claim = match session.try_claim_read() {
        Some(c) => c,
        None => return ReadOutcome::Busy,
    };

    match session.transport() {
        Transport::Tcp => read_stream(session, chunk),
        Transport::Udp => read_datagrams(session),
    }
}

fn stall(session: &FlowSession, bytes: usize) -> ReadOutcome {
    log::debug!("Inbound buffer of {} full, pausing reads", session.key());
    session.set_read_stalled(true);
    ReadOutcome::Read { bytes, eof: false }
}

fn read_stream(session: &FlowSession, chunk: usize) -> ReadOutcome {
    let mut buf = vec![0u8; chunk];
    let mut total = 0usize;

    loop {
        let room = session.inbound_remaining();
        if room == 0 {
            return stall(session, total);
        }
        let want = room.min(buf.len());

        let result = session.with_socket(|socket| match socket {
            RealSocket::Tcp(stream) => stream.read(&mut buf[..want]),
            RealSocket::Udp(_) => Err(io::ErrorKind::Unsupported.into()),
        });

        match result {
            None => return ReadOutcome::Read { bytes: total, eof: false },
            Some(Ok(0)) => return ReadOutcome::Read { bytes: total, eof: true },
            Some(Ok(n)) => {
                if let Err(e) = session.append_inbound(&buf[..n]) {
                    log::warn!("Dropping {} bytes for {}: {}", n, session.key(), e);
                    return ReadOutcome::Failed(io::ErrorKind::OutOfMemory);
                }
                total += n;
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::Read { bytes: total, eof: false }
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => return ReadOutcome::Failed(e.kind()),
        }
    }
}

/// Datagrams are peeked first so one that does not fit stays queued on the socket.
/// A datagram larger than the whole (empty) buffer can never fit and is discarded.
fn read_datagrams(session: &FlowSession) -> ReadOutcome {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut total = 0usize;

    loop {
        let peeked = session.with_socket(|socket| match socket {
            RealSocket::Udp(udp) => udp.peek(&mut buf),
            RealSocket::Tcp(_) => Err(io::ErrorKind::Unsupported.into()),
        });
        let size = match peeked {
            None => return ReadOutcome::Read { bytes: total, eof: false },
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::Read { bytes: total, eof: false }
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => return ReadOutcome::Failed(e.kind()),
        };

        let room = session.inbound_remaining();
        let oversized = size > room && !session.has_inbound_data();
        if size > room && !oversized {
            return stall(session, total);
        }

        let received = session.with_socket(|socket| match socket {
            RealSocket::Udp(udp) => udp.recv(&mut buf),
            RealSocket::Tcp(_) => Err(io::ErrorKind::Unsupported.into()),
        });
        let n = match received {
            None => return ReadOutcome::Read { bytes: total, eof: false },
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::Read { bytes: total, eof: false }
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => return ReadOutcome::Failed(e.kind()),
        };

        if oversized {
            log::warn!(
                "Discarding {} byte datagram for {}, larger than the inbound buffer",
                n,
                session.key()
            );
            continue;
        }
        if n == 0 {
            continue;
        }
        if let Err(e) = session.append_inbound(&buf[..n]) {
            log::warn!("Dropping datagram of {} bytes for {}: {}", n, session.key(), e);
            continue;
        }
        total += n;
    }
}

/// Write the outbound buffer; whatever the socket does not take goes back in front
fn write_from_session(session: &FlowSession) -> io::Result<usize> {
    let _claim = match session.try_claim_write() {
        Some(c) => c,
        None => return Ok(0),
    };

    match session.transport() {
        Transport::Tcp => {
            let data = session.drain_outbound();
            let mut written = 0usize;

            while written < data.len() {
                let result = session.with_socket(|socket| match socket {
                    RealSocket::Tcp(stream) => stream.write(&data[written..]),
                    RealSocket::Udp(_) => Err(io::ErrorKind::Unsupported.into()),
                });
                match result {
                    Some(Ok(0)) | None => break,
                    Some(Ok(n)) => written += n,
                    Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Some(Err(e)) => {
                        session.requeue_outbound(&data[written..]);
                        return Err(e);
                    }
                }
            }

            if written < data.len() {
                session.requeue_outbound(&data[written..]);
            }
            Ok(written)
        }
        Transport::Udp => {
            let mut written = 0usize;
            while let Some(datagram) = session.drain_outbound_datagram() {
                let result = session.with_socket(|socket| match socket {
                    RealSocket::Udp(udp) => udp.send(&datagram),
                    RealSocket::Tcp(_) => Err(io::ErrorKind::Unsupported.into()),
                });
                match result {
                    Some(Ok(n)) => written += n,
                    Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                        session.requeue_outbound(&datagram);
                        break;
                    }
                    Some(Err(e)) => {
                        // Datagrams are lossy; one bad send does not end the flow
                        log::debug!("Dropping datagram for {}: {}", session.key(), e);
                    }
                    None => break,
                }
            }
            Ok(written)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream;
    use std::net::TcpListener;

    fn connected_tcp_session(config: &SessionConfig) -> (FlowSession, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dest = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(dest).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();

        let session = FlowSession::new_tcp(
            dest,
            "10.0.0.2:51000".parse().unwrap(),
            Token(1),
            100,
            0,
            config,
        );
        session.attach_socket(RealSocket::Tcp(TcpStream::from_std(client)), true);
        (session, server)
    }

    #[test]
    fn test_write_from_session_delivers_bytes() {
        let (session, mut server) = connected_tcp_session(&SessionConfig::default());
        session.append_outbound(b"hello remote").unwrap();

        assert_eq!(write_from_session(&session).unwrap(), 12);
        assert!(!session.has_outbound_data());

        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello remote");
    }

    #[test]
    fn test_read_into_session_stalls_when_full() {
        let config = SessionConfig {
            max_buffer_bytes: 8,
            ..SessionConfig::default()
        };
        let (session, mut server) = connected_tcp_session(&config);
        server.write_all(b"0123456789abcdef").unwrap();
        server.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let outcome = read_into_session(&session, 4);
        assert_eq!(outcome, ReadOutcome::Read { bytes: 8, eof: false });
        assert!(session.is_read_stalled());
        assert_eq!(session.drain_inbound(usize::MAX), b"01234567");
    }

    #[test]
    fn test_read_into_session_reports_eof() {
        let (session, server) = connected_tcp_session(&SessionConfig::default());
        drop(server);
        std::thread::sleep(Duration::from_millis(50));

        let outcome = read_into_session(&session, 1024);
        assert_eq!(outcome, ReadOutcome::Read { bytes: 0, eof: true });
    }

    #[test]
    fn test_read_claim_held_elsewhere_is_busy() {
        let (session, _server) = connected_tcp_session(&SessionConfig::default());
        let _held = session.try_claim_read().unwrap();
        assert_eq!(read_into_session(&session, 1024), ReadOutcome::Busy);
    }

    fn connected_udp_session(config: &SessionConfig) -> (FlowSession, std::net::UdpSocket) {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let local = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        local.connect(peer.local_addr().unwrap()).unwrap();
        peer.connect(local.local_addr().unwrap()).unwrap();
        local.set_nonblocking(true).unwrap();

        let session = FlowSession::new_udp(
            peer.local_addr().unwrap(),
            "10.0.0.2:40000".parse().unwrap(),
            Token(2),
            config,
        );
        session.attach_socket(RealSocket::Udp(mio::net::UdpSocket::from_std(local)), true);
        (session, peer)
    }

    #[test]
    fn test_udp_read_with_buffer_below_max_datagram() {
        let config = SessionConfig {
            max_buffer_bytes: 32 * 1024,
            ..SessionConfig::default()
        };
        let (session, peer) = connected_udp_session(&config);
        peer.send(b"0123456789").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let outcome = read_into_session(&session, config.read_chunk_size);
        assert_eq!(outcome, ReadOutcome::Read { bytes: 10, eof: false });
        assert!(!session.is_read_stalled());
        assert_eq!(session.inbound_size(), 10);
    }

    #[test]
    fn test_udp_datagram_that_does_not_fit_waits() {
        let config = SessionConfig {
            max_buffer_bytes: 16,
            ..SessionConfig::default()
        };
        let (session, peer) = connected_udp_session(&config);
        peer.send(b"first-12byte").unwrap();
        peer.send(b"second-12byt").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(
            read_into_session(&session, config.read_chunk_size),
            ReadOutcome::Read { bytes: 12, eof: false }
        );
        assert!(session.is_read_stalled());

        assert_eq!(session.drain_inbound_datagram().unwrap(), b"first-12byte");
        session.set_read_stalled(false);
        assert_eq!(
            read_into_session(&session, config.read_chunk_size),
            ReadOutcome::Read { bytes: 12, eof: false }
        );
        assert_eq!(session.drain_inbound_datagram().unwrap(), b"second-12byt");
    }

    #[test]
    fn test_udp_datagram_larger_than_buffer_is_discarded() {
        let config = SessionConfig {
            max_buffer_bytes: 8,
            ..SessionConfig::default()
        };
        let (session, peer) = connected_udp_session(&config);
        peer.send(b"far too large for it").unwrap();
        peer.send(b"fits").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let outcome = read_into_session(&session, config.read_chunk_size);
        assert_eq!(outcome, ReadOutcome::Read { bytes: 4, eof: false });
        assert_eq!(session.drain_inbound_datagram().unwrap(), b"fits");
    }

    #[test]
    fn test_sender_is_an_event_sink() {
        let (tx, rx) = mpsc::channel();
        let key = SessionKey::new("1.1.1.1".parse().unwrap(), 80, "10.0.0.2".parse().unwrap(), 5);
        tx.publish(FlowEvent::InboundData(key.clone()));
        assert_eq!(rx.recv().unwrap(), FlowEvent::InboundData(key));
    }
}
