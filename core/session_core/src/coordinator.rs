//! Session coordinator
//!
//! The orchestration surface of the session layer. It opens real sockets through the
//! `Dialer`, admits sessions into the bounded `SessionDirectory`, hands sockets to the
//! reactor for registration, routes captured client payload into the owning session
//! and tears sessions down.
//!
//! One coordinator is constructed by whoever wires the process together and shared as
//! `Arc<SessionCoordinator>` with the reactor and the capture threads.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::Token;

use crate::config::SessionConfig;
use crate::dialer::Dialer;
use crate::directory::{InsertOutcome, SessionDirectory};
use crate::error::{ConnectFailure, SessionError};
use crate::metrics::Metrics;
use crate::packet::{tcp_payload, udp_payload, IpHeader, TcpHeader, UdpHeader};
use crate::reactor::ReactorHandle;
use crate::session::{seq_lt, FlowSession, RealSocket, SessionKey, Transport};

// ============================================================================
// Coordinator Structure
// ============================================================================

/// Creates, finds, feeds and closes flow sessions
pub struct SessionCoordinator {
    config: SessionConfig,
    directory: SessionDirectory,
    dialer: Arc<dyn Dialer>,
    reactor: ReactorHandle,
    metrics: Arc<Metrics>,
    /// Next reactor token; 0 belongs to the waker
    next_token: AtomicUsize,
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig, dialer: Arc<dyn Dialer>, reactor: ReactorHandle) -> Self {
        Self::with_metrics(config, dialer, reactor, Arc::new(Metrics::new()))
    }

    /// Share `metrics` with other components (the dialer counts protect failures)
    pub fn with_metrics(
        config: SessionConfig,
        dialer: Arc<dyn Dialer>,
        reactor: ReactorHandle,
        metrics: Arc<Metrics>,
    ) -> Self {
        SessionCoordinator {
            directory: SessionDirectory::new(config.session_limit),
            config,
            dialer,
            reactor,
            metrics,
            next_token: AtomicUsize::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn session_count(&self) -> usize {
        self.directory.len()
    }

    /// Snapshot of every live session
    pub fn sessions(&self) -> Vec<Arc<FlowSession>> {
        self.directory.values()
    }

    /// Directory key for a 4-tuple; the same function serves creation and lookup
    pub fn key(dest_addr: IpAddr, dest_port: u16, src_addr: IpAddr, src_port: u16) -> SessionKey {
        SessionKey::new(dest_addr, dest_port, src_addr, src_port)
    }

    fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn update_active_gauge(&self) {
        self.metrics
            .active_sessions
            .store(self.directory.len() as u64, Ordering::Relaxed);
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a TCP session; `None` means the flow is not handled (reason is logged)
    pub fn create_tcp_session(
        &self,
        dest_addr: IpAddr,
        dest_port: u16,
        src_addr: IpAddr,
        src_port: u16,
        sequence: u32,
        ack: u32,
    ) -> Option<Arc<FlowSession>> {
        self.try_create_tcp_session(dest_addr, dest_port, src_addr, src_port, sequence, ack)
            .ok()
    }

    /// Create a TCP session: bounded connect attempts, then admission and registration
    pub fn try_create_tcp_session(
        &self,
        dest_addr: IpAddr,
        dest_port: u16,
        src_addr: IpAddr,
        src_port: u16,
        sequence: u32,
        ack: u32,
    ) -> Result<Arc<FlowSession>, SessionError> {
        let destination = SocketAddr::new(dest_addr, dest_port);
        let source = SocketAddr::new(src_addr, src_port);
        let key = SessionKey::from_addrs(destination, source);
        self.check_admission(&key)?;

        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        let mut dialed = None;

        for attempt in 1..=attempts {
            match self.dialer.dial_tcp(destination) {
                Ok(d) => {
                    dialed = Some(d);
                    break;
                }
                Err(e) => match ConnectFailure::classify(&e) {
                    ConnectFailure::Permanent => {
                        log::warn!(
                            "Connect to {} for {} failed permanently: {}",
                            destination,
                            key,
                            e
                        );
                        self.metrics
                            .connect_failures_total
                            .fetch_add(1, Ordering::Relaxed);
                        return Err(SessionError::Unreachable { key, source: e });
                    }
                    _ => {
                        log::debug!(
                            "Connect attempt {}/{} to {} failed: {}",
                            attempt,
                            attempts,
                            destination,
                            e
                        );
                        last_error = Some(e);
                    }
                },
            }
        }

        let (stream, connected) = match dialed {
            Some(d) => d.into_parts(),
            None => {
                let last = last_error
                    .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::TimedOut));
                log::warn!(
                    "Giving up on {} after {} connect attempts: {}",
                    key,
                    attempts,
                    last
                );
                self.metrics
                    .connect_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::AttemptsExhausted { key, attempts, last });
            }
        };

        let session = Arc::new(FlowSession::new_tcp(
            destination,
            source,
            self.allocate_token(),
            sequence,
            ack,
            &self.config,
        ));
        session.attach_socket(RealSocket::Tcp(stream), connected);

        self.admit(session, Transport::Tcp)
    }

    /// Create a UDP session; `None` means the flow is not handled (reason is logged)
    pub fn create_udp_session(
        &self,
        dest_addr: IpAddr,
        dest_port: u16,
        src_addr: IpAddr,
        src_port: u16,
    ) -> Option<Arc<FlowSession>> {
        self.try_create_udp_session(dest_addr, dest_port, src_addr, src_port)
            .ok()
    }

    /// Create a UDP session with a single attempt; the connect only fixes the peer
    pub fn try_create_udp_session(
        &self,
        dest_addr: IpAddr,
        dest_port: u16,
        src_addr: IpAddr,
        src_port: u16,
    ) -> Result<Arc<FlowSession>, SessionError> {
        let destination = SocketAddr::new(dest_addr, dest_port);
        let source = SocketAddr::new(src_addr, src_port);
        let key = SessionKey::from_addrs(destination, source);
        self.check_admission(&key)?;

        let (socket, _) = match self.dialer.dial_udp(destination) {
            Ok(d) => d.into_parts(),
            Err(e) => {
                log::warn!("Failed to open UDP socket toward {} for {}: {}", destination, key, e);
                self.metrics
                    .connect_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::Unreachable { key, source: e });
            }
        };

        let session = Arc::new(FlowSession::new_udp(
            destination,
            source,
            self.allocate_token(),
            &self.config,
        ));
        session.attach_socket(RealSocket::Udp(socket), true);

        self.admit(session, Transport::Udp)
    }

    /// Cheap pre-check so no socket is opened for a flow that cannot be admitted
    fn check_admission(&self, key: &SessionKey) -> Result<(), SessionError> {
        if self.directory.contains(key) {
            log::debug!("Session {} already exists", key);
            self.metrics
                .duplicate_sessions_total
                .fetch_add(1, Ordering::Relaxed);
            return Err(SessionError::AlreadyExists(key.clone()));
        }
        if self.directory.len() >= self.directory.capacity() {
            return Err(self.refuse_at_capacity(key));
        }
        Ok(())
    }

    fn refuse_at_capacity(&self, key: &SessionKey) -> SessionError {
        let limit = self.directory.capacity();
        log::warn!("Session limit {} reached, refusing {}", limit, key);
        self.metrics
            .refused_sessions_total
            .fetch_add(1, Ordering::Relaxed);
        SessionError::CapacityReached { limit }
    }

    /// Insert a freshly connected session and register its socket with the reactor.
    /// Losing the insert to a concurrent creator or to capacity closes our socket.
    fn admit(
        &self,
        session: Arc<FlowSession>,
        transport: Transport,
    ) -> Result<Arc<FlowSession>, SessionError> {
        let key = session.key().clone();

        match self.directory.try_insert(Arc::clone(&session)) {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate(_) => {
                log::debug!("Lost creation race for {}, discarding socket", key);
                self.metrics
                    .duplicate_sessions_total
                    .fetch_add(1, Ordering::Relaxed);
                self.release_socket(&session);
                return Err(SessionError::AlreadyExists(key));
            }
            InsertOutcome::Full => {
                let err = self.refuse_at_capacity(&key);
                self.release_socket(&session);
                return Err(err);
            }
        }

        if let Err(e) = self.reactor.register(key.clone()) {
            log::error!("Cannot register {} with the reactor: {}", key, e);
            self.directory.remove_exact(&session);
            self.release_socket(&session);
            return Err(e);
        }

        match transport {
            Transport::Tcp => self.metrics.tcp_sessions_total.fetch_add(1, Ordering::Relaxed),
            Transport::Udp => self.metrics.udp_sessions_total.fetch_add(1, Ordering::Relaxed),
        };
        self.update_active_gauge();
        log::info!("Created {:?} session {} ({:?})", transport, key, session.token());

        Ok(session)
    }

    /// Close the socket of a session that never made it into the reactor
    fn release_socket(&self, session: &FlowSession) {
        session.mark_closed();
        if let Some(socket) = session.take_socket() {
            if let Err(e) = socket.shutdown() {
                log::debug!("Closing discarded socket of {}: {}", session.key(), e);
            }
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn lookup(
        &self,
        dest_addr: IpAddr,
        dest_port: u16,
        src_addr: IpAddr,
        src_port: u16,
    ) -> Option<Arc<FlowSession>> {
        self.directory
            .get(&Self::key(dest_addr, dest_port, src_addr, src_port))
    }

    pub fn lookup_by_key(&self, key: &SessionKey) -> Option<Arc<FlowSession>> {
        self.directory.get(key)
    }

    /// Find the session that owns a reactor token (TCP or UDP)
    pub fn lookup_by_token(&self, token: Token) -> Option<Arc<FlowSession>> {
        self.directory.find_by_token(token)
    }

    /// Refresh a session's last-access time, re-inserting it if it fell out of the
    /// directory while still live. Returns `false` if the session is not in the
    /// directory afterwards.
    pub fn keep_session_alive(&self, session: &Arc<FlowSession>) -> bool {
        session.touch();
        if session.state().is_terminal() {
            return false;
        }

        match self.directory.try_insert(Arc::clone(session)) {
            InsertOutcome::Inserted => {
                self.update_active_gauge();
                true
            }
            InsertOutcome::Duplicate(existing) => {
                if Arc::ptr_eq(&existing, session) {
                    return true;
                }
                log::debug!(
                    "{} was replaced by a newer session, not re-inserting",
                    session.key()
                );
                false
            }
            InsertOutcome::Full => {
                log::warn!(
                    "Session limit {} reached, cannot keep {} alive",
                    self.directory.capacity(),
                    session.key()
                );
                self.metrics
                    .refused_sessions_total
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    // ========================================================================
    // Ingest (client -> remote)
    // ========================================================================

    /// Route a captured TCP segment's payload into its session's outbound buffer.
    ///
    /// Returns the number of payload bytes accepted. Segments for unknown flows and
    /// retransmitted duplicates (sequence before the expected one) are dropped with 0.
    pub fn ingest_client_segment(&self, ip: &IpHeader, tcp: &TcpHeader, frame: &[u8]) -> usize {
        let found = self.lookup(ip.destination, tcp.destination_port, ip.source, tcp.source_port);
        let session = match found {
            Some(s) => s,
            None => {
                log::trace!(
                    "No session for segment {}:{} -> {}:{}",
                    ip.source,
                    tcp.source_port,
                    ip.destination,
                    tcp.destination_port
                );
                return 0;
            }
        };

        session.touch();
        session.set_last_tcp_headers(ip.clone(), tcp.clone());

        let expected = session.received_sequence();
        if expected != 0 && seq_lt(tcp.sequence, expected) {
            log::trace!(
                "Duplicate segment on {}: seq {} < expected {}",
                session.key(),
                tcp.sequence,
                expected
            );
            self.metrics
                .duplicate_segments_total
                .fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let payload = tcp_payload(ip, tcp, frame);
        if payload.is_empty() {
            return 0;
        }

        if let Err(e) = session.append_outbound(payload) {
            log::warn!("Dropping {} bytes for {}: {}", payload.len(), session.key(), e);
            return 0;
        }
        session.advance_received_sequence(tcp.sequence.wrapping_add(payload.len() as u32));
        if tcp.flags.psh {
            session.set_data_ready(true);
        }
        payload.len()
    }

    /// Append a captured datagram's payload to `session`; empty datagrams are dropped
    pub fn ingest_client_datagram(
        &self,
        ip: &IpHeader,
        udp: &UdpHeader,
        frame: &[u8],
        session: &FlowSession,
    ) -> usize {
        let payload = udp_payload(ip, udp, frame);
        if payload.is_empty() {
            log::trace!("Empty datagram for {} dropped", session.key());
            return 0;
        }

        session.touch();
        session.set_last_udp_headers(ip.clone(), udp.clone());

        if let Err(e) = session.append_outbound(payload) {
            log::warn!("Dropping datagram of {} bytes for {}: {}", payload.len(), session.key(), e);
            return 0;
        }
        payload.len()
    }

    // ========================================================================
    // Reactor Requests
    // ========================================================================

    /// Ask the reactor to write the session's outbound buffer
    pub fn request_flush(&self, session: &FlowSession) {
        if let Err(e) = self.reactor.flush(session.key().clone()) {
            log::debug!("Flush for {} not queued: {}", session.key(), e);
        }
    }

    /// Restart reading after the inbound buffer has been drained
    pub fn resume_reading_if_stalled(&self, session: &FlowSession) {
        if session.is_read_stalled() {
            if let Err(e) = self.reactor.resume_read(session.key().clone()) {
                log::debug!("Resume for {} not queued: {}", session.key(), e);
            }
        }
    }

    /// The client sent FIN: record it and shut the real socket's write half once
    /// everything buffered before the FIN has been written
    pub fn half_close_remote(&self, session: &FlowSession) {
        session.mark_acked_to_fin();
        self.request_flush(session);
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Remove the directory entry, then close the real socket.
    ///
    /// Close errors are logged and swallowed; the session is unreachable by then.
    pub fn close_session(&self, session: &FlowSession) {
        let removed = self.directory.remove_exact(session);
        session.mark_closed();

        if let Some(socket) = session.take_socket() {
            if let Err(e) = socket.shutdown() {
                log::debug!("Closing socket of {}: {}", session.key(), e);
            }
            self.reactor.retire(session.token(), socket);
        }

        if removed {
            self.metrics
                .closed_sessions_total
                .fetch_add(1, Ordering::Relaxed);
            self.update_active_gauge();
            log::info!("Closed session {}", session.key());
        }
    }

    pub fn close_by_key(&self, key: &SessionKey) -> bool {
        match self.directory.get(key) {
            Some(session) => {
                self.close_session(&session);
                true
            }
            None => false,
        }
    }

    pub fn close_by_token(&self, token: Token) -> bool {
        match self.directory.find_by_token(token) {
            Some(session) => {
                self.close_session(&session);
                true
            }
            None => false,
        }
    }

    pub fn close_by_tuple(
        &self,
        dest_addr: IpAddr,
        dest_port: u16,
        src_addr: IpAddr,
        src_port: u16,
    ) -> bool {
        self.close_by_key(&Self::key(dest_addr, dest_port, src_addr, src_port))
    }

    /// Close every session that is aborting, past its FIN grace period, or idle.
    /// Returns the keys that were closed.
    pub fn sweep(&self) -> Vec<SessionKey> {
        let now = Instant::now();
        let fin_grace = self.config.fin_grace();
        let mut closed = Vec::new();

        for session in self.directory.values() {
            let idle_limit = match session.transport() {
                Transport::Tcp => self.config.tcp_idle_timeout(),
                Transport::Udp => self.config.udp_idle_timeout(),
            };

            let reason = if session.is_aborting() {
                "aborted"
            } else if session
                .acked_to_fin_at()
                .map_or(false, |at| now.saturating_duration_since(at) >= fin_grace)
            {
                "FIN grace expired"
            } else if session.idle_for(now) >= idle_limit {
                "idle"
            } else {
                continue;
            };

            log::debug!("Sweeping {} ({})", session.key(), reason);
            self.close_session(&session);
            closed.push(session.key().clone());
        }
        closed
    }

    /// Close every live session; returns how many were closed
    pub fn close_all(&self) -> usize {
        let sessions = self.directory.values();
        for session in &sessions {
            self.close_session(session);
        }
        sessions.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
