//! Flow session state
//!
//! One `FlowSession` exists per relayed TCP or UDP flow. It is shared as an
//! `Arc<FlowSession>` between the directory, the reactor thread and whatever threads
//! handle capture and injection, so all mutable state sits behind atomics or behind
//! one lock per concern:
//!
//! | lock             | guards                                   |
//! |------------------|------------------------------------------|
//! | `inbound`        | bytes read from the real socket          |
//! | `outbound`       | bytes from the client, not yet written   |
//! | `clear_inbound`  | decoded inbound payload                  |
//! | `clear_outbound` | decoded outbound payload                 |
//! | `flow`           | client window and bytes in flight        |
//! | `last_headers`   | headers of the last client packet        |
//!
//! No operation needs two of these at once. The socket and the two direction claims
//! have their own locks as well.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::StreamBuffer;
use crate::config::SessionConfig;
use crate::error::BufferError;
use crate::packet::{IpHeader, TcpHeader, UdpHeader};

// ============================================================================
// Session Key
// ============================================================================

/// `"{destAddr}:{destPort}-{srcAddr}:{srcPort}"`, the directory key and log identifier.
///
/// Callers treat it as opaque; it is never parsed back into addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(dest_addr: IpAddr, dest_port: u16, src_addr: IpAddr, src_port: u16) -> Self {
        SessionKey(format!("{}:{}-{}:{}", dest_addr, dest_port, src_addr, src_port))
    }

    pub fn from_addrs(destination: SocketAddr, source: SocketAddr) -> Self {
        Self::new(destination.ip(), destination.port(), source.ip(), source.port())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Transport and Lifecycle
// ============================================================================

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Lifecycle of a session
///
/// `Creating -> Connecting -> Connected -> Closing -> FinSentUnacked -> Closed`,
/// with `Aborted` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Creating = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    FinSentUnacked = 4,
    Closed = 5,
    Aborted = 6,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Creating,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closing,
            4 => SessionState::FinSentUnacked,
            5 => SessionState::Closed,
            _ => SessionState::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Aborted) | (_, Closed) => true,
            (Creating, Connecting) | (Creating, Connected) => true,
            (Connecting, Connected) | (Connecting, Closing) => true,
            (Connected, Closing) | (Connected, FinSentUnacked) => true,
            (Closing, FinSentUnacked) => true,
            _ => false,
        }
    }
}

/// `a < b` in TCP sequence space
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

// ============================================================================
// Real Socket
// ============================================================================

/// The outbound socket a session relays through
#[derive(Debug)]
pub enum RealSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl RealSocket {
    /// Close both directions now; dropping the socket releases the descriptor
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            RealSocket::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
            RealSocket::Udp(_) => Ok(()),
        }
    }

    /// Half-close: no more bytes toward the remote
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            RealSocket::Tcp(stream) => stream.shutdown(std::net::Shutdown::Write),
            RealSocket::Udp(_) => Ok(()),
        }
    }
}

impl Source for RealSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            RealSocket::Tcp(s) => s.register(registry, token, interests),
            RealSocket::Udp(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            RealSocket::Tcp(s) => s.reregister(registry, token, interests),
            RealSocket::Udp(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            RealSocket::Tcp(s) => s.deregister(registry),
            RealSocket::Udp(s) => s.deregister(registry),
        }
    }
}

// ============================================================================
// Session Internals
// ============================================================================

/// Client receive window and bytes pushed into it
#[derive(Debug, Default)]
struct FlowControl {
    window_size: u32,
    window_scale: u32,
    /// `window_size * window_scale`; zero until the client advertises one
    window: u32,
    sent_since_last_ack: u32,
}

/// Headers of the most recent client packet, kept for building replies
#[derive(Debug, Default)]
struct LastHeaders {
    ip: Option<IpHeader>,
    tcp: Option<TcpHeader>,
    udp: Option<UdpHeader>,
}

/// Exclusive right to service one direction of a session
pub type DirectionClaim<'a> = MutexGuard<'a, ()>;

// ============================================================================
// Flow Session
// ============================================================================

/// State of one relayed flow
pub struct FlowSession {
    key: SessionKey,
    transport: Transport,
    destination: SocketAddr,
    source: SocketAddr,
    /// Registration token with the reactor
    token: Token,
    created_at: Instant,
    state: AtomicU8,

    /// Next sequence number expected from the client
    received_sequence: AtomicU32,
    /// Oldest sequence number we sent to the client that is not yet acknowledged
    send_unacked: AtomicU32,
    /// Sequence number of the next byte we send to the client
    send_next: AtomicU32,
    initial_sequence: u32,
    initial_ack: u32,
    max_segment_size: AtomicU32,
    timestamp_sender: AtomicU32,
    timestamp_reply_to: AtomicU32,

    flow: Mutex<FlowControl>,
    client_window_ceiling: u32,

    inbound: Mutex<StreamBuffer>,
    outbound: Mutex<StreamBuffer>,
    clear_inbound: Mutex<StreamBuffer>,
    clear_outbound: Mutex<StreamBuffer>,
    last_headers: Mutex<LastHeaders>,
    /// Bytes pushed to the client and not yet acknowledged, from `send_unacked` on
    unacked_data: Mutex<Vec<u8>>,

    socket: Mutex<Option<RealSocket>>,
    read_claim: Mutex<()>,
    write_claim: Mutex<()>,

    connected: AtomicBool,
    closing_connection: AtomicBool,
    has_received_last_segment: AtomicBool,
    acked_to_fin: AtomicBool,
    acked_to_fin_at: Mutex<Option<Instant>>,
    aborting: AtomicBool,
    packet_corrupted: AtomicBool,
    is_acked: AtomicBool,
    data_ready: AtomicBool,
    read_stalled: AtomicBool,
    write_shut: AtomicBool,
    verbose: AtomicBool,

    resend_counter: AtomicU32,
    resend_limit: u32,
    last_accessed: Mutex<Instant>,
}

impl FlowSession {
    /// New TCP session in `Creating`; `sequence`/`ack` come from the client's SYN
    pub fn new_tcp(
        destination: SocketAddr,
        source: SocketAddr,
        token: Token,
        sequence: u32,
        ack: u32,
        config: &SessionConfig,
    ) -> Self {
        let session =
            Self::build(Transport::Tcp, destination, source, token, sequence, ack, config);
        session
            .received_sequence
            .store(sequence, Ordering::Relaxed);
        session
    }

    /// New UDP session in `Creating`; its buffers keep datagram boundaries
    pub fn new_udp(
        destination: SocketAddr,
        source: SocketAddr,
        token: Token,
        config: &SessionConfig,
    ) -> Self {
        Self::build(Transport::Udp, destination, source, token, 0, 0, config)
    }

    fn build(
        transport: Transport,
        destination: SocketAddr,
        source: SocketAddr,
        token: Token,
        sequence: u32,
        ack: u32,
        config: &SessionConfig,
    ) -> Self {
        let limit = config.max_buffer_bytes;
        let new_buffer = || match transport {
            Transport::Tcp => StreamBuffer::stream(limit),
            Transport::Udp => StreamBuffer::datagram(limit),
        };
        let now = Instant::now();

        FlowSession {
            key: SessionKey::from_addrs(destination, source),
            transport,
            destination,
            source,
            token,
            created_at: now,
            state: AtomicU8::new(SessionState::Creating as u8),
            received_sequence: AtomicU32::new(0),
            send_unacked: AtomicU32::new(0),
            send_next: AtomicU32::new(0),
            initial_sequence: sequence,
            initial_ack: ack,
            max_segment_size: AtomicU32::new(0),
            timestamp_sender: AtomicU32::new(0),
            timestamp_reply_to: AtomicU32::new(0),
            flow: Mutex::new(FlowControl::default()),
            client_window_ceiling: config.client_window_ceiling,
            inbound: Mutex::new(new_buffer()),
            outbound: Mutex::new(new_buffer()),
            clear_inbound: Mutex::new(new_buffer()),
            clear_outbound: Mutex::new(new_buffer()),
            last_headers: Mutex::new(LastHeaders::default()),
            unacked_data: Mutex::new(Vec::new()),
            socket: Mutex::new(None),
            read_claim: Mutex::new(()),
            write_claim: Mutex::new(()),
            connected: AtomicBool::new(false),
            closing_connection: AtomicBool::new(false),
            has_received_last_segment: AtomicBool::new(false),
            acked_to_fin: AtomicBool::new(false),
            acked_to_fin_at: Mutex::new(None),
            aborting: AtomicBool::new(false),
            packet_corrupted: AtomicBool::new(false),
            is_acked: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
            read_stalled: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            resend_counter: AtomicU32::new(0),
            resend_limit: config.resend_limit,
            last_accessed: Mutex::new(now),
        }
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the transition is legal; returns whether it happened
    pub fn advance(&self, next: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if from == next {
                return true;
            }
            if !from.can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if self.is_verbose() {
                        log::debug!("Session {} {:?} -> {:?}", self.key, from, next);
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record the real socket's connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            self.advance(SessionState::Connected);
        }
    }

    pub fn is_closing_connection(&self) -> bool {
        self.closing_connection.load(Ordering::Acquire)
    }

    pub fn set_closing_connection(&self) {
        self.closing_connection.store(true, Ordering::Release);
        self.advance(SessionState::Closing);
    }

    /// Our FIN went out to the client and waits for its ACK
    pub fn mark_fin_sent(&self) {
        self.closing_connection.store(true, Ordering::Release);
        self.advance(SessionState::FinSentUnacked);
    }

    /// Entered on teardown
    pub fn mark_closed(&self) {
        self.advance(SessionState::Closed);
    }

    pub fn has_received_last_segment(&self) -> bool {
        self.has_received_last_segment.load(Ordering::Acquire)
    }

    /// The remote side finished sending (EOF on the real socket)
    pub fn set_received_last_segment(&self) {
        self.has_received_last_segment.store(true, Ordering::Release);
    }

    pub fn is_acked_to_fin(&self) -> bool {
        self.acked_to_fin.load(Ordering::Acquire)
    }

    /// The client's FIN has been acknowledged; starts the grace period
    pub fn mark_acked_to_fin(&self) {
        *self.acked_to_fin_at.lock() = Some(Instant::now());
        self.acked_to_fin.store(true, Ordering::Release);
    }

    pub fn acked_to_fin_at(&self) -> Option<Instant> {
        *self.acked_to_fin_at.lock()
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Request immediate teardown. Workers stop servicing the session; the next
    /// sweep (or an explicit close) removes it.
    pub fn abort(&self) {
        self.aborting.store(true, Ordering::Release);
        self.advance(SessionState::Aborted);
    }

    pub fn is_packet_corrupted(&self) -> bool {
        self.packet_corrupted.load(Ordering::Acquire)
    }

    pub fn set_packet_corrupted(&self, corrupted: bool) {
        self.packet_corrupted.store(corrupted, Ordering::Release);
    }

    pub fn is_acked(&self) -> bool {
        self.is_acked.load(Ordering::Acquire)
    }

    pub fn set_acked(&self, acked: bool) {
        self.is_acked.store(acked, Ordering::Release);
    }

    /// The client pushed (PSH) and the outbound buffer is ready to go out
    pub fn is_data_ready(&self) -> bool {
        self.data_ready.load(Ordering::Acquire)
    }

    pub fn set_data_ready(&self, ready: bool) {
        self.data_ready.store(ready, Ordering::Release);
    }

    pub fn is_read_stalled(&self) -> bool {
        self.read_stalled.load(Ordering::Acquire)
    }

    pub fn set_read_stalled(&self, stalled: bool) {
        self.read_stalled.store(stalled, Ordering::Release);
    }

    /// Claim the one-time write half-close; `true` only for the first caller
    pub fn claim_write_shutdown(&self) -> bool {
        !self.write_shut.swap(true, Ordering::AcqRel)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Log every state change of this session at debug level
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed())
    }

    // ------------------------------------------------------------------------
    // Sequence Tracking
    // ------------------------------------------------------------------------

    pub fn received_sequence(&self) -> u32 {
        self.received_sequence.load(Ordering::Acquire)
    }

    pub fn set_received_sequence(&self, sequence: u32) {
        self.received_sequence.store(sequence, Ordering::Release);
    }

    /// Move the expected client sequence forward to `end`, never backward
    pub fn advance_received_sequence(&self, end: u32) {
        let _ = self
            .received_sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 || seq_lt(current, end) {
                    Some(end)
                } else {
                    None
                }
            });
    }

    pub fn send_unacked(&self) -> u32 {
        self.send_unacked.load(Ordering::Acquire)
    }

    pub fn set_send_unacked(&self, sequence: u32) {
        self.send_unacked.store(sequence, Ordering::Release);
    }

    pub fn send_next(&self) -> u32 {
        self.send_next.load(Ordering::Acquire)
    }

    pub fn set_send_next(&self, sequence: u32) {
        self.send_next.store(sequence, Ordering::Release);
    }

    /// Reserve `len` bytes of sequence space; returns the first sequence number
    pub fn claim_send_sequence(&self, len: u32) -> u32 {
        self.send_next.fetch_add(len, Ordering::AcqRel)
    }

    pub fn initial_sequence(&self) -> u32 {
        self.initial_sequence
    }

    pub fn initial_ack(&self) -> u32 {
        self.initial_ack
    }

    pub fn max_segment_size(&self) -> u16 {
        self.max_segment_size.load(Ordering::Relaxed) as u16
    }

    pub fn set_max_segment_size(&self, mss: u16) {
        self.max_segment_size.store(mss as u32, Ordering::Relaxed);
    }

    /// TCP timestamp option values (TSval from the client, TSecr it echoed)
    pub fn timestamps(&self) -> (u32, u32) {
        (
            self.timestamp_sender.load(Ordering::Relaxed),
            self.timestamp_reply_to.load(Ordering::Relaxed),
        )
    }

    pub fn set_timestamps(&self, sender: u32, reply_to: u32) {
        self.timestamp_sender.store(sender, Ordering::Relaxed);
        self.timestamp_reply_to.store(reply_to, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Flow Control
    // ------------------------------------------------------------------------

    /// Record the client's advertised window; `scale` is the multiplier (`1 << shift`)
    pub fn set_send_window(&self, size: u32, scale: u32) {
        let mut flow = self.flow.lock();
        flow.window_size = size;
        flow.window_scale = scale;
        flow.window = size.saturating_mul(scale);
    }

    /// Window from the client's SYN. The scale is kept for later segments but the
    /// SYN's own window is never scaled.
    pub fn set_initial_send_window(&self, size: u32, scale: u32) {
        let mut flow = self.flow.lock();
        flow.window_size = size;
        flow.window_scale = scale;
        flow.window = size;
    }

    pub fn send_window(&self) -> u32 {
        self.flow.lock().window
    }

    pub fn send_window_scale(&self) -> u32 {
        self.flow.lock().window_scale
    }

    pub fn sent_since_last_ack(&self) -> u32 {
        self.flow.lock().sent_since_last_ack
    }

    pub fn increase_sent_since_last_ack(&self, amount: u32) {
        let mut flow = self.flow.lock();
        flow.sent_since_last_ack = flow.sent_since_last_ack.saturating_add(amount);
    }

    /// The client acknowledged `amount` bytes; clamps at zero
    pub fn decrease_sent_since_last_ack(&self, amount: u32) {
        let mut flow = self.flow.lock();
        flow.sent_since_last_ack = flow.sent_since_last_ack.saturating_sub(amount);
    }

    /// Whether the client's receive window is exhausted.
    ///
    /// With an advertised window the limit is that window. Before one is known the
    /// ceiling applies, and the window counts as full once more than the ceiling
    /// is in flight.
    pub fn is_client_window_full(&self) -> bool {
        let flow = self.flow.lock();
        if flow.window > 0 {
            flow.sent_since_last_ack >= flow.window
        } else {
            flow.sent_since_last_ack > self.client_window_ceiling
        }
    }

    /// Bytes that may still be pushed toward the client right now
    pub fn client_window_available(&self) -> u32 {
        let flow = self.flow.lock();
        let limit = if flow.window > 0 {
            flow.window
        } else {
            self.client_window_ceiling.saturating_add(1)
        };
        limit.saturating_sub(flow.sent_since_last_ack)
    }

    // ------------------------------------------------------------------------
    // Retransmission
    // ------------------------------------------------------------------------

    /// Keep bytes just pushed to the client until they are acknowledged
    pub fn push_unacked(&self, data: &[u8]) {
        self.unacked_data.lock().extend_from_slice(data);
    }

    /// Forget the first `amount` unacknowledged bytes
    pub fn acknowledge_unacked(&self, amount: usize) {
        let mut unacked = self.unacked_data.lock();
        let amount = amount.min(unacked.len());
        unacked.drain(..amount);
    }

    /// Up to `max` bytes starting at the oldest unacknowledged one
    pub fn unacked_prefix(&self, max: usize) -> Vec<u8> {
        let unacked = self.unacked_data.lock();
        unacked[..max.min(unacked.len())].to_vec()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked_data.lock().len()
    }

    pub fn clear_unacked_data(&self) {
        self.unacked_data.lock().clear();
    }

    /// Count one retransmission; `false` once the resend limit is exceeded
    pub fn record_resend(&self) -> bool {
        let count = self.resend_counter.fetch_add(1, Ordering::AcqRel) + 1;
        count <= self.resend_limit
    }

    /// The client's acknowledgment moved forward
    pub fn reset_resend(&self) {
        self.resend_counter.store(0, Ordering::Release);
    }

    pub fn resend_count(&self) -> u32 {
        self.resend_counter.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Outbound Buffer (client -> remote)
    // ------------------------------------------------------------------------

    /// Append client payload; all or nothing
    pub fn append_outbound(&self, data: &[u8]) -> Result<(), BufferError> {
        self.outbound.lock().append(data)
    }

    /// Take the whole outbound buffer
    pub fn drain_outbound(&self) -> Vec<u8> {
        self.outbound.lock().take_all()
    }

    /// Take the oldest buffered client datagram (UDP)
    pub fn drain_outbound_datagram(&self) -> Option<Vec<u8>> {
        self.outbound.lock().take_datagram()
    }

    /// Put the unwritten tail of a socket write back in front
    pub fn requeue_outbound(&self, data: &[u8]) {
        self.outbound.lock().prepend(data);
    }

    pub fn has_outbound_data(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    pub fn outbound_size(&self) -> usize {
        self.outbound.lock().len()
    }

    // ------------------------------------------------------------------------
    // Inbound Buffer (remote -> client)
    // ------------------------------------------------------------------------

    /// Append bytes read from the real socket; all or nothing
    pub fn append_inbound(&self, data: &[u8]) -> Result<(), BufferError> {
        self.inbound.lock().append(data)
    }

    /// Take up to `max_size` bytes; anything beyond stays at the front
    pub fn drain_inbound(&self, max_size: usize) -> Vec<u8> {
        self.inbound.lock().take_up_to(max_size)
    }

    /// Take the oldest datagram read from the real socket (UDP)
    pub fn drain_inbound_datagram(&self) -> Option<Vec<u8>> {
        self.inbound.lock().take_datagram()
    }

    pub fn has_inbound_data(&self) -> bool {
        !self.inbound.lock().is_empty()
    }

    pub fn inbound_size(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Space left in the inbound buffer
    pub fn inbound_remaining(&self) -> usize {
        self.inbound.lock().remaining()
    }

    pub fn reset_inbound(&self) {
        self.inbound.lock().clear();
    }

    // ------------------------------------------------------------------------
    // Clear Buffers (decoded inner protocol)
    // ------------------------------------------------------------------------

    pub fn append_clear_inbound(&self, data: &[u8]) -> Result<(), BufferError> {
        self.clear_inbound.lock().append(data)
    }

    pub fn drain_clear_inbound(&self) -> Vec<u8> {
        self.clear_inbound.lock().take_all()
    }

    pub fn reset_clear_inbound(&self) {
        self.clear_inbound.lock().clear();
    }

    pub fn append_clear_outbound(&self, data: &[u8]) -> Result<(), BufferError> {
        self.clear_outbound.lock().append(data)
    }

    pub fn drain_clear_outbound(&self) -> Vec<u8> {
        self.clear_outbound.lock().take_all()
    }

    pub fn reset_clear_outbound(&self) {
        self.clear_outbound.lock().clear();
    }

    // ------------------------------------------------------------------------
    // Last Headers
    // ------------------------------------------------------------------------

    pub fn set_last_tcp_headers(&self, ip: IpHeader, tcp: TcpHeader) {
        let mut last = self.last_headers.lock();
        last.ip = Some(ip);
        last.tcp = Some(tcp);
    }

    pub fn set_last_udp_headers(&self, ip: IpHeader, udp: UdpHeader) {
        let mut last = self.last_headers.lock();
        last.ip = Some(ip);
        last.udp = Some(udp);
    }

    pub fn last_ip_header(&self) -> Option<IpHeader> {
        self.last_headers.lock().ip.clone()
    }

    pub fn last_tcp_header(&self) -> Option<TcpHeader> {
        self.last_headers.lock().tcp.clone()
    }

    pub fn last_udp_header(&self) -> Option<UdpHeader> {
        self.last_headers.lock().udp.clone()
    }

    // ------------------------------------------------------------------------
    // Real Socket
    // ------------------------------------------------------------------------

    /// Hand the session its real socket
    pub fn attach_socket(&self, socket: RealSocket, connected: bool) {
        *self.socket.lock() = Some(socket);
        if connected {
            self.set_connected(true);
        } else {
            self.advance(SessionState::Connecting);
        }
    }

    /// Run `f` on the socket if the session still owns one
    pub fn with_socket<R>(&self, f: impl FnOnce(&mut RealSocket) -> R) -> Option<R> {
        self.socket.lock().as_mut().map(f)
    }

    /// Remove the socket from the session (teardown)
    pub fn take_socket(&self) -> Option<RealSocket> {
        self.socket.lock().take()
    }

    pub fn has_socket(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Claim the read direction; `None` if another worker is servicing it
    pub fn try_claim_read(&self) -> Option<DirectionClaim<'_>> {
        self.read_claim.try_lock()
    }

    /// Claim the write direction; `None` if another worker is servicing it
    pub fn try_claim_write(&self) -> Option<DirectionClaim<'_>> {
        self.write_claim.try_lock()
    }
}

impl fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSession")
            .field("key", &self.key)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .field("token", &self.token)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
