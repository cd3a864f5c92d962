//! Client-facing TCP/UDP emulation
//!
//! The session layer relays payload between buffers and real sockets. This module is
//! the other half: it answers the client's TCP stack (SYN-ACK, ACK, FIN, RST), feeds
//! captured payload into sessions and wraps inbound bytes into frames for the client.
//!
//! Everything here runs on the daemon's main thread; the reactor thread only reports
//! `FlowEvent`s, which the main loop hands to `FlowHandler::handle_event`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ring::rand::{SecureRandom, SystemRandom};
use session_core::packet::tcp_payload;
use session_core::session::seq_lt;
use session_core::{
    FlowEvent, FlowSession, IpHeader, SessionCoordinator, SessionKey, SessionState, TcpFlags,
    TcpHeader, Transport, UdpHeader,
};

use crate::frame::{self, Packet, TcpReply};

// ============================================================================
// Constants
// ============================================================================

/// Segment size used when the client's SYN carries no MSS option
const DEFAULT_MSS: u16 = 536;

/// Largest segment we push, so a frame fits one datagram on the feed
const MAX_SEGMENT_SIZE: u16 = 1400;

/// Receive window we advertise to the client
const ADVERTISED_WINDOW: u16 = 65_535;

/// Largest window scale shift allowed by TCP
const MAX_WINDOW_SHIFT: u8 = 14;

// ============================================================================
// Output
// ============================================================================

/// Destination for frames injected toward the client
pub trait FrameSink {
    fn send_frame(&mut self, frame: Vec<u8>);
}

impl FrameSink for Vec<Vec<u8>> {
    fn send_frame(&mut self, frame: Vec<u8>) {
        self.push(frame);
    }
}

// ============================================================================
// Flow Handler
// ============================================================================

/// Drives the client side of every flow
pub struct FlowHandler {
    coordinator: Arc<SessionCoordinator>,
    rng: SystemRandom,
    /// TCP sessions we answer for; kept past directory removal so the client can
    /// still be reset when the reactor tears a session down
    tcp_flows: HashMap<SessionKey, Arc<FlowSession>>,
}

impl FlowHandler {
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        FlowHandler {
            coordinator,
            rng: SystemRandom::new(),
            tcp_flows: HashMap::new(),
        }
    }

    pub fn tracked_flows(&self) -> usize {
        self.tcp_flows.len()
    }

    /// Process one captured frame from the client
    pub fn handle_frame(&mut self, frame: &[u8], out: &mut dyn FrameSink) {
        match frame::decode(frame) {
            Ok(Packet::Tcp(ip, tcp)) => self.handle_tcp(&ip, &tcp, frame, out),
            Ok(Packet::Udp(ip, udp)) => self.handle_udp(&ip, &udp, frame, out),
            Err(e) => log::trace!("Dropping frame of {} bytes: {}", frame.len(), e),
        }
    }

    /// React to what the reactor observed on a real socket
    pub fn handle_event(&mut self, event: FlowEvent, out: &mut dyn FrameSink) {
        match event {
            FlowEvent::Connected(key) => {
                if let Some(session) = self.tcp_flows.get(&key).cloned() {
                    self.send_syn_ack(&session, out);
                }
            }
            FlowEvent::ConnectFailed(key) | FlowEvent::Closed(key) => {
                if let Some(session) = self.tcp_flows.remove(&key) {
                    self.send_reset(&session, out);
                }
            }
            FlowEvent::InboundData(key) | FlowEvent::RemoteClosed(key) => {
                if let Some(session) = self.coordinator.lookup_by_key(&key) {
                    match session.transport() {
                        Transport::Tcp => self.deliver(&session, out),
                        Transport::Udp => self.deliver_datagrams(&session, out),
                    }
                }
            }
        }
    }

    fn random_isn(&self) -> u32 {
        let mut bytes = [0u8; 4];
        if self.rng.fill(&mut bytes).is_err() {
            log::warn!("System RNG failed, falling back to a fixed ISN");
        }
        u32::from_be_bytes(bytes)
    }

    // ========================================================================
    // TCP
    // ========================================================================

    fn handle_tcp(
        &mut self,
        ip: &IpHeader,
        tcp: &TcpHeader,
        frame: &[u8],
        out: &mut dyn FrameSink,
    ) {
        let existing = self.coordinator.lookup(
            ip.destination,
            tcp.destination_port,
            ip.source,
            tcp.source_port,
        );

        if tcp.flags.rst {
            if let Some(session) = existing {
                log::debug!("Client reset {}", session.key());
                session.abort();
                self.close(&session);
            }
            return;
        }

        if tcp.flags.syn && !tcp.flags.ack {
            match existing {
                // Retransmitted SYN: answer again once connected
                Some(session) => {
                    if session.is_connected() {
                        self.resend_syn_ack(&session, out);
                    }
                }
                None => self.open_tcp(ip, tcp, out),
            }
            return;
        }

        let session = match existing {
            Some(s) => s,
            None => {
                log::trace!(
                    "Segment for unknown flow {}:{} -> {}:{}",
                    ip.source,
                    tcp.source_port,
                    ip.destination,
                    tcp.destination_port
                );
                self.reset_unknown(ip, tcp, frame, out);
                return;
            }
        };
        if session.is_aborting() {
            return;
        }

        session.touch();
        let previous = session.last_tcp_header();
        let payload_len = tcp_payload(ip, tcp, frame).len();

        let scale = session.send_window_scale().max(1);
        session.set_send_window(tcp.window as u32, scale);
        if let Some((tsval, _)) = tcp.timestamp {
            let (_, reply_to) = session.timestamps();
            session.set_timestamps(tsval, reply_to);
        }

        if tcp.flags.ack && self.process_ack(&session, tcp, payload_len, previous.as_ref(), out) {
            return;
        }

        if payload_len > 0 {
            let expected = session.received_sequence();
            if seq_lt(expected, tcp.sequence) {
                log::trace!(
                    "Out-of-order segment on {}: seq {} ahead of {}",
                    session.key(),
                    tcp.sequence,
                    expected
                );
                self.send_ack(&session, out);
                return;
            }
            if self.coordinator.ingest_client_segment(ip, tcp, frame) > 0 {
                self.coordinator.request_flush(&session);
            }
            self.send_ack(&session, out);
        } else {
            session.set_last_tcp_headers(ip.clone(), tcp.clone());
        }

        if tcp.flags.fin {
            self.handle_client_fin(&session, tcp, payload_len, out);
        }

        self.deliver(&session, out);
    }

    /// SYN for a new flow: create the session; the SYN-ACK waits for `Connected`
    fn open_tcp(&mut self, ip: &IpHeader, tcp: &TcpHeader, out: &mut dyn FrameSink) {
        let session = match self.coordinator.create_tcp_session(
            ip.destination,
            tcp.destination_port,
            ip.source,
            tcp.source_port,
            tcp.sequence,
            tcp.acknowledgment,
        ) {
            Some(s) => s,
            None => {
                let reply = TcpReply {
                    flags: TcpFlags {
                        rst: true,
                        ack: true,
                        ..TcpFlags::default()
                    },
                    sequence: 0,
                    acknowledgment: tcp.sequence.wrapping_add(1),
                    window: 0,
                    mss: None,
                };
                let from = SocketAddr::new(ip.destination, tcp.destination_port);
                let to = SocketAddr::new(ip.source, tcp.source_port);
                emit(out, frame::build_tcp(from, to, &reply, &[]));
                return;
            }
        };

        session.set_received_sequence(tcp.sequence.wrapping_add(1));
        session.set_last_tcp_headers(ip.clone(), tcp.clone());

        let scale = tcp
            .window_scale
            .map(|shift| 1u32 << shift.min(MAX_WINDOW_SHIFT))
            .unwrap_or(1);
        session.set_initial_send_window(tcp.window as u32, scale);
        session.set_max_segment_size(tcp.mss.unwrap_or(DEFAULT_MSS).min(MAX_SEGMENT_SIZE));
        if let Some((tsval, tsecr)) = tcp.timestamp {
            session.set_timestamps(tsval, tsecr);
        }

        let isn = self.random_isn();
        session.set_send_unacked(isn);
        session.set_send_next(isn);

        self.tcp_flows.insert(session.key().clone(), session);
    }

    /// Returns `true` if the segment finished the session
    fn process_ack(
        &mut self,
        session: &Arc<FlowSession>,
        tcp: &TcpHeader,
        payload_len: usize,
        previous: Option<&TcpHeader>,
        out: &mut dyn FrameSink,
    ) -> bool {
        let ack = tcp.acknowledgment;
        let una = session.send_unacked();
        let nxt = session.send_next();

        if session.state() == SessionState::FinSentUnacked && !seq_lt(ack, nxt) {
            log::debug!("Client acknowledged our FIN on {}", session.key());
            if tcp.flags.fin {
                let fin_sequence = tcp.sequence.wrapping_add(payload_len as u32);
                session.set_received_sequence(fin_sequence.wrapping_add(1));
                self.send_ack(session, out);
            }
            self.close(session);
            return true;
        }

        if seq_lt(una, ack) && !seq_lt(nxt, ack) {
            // The first advancing ACK also covers our SYN, which carries no data byte
            let syn = u32::from(!session.is_acked());
            let acked = ack.wrapping_sub(una).saturating_sub(syn);
            session.set_send_unacked(ack);
            session.decrease_sent_since_last_ack(acked);
            session.acknowledge_unacked(acked as usize);
            session.reset_resend();
            session.set_acked(true);
            return false;
        }

        let duplicate = ack == una
            && payload_len == 0
            && !tcp.flags.fin
            && session.unacked_len() > 0
            && previous.map_or(false, |p| p.acknowledgment == ack && p.window == tcp.window);
        if duplicate {
            if session.record_resend() {
                self.retransmit(session, out);
            } else {
                log::debug!(
                    "Resend limit reached on {}, waiting for the client",
                    session.key()
                );
            }
        }
        false
    }

    fn handle_client_fin(
        &mut self,
        session: &Arc<FlowSession>,
        tcp: &TcpHeader,
        payload_len: usize,
        out: &mut dyn FrameSink,
    ) {
        let fin_sequence = tcp.sequence.wrapping_add(payload_len as u32);
        if session.is_acked_to_fin() {
            self.send_ack(session, out);
            return;
        }
        if fin_sequence != session.received_sequence() {
            // Data before the FIN is missing; the client will retransmit
            return;
        }

        log::debug!("Client finished sending on {}", session.key());
        session.set_received_sequence(fin_sequence.wrapping_add(1));
        self.send_ack(session, out);
        self.coordinator.half_close_remote(session);
    }

    /// Push inbound bytes while the client window allows; FIN once the remote is done
    fn deliver(&mut self, session: &Arc<FlowSession>, out: &mut dyn FrameSink) {
        if !session.is_connected() || session.is_aborting() {
            return;
        }
        let mss = session.max_segment_size().max(1) as usize;

        while !session.is_client_window_full() {
            let room = session.client_window_available() as usize;
            let chunk = session.drain_inbound(mss.min(room));
            if chunk.is_empty() {
                break;
            }

            let len = chunk.len() as u32;
            let reply = TcpReply {
                flags: TcpFlags {
                    ack: true,
                    psh: true,
                    ..TcpFlags::default()
                },
                sequence: session.claim_send_sequence(len),
                acknowledgment: session.received_sequence(),
                window: ADVERTISED_WINDOW,
                mss: None,
            };
            session.increase_sent_since_last_ack(len);
            session.push_unacked(&chunk);
            emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &chunk));
        }

        self.coordinator.resume_reading_if_stalled(session);

        let finishing = session.has_received_last_segment()
            && !session.has_inbound_data()
            && matches!(
                session.state(),
                SessionState::Connected | SessionState::Closing
            );
        if finishing {
            let reply = TcpReply {
                flags: TcpFlags {
                    fin: true,
                    ack: true,
                    ..TcpFlags::default()
                },
                sequence: session.claim_send_sequence(1),
                acknowledgment: session.received_sequence(),
                window: ADVERTISED_WINDOW,
                mss: None,
            };
            emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &[]));
            session.mark_fin_sent();
        }
    }

    fn retransmit(&self, session: &FlowSession, out: &mut dyn FrameSink) {
        let mss = session.max_segment_size().max(1) as usize;
        let segment = session.unacked_prefix(mss);
        if segment.is_empty() {
            return;
        }
        log::trace!("Retransmitting {} bytes on {}", segment.len(), session.key());
        let reply = TcpReply {
            flags: TcpFlags {
                ack: true,
                psh: true,
                ..TcpFlags::default()
            },
            sequence: session.send_unacked(),
            acknowledgment: session.received_sequence(),
            window: ADVERTISED_WINDOW,
            mss: None,
        };
        emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &segment));
    }

    fn send_syn_ack(&self, session: &FlowSession, out: &mut dyn FrameSink) {
        let reply = TcpReply {
            flags: TcpFlags {
                syn: true,
                ack: true,
                ..TcpFlags::default()
            },
            sequence: session.claim_send_sequence(1),
            acknowledgment: session.received_sequence(),
            window: ADVERTISED_WINDOW,
            mss: Some(session.max_segment_size()),
        };
        emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &[]));
    }

    fn resend_syn_ack(&self, session: &FlowSession, out: &mut dyn FrameSink) {
        let reply = TcpReply {
            flags: TcpFlags {
                syn: true,
                ack: true,
                ..TcpFlags::default()
            },
            sequence: session.send_unacked(),
            acknowledgment: session.received_sequence(),
            window: ADVERTISED_WINDOW,
            mss: Some(session.max_segment_size()),
        };
        emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &[]));
    }

    fn send_ack(&self, session: &FlowSession, out: &mut dyn FrameSink) {
        let reply = TcpReply {
            flags: TcpFlags {
                ack: true,
                ..TcpFlags::default()
            },
            sequence: session.send_next(),
            acknowledgment: session.received_sequence(),
            window: ADVERTISED_WINDOW,
            mss: None,
        };
        emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &[]));
    }

    fn send_reset(&self, session: &FlowSession, out: &mut dyn FrameSink) {
        let reply = TcpReply {
            flags: TcpFlags {
                rst: true,
                ack: true,
                ..TcpFlags::default()
            },
            sequence: session.send_next(),
            acknowledgment: session.received_sequence(),
            window: 0,
            mss: None,
        };
        emit(out, frame::build_tcp(session.destination(), session.source(), &reply, &[]));
    }

    /// RST for a segment that belongs to no session
    fn reset_unknown(&self, ip: &IpHeader, tcp: &TcpHeader, frame: &[u8], out: &mut dyn FrameSink) {
        let payload_len = tcp_payload(ip, tcp, frame).len() as u32;
        let reply = if tcp.flags.ack {
            TcpReply {
                flags: TcpFlags {
                    rst: true,
                    ..TcpFlags::default()
                },
                sequence: tcp.acknowledgment,
                ..TcpReply::default()
            }
        } else {
            TcpReply {
                flags: TcpFlags {
                    rst: true,
                    ack: true,
                    ..TcpFlags::default()
                },
                sequence: 0,
                acknowledgment: tcp.sequence.wrapping_add(payload_len),
                ..TcpReply::default()
            }
        };
        let from = SocketAddr::new(ip.destination, tcp.destination_port);
        let to = SocketAddr::new(ip.source, tcp.source_port);
        emit(out, frame::build_tcp(from, to, &reply, &[]));
    }

    fn close(&mut self, session: &Arc<FlowSession>) {
        self.tcp_flows.remove(session.key());
        self.coordinator.close_session(session);
    }

    // ========================================================================
    // UDP
    // ========================================================================

    fn handle_udp(
        &mut self,
        ip: &IpHeader,
        udp: &UdpHeader,
        frame: &[u8],
        out: &mut dyn FrameSink,
    ) {
        let session = match self.coordinator.lookup(
            ip.destination,
            udp.destination_port,
            ip.source,
            udp.source_port,
        ) {
            Some(s) => s,
            None => match self.coordinator.create_udp_session(
                ip.destination,
                udp.destination_port,
                ip.source,
                udp.source_port,
            ) {
                Some(s) => s,
                None => return,
            },
        };

        if self.coordinator.ingest_client_datagram(ip, udp, frame, &session) > 0 {
            self.coordinator.request_flush(&session);
        }
        // Replies may already be waiting
        self.deliver_datagrams(&session, out);
    }

    fn deliver_datagrams(&self, session: &FlowSession, out: &mut dyn FrameSink) {
        while let Some(datagram) = session.drain_inbound_datagram() {
            emit(out, frame::build_udp(session.destination(), session.source(), &datagram));
        }
        self.coordinator.resume_reading_if_stalled(session);
    }

    /// Reset every tracked flow (daemon shutdown)
    pub fn reset_all(&mut self, out: &mut dyn FrameSink) {
        let flows: Vec<Arc<FlowSession>> = self.tcp_flows.drain().map(|(_, s)| s).collect();
        for session in &flows {
            self.send_reset(session, out);
        }
    }
}

fn emit(out: &mut dyn FrameSink, frame: Result<Vec<u8>, frame::FrameError>) {
    match frame {
        Ok(frame) => out.send_frame(frame),
        Err(e) => log::warn!("Cannot build reply frame: {}", e),
    }
}
