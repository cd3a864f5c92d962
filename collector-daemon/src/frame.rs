//! Captured frame decoding and reply frame building
//!
//! Decoding turns a raw IP frame into the header views the session layer consumes.
//! Building produces the IP/TCP and IP/UDP frames injected back toward the client;
//! they always travel from the session's remote endpoint to its client endpoint.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use etherparse::{
    InternetSlice, PacketBuilder, PacketBuilderStep, SlicedPacket, TcpOptionElement,
    TransportSlice,
};
use session_core::{IpHeader, TcpFlags, TcpHeader, UdpHeader};

// ============================================================================
// Constants
// ============================================================================

/// TTL / hop limit of injected frames
const REPLY_TTL: u8 = 64;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum FrameError {
    /// The frame is not a well-formed IP packet
    Malformed(String),
    /// Valid IP, but neither TCP nor UDP
    Unsupported,
    /// Source and destination are of different address families
    MixedFamilies,
    /// The builder rejected the frame
    Build(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            FrameError::Unsupported => write!(f, "unsupported transport"),
            FrameError::MixedFamilies => write!(f, "mixed IPv4/IPv6 endpoints"),
            FrameError::Build(msg) => write!(f, "frame build failed: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Decoding
// ============================================================================

/// A captured frame, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Tcp(IpHeader, TcpHeader),
    Udp(IpHeader, UdpHeader),
}

/// Offset of `inner` within `outer`; both slices come from the same frame
fn offset_in(outer: &[u8], inner: &[u8]) -> usize {
    (inner.as_ptr() as usize).saturating_sub(outer.as_ptr() as usize)
}

/// Decode a raw IPv4/IPv6 frame carrying TCP or UDP
pub fn decode(frame: &[u8]) -> Result<Packet, FrameError> {
    let sliced =
        SlicedPacket::from_ip(frame).map_err(|e| FrameError::Malformed(format!("{:?}", e)))?;

    let (source, destination) = match &sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => (
            IpAddr::V4(header.source_addr()),
            IpAddr::V4(header.destination_addr()),
        ),
        Some(InternetSlice::Ipv6(header, _)) => (
            IpAddr::V6(header.source_addr()),
            IpAddr::V6(header.destination_addr()),
        ),
        None => return Err(FrameError::Malformed("no IP header".into())),
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let ip = IpHeader {
                header_len: offset_in(frame, tcp.slice()),
                source,
                destination,
            };

            let mut window_scale = None;
            let mut mss = None;
            let mut timestamp = None;
            for option in tcp.options_iterator().flatten() {
                match option {
                    TcpOptionElement::WindowScale(shift) => window_scale = Some(shift),
                    TcpOptionElement::MaximumSegmentSize(size) => mss = Some(size),
                    TcpOptionElement::Timestamp(val, echo) => timestamp = Some((val, echo)),
                    _ => {}
                }
            }

            let header = TcpHeader {
                header_len: tcp.slice().len(),
                source_port: tcp.source_port(),
                destination_port: tcp.destination_port(),
                sequence: tcp.sequence_number(),
                acknowledgment: tcp.acknowledgment_number(),
                flags: TcpFlags {
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                },
                window: tcp.window_size(),
                window_scale,
                mss,
                timestamp,
            };
            Ok(Packet::Tcp(ip, header))
        }
        Some(TransportSlice::Udp(udp)) => {
            let ip = IpHeader {
                header_len: offset_in(frame, udp.slice()),
                source,
                destination,
            };
            let header = UdpHeader {
                length: udp.length() as usize,
                source_port: udp.source_port(),
                destination_port: udp.destination_port(),
            };
            Ok(Packet::Udp(ip, header))
        }
        _ => Err(FrameError::Unsupported),
    }
}

// ============================================================================
// Building
// ============================================================================

/// Header fields of a TCP segment sent to the client
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpReply {
    pub flags: TcpFlags,
    pub sequence: u32,
    pub acknowledgment: u32,
    pub window: u16,
    /// Advertised on SYN-ACK only
    pub mss: Option<u16>,
}

fn ip_step(
    from: SocketAddr,
    to: SocketAddr,
) -> Result<PacketBuilderStep<etherparse::IpHeader>, FrameError> {
    match (from.ip(), to.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            Ok(PacketBuilder::ipv4(src.octets(), dst.octets(), REPLY_TTL))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            Ok(PacketBuilder::ipv6(src.octets(), dst.octets(), REPLY_TTL))
        }
        _ => Err(FrameError::MixedFamilies),
    }
}

/// IP/TCP frame from `from` (remote) to `to` (client)
pub fn build_tcp(
    from: SocketAddr,
    to: SocketAddr,
    reply: &TcpReply,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let mut builder = ip_step(from, to)?.tcp(from.port(), to.port(), reply.sequence, reply.window);

    if reply.flags.syn {
        builder = builder.syn();
    }
    if reply.flags.ack {
        builder = builder.ack(reply.acknowledgment);
    }
    if reply.flags.fin {
        builder = builder.fin();
    }
    if reply.flags.rst {
        builder = builder.rst();
    }
    if reply.flags.psh {
        builder = builder.psh();
    }
    if let Some(mss) = reply.mss {
        builder = builder
            .options(&[TcpOptionElement::MaximumSegmentSize(mss)])
            .map_err(|e| FrameError::Build(format!("{:?}", e)))?;
    }

    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, payload)
        .map_err(|e| FrameError::Build(format!("{:?}", e)))?;
    Ok(frame)
}

/// IP/UDP frame from `from` (remote) to `to` (client)
pub fn build_udp(from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let builder = ip_step(from, to)?.udp(from.port(), to.port());

    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, payload)
        .map_err(|e| FrameError::Build(format!("{:?}", e)))?;
    Ok(frame)
}

// ============================================================================
// Tests
// ============================================================================
