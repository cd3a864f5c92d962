//! VPN Collector Daemon
//!
//! Client-side half of the relay:
//! - Decodes captured IP frames into the session layer's header views
//! - Emulates the client-facing end of each TCP flow (handshake, ACKs, FIN/RST)
//! - Wraps inbound bytes and datagrams into frames for injection

pub mod frame;
pub mod handler;

pub use frame::{FrameError, Packet, TcpReply};
pub use handler::{FlowHandler, FrameSink};
