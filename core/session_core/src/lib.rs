//! VPN Collector Session Core
//!
//! User-space TCP/UDP session reconstruction for the VPN traffic collector:
//! - Per-flow session state (sequence tracking, client window, buffers, lifecycle)
//! - Bounded session directory keyed by the flow 4-tuple
//! - Coordinator for creation with bounded connect retries, lookup, ingest, teardown
//! - Single-owner readiness reactor driving every real socket

// ============================================================================
// Modules
// ============================================================================

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod dialer;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod protect;
pub mod reactor;
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, SessionConfig, DEFAULT_SESSION_LIMIT};
pub use coordinator::SessionCoordinator;
pub use dialer::{Dialed, Dialer, SystemDialer};
pub use error::{BufferError, ConnectFailure, SessionError};
pub use metrics::Metrics;
pub use packet::{IpHeader, TcpFlags, TcpHeader, UdpHeader};
pub use protect::{AllowAll, ProtectFn, SocketProtector};
pub use reactor::{FlowEvent, FlowEventSink, Reactor, ReactorCommand, ReactorHandle};
pub use session::{FlowSession, RealSocket, SessionKey, SessionState, Transport};
