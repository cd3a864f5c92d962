//! Error types for the session layer
//!
//! Nothing in here is allowed to escape the relay loop as a panic. Buffer faults are
//! reported to the caller, connect failures are classified so the coordinator knows
//! whether another attempt is worth it, and creation conflicts surface as "no session".

use std::collections::TryReserveError;
use std::fmt;
use std::io;

use crate::session::SessionKey;

// ============================================================================
// Buffer Errors
// ============================================================================

/// Failure appending to a session buffer. The buffer is left untouched.
#[derive(Debug)]
pub enum BufferError {
    /// Appending would push the buffer past its configured bound
    Capacity { len: usize, incoming: usize, limit: usize },
    /// The allocator refused to grow the buffer
    Alloc(TryReserveError),
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Capacity { len, incoming, limit } => write!(
                f,
                "buffer holds {} bytes, cannot take {} more (limit {})",
                len, incoming, limit
            ),
            BufferError::Alloc(e) => write!(f, "buffer allocation failed: {}", e),
        }
    }
}

impl std::error::Error for BufferError {}

// ============================================================================
// Connect Classification
// ============================================================================

/// How a non-blocking connect attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Connect is in progress; readiness will report completion
    Pending,
    /// Worth another attempt (unreachable right now, interrupted, reset)
    Transient,
    /// Retrying cannot help (bad address, unsupported family, policy rejection)
    Permanent,
}

impl ConnectFailure {
    /// Classify the error returned by a non-blocking `connect`
    pub fn classify(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::EINPROGRESS | libc::EALREADY => return ConnectFailure::Pending,
                libc::ENETUNREACH | libc::EHOSTUNREACH | libc::EAGAIN | libc::ENOBUFS => {
                    return ConnectFailure::Transient
                }
                libc::EAFNOSUPPORT | libc::EPROTONOSUPPORT | libc::EACCES | libc::EPERM => {
                    return ConnectFailure::Permanent
                }
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::WouldBlock => ConnectFailure::Pending,
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::AddrNotAvailable => ConnectFailure::Transient,
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::Unsupported
            | io::ErrorKind::AddrInUse => ConnectFailure::Permanent,
            _ => ConnectFailure::Transient,
        }
    }
}

// ============================================================================
// Session Errors
// ============================================================================

/// Why a session could not be created or serviced
#[derive(Debug)]
pub enum SessionError {
    /// A session with this key is already live
    AlreadyExists(SessionKey),
    /// The directory is at its configured limit
    CapacityReached { limit: usize },
    /// The destination can never be reached (not retried)
    Unreachable { key: SessionKey, source: io::Error },
    /// Every connect attempt failed with a transient error
    AttemptsExhausted { key: SessionKey, attempts: u32, last: io::Error },
    /// Socket setup failed before any connect was tried
    Socket(io::Error),
    /// The reactor thread is gone
    ReactorClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyExists(key) => write!(f, "session {} already exists", key),
            SessionError::CapacityReached { limit } => {
                write!(f, "session limit of {} reached", limit)
            }
            SessionError::Unreachable { key, source } => {
                write!(f, "session {} unreachable: {}", key, source)
            }
            SessionError::AttemptsExhausted { key, attempts, last } => write!(
                f,
                "session {} failed to connect after {} attempts: {}",
                key, attempts, last
            ),
            SessionError::Socket(e) => write!(f, "socket setup failed: {}", e),
            SessionError::ReactorClosed => write!(f, "reactor is not running"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Unreachable { source, .. } => Some(source),
            SessionError::AttemptsExhausted { last, .. } => Some(last),
            SessionError::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Socket(e)
    }
}

// ============================================================================
// Tests
// ============================================================================
