//! Socket protection
//!
//! Real outbound sockets must not be routed back into the VPN interface they are
//! relaying for. On Android the VPN service exposes `protect(fd)` for that; other
//! hosts route by policy and need nothing. Protection is best effort: a failure is
//! logged and the socket is used anyway.

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use socket2::Socket;

/// Marks a socket so its traffic bypasses the VPN route
pub trait SocketProtector: Send + Sync {
    /// Returns `false` if the socket could not be protected
    fn protect(&self, socket: &Socket) -> bool;
}

/// No-op protector for hosts where the route is handled elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SocketProtector for AllowAll {
    fn protect(&self, _socket: &Socket) -> bool {
        true
    }
}

/// Protector backed by a raw-descriptor callback (the VpnService bridge shape)
pub struct ProtectFn<F>
where
    F: Fn(i32) -> bool + Send + Sync,
{
    callback: F,
}

impl<F> ProtectFn<F>
where
    F: Fn(i32) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        ProtectFn { callback }
    }
}

impl<F> SocketProtector for ProtectFn<F>
where
    F: Fn(i32) -> bool + Send + Sync,
{
    #[cfg(unix)]
    fn protect(&self, socket: &Socket) -> bool {
        let fd = socket.as_raw_fd();
        let ok = (self.callback)(fd);
        if ok {
            log::trace!("Socket fd={} protected", fd);
        }
        ok
    }

    #[cfg(not(unix))]
    fn protect(&self, _socket: &Socket) -> bool {
        true
    }
}
