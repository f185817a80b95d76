//! Datagram transport seam
//!
//! The library never opens sockets. The host supplies a [`Transport`] and
//! the session drives it from `idle()`: outbound packets are fire-and-
//! forget, inbound packets are drained non-blockingly each tick. A plain
//! `UdpSocket` in non-blocking mode satisfies this trait directly.

use std::io;
use std::net::SocketAddr;

/// Connectionless, best-effort datagram transport (e.g. UDP).
pub trait Transport {
    /// Send one datagram to `target`. Losing the packet is acceptable;
    /// the protocol layer's own timers handle retry.
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<()>;

    /// Receive one datagram if available (non-blocking).
    ///
    /// Returns `Ok(None)` when nothing is pending.
    fn recv_from(&self) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;

    /// The local address this transport is bound to, if known.
    fn local_addr(&self) -> Option<SocketAddr>;
}
