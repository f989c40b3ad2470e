//! Transport facade: the only place the stack touches a network.
//!
//! Every call is non-blocking. `WouldBlock` means "nothing now, poll again",
//! `Closed` means the socket or connection is gone, `Unreachable` means no
//! endpoint answers at that address. None of them is fatal to the caller and
//! the facade never retries on its own.

use std::net::SocketAddr;

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("operation would block")]
    WouldBlock,

    #[error("transport closed")]
    Closed,

    #[error("{0} unreachable")]
    Unreachable(SocketAddr),
}

/// A reliable, ordered byte stream to one remote endpoint.
pub trait Connection {
    fn peer_addr(&self) -> SocketAddr;

    /// Read available bytes. `Ok(0)` is an orderly end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write as much of `buf` as fits right now. May write fewer bytes than
    /// offered; returns `WouldBlock` when nothing fits.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Release the connection. Further calls fail with `Closed`.
    fn close(&mut self);
}

/// Datagrams for discovery plus connections for sessions.
pub trait NetStack {
    type Conn: Connection;

    /// Address peers use to reach this stack's connection listener.
    fn local_addr(&self) -> SocketAddr;

    fn send_datagram(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError>;

    fn recv_datagram(&mut self) -> Result<(SocketAddr, Bytes), TransportError>;

    /// Start a connection. It may still be in progress when returned; writes
    /// report `WouldBlock` until it completes.
    fn connect(&mut self, to: SocketAddr) -> Result<Self::Conn, TransportError>;

    fn accept(&mut self) -> Result<Self::Conn, TransportError>;
}
