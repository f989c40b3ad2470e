//! OS socket backend for the transport facade.
//!
//! One UDP socket (broadcast enabled) carries announces, one TCP listener
//! accepts sessions. Every socket is non-blocking; the node's tick loop is
//! the only thing that ever waits.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};

use dsoftbus_core::wire::MAX_ANNOUNCE;
use dsoftbus_services::transport::{Connection, NetStack, TransportError};

const LISTEN_BACKLOG: i32 = 128;

pub struct OsNet {
    udp: UdpSocket,
    listener: TcpListener,
    local: SocketAddr,
    buf: Vec<u8>,
}

impl OsNet {
    pub fn bind(ip: IpAddr, discovery_port: u16, session_port: u16) -> Result<Self> {
        let udp_addr = SocketAddr::new(ip, discovery_port);
        let udp = Socket::new(Domain::for_address(udp_addr), Type::DGRAM, Some(Protocol::UDP)).context("socket(udp)")?;
        udp.set_reuse_address(true).context("SO_REUSEADDR")?;
        if ip.is_ipv4() {
            udp.set_broadcast(true).context("SO_BROADCAST")?;
        }
        udp.set_nonblocking(true).context("O_NONBLOCK")?;
        udp.bind(&udp_addr.into())
            .with_context(|| format!("failed to bind discovery socket on {udp_addr}"))?;

        let tcp_addr = SocketAddr::new(ip, session_port);
        let tcp = Socket::new(Domain::for_address(tcp_addr), Type::STREAM, Some(Protocol::TCP)).context("socket(tcp)")?;
        tcp.set_reuse_address(true).context("SO_REUSEADDR")?;
        tcp.set_nonblocking(true).context("O_NONBLOCK")?;
        tcp.bind(&tcp_addr.into())
            .with_context(|| format!("failed to bind session listener on {tcp_addr}"))?;
        tcp.listen(LISTEN_BACKLOG).context("listen()")?;

        tracing::info!(discovery = %udp_addr, session = %tcp_addr, "sockets bound");
        Ok(Self {
            udp: udp.into(),
            listener: tcp.into(),
            local: tcp_addr,
            buf: vec![0u8; MAX_ANNOUNCE * 2],
        })
    }
}

fn map_io(e: io::Error, addr: SocketAddr) -> TransportError {
    match e.kind() {
        // ENOTCONN while a non-blocking connect is still in progress.
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected => {
            TransportError::WouldBlock
        }
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable => TransportError::Unreachable(addr),
        _ => TransportError::Closed,
    }
}

impl NetStack for OsNet {
    type Conn = OsConn;

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send_datagram(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.udp.send_to(bytes, to).map(|_| ()).map_err(|e| map_io(e, to))
    }

    fn recv_datagram(&mut self) -> Result<(SocketAddr, Bytes), TransportError> {
        let (n, from) = self.udp.recv_from(&mut self.buf).map_err(|e| map_io(e, self.local))?;
        Ok((from, Bytes::copy_from_slice(&self.buf[..n])))
    }

    fn connect(&mut self, to: SocketAddr) -> Result<OsConn, TransportError> {
        let socket = Socket::new(Domain::for_address(to), Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| TransportError::Closed)?;
        socket.set_nonblocking(true).map_err(|_| TransportError::Closed)?;
        socket.set_nodelay(true).map_err(|_| TransportError::Closed)?;
        match socket.connect(&to.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(map_io(e, to)),
        }
        tracing::trace!(peer = %to, "connect started");
        Ok(OsConn {
            stream: socket.into(),
            peer: to,
            closed: false,
        })
    }

    fn accept(&mut self) -> Result<OsConn, TransportError> {
        let (stream, peer) = self.listener.accept().map_err(|e| map_io(e, self.local))?;
        stream.set_nonblocking(true).map_err(|_| TransportError::Closed)?;
        stream.set_nodelay(true).map_err(|_| TransportError::Closed)?;
        tracing::trace!(peer = %peer, "connection accepted");
        Ok(OsConn {
            stream,
            peer,
            closed: false,
        })
    }
}

pub struct OsConn {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl Connection for OsConn {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream.read(buf).map_err(|e| map_io(e, self.peer))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream.write(buf).map_err(|e| map_io(e, self.peer))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
