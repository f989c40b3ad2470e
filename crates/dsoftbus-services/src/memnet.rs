//! Deterministic in-memory network.
//!
//! `MemNet` is a fabric of named hosts living on one thread. Datagrams pass
//! through a seeded fault injector (loss, duplication, jitter) and are
//! delivered when the test advances the fabric clock. Connections are pairs
//! of bounded byte pipes; killing a host breaks every pipe it owns.
//!
//! Same seed plus same call sequence gives the same delivery schedule.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{DISCOVERY_PORT, SESSION_PORT};

use crate::transport::{Connection, NetStack, TransportError};

/// Default bytes a pipe buffers before writes report `WouldBlock`.
pub const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// Fault profile applied to every datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DatagramFaults {
    /// Probability a datagram copy is dropped, 0.0..=1.0.
    pub loss: f64,
    /// Probability a datagram is delivered twice, 0.0..=1.0.
    pub duplicate: f64,
    /// Maximum extra delivery delay; each copy draws uniformly from 0..=jitter.
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemNetStats {
    pub datagrams_sent: u64,
    pub datagrams_dropped: u64,
    pub datagrams_duplicated: u64,
    pub datagrams_delivered: u64,
}

/// Shared handle to the fabric. Clones refer to the same network.
#[derive(Clone)]
pub struct MemNet {
    fabric: Rc<RefCell<Fabric>>,
}

struct Fabric {
    now: MonotonicTime,
    rng: StdRng,
    faults: DatagramFaults,
    pipe_capacity: usize,
    hosts: BTreeMap<IpAddr, Host>,
    in_flight: BTreeMap<(MonotonicTime, u64), Datagram>,
    next_seq: u64,
    next_port: u16,
    stats: MemNetStats,
}

struct Host {
    alive: bool,
    datagram_port: u16,
    session_port: u16,
    inbox: VecDeque<(SocketAddr, Bytes)>,
    backlog: VecDeque<MemConn>,
    pipes: Vec<Weak<RefCell<Pipe>>>,
}

struct Datagram {
    from: SocketAddr,
    to: IpAddr,
    bytes: Bytes,
}

#[derive(Default)]
struct Pipe {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    broken: bool,
}

impl MemNet {
    pub fn new(seed: u64) -> Self {
        Self {
            fabric: Rc::new(RefCell::new(Fabric {
                now: MonotonicTime::ZERO,
                rng: StdRng::seed_from_u64(seed),
                faults: DatagramFaults::default(),
                pipe_capacity: DEFAULT_PIPE_CAPACITY,
                hosts: BTreeMap::new(),
                in_flight: BTreeMap::new(),
                next_seq: 0,
                next_port: 40_000,
                stats: MemNetStats::default(),
            })),
        }
    }

    pub fn set_faults(&self, faults: DatagramFaults) {
        self.fabric.borrow_mut().faults = faults;
    }

    /// Capacity of pipes created from now on.
    pub fn set_pipe_capacity(&self, capacity: usize) {
        self.fabric.borrow_mut().pipe_capacity = capacity.max(1);
    }

    /// Attach a host at `ip` with the standard ports. Re-attaching a killed
    /// host revives it with empty queues.
    pub fn endpoint(&self, ip: Ipv4Addr) -> MemEndpoint {
        self.endpoint_with_ports(ip, DISCOVERY_PORT, SESSION_PORT)
    }

    pub fn endpoint_with_ports(&self, ip: Ipv4Addr, datagram_port: u16, session_port: u16) -> MemEndpoint {
        let ip = IpAddr::V4(ip);
        self.fabric.borrow_mut().hosts.insert(
            ip,
            Host {
                alive: true,
                datagram_port,
                session_port,
                inbox: VecDeque::new(),
                backlog: VecDeque::new(),
                pipes: Vec::new(),
            },
        );
        MemEndpoint {
            net: self.clone(),
            ip,
            session_port,
        }
    }

    /// Broadcast destination on `port`.
    pub fn broadcast(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::BROADCAST, port))
    }

    /// Move the fabric clock forward and deliver every datagram now due.
    pub fn advance(&self, now: MonotonicTime) {
        let mut f = self.fabric.borrow_mut();
        if now > f.now {
            f.now = now;
        }
        f.deliver_due();
    }

    pub fn now(&self) -> MonotonicTime {
        self.fabric.borrow().now
    }

    /// Simulate sudden death: the host stops sending and receiving and every
    /// connection it holds is broken.
    pub fn kill(&self, ip: Ipv4Addr) {
        let backlog = {
            let mut f = self.fabric.borrow_mut();
            let Some(host) = f.hosts.get_mut(&IpAddr::V4(ip)) else {
                return;
            };
            host.alive = false;
            host.inbox.clear();
            for pipe in host.pipes.drain(..).filter_map(|w| w.upgrade()) {
                pipe.borrow_mut().broken = true;
            }
            std::mem::take(&mut host.backlog)
        };
        drop(backlog);
        tracing::debug!(%ip, "memnet host killed");
    }

    pub fn stats(&self) -> MemNetStats {
        self.fabric.borrow().stats
    }

    /// Datagrams accepted by the fabric but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.fabric.borrow().in_flight.len()
    }
}

impl Fabric {
    fn host_alive(&self, ip: &IpAddr) -> bool {
        self.hosts.get(ip).map(|h| h.alive).unwrap_or(false)
    }

    fn schedule(&mut self, from: SocketAddr, to: IpAddr, bytes: &Bytes) {
        let faults = self.faults;
        let loss = faults.loss.clamp(0.0, 1.0);
        let dup = faults.duplicate.clamp(0.0, 1.0);

        let copies = if self.rng.gen_bool(dup) {
            self.stats.datagrams_duplicated += 1;
            2
        } else {
            1
        };
        for _ in 0..copies {
            if self.rng.gen_bool(loss) {
                self.stats.datagrams_dropped += 1;
                continue;
            }
            let delay = if faults.jitter_ms > 0 {
                self.rng.gen_range(0..=faults.jitter_ms)
            } else {
                0
            };
            let at = MonotonicTime::from_millis(self.now.as_millis().saturating_add(delay));
            let seq = self.next_seq;
            self.next_seq += 1;
            self.in_flight.insert(
                (at, seq),
                Datagram {
                    from,
                    to,
                    bytes: bytes.clone(),
                },
            );
        }
    }

    fn deliver_due(&mut self) {
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            let dg = entry.remove();
            if let Some(host) = self.hosts.get_mut(&dg.to) {
                if host.alive {
                    host.inbox.push_back((dg.from, dg.bytes));
                    self.stats.datagrams_delivered += 1;
                }
            }
        }
    }

    fn new_pipe(&self) -> Rc<RefCell<Pipe>> {
        Rc::new(RefCell::new(Pipe {
            capacity: self.pipe_capacity,
            ..Pipe::default()
        }))
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// One host's view of the fabric.
pub struct MemEndpoint {
    net: MemNet,
    ip: IpAddr,
    session_port: u16,
}

impl MemEndpoint {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn net(&self) -> &MemNet {
        &self.net
    }
}

impl NetStack for MemEndpoint {
    type Conn = MemConn;

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.session_port)
    }

    fn send_datagram(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        let mut f = self.net.fabric.borrow_mut();
        let from_port = match f.hosts.get(&self.ip) {
            Some(h) if h.alive => h.datagram_port,
            _ => return Err(TransportError::Closed),
        };
        let from = SocketAddr::new(self.ip, from_port);

        let targets: Vec<IpAddr> = if to.ip() == IpAddr::V4(Ipv4Addr::BROADCAST) {
            f.hosts
                .iter()
                .filter(|(_, h)| h.alive && h.datagram_port == to.port())
                .map(|(ip, _)| *ip)
                .collect()
        } else {
            match f.hosts.get(&to.ip()) {
                Some(h) if h.alive && h.datagram_port == to.port() => vec![to.ip()],
                _ => return Err(TransportError::Unreachable(to)),
            }
        };

        f.stats.datagrams_sent += 1;
        let bytes = Bytes::copy_from_slice(bytes);
        for ip in targets {
            f.schedule(from, ip, &bytes);
        }
        f.deliver_due();
        Ok(())
    }

    fn recv_datagram(&mut self) -> Result<(SocketAddr, Bytes), TransportError> {
        let mut f = self.net.fabric.borrow_mut();
        match f.hosts.get_mut(&self.ip) {
            Some(h) if h.alive => h.inbox.pop_front().ok_or(TransportError::WouldBlock),
            _ => Err(TransportError::Closed),
        }
    }

    fn connect(&mut self, to: SocketAddr) -> Result<MemConn, TransportError> {
        let mut f = self.net.fabric.borrow_mut();
        if !f.host_alive(&self.ip) {
            return Err(TransportError::Closed);
        }
        match f.hosts.get(&to.ip()) {
            Some(h) if h.alive && h.session_port == to.port() => {}
            _ => return Err(TransportError::Unreachable(to)),
        }

        let port = f.next_port;
        f.next_port = f.next_port.checked_add(1).unwrap_or(40_000);
        let local = SocketAddr::new(self.ip, port);

        let up = f.new_pipe();
        let down = f.new_pipe();
        let client = MemConn {
            peer: to,
            tx: up.clone(),
            rx: down.clone(),
            closed: false,
        };
        let server = MemConn {
            peer: local,
            tx: down.clone(),
            rx: up.clone(),
            closed: false,
        };

        for ip in [self.ip, to.ip()] {
            if let Some(h) = f.hosts.get_mut(&ip) {
                h.pipes.push(Rc::downgrade(&up));
                h.pipes.push(Rc::downgrade(&down));
                h.pipes.retain(|w| w.strong_count() > 0);
            }
        }
        if let Some(h) = f.hosts.get_mut(&to.ip()) {
            h.backlog.push_back(server);
        }
        Ok(client)
    }

    fn accept(&mut self) -> Result<MemConn, TransportError> {
        let mut f = self.net.fabric.borrow_mut();
        match f.hosts.get_mut(&self.ip) {
            Some(h) if h.alive => h.backlog.pop_front().ok_or(TransportError::WouldBlock),
            _ => Err(TransportError::Closed),
        }
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// One side of an in-memory connection.
pub struct MemConn {
    peer: SocketAddr,
    tx: Rc<RefCell<Pipe>>,
    rx: Rc<RefCell<Pipe>>,
    closed: bool,
}

impl Connection for MemConn {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.borrow_mut();
        if !rx.buf.is_empty() {
            let n = buf.len().min(rx.buf.len());
            for (slot, byte) in buf.iter_mut().zip(rx.buf.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        if rx.broken {
            return Err(TransportError::Closed);
        }
        if rx.writer_closed {
            return Ok(0);
        }
        Err(TransportError::WouldBlock)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut tx = self.tx.borrow_mut();
        if tx.broken || tx.reader_closed {
            return Err(TransportError::Closed);
        }
        let room = tx.capacity.saturating_sub(tx.buf.len());
        if room == 0 {
            return Err(TransportError::WouldBlock);
        }
        let n = room.min(buf.len());
        tx.buf.extend(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tx.borrow_mut().writer_closed = true;
        self.rx.borrow_mut().reader_closed = true;
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: u64) -> MonotonicTime {
        MonotonicTime::from_millis(ms)
    }

    #[test]
    fn broadcast_reaches_every_live_host_including_sender() {
        let net = MemNet::new(1);
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));

        a.send_datagram(MemNet::broadcast(DISCOVERY_PORT), b"hello").unwrap();
        let (from, bytes) = b.recv_datagram().unwrap();
        assert_eq!(from, SocketAddr::from(([10, 0, 0, 1], DISCOVERY_PORT)));
        assert_eq!(&bytes[..], b"hello");
        assert!(a.recv_datagram().is_ok());
        assert_eq!(b.recv_datagram(), Err(TransportError::WouldBlock));
    }

    #[test]
    fn unicast_to_unknown_host_is_unreachable() {
        let net = MemNet::new(1);
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let to = SocketAddr::from(([10, 0, 0, 9], DISCOVERY_PORT));
        assert_eq!(a.send_datagram(to, b"x"), Err(TransportError::Unreachable(to)));
    }

    #[test]
    fn jitter_delays_until_advance() {
        let net = MemNet::new(7);
        net.set_faults(DatagramFaults {
            jitter_ms: 100,
            ..DatagramFaults::default()
        });
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));
        let to = SocketAddr::from(([10, 0, 0, 2], DISCOVERY_PORT));
        for _ in 0..10 {
            a.send_datagram(to, b"j").unwrap();
        }
        net.advance(t(100));
        let mut got = 0;
        while b.recv_datagram().is_ok() {
            got += 1;
        }
        assert_eq!(got, 10);
    }

    #[test]
    fn total_loss_drops_everything() {
        let net = MemNet::new(3);
        net.set_faults(DatagramFaults {
            loss: 1.0,
            ..DatagramFaults::default()
        });
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));
        let to = SocketAddr::from(([10, 0, 0, 2], DISCOVERY_PORT));
        a.send_datagram(to, b"gone").unwrap();
        net.advance(t(10));
        assert_eq!(b.recv_datagram(), Err(TransportError::WouldBlock));
        assert_eq!(net.stats().datagrams_dropped, 1);
    }

    #[test]
    fn same_seed_same_schedule() {
        let run = |seed| {
            let net = MemNet::new(seed);
            net.set_faults(DatagramFaults {
                loss: 0.3,
                duplicate: 0.3,
                jitter_ms: 20,
            });
            let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
            let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));
            let to = SocketAddr::from(([10, 0, 0, 2], DISCOVERY_PORT));
            for i in 0u8..50 {
                a.send_datagram(to, &[i]).unwrap();
            }
            net.advance(t(20));
            let mut seen = Vec::new();
            while let Ok((_, bytes)) = b.recv_datagram() {
                seen.push(bytes[0]);
            }
            seen
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn connection_round_trip_and_orderly_close() {
        let net = MemNet::new(1);
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));

        let mut client = a.connect(b.local_addr()).unwrap();
        let mut server = b.accept().unwrap();
        assert_eq!(server.peer_addr().ip(), a.ip());

        assert_eq!(client.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(server.read(&mut buf), Err(TransportError::WouldBlock));

        client.close();
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        assert_eq!(server.write(b"late"), Err(TransportError::Closed));
    }

    #[test]
    fn bounded_pipe_applies_backpressure() {
        let net = MemNet::new(1);
        net.set_pipe_capacity(8);
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));
        let mut client = a.connect(b.local_addr()).unwrap();
        let mut server = b.accept().unwrap();

        assert_eq!(client.write(&[1u8; 20]).unwrap(), 8);
        assert_eq!(client.write(&[1u8; 1]), Err(TransportError::WouldBlock));
        let mut buf = [0u8; 3];
        server.read(&mut buf).unwrap();
        assert_eq!(client.write(&[1u8; 20]).unwrap(), 3);
    }

    #[test]
    fn kill_breaks_connections_and_datagrams() {
        let net = MemNet::new(1);
        let mut a = net.endpoint(Ipv4Addr::new(10, 0, 0, 1));
        let mut b = net.endpoint(Ipv4Addr::new(10, 0, 0, 2));
        let mut client = a.connect(b.local_addr()).unwrap();
        let _server = b.accept().unwrap();

        net.kill(Ipv4Addr::new(10, 0, 0, 2));
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf), Err(TransportError::Closed));
        assert_eq!(client.write(b"x"), Err(TransportError::Closed));
        assert_eq!(b.recv_datagram(), Err(TransportError::Closed));
        assert!(matches!(
            a.connect(b.local_addr()),
            Err(TransportError::Unreachable(_))
        ));
    }
}
