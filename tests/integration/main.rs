//! DSoftBus integration test harness.
//!
//! Every scenario runs whole `Node`s over the in-memory fabric with a
//! simulated clock, so tests are deterministic and need no privileges:
//!
//!   cargo test --test integration
//!
//! Nodes live at 10.0.0.1, 10.0.0.2, ... in the order they are named.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{bail, Context, Result};

use dsoftbus_core::config::SoftbusConfig;
use dsoftbus_core::crypto::Keypair;
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{AnnounceV1, DISCOVERY_PORT, SESSION_PORT};
use dsoftbus_services::memnet::{MemEndpoint, MemNet};
use dsoftbus_services::mux::StreamId;
use dsoftbus_services::session::{SessionId, SessionState};
use dsoftbus_services::transport::NetStack;
use dsoftbus_services::{Node, NodeEvent, SessionEvent};

mod directory;
mod discovery;
mod faults;
mod rpc;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Simulated time per step.
pub const STEP_MS: u64 = 10;

pub fn ip(index: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, index as u8 + 1)
}

/// A set of nodes on one fabric, ticked together.
pub struct Cluster {
    pub net: MemNet,
    pub names: Vec<String>,
    pub nodes: Vec<Node<MemEndpoint>>,
    /// Everything each node reported, in order.
    pub events: Vec<Vec<NodeEvent>>,
    frozen: Vec<bool>,
    now_ms: u64,
}

impl Cluster {
    pub fn new(seed: u64, names: &[&str]) -> Self {
        Self::with_config(seed, names, |_| {})
    }

    pub fn with_config(seed: u64, names: &[&str], tweak: impl Fn(&mut SoftbusConfig)) -> Self {
        let net = MemNet::new(seed);
        let nodes = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut config = SoftbusConfig::default();
                config.identity.device_id = name.to_string();
                tweak(&mut config);
                Node::new(net.endpoint(ip(i)), Keypair::from_seed(name.as_bytes()), config, 1)
                    .expect("test config is valid")
            })
            .collect();
        Self {
            net,
            names: names.iter().map(|n| n.to_string()).collect(),
            nodes,
            events: vec![Vec::new(); names.len()],
            frozen: vec![false; names.len()],
            now_ms: 0,
        }
    }

    pub fn now(&self) -> MonotonicTime {
        MonotonicTime::from_millis(self.now_ms)
    }

    pub fn index(&self, name: &str) -> usize {
        self.names
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    pub fn node(&mut self, name: &str) -> &mut Node<MemEndpoint> {
        let i = self.index(name);
        &mut self.nodes[i]
    }

    pub fn step(&mut self) {
        self.now_ms += STEP_MS;
        let now = self.now();
        self.net.advance(now);
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if self.frozen[i] {
                continue;
            }
            node.tick(now);
            while let Some(event) = node.poll_event() {
                self.events[i].push(event);
            }
        }
    }

    pub fn run_for(&mut self, ms: u64) {
        let end = self.now_ms + ms;
        while self.now_ms < end {
            self.step();
        }
    }

    /// Step until `done` holds, failing after `limit_ms` of simulated time.
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&mut Self) -> bool) -> Result<()> {
        let end = self.now_ms + limit_ms;
        while self.now_ms < end {
            self.step();
            if done(self) {
                return Ok(());
            }
        }
        bail!("condition not met within {limit_ms} ms (now {} ms)", self.now_ms)
    }

    /// Both ends hold an authenticated session with each other.
    pub fn linked(&self, a: &str, b: &str) -> bool {
        self.nodes[self.index(a)].session_with(b).is_some() && self.nodes[self.index(b)].session_with(a).is_some()
    }

    /// Wait until every pair is linked, then give the busdir and rpc
    /// streams a moment to open.
    pub fn link_all(&mut self, limit_ms: u64) -> Result<()> {
        let names = self.names.clone();
        self.run_until(limit_ms, |c| {
            names
                .iter()
                .enumerate()
                .all(|(i, a)| names[i + 1..].iter().all(|b| c.linked(a, b)))
        })
        .context("nodes did not link")?;
        self.run_for(200);
        Ok(())
    }

    /// Simulate the host dying: its sockets and connections vanish.
    pub fn kill(&mut self, name: &str) {
        let i = self.index(name);
        self.net.kill(ip(i));
        self.frozen[i] = true;
    }

    /// Stop ticking a node without touching its network, like a hung process.
    pub fn freeze(&mut self, name: &str) {
        let i = self.index(name);
        self.frozen[i] = true;
    }

    pub fn thaw(&mut self, name: &str) {
        let i = self.index(name);
        self.frozen[i] = false;
    }

    pub fn session_events(&self, name: &str) -> Vec<SessionEvent> {
        self.events[self.index(name)]
            .iter()
            .filter_map(|e| match e {
                NodeEvent::Session(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Terminal states of every session `name` has ended, in order.
    pub fn ended_states(&self, name: &str) -> Vec<SessionState> {
        self.session_events(name)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Ended { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Write all of `data`, stepping while the stream has no credit.
    pub fn write_all(&mut self, name: &str, session: SessionId, stream: StreamId, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        for _ in 0..1_000 {
            let mux = self.node(name).mux_mut(session).context("session gone")?;
            match mux.write(stream, &data[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.code() == "EWOULDBLOCK" => {}
                Err(e) => bail!("write failed: {e}"),
            }
            if sent == data.len() {
                return Ok(());
            }
            self.step();
        }
        bail!("wrote {sent} of {} bytes", data.len())
    }

    /// Read exactly `len` bytes, stepping while nothing is readable.
    pub fn read_exact(&mut self, name: &str, session: SessionId, stream: StreamId, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut buf = vec![0u8; len];
        for _ in 0..1_000 {
            let mux = self.node(name).mux_mut(session).context("session gone")?;
            let n = mux.read(stream, &mut buf[..len - out.len()])?;
            out.extend_from_slice(&buf[..n]);
            if out.len() == len {
                return Ok(out);
            }
            self.step();
        }
        bail!("read {} of {len} bytes", out.len())
    }
}

// ── Impostors ─────────────────────────────────────────────────────────────────

/// A bare host on the fabric that speaks raw datagrams, used to inject
/// announces no honest node would send.
pub struct Impostor {
    pub endpoint: MemEndpoint,
}

impl Impostor {
    pub fn attach(net: &MemNet, host: u8) -> Self {
        Self {
            endpoint: net.endpoint(Ipv4Addr::new(10, 0, 0, host)),
        }
    }

    pub fn ip(&self) -> std::net::IpAddr {
        self.endpoint.ip()
    }

    /// Announce `device_id` with `static_pub`, pointing peers at this host.
    pub fn announce(&mut self, to: Ipv4Addr, device_id: &str, static_pub: [u8; 32], seq: u64) -> Result<()> {
        let packet = AnnounceV1 {
            device_id: device_id.to_string(),
            port: SESSION_PORT,
            noise_static: static_pub,
            announce_seq: seq,
            services: Vec::new(),
        }
        .encode()?;
        self.send_raw(to, &packet)
    }

    pub fn send_raw(&mut self, to: Ipv4Addr, bytes: &[u8]) -> Result<()> {
        self.endpoint
            .send_datagram(SocketAddr::from((to, DISCOVERY_PORT)), bytes)
            .map_err(|e| anyhow::anyhow!("send failed: {e}"))
    }
}

/// A keypair whose public key sorts above `than`, so the node holding
/// `than` is the one that dials.
pub fn keypair_above(than: &[u8; 32], label: &str) -> Keypair {
    (0u32..)
        .map(|i| Keypair::from_seed(format!("{label}-{i}").as_bytes()))
        .find(|kp| kp.public > *than)
        .expect("some seed sorts higher")
}
