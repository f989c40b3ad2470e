//! Node: one device's bus, driven by a single event loop.
//!
//! `tick(now)` runs every layer once, in dependency order:
//!   datagrams → discovery → announce → peer expiry → dial
//!   → accept → session input → session events → directory/rpc links
//!   → directory expiry → session output
//!
//! A node dials only peers whose claimed static key sorts above its own, so
//! two nodes never race to connect to each other. The peer with the lower
//! key waits to be dialled.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;

use dsoftbus_core::config::{ConfigError, SoftbusConfig};
use dsoftbus_core::crypto::{Fingerprint, Keypair};
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{validate_label, PacketError, Priority, MAX_DEVICE_ID_BYTES};

use crate::busdir::{Directory, DirectoryError, DirectoryLink};
use crate::discovery::{DiscoveryEngine, LocalAnnounce, PeerEvent};
use crate::mux::{IncomingStream, Mux, MuxError, StreamId, BUSDIR_LABEL, RPCMUX_LABEL};
use crate::peer::{PeerRecord, PeerTable};
use crate::rpcmux::{CallId, RemotePolicy, RpcDispatcher, RpcError, RpcMux, RpcService};
use crate::session::{SessionError, SessionEvent, SessionId, SessionLayer};
use crate::transport::{NetStack, TransportError};

/// Datagrams processed per tick before yielding to the other layers.
const MAX_DATAGRAMS_PER_TICK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Peer(PeerEvent),
    Session(SessionEvent),
    /// The peer opened an application stream.
    IncomingStream {
        session: SessionId,
        device_id: String,
        stream: IncomingStream,
    },
}

/// Handle for a call started through the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallHandle(u64);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid device id: {0}")]
    DeviceId(PacketError),
    #[error("invalid announce address {0:?}")]
    AnnounceAddr(String),
    #[error("no authenticated session with {0}")]
    NoSession(String),
    #[error("stream label {0:?} is reserved")]
    ReservedLabel(String),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Per-session attachments: the directory link and the rpc multiplexer.
struct Link {
    device_id: String,
    fingerprint: Fingerprint,
    busdir: Option<DirectoryLink>,
    rpc: Option<RpcMux>,
}

pub struct Node<N: NetStack> {
    net: N,
    config: SoftbusConfig,
    fingerprint: Fingerprint,
    announce_to: SocketAddr,
    discovery: DiscoveryEngine,
    sessions: SessionLayer<N::Conn>,
    directory: Directory,
    dispatcher: RpcDispatcher,
    links: BTreeMap<SessionId, Link>,
    calls: BTreeMap<CallHandle, (SessionId, CallId)>,
    finished: BTreeMap<CallHandle, Result<Bytes, RpcError>>,
    next_call: u64,
    last_dial: BTreeMap<String, MonotonicTime>,
    events: VecDeque<NodeEvent>,
}

impl<N: NetStack> Node<N> {
    /// Build a node. `initial_seq` must exceed every announce sequence a
    /// previous run of this device sent; the daemon uses wall-clock millis.
    pub fn new(net: N, keypair: Keypair, config: SoftbusConfig, initial_seq: u64) -> Result<Self, NodeError> {
        config.validate()?;
        let device_id = config.identity.device_id.clone();
        validate_label(&device_id, MAX_DEVICE_ID_BYTES, "device_id").map_err(NodeError::DeviceId)?;
        let ip: IpAddr = config
            .network
            .announce_addr
            .parse()
            .map_err(|_| NodeError::AnnounceAddr(config.network.announce_addr.clone()))?;
        let announce_to = SocketAddr::new(ip, config.network.discovery_port);

        let fingerprint = keypair.fingerprint();
        let discovery = DiscoveryEngine::new(
            LocalAnnounce {
                device_id: device_id.clone(),
                static_pub: keypair.public,
                port: config.network.session_port,
                services: Vec::new(),
                initial_seq,
            },
            config.discovery.clone(),
        );
        let sessions = SessionLayer::new(keypair, device_id.clone(), config.session.clone(), config.mux.clone());
        let directory = Directory::new(fingerprint, config.directory.clone());
        let dispatcher = RpcDispatcher::with_policy(RemotePolicy::from_config(&config.rpc));

        tracing::info!(%device_id, %fingerprint, announce_to = %announce_to, "node ready");
        Ok(Self {
            net,
            config,
            fingerprint,
            announce_to,
            discovery,
            sessions,
            directory,
            dispatcher,
            links: BTreeMap::new(),
            calls: BTreeMap::new(),
            finished: BTreeMap::new(),
            next_call: 1,
            last_dial: BTreeMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn device_id(&self) -> &str {
        self.sessions.device_id()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn peers(&self) -> &PeerTable {
        self.discovery.peers()
    }

    pub fn sessions(&self) -> &SessionLayer<N::Conn> {
        &self.sessions
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut Directory {
        &mut self.directory
    }

    /// The authenticated session to `device_id`, if any.
    pub fn session_with(&self, device_id: &str) -> Option<SessionId> {
        self.sessions.authenticated(device_id)
    }

    pub fn poll_event(&mut self) -> Option<NodeEvent> {
        self.events.pop_front()
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: MonotonicTime) {
        self.receive_datagrams(now);
        self.announce(now);
        for event in self.discovery.expire(now) {
            if let PeerEvent::Expired(record) = &event {
                self.last_dial.remove(&record.device_id);
            }
            self.events.push_back(NodeEvent::Peer(event));
        }
        self.dial_peers(now);

        self.sessions.accept_pending(&mut self.net, now);
        self.sessions.poll(self.discovery.peers(), now);
        self.drain_session_events(now);

        self.service_links(now);
        self.directory.tick(now);
        if self.directory.local_service_names() != self.discovery.local().services {
            self.sync_announced_services();
        }

        self.sessions.flush(now);
        self.drain_session_events(now);
    }

    fn receive_datagrams(&mut self, now: MonotonicTime) {
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            match self.net.recv_datagram() {
                Ok((src, bytes)) => {
                    if let Some(event) = self.discovery.on_datagram(src, &bytes, now) {
                        self.events.push_back(NodeEvent::Peer(event));
                    }
                }
                Err(TransportError::WouldBlock) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "datagram receive failed");
                    return;
                }
            }
        }
    }

    fn announce(&mut self, now: MonotonicTime) {
        if let Some(bytes) = self.discovery.announce_tick(now) {
            if let Err(e) = self.net.send_datagram(self.announce_to, &bytes) {
                tracing::debug!(error = %e, to = %self.announce_to, "announce not sent");
            }
        }
    }

    fn dial_peers(&mut self, now: MonotonicTime) {
        let local = *self.sessions.local_static();
        let backoff = self.config.session.handshake_timeout();
        let due: Vec<PeerRecord> = self
            .discovery
            .peers()
            .iter()
            .filter(|r| r.claimed_static_pub > local)
            .filter(|r| !self.sessions.has_session_with(&r.device_id))
            .filter(|r| {
                self.last_dial
                    .get(&r.device_id)
                    .map_or(true, |last| now >= last.saturating_add(backoff))
            })
            .cloned()
            .collect();

        for record in due {
            self.last_dial.insert(record.device_id.clone(), now);
            if let Err(e) = self.sessions.connect(&mut self.net, &record, now) {
                tracing::debug!(device_id = %record.device_id, error = %e, "dial failed");
            }
        }
    }

    fn drain_session_events(&mut self, now: MonotonicTime) {
        while let Some(event) = self.sessions.poll_event() {
            match &event {
                SessionEvent::Authenticated {
                    id,
                    device_id,
                    fingerprint,
                    initiator,
                } => self.attach(*id, device_id.clone(), *fingerprint, *initiator, now),
                SessionEvent::Ended { id, .. } => self.detach(*id),
                SessionEvent::Transition { .. } => {}
            }
            self.events.push_back(NodeEvent::Session(event));
        }
    }

    /// The initiator opens the busdir and rpc streams; the responder picks
    /// them up in `service_links`.
    fn attach(&mut self, id: SessionId, device_id: String, fingerprint: Fingerprint, initiator: bool, now: MonotonicTime) {
        let mut link = Link {
            device_id,
            fingerprint,
            busdir: None,
            rpc: None,
        };
        if initiator {
            if let Some(mux) = self.sessions.mux_mut(id) {
                match mux.open(Priority::Control, BUSDIR_LABEL, now) {
                    Ok(stream) => link.busdir = Some(DirectoryLink::new(stream, fingerprint)),
                    Err(e) => tracing::debug!(session = %id, error = %e, "busdir stream not opened"),
                }
                match mux.open(Priority::Rpc, RPCMUX_LABEL, now) {
                    Ok(stream) => link.rpc = Some(RpcMux::new(stream, Some(fingerprint), self.config.rpc.clone())),
                    Err(e) => tracing::debug!(session = %id, error = %e, "rpc stream not opened"),
                }
            }
        }
        self.links.insert(id, link);
    }

    fn detach(&mut self, id: SessionId) {
        let Some(mut link) = self.links.remove(&id) else {
            return;
        };
        if let Some(rpc) = link.rpc.as_mut() {
            rpc.fail_all(RpcError::Closed);
            let handles: Vec<(CallHandle, CallId)> = self
                .calls
                .iter()
                .filter(|(_, (sid, _))| *sid == id)
                .map(|(h, (_, call))| (*h, *call))
                .collect();
            for (handle, call) in handles {
                self.calls.remove(&handle);
                if let Poll::Ready(result) = rpc.poll_response(call) {
                    self.finished.insert(handle, result);
                }
            }
        }
        let still_linked = self.links.values().any(|l| l.fingerprint == link.fingerprint);
        if !still_linked {
            self.directory.remove_peer(link.fingerprint);
        }
        tracing::debug!(session = %id, device_id = %link.device_id, "session detached");
    }

    fn service_links(&mut self, now: MonotonicTime) {
        let refresh = self.config.directory.refresh_interval();
        let ids: Vec<SessionId> = self.links.keys().copied().collect();
        for id in ids {
            let Some(mux) = self.sessions.mux_mut(id) else {
                continue;
            };
            let Some(link) = self.links.get_mut(&id) else {
                continue;
            };

            while let Some(incoming) = mux.accept() {
                match incoming.label.as_str() {
                    BUSDIR_LABEL if link.busdir.is_none() => {
                        link.busdir = Some(DirectoryLink::new(incoming.id, link.fingerprint));
                    }
                    RPCMUX_LABEL if link.rpc.is_none() => {
                        link.rpc = Some(RpcMux::new(incoming.id, Some(link.fingerprint), self.config.rpc.clone()));
                    }
                    _ => self.events.push_back(NodeEvent::IncomingStream {
                        session: id,
                        device_id: link.device_id.clone(),
                        stream: incoming,
                    }),
                }
            }

            if let Some(busdir) = link.busdir.as_mut() {
                if let Err(e) = busdir.pump(mux, &mut self.directory, refresh, now) {
                    tracing::debug!(session = %id, error = %e, "busdir link lost");
                    link.busdir = None;
                }
            }
            if let Some(rpc) = link.rpc.as_mut() {
                rpc.tick(now);
                if !rpc.is_closed() {
                    if let Err(e) = rpc.pump(mux, &mut self.dispatcher) {
                        tracing::debug!(session = %id, error = %e, "rpc stream lost");
                        rpc.fail_all(RpcError::Closed);
                    }
                }
            }
        }
    }

    // ── Directory ─────────────────────────────────────────────────────────────

    /// Publish a local service. Linked peers learn about it on the next tick
    /// and the service name joins this node's announces.
    pub fn publish(
        &mut self,
        service_name: &str,
        version: u32,
        metadata: BTreeMap<String, String>,
        ttl: Duration,
        now: MonotonicTime,
    ) -> Result<(), DirectoryError> {
        self.directory.publish(service_name, version, metadata, ttl, now)?;
        self.sync_announced_services();
        Ok(())
    }

    pub fn unpublish(&mut self, service_name: &str, version: u32) -> Result<(), DirectoryError> {
        self.directory.unpublish(service_name, version)?;
        self.sync_announced_services();
        Ok(())
    }

    fn sync_announced_services(&mut self) {
        let names = self.directory.local_service_names();
        if let Err(e) = self.discovery.set_services(names) {
            tracing::debug!(error = %e, "service list does not fit in an announce, keeping previous");
        }
    }

    // ── RPC ───────────────────────────────────────────────────────────────────

    /// Register a local service. Returns the service it replaced. Peers can
    /// only call it once it is listed in `rpc.allowed_services` or passed to
    /// `allow_remote`.
    pub fn register_service(&mut self, service: Box<dyn RpcService>) -> Option<Box<dyn RpcService>> {
        self.dispatcher.register(service)
    }

    /// Let linked peers call `service`.
    pub fn allow_remote(&mut self, service: &str) {
        self.dispatcher.policy_mut().allow(service);
    }

    /// Call `service` on whichever linked peer publishes it, preferring the
    /// highest version. Uses the configured call timeout.
    pub fn call(&mut self, service: &str, method: &str, payload: &[u8], now: MonotonicTime) -> Result<CallHandle, RpcError> {
        let deadline = now.saturating_add(self.config.rpc.call_timeout());
        self.call_with_deadline(service, method, payload, deadline)
    }

    pub fn call_with_deadline(
        &mut self,
        service: &str,
        method: &str,
        payload: &[u8],
        deadline: MonotonicTime,
    ) -> Result<CallHandle, RpcError> {
        let mut candidates: Vec<_> = self
            .directory
            .list(service)
            .into_iter()
            .filter(|e| e.peer != self.fingerprint)
            .collect();
        candidates.sort_by_key(|e| (Reverse(e.version), e.peer));

        let session = candidates.iter().find_map(|entry| {
            self.links
                .iter()
                .find(|(_, l)| l.fingerprint == entry.peer && l.rpc.as_ref().is_some_and(|r| !r.is_closed()))
                .map(|(id, _)| *id)
        });
        match session {
            Some(id) => self.call_session(id, service, method, payload, deadline),
            None => Err(RpcError::NotFound),
        }
    }

    /// Call a specific peer, whether or not it published `service`.
    pub fn call_peer(
        &mut self,
        device_id: &str,
        service: &str,
        method: &str,
        payload: &[u8],
        deadline: MonotonicTime,
    ) -> Result<CallHandle, RpcError> {
        let id = self.sessions.authenticated(device_id).ok_or(RpcError::Closed)?;
        self.call_session(id, service, method, payload, deadline)
    }

    fn call_session(
        &mut self,
        id: SessionId,
        service: &str,
        method: &str,
        payload: &[u8],
        deadline: MonotonicTime,
    ) -> Result<CallHandle, RpcError> {
        let rpc = self
            .links
            .get_mut(&id)
            .and_then(|l| l.rpc.as_mut())
            .ok_or(RpcError::Closed)?;
        let call = rpc.call(service, method, payload, deadline)?;
        let handle = CallHandle(self.next_call);
        self.next_call += 1;
        self.calls.insert(handle, (id, call));
        Ok(handle)
    }

    /// `Ready` exactly once per call.
    pub fn poll_call(&mut self, handle: CallHandle) -> Poll<Result<Bytes, RpcError>> {
        if let Some(result) = self.finished.remove(&handle) {
            return Poll::Ready(result);
        }
        let Some(&(id, call)) = self.calls.get(&handle) else {
            return Poll::Ready(Err(RpcError::Closed));
        };
        let Some(rpc) = self.links.get_mut(&id).and_then(|l| l.rpc.as_mut()) else {
            self.calls.remove(&handle);
            return Poll::Ready(Err(RpcError::Closed));
        };
        match rpc.poll_response(call) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.calls.remove(&handle);
                Poll::Ready(result)
            }
        }
    }

    // ── Application streams ───────────────────────────────────────────────────

    /// Open an application stream to an authenticated peer.
    pub fn open_stream(
        &mut self,
        device_id: &str,
        priority: Priority,
        label: &str,
        now: MonotonicTime,
    ) -> Result<(SessionId, StreamId), NodeError> {
        if label == BUSDIR_LABEL || label == RPCMUX_LABEL {
            return Err(NodeError::ReservedLabel(label.to_string()));
        }
        let id = self
            .sessions
            .authenticated(device_id)
            .ok_or_else(|| NodeError::NoSession(device_id.to_string()))?;
        let mux = self
            .sessions
            .mux_mut(id)
            .ok_or_else(|| NodeError::NoSession(device_id.to_string()))?;
        Ok((id, mux.open(priority, label, now)?))
    }

    /// The mux of an authenticated session, for reading and writing streams.
    pub fn mux_mut(&mut self, session: SessionId) -> Option<&mut Mux> {
        self.sessions.mux_mut(session)
    }

    /// Close a session with a peer. Its calls fail with `ECLOSED` and its
    /// directory entries are dropped on the next event drain.
    pub fn disconnect(&mut self, device_id: &str, now: MonotonicTime) -> Result<(), NodeError> {
        let id = self
            .sessions
            .authenticated(device_id)
            .ok_or_else(|| NodeError::NoSession(device_id.to_string()))?;
        self.sessions.close(id, now)?;
        self.drain_session_events(now);
        Ok(())
    }
}
