//! Secure session layer: Noise_XK over a reliable connection.
//!
//! One `SecureSession` per connection attempt. The initiator dials a peer it
//! learned from discovery and already knows the peer's claimed static key;
//! the responder learns who is calling from message 3. Either way, the key
//! proven by the handshake is compared byte-for-byte with the discovery
//! record before the session can become `Authenticated`. A mismatch rejects
//! the attempt and drops every derived key.
//!
//! Wire layout on the connection (every frame has a u16 BE length prefix):
//!   msg1, msg2, msg3                 raw Noise handshake messages
//!   [nonce u64 LE | ciphertext]      transport records afterwards
//! A record's plaintext is `[RecordKind u8 | body]`.
//!
//! Each side sends an `Accept` record once its own identity check passed and
//! only turns `Authenticated` after the peer's `Accept` arrives. The mux is
//! created at that point and never exists for a rejected session.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};

use dsoftbus_core::config::{MuxConfig, SessionConfig};
use dsoftbus_core::crypto::{
    CompletedHandshake, CryptoError, Fingerprint, Keypair, NoiseInitiator, NoiseResponder, ResponderPending,
    SessionCipher,
};
use dsoftbus_core::framing::{put_frame, FrameReader, Prefix};
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{validate_label, Frame, RecordKind, WireError, MAX_DEVICE_ID_BYTES};

use crate::mux::Mux;
use crate::peer::{PeerRecord, PeerTable};
use crate::transport::{Connection, NetStack, TransportError};

const READ_CHUNK: usize = 4096;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Local handle for one session attempt. Never reused within a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Why an attempt never reached `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionRejection {
    #[error("handshake timed out")]
    Timeout,
    #[error("cryptographic failure")]
    CryptoFailure,
    #[error("authenticated key does not match the claimed identity")]
    IdentityMismatch,
    #[error("peer closed the connection during the handshake")]
    PeerClosed,
    #[error("handshake protocol violation")]
    Protocol,
}

/// Why an authenticated session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Remote,
    IdleTimeout,
    TransportLost,
    Protocol,
    CryptoFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Message 1 sent.
    HandshakeInitiated,
    /// Message 2 sent (responder) or received (initiator).
    HandshakeResponded,
    /// Message 3 exchanged, transport keys derived.
    HandshakeCompleted,
    IdentityVerifying,
    Authenticated,
    Rejected(SessionRejection),
    Closed(CloseReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Rejected(_) | SessionState::Closed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Transition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
    Authenticated {
        id: SessionId,
        device_id: String,
        fingerprint: Fingerprint,
        initiator: bool,
    },
    /// The session reached a terminal state and was removed.
    Ended {
        id: SessionId,
        device_id: Option<String>,
        state: SessionState,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("session limit reached")]
    TooManySessions,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is not authenticated")]
    NotAuthenticated(SessionId),
}

enum Handshake {
    Initiator(NoiseInitiator),
    Responder(NoiseResponder),
    AwaitingMsg3(ResponderPending),
    Done,
}

/// Borrowed layer state handed to a session while it runs.
struct Ctx<'a> {
    device_id: &'a str,
    config: &'a SessionConfig,
    mux_config: &'a MuxConfig,
    events: &'a mut VecDeque<SessionEvent>,
    now: MonotonicTime,
}

// ── SecureSession ─────────────────────────────────────────────────────────────

pub struct SecureSession<C> {
    id: SessionId,
    initiator: bool,
    conn: C,
    peer_addr: SocketAddr,
    state: SessionState,
    handshake: Handshake,
    /// Initiator: the record that led to this attempt. Responder: the record
    /// the peer's claim was checked against.
    expected: Option<PeerRecord>,
    peer_device_id: Option<String>,
    authenticated_static_pub: Option<[u8; 32]>,
    cipher: Option<SessionCipher>,
    mux: Option<Mux>,
    local_accepted: bool,
    peer_accepted: bool,
    reader: FrameReader,
    outbound: BytesMut,
    plain: Vec<u8>,
    sealed: Vec<u8>,
    opened: Vec<u8>,
    started_at: MonotonicTime,
    last_recv: MonotonicTime,
    last_send: MonotonicTime,
}

impl<C> fmt::Debug for SecureSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("peer", &self.peer_device_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> SecureSession<C> {
    fn new(id: SessionId, initiator: bool, conn: C, handshake: Handshake, now: MonotonicTime) -> Self {
        let peer_addr = conn.peer_addr();
        Self {
            id,
            initiator,
            conn,
            peer_addr,
            state: SessionState::Idle,
            handshake,
            expected: None,
            peer_device_id: None,
            authenticated_static_pub: None,
            cipher: None,
            mux: None,
            local_accepted: false,
            peer_accepted: false,
            reader: FrameReader::new(Prefix::U16, u16::MAX as usize),
            outbound: BytesMut::new(),
            plain: Vec::new(),
            sealed: Vec::new(),
            opened: Vec::new(),
            started_at: now,
            last_recv: now,
            last_send: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Device id the peer claimed during the handshake, once known.
    pub fn peer_device_id(&self) -> Option<&str> {
        self.peer_device_id.as_deref()
    }

    /// Static key the peer proved, once the handshake completed.
    pub fn authenticated_static_pub(&self) -> Option<&[u8; 32]> {
        self.authenticated_static_pub.as_ref()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.authenticated_static_pub.as_ref().map(Fingerprint::of)
    }

    /// The stream multiplexer. Only an authenticated session has one.
    pub fn mux_mut(&mut self) -> Option<&mut Mux> {
        match self.state {
            SessionState::Authenticated => self.mux.as_mut(),
            _ => None,
        }
    }

    fn set_state(&mut self, to: SessionState, cx: &mut Ctx<'_>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::debug!(session = %self.id, ?from, ?to, "session transition");
        cx.events.push_back(SessionEvent::Transition { id: self.id, from, to });
    }

    /// Enter a terminal state. All key material and the mux are dropped and
    /// nothing still queued is sent.
    fn end(&mut self, to: SessionState, cx: &mut Ctx<'_>) {
        if self.state.is_terminal() {
            return;
        }
        match to {
            SessionState::Rejected(SessionRejection::IdentityMismatch)
            | SessionState::Rejected(SessionRejection::CryptoFailure)
            | SessionState::Closed(CloseReason::CryptoFailure) => {
                tracing::warn!(
                    session = %self.id,
                    peer = %self.peer_addr,
                    device_id = ?self.peer_device_id,
                    ?to,
                    "session rejected"
                );
            }
            _ => {}
        }
        self.cipher = None;
        self.mux = None;
        self.handshake = Handshake::Done;
        self.outbound.clear();
        self.plain.clear();
        self.opened.clear();
        self.conn.close();
        self.set_state(to, cx);
    }

    /// Fail with the right terminal state for how far the session got.
    fn fail(&mut self, rejection: SessionRejection, close: CloseReason, cx: &mut Ctx<'_>) {
        let to = if self.state == SessionState::Authenticated {
            SessionState::Closed(close)
        } else {
            SessionState::Rejected(rejection)
        };
        self.end(to, cx);
    }

    fn queue_raw(&mut self, msg: &[u8]) -> Result<(), SessionError> {
        put_frame(&mut self.outbound, Prefix::U16, msg)?;
        Ok(())
    }

    fn queue_record(&mut self, kind: RecordKind, body: &[u8], now: MonotonicTime) -> Result<(), SessionError> {
        let cipher = self.cipher.as_mut().ok_or(CryptoError::MissingRemoteStatic)?;
        self.plain.clear();
        self.plain.push(kind as u8);
        self.plain.extend_from_slice(body);
        cipher.encrypt(&self.plain, &mut self.sealed)?;
        put_frame(&mut self.outbound, Prefix::U16, &self.sealed)?;
        self.last_send = now;
        Ok(())
    }

    /// Drain the connection into the frame reader. Returns true at EOF.
    fn read_transport(&mut self) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.conn.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(TransportError::WouldBlock) => return false,
                Err(_) => return true,
            }
        }
    }

    fn poll(&mut self, peers: &PeerTable, cx: &mut Ctx<'_>) {
        if self.state.is_terminal() {
            return;
        }
        let eof = self.read_transport();

        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => {
                    self.last_recv = cx.now;
                    self.on_frame(&frame, peers, cx);
                    if self.state.is_terminal() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(session = %self.id, error = %e, "bad record framing");
                    self.fail(SessionRejection::Protocol, CloseReason::Protocol, cx);
                    return;
                }
            }
        }

        if self.state == SessionState::IdentityVerifying && !self.local_accepted && !self.initiator {
            self.verify_responder(peers, cx);
            if self.state.is_terminal() {
                return;
            }
        }

        if eof {
            self.fail(SessionRejection::PeerClosed, CloseReason::TransportLost, cx);
            return;
        }
        self.on_timers(cx);
    }

    fn on_timers(&mut self, cx: &mut Ctx<'_>) {
        let now = cx.now;
        if self.state != SessionState::Authenticated {
            let deadline = self.started_at.saturating_add(cx.config.handshake_timeout());
            if now.is_past(deadline) {
                tracing::debug!(session = %self.id, peer = %self.peer_addr, "handshake deadline passed");
                self.end(SessionState::Rejected(SessionRejection::Timeout), cx);
            }
            return;
        }

        if now.is_past(self.last_recv.saturating_add(cx.config.idle_timeout())) {
            tracing::info!(session = %self.id, device_id = ?self.peer_device_id, "session idle, closing");
            self.end(SessionState::Closed(CloseReason::IdleTimeout), cx);
            return;
        }
        if let Some(mux) = self.mux.as_mut() {
            mux.tick(now);
        }
        if now.saturating_duration_since(self.last_send) >= cx.config.keepalive_interval() {
            if let Err(e) = self.queue_record(RecordKind::Keepalive, &[], now) {
                tracing::debug!(session = %self.id, error = %e, "keepalive failed");
                self.end(SessionState::Closed(CloseReason::CryptoFailure), cx);
            }
        }
    }

    fn on_frame(&mut self, frame: &[u8], peers: &PeerTable, cx: &mut Ctx<'_>) {
        match std::mem::replace(&mut self.handshake, Handshake::Done) {
            Handshake::Responder(noise) => self.on_msg1(noise, frame, cx),
            Handshake::Initiator(noise) => self.on_msg2(noise, frame, cx),
            Handshake::AwaitingMsg3(pending) => self.on_msg3(pending, frame, peers, cx),
            Handshake::Done => self.on_record(frame, cx),
        }
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    fn on_msg1(&mut self, noise: NoiseResponder, msg1: &[u8], cx: &mut Ctx<'_>) {
        let msg2 = match noise.respond(msg1, cx.device_id.as_bytes()) {
            Ok((pending, msg2)) => {
                self.handshake = Handshake::AwaitingMsg3(pending);
                msg2
            }
            Err(e) => {
                tracing::debug!(session = %self.id, peer = %self.peer_addr, error = %e, "bad handshake message 1");
                self.end(SessionState::Rejected(SessionRejection::CryptoFailure), cx);
                return;
            }
        };
        if self.queue_raw(&msg2).is_err() {
            self.end(SessionState::Rejected(SessionRejection::Protocol), cx);
            return;
        }
        self.set_state(SessionState::HandshakeResponded, cx);
    }

    fn on_msg2(&mut self, noise: NoiseInitiator, msg2: &[u8], cx: &mut Ctx<'_>) {
        let (pending, payload) = match noise.read_response(msg2) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(session = %self.id, peer = %self.peer_addr, error = %e, "bad handshake message 2");
                self.end(SessionState::Rejected(SessionRejection::CryptoFailure), cx);
                return;
            }
        };
        self.set_state(SessionState::HandshakeResponded, cx);

        let (done, msg3) = match pending.finish(cx.device_id.as_bytes()) {
            Ok(ok) => ok,
            Err(_) => {
                self.end(SessionState::Rejected(SessionRejection::CryptoFailure), cx);
                return;
            }
        };
        if self.queue_raw(&msg3).is_err() {
            self.end(SessionState::Rejected(SessionRejection::Protocol), cx);
            return;
        }
        self.install(done, cx);

        let Some(claimed_id) = parse_device_id(&payload) else {
            self.end(SessionState::Rejected(SessionRejection::Protocol), cx);
            return;
        };
        self.peer_device_id = Some(claimed_id);
        self.set_state(SessionState::IdentityVerifying, cx);

        let bound = match (&self.expected, &self.authenticated_static_pub, &self.peer_device_id) {
            (Some(record), Some(proven), Some(claimed_id)) => {
                record.claimed_static_pub == *proven && record.device_id == *claimed_id
            }
            _ => false,
        };
        if !bound {
            self.end(SessionState::Rejected(SessionRejection::IdentityMismatch), cx);
            return;
        }
        self.accept_locally(cx);
    }

    fn on_msg3(&mut self, pending: ResponderPending, msg3: &[u8], peers: &PeerTable, cx: &mut Ctx<'_>) {
        let (done, payload) = match pending.finish(msg3) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(session = %self.id, peer = %self.peer_addr, error = %e, "bad handshake message 3");
                self.end(SessionState::Rejected(SessionRejection::CryptoFailure), cx);
                return;
            }
        };
        self.install(done, cx);

        let Some(claimed_id) = parse_device_id(&payload) else {
            self.end(SessionState::Rejected(SessionRejection::Protocol), cx);
            return;
        };
        self.peer_device_id = Some(claimed_id);
        self.set_state(SessionState::IdentityVerifying, cx);
        self.verify_responder(peers, cx);
    }

    fn install(&mut self, done: CompletedHandshake, cx: &mut Ctx<'_>) {
        self.authenticated_static_pub = Some(done.remote_static);
        self.cipher = Some(done.cipher);
        self.set_state(SessionState::HandshakeCompleted, cx);
    }

    /// Check the initiator's proven key against the discovery record for the
    /// device id it claimed. Without a record the session keeps waiting until
    /// the handshake deadline.
    fn verify_responder(&mut self, peers: &PeerTable, cx: &mut Ctx<'_>) {
        let (Some(device_id), Some(proven)) = (&self.peer_device_id, &self.authenticated_static_pub) else {
            return;
        };
        let Some(record) = peers.get(device_id) else {
            tracing::trace!(session = %self.id, %device_id, "no discovery record yet, waiting");
            return;
        };
        if record.claimed_static_pub != *proven {
            self.end(SessionState::Rejected(SessionRejection::IdentityMismatch), cx);
            return;
        }
        self.expected = Some(record.clone());
        self.accept_locally(cx);
    }

    fn accept_locally(&mut self, cx: &mut Ctx<'_>) {
        if let Err(e) = self.queue_record(RecordKind::Accept, &[], cx.now) {
            tracing::debug!(session = %self.id, error = %e, "failed to queue accept");
            self.end(SessionState::Rejected(SessionRejection::CryptoFailure), cx);
            return;
        }
        self.local_accepted = true;
        self.maybe_authenticate(cx);
    }

    fn maybe_authenticate(&mut self, cx: &mut Ctx<'_>) {
        if !(self.local_accepted && self.peer_accepted) || self.state != SessionState::IdentityVerifying {
            return;
        }
        let (Some(device_id), Some(fingerprint)) = (self.peer_device_id.clone(), self.fingerprint()) else {
            return;
        };
        self.mux = Some(Mux::new(self.initiator, cx.mux_config.clone()));
        self.set_state(SessionState::Authenticated, cx);
        tracing::info!(
            session = %self.id,
            %device_id,
            %fingerprint,
            peer = %self.peer_addr,
            initiator = self.initiator,
            "session authenticated"
        );
        cx.events.push_back(SessionEvent::Authenticated {
            id: self.id,
            device_id,
            fingerprint,
            initiator: self.initiator,
        });
    }

    // ── Records ───────────────────────────────────────────────────────────────

    fn on_record(&mut self, record: &[u8], cx: &mut Ctx<'_>) {
        let Some(cipher) = self.cipher.as_mut() else {
            self.fail(SessionRejection::Protocol, CloseReason::Protocol, cx);
            return;
        };
        if let Err(e) = cipher.decrypt(record, &mut self.opened) {
            tracing::debug!(session = %self.id, error = %e, "record failed to decrypt");
            self.fail(SessionRejection::CryptoFailure, CloseReason::CryptoFailure, cx);
            return;
        }
        let opened = std::mem::take(&mut self.opened);
        self.on_plaintext(&opened, cx);
        if self.opened.is_empty() {
            self.opened = opened;
        }
    }

    fn on_plaintext(&mut self, plain: &[u8], cx: &mut Ctx<'_>) {
        let Some((&kind, body)) = plain.split_first() else {
            self.fail(SessionRejection::Protocol, CloseReason::Protocol, cx);
            return;
        };
        match RecordKind::try_from(kind) {
            Ok(RecordKind::Accept) => {
                if self.peer_accepted {
                    self.fail(SessionRejection::Protocol, CloseReason::Protocol, cx);
                    return;
                }
                self.peer_accepted = true;
                self.maybe_authenticate(cx);
            }
            Ok(RecordKind::Mux) => {
                if self.state != SessionState::Authenticated {
                    tracing::debug!(session = %self.id, state = ?self.state, "mux record before authentication");
                    self.end(SessionState::Rejected(SessionRejection::Protocol), cx);
                    return;
                }
                let result = match self.mux.as_mut() {
                    Some(mux) => mux.on_frame(body),
                    None => return,
                };
                if let Err(e) = result {
                    tracing::debug!(session = %self.id, error = %e, "mux protocol violation");
                    self.end(SessionState::Closed(CloseReason::Protocol), cx);
                }
            }
            Ok(RecordKind::Keepalive) => {}
            Ok(RecordKind::Close) => {
                tracing::debug!(session = %self.id, "peer closed session");
                self.fail(SessionRejection::PeerClosed, CloseReason::Remote, cx);
            }
            Err(_) => self.fail(SessionRejection::Protocol, CloseReason::Protocol, cx),
        }
    }

    // ── Output ────────────────────────────────────────────────────────────────

    fn flush(&mut self, cx: &mut Ctx<'_>) {
        if self.state.is_terminal() {
            return;
        }
        let limit = cx.config.max_outbound_bytes as usize;
        while self.state == SessionState::Authenticated && self.outbound.len() < limit {
            let Some(frame) = self.mux.as_mut().and_then(Mux::poll_transmit) else {
                break;
            };
            let queued = Frame::encode(frame.header, &frame.payload)
                .map_err(SessionError::from)
                .and_then(|bytes| self.queue_record(RecordKind::Mux, &bytes, cx.now));
            if let Err(e) = queued {
                tracing::debug!(session = %self.id, error = %e, "failed to seal mux frame");
                self.end(SessionState::Closed(CloseReason::CryptoFailure), cx);
                return;
            }
        }
        if self.write_out().is_err() {
            self.fail(SessionRejection::PeerClosed, CloseReason::TransportLost, cx);
        }
    }

    fn write_out(&mut self) -> Result<(), TransportError> {
        while !self.outbound.is_empty() {
            match self.conn.write(&self.outbound) {
                Ok(0) | Err(TransportError::WouldBlock) => break,
                Ok(n) => self.outbound.advance(n),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn close_local(&mut self, cx: &mut Ctx<'_>) {
        if self.state.is_terminal() {
            return;
        }
        if self.cipher.is_some() && self.queue_record(RecordKind::Close, &[], cx.now).is_ok() {
            let _ = self.write_out();
        }
        self.fail(SessionRejection::PeerClosed, CloseReason::Local, cx);
    }
}

fn parse_device_id(payload: &[u8]) -> Option<String> {
    let id = std::str::from_utf8(payload).ok()?;
    validate_label(id, MAX_DEVICE_ID_BYTES, "device_id").ok()?;
    Some(id.to_string())
}

// ── SessionLayer ──────────────────────────────────────────────────────────────

/// Owns every session of this device and the static keypair they use.
pub struct SessionLayer<C> {
    keypair: Keypair,
    device_id: String,
    config: SessionConfig,
    mux_config: MuxConfig,
    sessions: BTreeMap<SessionId, SecureSession<C>>,
    next_id: u64,
    events: VecDeque<SessionEvent>,
}

impl<C: Connection> SessionLayer<C> {
    pub fn new(keypair: Keypair, device_id: impl Into<String>, config: SessionConfig, mux_config: MuxConfig) -> Self {
        Self {
            keypair,
            device_id: device_id.into(),
            config,
            mux_config,
            sessions: BTreeMap::new(),
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn local_static(&self) -> &[u8; 32] {
        &self.keypair.public
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<&SecureSession<C>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SecureSession<C>> {
        self.sessions.get_mut(&id)
    }

    pub fn mux_mut(&mut self, id: SessionId) -> Option<&mut Mux> {
        self.sessions.get_mut(&id).and_then(SecureSession::mux_mut)
    }

    /// The authenticated session to `device_id`, if any.
    pub fn authenticated(&self, device_id: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.state == SessionState::Authenticated && s.peer_device_id() == Some(device_id))
            .map(|s| s.id)
    }

    /// True while any live session (or attempt) targets `device_id`.
    pub fn has_session_with(&self, device_id: &str) -> bool {
        self.sessions.values().any(|s| {
            !s.state.is_terminal()
                && (s.peer_device_id() == Some(device_id)
                    || s.expected.as_ref().is_some_and(|r| r.device_id == device_id))
        })
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Dial the peer described by `record` and send message 1.
    pub fn connect<N>(&mut self, net: &mut N, record: &PeerRecord, now: MonotonicTime) -> Result<SessionId, SessionError>
    where
        N: NetStack<Conn = C>,
    {
        if self.sessions.len() as u64 >= self.config.max_sessions {
            return Err(SessionError::TooManySessions);
        }
        let (noise, msg1) = NoiseInitiator::new(&self.keypair, &record.claimed_static_pub)?;
        let conn = net.connect(record.addr)?;
        let id = self.allocate_id();

        let mut session = SecureSession::new(id, true, conn, Handshake::Initiator(noise), now);
        session.expected = Some(record.clone());
        session.queue_raw(&msg1)?;
        let mut cx = Ctx {
            device_id: &self.device_id,
            config: &self.config,
            mux_config: &self.mux_config,
            events: &mut self.events,
            now,
        };
        session.set_state(SessionState::HandshakeInitiated, &mut cx);
        tracing::debug!(
            session = %id,
            device_id = %record.device_id,
            peer = %record.addr,
            fingerprint = %record.fingerprint(),
            "handshake initiated"
        );
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Take every pending inbound connection as a responder session.
    pub fn accept_pending<N>(&mut self, net: &mut N, now: MonotonicTime) -> usize
    where
        N: NetStack<Conn = C>,
    {
        let mut accepted = 0;
        loop {
            let mut conn = match net.accept() {
                Ok(conn) => conn,
                Err(TransportError::WouldBlock) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "accept failed");
                    break;
                }
            };
            if self.sessions.len() as u64 >= self.config.max_sessions {
                tracing::debug!(peer = %conn.peer_addr(), "session limit reached, refusing connection");
                conn.close();
                continue;
            }
            let noise = match NoiseResponder::new(&self.keypair) {
                Ok(noise) => noise,
                Err(e) => {
                    tracing::debug!(error = %e, "responder setup failed");
                    conn.close();
                    continue;
                }
            };
            let id = self.allocate_id();
            tracing::debug!(session = %id, peer = %conn.peer_addr(), "inbound session");
            self.sessions
                .insert(id, SecureSession::new(id, false, conn, Handshake::Responder(noise), now));
            accepted += 1;
        }
        accepted
    }

    /// Process input and timers for every session. Sessions that reached a
    /// terminal state are removed and reported as `Ended`.
    pub fn poll(&mut self, peers: &PeerTable, now: MonotonicTime) {
        let mut cx = Ctx {
            device_id: &self.device_id,
            config: &self.config,
            mux_config: &self.mux_config,
            events: &mut self.events,
            now,
        };
        for session in self.sessions.values_mut() {
            session.poll(peers, &mut cx);
        }
        self.reap();
    }

    /// Seal pending mux output and push queued bytes into the connections.
    pub fn flush(&mut self, now: MonotonicTime) {
        let mut cx = Ctx {
            device_id: &self.device_id,
            config: &self.config,
            mux_config: &self.mux_config,
            events: &mut self.events,
            now,
        };
        for session in self.sessions.values_mut() {
            session.flush(&mut cx);
        }
        self.reap();
    }

    /// Close a session. An authenticated session tells the peer first.
    pub fn close(&mut self, id: SessionId, now: MonotonicTime) -> Result<(), SessionError> {
        let session = self.sessions.get_mut(&id).ok_or(SessionError::UnknownSession(id))?;
        let mut cx = Ctx {
            device_id: &self.device_id,
            config: &self.config,
            mux_config: &self.mux_config,
            events: &mut self.events,
            now,
        };
        session.close_local(&mut cx);
        self.reap();
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn reap(&mut self) {
        let ended: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.state.is_terminal())
            .map(|s| s.id)
            .collect();
        for id in ended {
            if let Some(session) = self.sessions.remove(&id) {
                self.events.push_back(SessionEvent::Ended {
                    id,
                    device_id: session.peer_device_id,
                    state: session.state,
                });
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
