//! rpcmux: request/response calls over one Rpc-priority mux stream.
//!
//! Each session has at most one rpc stream, shared by calls in both
//! directions. Envelopes travel as u32-prefixed frames. Responses are matched
//! to calls by `call_id`, so calls complete in whatever order the peer
//! answers them. Only bytes within one stream are ordered.
//!
//! Backpressure is layered on the mux window: sealed envelopes wait in a
//! bounded outbox until the stream has credit. A full outbox refuses new
//! calls with `EBACKPRESSURE` and stops reading requests, which in turn
//! stops the peer through the mux window.
//!
//! Requests from peers pass a `RemotePolicy` before reaching a service:
//! only allowlisted services are callable, request payloads are bounded and
//! the caller must be authenticated. Refusals answer with a `Denied` fault.

use std::collections::{BTreeMap, BTreeSet};
use std::task::Poll;

use bytes::{Buf, Bytes, BytesMut};

use dsoftbus_core::config::RpcConfig;
use dsoftbus_core::crypto::Fingerprint;
use dsoftbus_core::framing::{put_frame, FrameReader, Prefix};
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{EnvelopeKind, FaultCode, RpcEnvelope, WireError, MAX_RPC_NAME_BYTES};

use crate::mux::{Mux, MuxError, StreamId};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("no such service")]
    NotFound,
    #[error("call deadline exceeded")]
    Timeout,
    #[error("peer error: {0}")]
    Peer(String),
    #[error("session or stream closed")]
    Closed,
    #[error("outbound queue full")]
    Backpressure,
    #[error("too many calls in flight")]
    TooManyCalls,
    #[error("rpc protocol violation")]
    Protocol,
    #[error("message too large")]
    Oversized,
    #[error("call refused by the callee's policy: {0}")]
    Denied(String),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::NotFound => "ENOTFOUND",
            RpcError::Timeout => "ETIMEOUT",
            RpcError::Peer(_) => "EPEER",
            RpcError::Closed => "ECLOSED",
            RpcError::Backpressure => "EBACKPRESSURE",
            RpcError::TooManyCalls => "ETOOMANYCALLS",
            RpcError::Protocol => "EPROTO",
            RpcError::Oversized => "EMSGSIZE",
            RpcError::Denied(_) => "EDENIED",
        }
    }
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::FieldTooLong(_) | WireError::PayloadTooLarge(_) => RpcError::Oversized,
            _ => RpcError::Protocol,
        }
    }
}

/// What a service handler can fail with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("{0}")]
    Failed(String),
}

// ── Remote call policy ────────────────────────────────────────────────────────

/// Why a remote call was refused before it reached a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("caller is not authenticated")]
    Unauthenticated,
    #[error("service is not exposed to peers")]
    NotAllowed,
    #[error("request payload too large")]
    Oversized,
}

/// Deny-by-default admission for calls arriving from peers.
#[derive(Debug, Clone)]
pub struct RemotePolicy {
    allowed: BTreeSet<String>,
    max_request_bytes: usize,
}

impl RemotePolicy {
    /// A policy that admits nothing until services are allowed.
    pub fn deny_all(max_request_bytes: u64) -> Self {
        Self {
            allowed: BTreeSet::new(),
            max_request_bytes: max_request_bytes.min(u32::MAX as u64) as usize,
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        let mut policy = Self::deny_all(config.max_request_bytes);
        for service in &config.allowed_services {
            policy.allow(service);
        }
        policy
    }

    pub fn allow(&mut self, service: &str) {
        if self.allowed.insert(service.to_string()) {
            tracing::info!(service, "service exposed to peers");
        }
    }

    pub fn revoke(&mut self, service: &str) -> bool {
        self.allowed.remove(service)
    }

    pub fn is_allowed(&self, service: &str) -> bool {
        self.allowed.contains(service)
    }

    /// Check one request. `caller` is the fingerprint the session proved.
    pub fn authorize(&self, caller: Option<&Fingerprint>, service: &str, request_len: usize) -> Result<(), Denial> {
        if caller.is_none() {
            return Err(Denial::Unauthenticated);
        }
        if !self.allowed.contains(service) {
            return Err(Denial::NotAllowed);
        }
        if request_len > self.max_request_bytes {
            return Err(Denial::Oversized);
        }
        Ok(())
    }
}

// ── Services ──────────────────────────────────────────────────────────────────

/// A callable service. Payload encoding is the service's business.
pub trait RpcService {
    fn name(&self) -> &str;

    fn handle(&mut self, method: &str, payload: &[u8]) -> Result<Bytes, ServiceError>;
}

/// Routes incoming requests to registered services by name. Registering a
/// service does not expose it; the policy decides what peers may call.
pub struct RpcDispatcher {
    services: BTreeMap<String, Box<dyn RpcService>>,
    policy: RemotePolicy,
}

impl Default for RpcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::with_policy(RemotePolicy::from_config(&RpcConfig::default()))
    }

    pub fn with_policy(policy: RemotePolicy) -> Self {
        Self {
            services: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RemotePolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut RemotePolicy {
        &mut self.policy
    }

    /// Register a service, replacing any previous one with the same name.
    pub fn register(&mut self, service: Box<dyn RpcService>) -> Option<Box<dyn RpcService>> {
        let name = service.name().to_string();
        tracing::debug!(service = %name, "rpc service registered");
        self.services.insert(name, service)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn RpcService>> {
        self.services.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.services.keys().map(String::as_str)
    }

    fn dispatch(
        &mut self,
        caller: Option<&Fingerprint>,
        service: &str,
        method: &str,
        payload: &[u8],
    ) -> Result<Bytes, (FaultCode, String)> {
        if let Err(denial) = self.policy.authorize(caller, service, payload.len()) {
            tracing::warn!(?caller, service, method, request_len = payload.len(), %denial, "remote call denied");
            return Err((FaultCode::Denied, denial.to_string()));
        }
        tracing::info!(?caller, service, method, request_len = payload.len(), "remote call admitted");
        let Some(svc) = self.services.get_mut(service) else {
            return Err((FaultCode::NotFound, format!("no service {service}")));
        };
        svc.handle(method, payload).map_err(|e| match e {
            ServiceError::UnknownMethod(m) => (FaultCode::NotFound, format!("no method {m}")),
            ServiceError::Failed(msg) => (FaultCode::Application, msg),
        })
    }
}

// ── RpcMux ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub u64);

/// Per-session call multiplexer bound to one mux stream.
pub struct RpcMux {
    stream: StreamId,
    /// Authenticated identity of the peer; `None` refuses every request.
    peer: Option<Fingerprint>,
    config: RpcConfig,
    next_call: u64,
    /// In-flight calls and their deadlines.
    pending: BTreeMap<u64, MonotonicTime>,
    done: BTreeMap<u64, Result<Bytes, RpcError>>,
    reader: FrameReader,
    outbox: BytesMut,
    closed: bool,
}

impl RpcMux {
    pub fn new(stream: StreamId, peer: Option<Fingerprint>, config: RpcConfig) -> Self {
        let max = config.max_message_bytes.min(u32::MAX as u64) as usize;
        Self {
            stream,
            peer,
            config,
            next_call: 1,
            pending: BTreeMap::new(),
            done: BTreeMap::new(),
            reader: FrameReader::new(Prefix::U32, max),
            outbox: BytesMut::new(),
            closed: false,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn outbox_full(&self) -> bool {
        self.outbox.len() as u64 >= self.config.max_outbox_bytes
    }

    /// Start a call. The result is collected with `poll_response`.
    pub fn call(
        &mut self,
        service: &str,
        method: &str,
        payload: &[u8],
        deadline: MonotonicTime,
    ) -> Result<CallId, RpcError> {
        if self.closed {
            return Err(RpcError::Closed);
        }
        if self.pending.len() as u64 >= self.config.max_pending_calls {
            return Err(RpcError::TooManyCalls);
        }
        if self.outbox_full() {
            return Err(RpcError::Backpressure);
        }
        if service.is_empty() || service.len() > MAX_RPC_NAME_BYTES || method.len() > MAX_RPC_NAME_BYTES {
            return Err(RpcError::Protocol);
        }
        let call_id = self.next_call;
        let envelope = RpcEnvelope {
            kind: EnvelopeKind::Request,
            call_id,
            service: service.to_string(),
            method: method.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        self.enqueue(&envelope)?;
        self.next_call += 1;
        self.pending.insert(call_id, deadline);
        tracing::trace!(call_id, service, method, "rpc call queued");
        Ok(CallId(call_id))
    }

    /// `Ready` once the call finished. A call is reported exactly once; ids
    /// that are unknown or already collected resolve to `ECLOSED`.
    pub fn poll_response(&mut self, id: CallId) -> Poll<Result<Bytes, RpcError>> {
        if let Some(result) = self.done.remove(&id.0) {
            return Poll::Ready(result);
        }
        if self.pending.contains_key(&id.0) {
            return Poll::Pending;
        }
        Poll::Ready(Err(RpcError::Closed))
    }

    /// Resolve every call past its deadline with `ETIMEOUT`.
    pub fn tick(&mut self, now: MonotonicTime) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, deadline)| now.is_past(**deadline))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.pending.remove(&id);
            tracing::debug!(call_id = id, "rpc call timed out");
            self.done.insert(id, Err(RpcError::Timeout));
        }
    }

    /// Fail every in-flight call. Later calls report `ECLOSED` too.
    pub fn fail_all(&mut self, err: RpcError) {
        self.closed = true;
        self.outbox.clear();
        for (id, _) in std::mem::take(&mut self.pending) {
            self.done.insert(id, Err(err.clone()));
        }
    }

    /// Ids that finished and have not been collected yet.
    pub fn finished(&self) -> impl Iterator<Item = CallId> + '_ {
        self.done.keys().map(|id| CallId(*id))
    }

    /// Move bytes between the stream and the call table, serving requests
    /// with `dispatcher`. An error means the stream is unusable.
    pub fn pump(&mut self, mux: &mut Mux, dispatcher: &mut RpcDispatcher) -> Result<(), MuxError> {
        if self.closed {
            return Err(MuxError::Closed);
        }
        self.write(mux)?;
        if !self.outbox_full() {
            self.read(mux)?;
            self.process(dispatcher)?;
        }
        self.write(mux)
    }

    fn read(&mut self, mux: &mut Mux) -> Result<(), MuxError> {
        let mut buf = [0u8; 4096];
        loop {
            match mux.read(self.stream, &mut buf) {
                Ok(0) => return Err(MuxError::Closed),
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(MuxError::WouldBlock) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn process(&mut self, dispatcher: &mut RpcDispatcher) -> Result<(), MuxError> {
        while !self.outbox_full() {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "rpc framing violated");
                    return Err(MuxError::Protocol("rpc framing"));
                }
            };
            let envelope = match RpcEnvelope::decode(&frame) {
                Ok(env) => env,
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable rpc envelope dropped");
                    continue;
                }
            };
            self.on_envelope(envelope, dispatcher);
        }
        Ok(())
    }

    fn on_envelope(&mut self, env: RpcEnvelope, dispatcher: &mut RpcDispatcher) {
        match env.kind {
            EnvelopeKind::Request => {
                let reply = match dispatcher.dispatch(self.peer.as_ref(), &env.service, &env.method, &env.payload) {
                    Ok(payload) => RpcEnvelope {
                        kind: EnvelopeKind::Response,
                        call_id: env.call_id,
                        service: env.service,
                        method: env.method,
                        payload,
                    },
                    Err((code, msg)) => {
                        tracing::debug!(service = %env.service, method = %env.method, ?code, "rpc request faulted");
                        let mut payload = BytesMut::with_capacity(1 + msg.len());
                        payload.extend_from_slice(&[code as u8]);
                        payload.extend_from_slice(msg.as_bytes());
                        RpcEnvelope {
                            kind: EnvelopeKind::Fault,
                            call_id: env.call_id,
                            service: env.service,
                            method: env.method,
                            payload: payload.freeze(),
                        }
                    }
                };
                if let Err(e) = self.enqueue(&reply) {
                    tracing::debug!(call_id = reply.call_id, error = %e, "rpc reply dropped");
                }
            }
            EnvelopeKind::Response => self.complete(env.call_id, Ok(env.payload)),
            EnvelopeKind::Fault => {
                let err = match env.payload.split_first() {
                    Some((&code, msg)) => match FaultCode::try_from(code) {
                        Ok(FaultCode::NotFound) => RpcError::NotFound,
                        Ok(FaultCode::Application) => RpcError::Peer(String::from_utf8_lossy(msg).into_owned()),
                        Ok(FaultCode::Denied) => RpcError::Denied(String::from_utf8_lossy(msg).into_owned()),
                        Err(_) => RpcError::Protocol,
                    },
                    None => RpcError::Protocol,
                };
                self.complete(env.call_id, Err(err));
            }
        }
    }

    fn complete(&mut self, call_id: u64, result: Result<Bytes, RpcError>) {
        if self.pending.remove(&call_id).is_none() {
            tracing::trace!(call_id, "late or unknown rpc reply ignored");
            return;
        }
        self.done.insert(call_id, result);
    }

    fn enqueue(&mut self, env: &RpcEnvelope) -> Result<(), RpcError> {
        let bytes = env.encode()?;
        if bytes.len() as u64 > self.config.max_message_bytes {
            return Err(RpcError::Oversized);
        }
        put_frame(&mut self.outbox, Prefix::U32, &bytes)?;
        Ok(())
    }

    fn write(&mut self, mux: &mut Mux) -> Result<(), MuxError> {
        while !self.outbox.is_empty() {
            match mux.write(self.stream, &self.outbox) {
                Ok(n) => self.outbox.advance(n),
                Err(MuxError::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
