//! Stream multiplexer: many ordered, flow-controlled streams over one
//! secure session.
//!
//! The mux is a pure state machine. It never sees key material or sockets:
//! the owning session feeds it decrypted frames through `on_frame` and asks
//! `poll_transmit` for the next frame to encrypt.
//!
//! Flow control is credit based. Every frame carries the sender's `ack`
//! (bytes it has consumed) and `window` (bytes it will buffer beyond that).
//! A writer may have at most `peer_ack + peer_window - written` more bytes
//! accepted, so the unacknowledged byte count never exceeds the peer's latest
//! advertised window and the send buffer can never grow without bound.
//!
//! Scheduling: resets for forgotten streams go first. Then classes are served
//! strictly in order (Control, then Rpc, then Bulk); within a class, resets,
//! acks and window updates precede OPEN/DATA/FIN frames, which rotate
//! round-robin by stream id.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};

use dsoftbus_core::config::MuxConfig;
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{
    Frame, FrameHeader, Priority, ResetCode, FLAG_ACK, FLAG_DATA, FLAG_FIN, FLAG_OPEN, FLAG_RESET,
    FLAG_WINDOW, MAX_STREAM_LABEL,
};

pub type StreamId = u32;

/// Label of the directory sync stream.
pub const BUSDIR_LABEL: &str = "busdir";
/// Label of the rpc stream.
pub const RPCMUX_LABEL: &str = "rpcmux";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("stream window or buffer exceeded")]
    Window,
    #[error("too many open streams")]
    TooManyStreams,
    #[error("stream closed")]
    Closed,
    #[error("stream cannot make progress now")]
    WouldBlock,
    #[error("stream reset by peer: {0:?}")]
    Reset(ResetCode),
    #[error("stream open timed out")]
    Timeout,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl MuxError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            MuxError::Window => "EWINDOW",
            MuxError::TooManyStreams => "ETOOMANYSTREAMS",
            MuxError::Closed => "ECLOSED",
            MuxError::WouldBlock => "EWOULDBLOCK",
            MuxError::Reset(_) => "ERESET",
            MuxError::Timeout => "ETIMEOUT",
            MuxError::Protocol(_) => "EPROTO",
        }
    }
}

/// A stream the peer opened, waiting for the application to pick it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingStream {
    pub id: StreamId,
    pub priority: Priority,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// We sent OPEN and wait for the peer's ACK.
    Opening,
    Open,
    /// Terminal. Reported once to the application, then the stream is gone.
    Failed(MuxError),
}

struct Stream {
    priority: Priority,
    label: String,
    phase: Phase,
    opened_at: MonotonicTime,

    open_pending: bool,
    ack_pending: bool,
    window_pending: bool,
    reset_pending: Option<ResetCode>,

    send_buf: BytesMut,
    written: u64,
    peer_ack: u64,
    peer_window: u32,
    send_seq: u32,
    local_fin: bool,
    fin_sent: bool,

    recv_buf: BytesMut,
    recv_seq: u32,
    received: u64,
    consumed: u64,
    remote_fin: bool,
}

impl Stream {
    fn new(priority: Priority, label: String, phase: Phase, now: MonotonicTime) -> Self {
        Self {
            priority,
            label,
            phase,
            opened_at: now,
            open_pending: false,
            ack_pending: false,
            window_pending: false,
            reset_pending: None,
            send_buf: BytesMut::new(),
            written: 0,
            peer_ack: 0,
            peer_window: 0,
            send_seq: 0,
            local_fin: false,
            fin_sent: false,
            recv_buf: BytesMut::new(),
            recv_seq: 0,
            received: 0,
            consumed: 0,
            remote_fin: false,
        }
    }

    fn credit(&self) -> u64 {
        self.peer_ack
            .saturating_add(self.peer_window as u64)
            .saturating_sub(self.written)
    }

    fn has_send_work(&self) -> bool {
        if self.open_pending {
            return true;
        }
        self.phase == Phase::Open && (!self.send_buf.is_empty() || (self.local_fin && !self.fin_sent))
    }

    fn finished(&self) -> bool {
        self.phase == Phase::Open
            && self.fin_sent
            && self.remote_fin
            && self.recv_buf.is_empty()
            && !self.ack_pending
            && self.reset_pending.is_none()
    }
}

pub struct Mux {
    config: MuxConfig,
    initiator: bool,
    next_local_id: StreamId,
    streams: BTreeMap<StreamId, Stream>,
    incoming: VecDeque<IncomingStream>,
    /// RESET frames for streams that no longer have state.
    control: VecDeque<FrameHeader>,
    cursors: [Option<StreamId>; 3],
}

impl Mux {
    /// `initiator` is the session role: initiators allocate odd stream ids,
    /// responders even ones, so both sides can open without colliding.
    pub fn new(initiator: bool, config: MuxConfig) -> Self {
        Self {
            config,
            initiator,
            next_local_id: if initiator { 1 } else { 2 },
            streams: BTreeMap::new(),
            incoming: VecDeque::new(),
            control: VecDeque::new(),
            cursors: [None; 3],
        }
    }

    fn local_window(&self) -> u32 {
        self.config.initial_window.min(u32::MAX as u64) as u32
    }

    fn is_local_id(&self, id: StreamId) -> bool {
        (id % 2 == 1) == self.initiator
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// True once the peer acknowledged our OPEN (or we accepted theirs).
    pub fn is_open(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.phase == Phase::Open)
    }

    pub fn label(&self, id: StreamId) -> Option<&str> {
        self.streams.get(&id).map(|s| s.label.as_str())
    }

    /// Bytes `write` would accept right now.
    pub fn send_credit(&self, id: StreamId) -> u64 {
        self.streams
            .get(&id)
            .filter(|s| s.phase == Phase::Open && !s.local_fin)
            .map(Stream::credit)
            .unwrap_or(0)
    }

    /// Bytes written but not yet acknowledged by the peer.
    pub fn unacked(&self, id: StreamId) -> u64 {
        self.streams
            .get(&id)
            .map(|s| s.written.saturating_sub(s.peer_ack))
            .unwrap_or(0)
    }

    /// The peer's most recently advertised window for this stream.
    pub fn peer_window(&self, id: StreamId) -> u32 {
        self.streams.get(&id).map(|s| s.peer_window).unwrap_or(0)
    }

    /// Bytes buffered for the reader.
    pub fn readable(&self, id: StreamId) -> usize {
        self.streams.get(&id).map(|s| s.recv_buf.len()).unwrap_or(0)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.control.is_empty()
            || self.streams.values().any(|s| {
                s.reset_pending.is_some() || s.ack_pending || s.window_pending || s.has_send_work()
            })
    }

    // ── Application side ──────────────────────────────────────────────────────

    /// Open a stream. Data may flow once the peer acknowledges the OPEN.
    pub fn open(&mut self, priority: Priority, label: &str, now: MonotonicTime) -> Result<StreamId, MuxError> {
        if label.len() > MAX_STREAM_LABEL || label.chars().any(char::is_control) {
            return Err(MuxError::Protocol("invalid stream label"));
        }
        if self.streams.len() as u64 >= self.config.max_streams {
            tracing::debug!(open = self.streams.len(), "stream cap reached, open denied");
            return Err(MuxError::TooManyStreams);
        }
        let id = self.next_local_id;
        self.next_local_id = id.checked_add(2).ok_or(MuxError::TooManyStreams)?;

        let mut stream = Stream::new(priority, label.to_string(), Phase::Opening, now);
        stream.open_pending = true;
        self.streams.insert(id, stream);
        tracing::trace!(stream_id = id, ?priority, label, "stream open requested");
        Ok(id)
    }

    /// Next stream opened by the peer.
    pub fn accept(&mut self) -> Option<IncomingStream> {
        self.incoming.pop_front()
    }

    /// Queue bytes for sending. Accepts at most the current send credit.
    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, MuxError> {
        self.check_usable(id)?;
        let stream = self.streams.get_mut(&id).ok_or(MuxError::Closed)?;
        if stream.local_fin {
            return Err(MuxError::Closed);
        }
        if stream.phase == Phase::Opening {
            return Err(MuxError::WouldBlock);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let n = stream.credit().min(data.len() as u64) as usize;
        if n == 0 {
            return Err(MuxError::WouldBlock);
        }
        stream.send_buf.extend_from_slice(&data[..n]);
        stream.written += n as u64;
        Ok(n)
    }

    /// Read buffered bytes in order. `Ok(0)` means the peer half-closed and
    /// everything it sent has been read.
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, MuxError> {
        self.check_usable(id)?;
        let stream = self.streams.get_mut(&id).ok_or(MuxError::Closed)?;
        if !stream.recv_buf.is_empty() {
            let n = buf.len().min(stream.recv_buf.len());
            buf[..n].copy_from_slice(&stream.recv_buf.split_to(n));
            stream.consumed += n as u64;
            if n > 0 {
                stream.window_pending = true;
            }
            self.reap(id);
            return Ok(n);
        }
        if stream.remote_fin {
            return Ok(0);
        }
        Err(MuxError::WouldBlock)
    }

    /// Half-close: no more writes; buffered data still drains and the peer
    /// may keep sending. A second call reports `Closed`; a stream that was
    /// reset or timed out reports that failure once and is released.
    pub fn close(&mut self, id: StreamId) -> Result<(), MuxError> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(MuxError::Closed);
        };
        if let Phase::Failed(err) = stream.phase {
            self.retire(id);
            return Err(err);
        }
        if stream.local_fin {
            return Err(MuxError::Closed);
        }
        stream.local_fin = true;
        tracing::trace!(stream_id = id, "stream half-closed");
        self.reap(id);
        Ok(())
    }

    /// Abort the stream immediately, discarding buffered data both ways.
    pub fn reset(&mut self, id: StreamId) -> Result<(), MuxError> {
        let Some(stream) = self.streams.remove(&id) else {
            return Err(MuxError::Closed);
        };
        let already_reset = matches!(stream.phase, Phase::Failed(_)) && stream.reset_pending.is_none();
        if !already_reset {
            let code = stream.reset_pending.unwrap_or(ResetCode::Cancelled);
            self.control.push_back(
                FrameHeader::new(id, FLAG_RESET, stream.priority).with_code(code),
            );
        }
        tracing::debug!(stream_id = id, "stream reset locally");
        Ok(())
    }

    /// Expire opens that were never acknowledged.
    pub fn tick(&mut self, now: MonotonicTime) {
        let timeout = self.config.open_timeout();
        let expired: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.phase == Phase::Opening && now.is_past(s.opened_at.saturating_add(timeout)))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(stream_id = id, "stream open timed out");
            self.fail(id, MuxError::Timeout, Some(ResetCode::Timeout));
        }
    }

    fn check_usable(&mut self, id: StreamId) -> Result<(), MuxError> {
        match self.streams.get(&id).map(|s| s.phase) {
            None => Err(MuxError::Closed),
            Some(Phase::Failed(err)) => {
                self.retire(id);
                Err(err)
            }
            Some(_) => Ok(()),
        }
    }

    /// Drop stream state, keeping any RESET it still owes the peer.
    fn retire(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.remove(&id) {
            if let Some(code) = stream.reset_pending {
                self.control
                    .push_back(FrameHeader::new(id, FLAG_RESET, stream.priority).with_code(code));
            }
        }
    }

    /// Remove a stream once both directions are done.
    fn reap(&mut self, id: StreamId) {
        if self.streams.get(&id).is_some_and(Stream::finished) {
            self.streams.remove(&id);
            tracing::trace!(stream_id = id, "stream finished");
        }
    }

    fn fail(&mut self, id: StreamId, err: MuxError, code: Option<ResetCode>) {
        if let Some(s) = self.streams.get_mut(&id) {
            s.phase = Phase::Failed(err);
            s.send_buf.clear();
            s.recv_buf.clear();
            s.open_pending = false;
            s.ack_pending = false;
            s.window_pending = false;
            s.reset_pending = code;
        }
    }

    // ── Session side ──────────────────────────────────────────────────────────

    /// Apply one decrypted frame from the peer.
    ///
    /// Stream-level problems reset that stream and return `Ok`. An `Err` means
    /// the peer broke the framing itself and the session must be torn down.
    pub fn on_frame(&mut self, bytes: &[u8]) -> Result<(), MuxError> {
        let frame = Frame::decode(bytes).map_err(|e| {
            tracing::debug!(error = %e, "undecodable mux frame");
            MuxError::Protocol("malformed frame")
        })?;
        let h = frame.header;
        let id = h.stream();
        if id == 0 {
            return Err(MuxError::Protocol("stream id 0"));
        }
        tracing::trace!(stream_id = id, flags = h.flags, len = frame.payload.len(), "frame in");

        if h.has(FLAG_RESET) {
            self.on_reset(id, &h);
            return Ok(());
        }
        if h.has(FLAG_OPEN) {
            return self.on_open(id, &h, &frame.payload);
        }
        if h.has(FLAG_ACK) {
            self.on_ack(id, &h);
            return Ok(());
        }
        if h.has(FLAG_WINDOW) {
            self.on_window(id, &h);
        }
        if h.has(FLAG_DATA) || h.has(FLAG_FIN) {
            self.on_data(id, &h, &frame.payload);
        }
        Ok(())
    }

    fn on_reset(&mut self, id: StreamId, h: &FrameHeader) {
        let code = ResetCode::try_from(h.code).unwrap_or(ResetCode::Protocol);
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        if matches!(stream.phase, Phase::Failed(_)) {
            return;
        }
        let err = match (stream.phase, code) {
            (Phase::Opening, ResetCode::TooManyStreams) => MuxError::TooManyStreams,
            _ => MuxError::Reset(code),
        };
        tracing::debug!(stream_id = id, ?code, "stream reset by peer");
        self.fail(id, err, None);
    }

    fn on_open(&mut self, id: StreamId, h: &FrameHeader, payload: &[u8]) -> Result<(), MuxError> {
        if self.is_local_id(id) {
            return Err(MuxError::Protocol("peer opened a stream with our id parity"));
        }
        if self.streams.contains_key(&id) {
            return Err(MuxError::Protocol("duplicate stream open"));
        }
        let priority = Priority::try_from(h.priority).map_err(|_| MuxError::Protocol("bad priority"))?;

        let label = match std::str::from_utf8(payload) {
            Ok(l) if l.len() <= MAX_STREAM_LABEL && !l.chars().any(char::is_control) && h.acked() == 0 => {
                l.to_string()
            }
            _ => {
                self.control
                    .push_back(FrameHeader::new(id, FLAG_RESET, priority).with_code(ResetCode::Protocol));
                return Ok(());
            }
        };

        if self.streams.len() as u64 >= self.config.max_streams {
            tracing::debug!(stream_id = id, "refusing stream open: cap reached");
            self.control.push_back(
                FrameHeader::new(id, FLAG_RESET, priority).with_code(ResetCode::TooManyStreams),
            );
            return Ok(());
        }

        let mut stream = Stream::new(priority, label.clone(), Phase::Open, MonotonicTime::ZERO);
        stream.ack_pending = true;
        stream.peer_window = h.window_size();
        self.streams.insert(id, stream);
        self.incoming.push_back(IncomingStream { id, priority, label });
        tracing::trace!(stream_id = id, ?priority, "stream opened by peer");
        Ok(())
    }

    fn on_ack(&mut self, id: StreamId, h: &FrameHeader) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        match stream.phase {
            // Nothing is written before the open is acknowledged.
            Phase::Opening if h.acked() > stream.written => {
                self.fail(id, MuxError::Protocol("ack beyond written data"), Some(ResetCode::Protocol));
            }
            Phase::Opening => {
                stream.phase = Phase::Open;
                stream.peer_ack = h.acked();
                stream.peer_window = h.window_size();
                tracing::trace!(stream_id = id, window = stream.peer_window, "stream open acknowledged");
            }
            Phase::Open => self.fail(id, MuxError::Protocol("duplicate ack"), Some(ResetCode::Protocol)),
            Phase::Failed(_) => {}
        }
    }

    fn on_window(&mut self, id: StreamId, h: &FrameHeader) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.phase != Phase::Open {
            return;
        }
        let ack = h.acked();
        if ack > stream.written {
            self.fail(id, MuxError::Protocol("ack beyond written data"), Some(ResetCode::Protocol));
            return;
        }
        if ack >= stream.peer_ack {
            stream.peer_ack = ack;
            stream.peer_window = h.window_size();
        }
    }

    fn on_data(&mut self, id: StreamId, h: &FrameHeader, payload: &[u8]) {
        let window = self.local_window() as u64;
        let max_buffer = self.config.max_stream_buffer;
        let Some(stream) = self.streams.get_mut(&id) else {
            tracing::trace!(stream_id = id, "data for unknown stream dropped");
            return;
        };
        match stream.phase {
            Phase::Failed(_) => return,
            Phase::Opening => {
                self.fail(id, MuxError::Protocol("data before ack"), Some(ResetCode::Protocol));
                return;
            }
            Phase::Open => {}
        }
        if stream.remote_fin {
            self.fail(id, MuxError::Protocol("data after fin"), Some(ResetCode::Protocol));
            return;
        }
        if h.seq_no() != stream.recv_seq {
            self.fail(id, MuxError::Protocol("out of sequence frame"), Some(ResetCode::Protocol));
            return;
        }

        let len = payload.len() as u64;
        let outstanding = stream.received + len - stream.consumed;
        if outstanding > window || stream.recv_buf.len() as u64 + len > max_buffer {
            tracing::debug!(stream_id = id, outstanding, window, "inbound data overran window");
            self.fail(id, MuxError::Window, Some(ResetCode::Window));
            return;
        }

        stream.recv_buf.extend_from_slice(payload);
        stream.received += len;
        stream.recv_seq = stream.recv_seq.wrapping_add(1);
        if h.has(FLAG_FIN) {
            stream.remote_fin = true;
        }
        self.reap(id);
    }

    /// Next frame to send, if any.
    pub fn poll_transmit(&mut self) -> Option<Frame> {
        if let Some(h) = self.control.pop_front() {
            return Some(empty(h));
        }
        let window = self.local_window();

        for prio in Priority::ALL {
            if let Some(frame) = self.housekeeping(prio, window) {
                return Some(frame);
            }
            let ready: Vec<StreamId> = self
                .streams
                .iter()
                .filter(|(_, s)| s.priority == prio && s.has_send_work())
                .map(|(id, _)| *id)
                .collect();
            let Some(first) = ready.first().copied() else {
                continue;
            };
            let pick = match self.cursors[prio as usize] {
                Some(last) => ready.iter().copied().find(|id| *id > last).unwrap_or(first),
                None => first,
            };
            self.cursors[prio as usize] = Some(pick);
            return self.data_frame(pick, window);
        }
        None
    }

    /// Reset, ack or standalone window update owed by a stream of `prio`.
    fn housekeeping(&mut self, prio: Priority, window: u32) -> Option<Frame> {
        let (id, stream) = self.streams.iter_mut().find(|(_, s)| {
            s.priority == prio
                && (s.reset_pending.is_some() || s.ack_pending || (s.window_pending && !s.has_send_work()))
        })?;
        let id = *id;

        if let Some(code) = stream.reset_pending.take() {
            return Some(empty(FrameHeader::new(id, FLAG_RESET, stream.priority).with_code(code)));
        }
        if stream.ack_pending {
            stream.ack_pending = false;
            stream.window_pending = false;
            let h = FrameHeader::new(id, FLAG_ACK | FLAG_WINDOW, stream.priority).with_credit(stream.consumed, window);
            self.reap(id);
            return Some(empty(h));
        }
        stream.window_pending = false;
        Some(empty(
            FrameHeader::new(id, FLAG_WINDOW, stream.priority).with_credit(stream.consumed, window),
        ))
    }

    fn data_frame(&mut self, id: StreamId, window: u32) -> Option<Frame> {
        let max_payload = self.config.max_frame_payload as usize;
        let stream = self.streams.get_mut(&id)?;

        if stream.open_pending {
            stream.open_pending = false;
            let h = FrameHeader::new(id, FLAG_OPEN | FLAG_WINDOW, stream.priority).with_credit(0, window);
            return Some(Frame {
                header: h,
                payload: Bytes::copy_from_slice(stream.label.as_bytes()),
            });
        }

        let n = stream.send_buf.len().min(max_payload);
        let payload = stream.send_buf.split_to(n).freeze();
        let mut flags = FLAG_WINDOW;
        if n > 0 {
            flags |= FLAG_DATA;
        }
        if stream.local_fin && stream.send_buf.is_empty() {
            flags |= FLAG_FIN;
            stream.fin_sent = true;
        }
        let h = FrameHeader::new(id, flags, stream.priority)
            .with_seq(stream.send_seq)
            .with_credit(stream.consumed, window);
        stream.send_seq = stream.send_seq.wrapping_add(1);
        stream.window_pending = false;
        self.reap(id);
        Some(Frame { header: h, payload })
    }
}

fn empty(header: FrameHeader) -> Frame {
    Frame {
        header,
        payload: Bytes::new(),
    }
}
