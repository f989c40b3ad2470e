//! DSoftBus wire format: every byte layout that crosses the network.
//!
//! Three encodings live here:
//!   1. The discovery announce packet (v1), variable length, bounded.
//!   2. The mux frame header, fixed 26 bytes, zerocopy, network byte order.
//!   3. The rpcmux envelope, variable length, bounded.
//!
//! Changing any layout here is a protocol break. Parsers in this module
//! treat their input as hostile: they check lengths before reading, never
//! index past the end of a buffer and never panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Announce packet ───────────────────────────────────────────────────────────

/// Magic prefix of every announce datagram.
pub const ANNOUNCE_MAGIC: [u8; 4] = *b"NXSB";

/// Only announce version understood by this build.
pub const ANNOUNCE_VERSION: u8 = 1;

pub const MAX_DEVICE_ID_BYTES: usize = 64;
pub const MAX_SERVICE_NAME_BYTES: usize = 64;
pub const MAX_ANNOUNCED_SERVICES: usize = 16;

/// Smallest well-formed announce: magic, version, dev_len, a one-byte
/// device id, port, static key, seq and an empty service list.
pub const MIN_ANNOUNCE: usize = 4 + 1 + 1 + 1 + 2 + 32 + 8 + 1;

/// Largest datagram the discovery engine will look at.
pub const MAX_ANNOUNCE: usize = 1024;

/// One decoded announce datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceV1 {
    /// Stable device identifier (UTF-8, no control characters).
    pub device_id: String,
    /// Port on which the device accepts session connections.
    pub port: u16,
    /// Noise static public key the device claims to own.
    pub noise_static: [u8; 32],
    /// Strictly increasing per device; used for replay rejection.
    pub announce_seq: u64,
    /// Service names the device advertises.
    pub services: Vec<String>,
}

/// Announce encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("packet of {0} bytes exceeds maximum {}", MAX_ANNOUNCE)]
    Oversized(usize),

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported announce version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
}

/// Validate a device id or service name: non-empty, bounded, UTF-8 without
/// control characters.
pub fn validate_label(label: &str, max: usize, field: &'static str) -> Result<(), PacketError> {
    if label.is_empty() || label.len() > max {
        return Err(PacketError::InvalidField(field));
    }
    if label.chars().any(char::is_control) {
        return Err(PacketError::InvalidField(field));
    }
    Ok(())
}

fn decode_label(raw: &[u8], max: usize, field: &'static str) -> Result<String, PacketError> {
    let s = std::str::from_utf8(raw).map_err(|_| PacketError::InvalidField(field))?;
    validate_label(s, max, field)?;
    Ok(s.to_owned())
}

/// Pull exactly `n` bytes off the front of `buf`.
fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], PacketError> {
    if buf.remaining() < n {
        return Err(PacketError::Truncated);
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, PacketError> {
    if buf.remaining() < 1 {
        return Err(PacketError::Truncated);
    }
    Ok(buf.get_u8())
}

impl AnnounceV1 {
    /// Serialize into a datagram. Rejects values the decoder would refuse.
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        validate_label(&self.device_id, MAX_DEVICE_ID_BYTES, "device_id")?;
        if self.services.len() > MAX_ANNOUNCED_SERVICES {
            return Err(PacketError::InvalidField("service count"));
        }
        for s in &self.services {
            validate_label(s, MAX_SERVICE_NAME_BYTES, "service name")?;
        }

        let mut out = BytesMut::with_capacity(MIN_ANNOUNCE + self.device_id.len() + 64);
        out.put_slice(&ANNOUNCE_MAGIC);
        out.put_u8(ANNOUNCE_VERSION);
        out.put_u8(self.device_id.len() as u8);
        out.put_slice(self.device_id.as_bytes());
        out.put_u16(self.port);
        out.put_slice(&self.noise_static);
        out.put_u64(self.announce_seq);
        out.put_u8(self.services.len() as u8);
        for s in &self.services {
            out.put_u8(s.len() as u8);
            out.put_slice(s.as_bytes());
        }

        if out.len() > MAX_ANNOUNCE {
            return Err(PacketError::Oversized(out.len()));
        }
        Ok(out.freeze())
    }

    /// Parse a datagram. Length bounds, magic and version are checked before
    /// any field is interpreted.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() > MAX_ANNOUNCE {
            return Err(PacketError::Oversized(bytes.len()));
        }
        if bytes.len() < MIN_ANNOUNCE {
            return Err(PacketError::Truncated);
        }

        let mut b = bytes;
        if take(&mut b, 4)? != ANNOUNCE_MAGIC {
            return Err(PacketError::BadMagic);
        }
        let version = take_u8(&mut b)?;
        if version != ANNOUNCE_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let dev_len = take_u8(&mut b)? as usize;
        if dev_len == 0 || dev_len > MAX_DEVICE_ID_BYTES {
            return Err(PacketError::InvalidField("device_id"));
        }
        let device_id = decode_label(take(&mut b, dev_len)?, MAX_DEVICE_ID_BYTES, "device_id")?;

        if b.remaining() < 2 + 32 + 8 + 1 {
            return Err(PacketError::Truncated);
        }
        let port = b.get_u16();
        let mut noise_static = [0u8; 32];
        b.copy_to_slice(&mut noise_static);
        let announce_seq = b.get_u64();

        let count = b.get_u8() as usize;
        if count > MAX_ANNOUNCED_SERVICES {
            return Err(PacketError::InvalidField("service count"));
        }
        let mut services = Vec::with_capacity(count);
        for _ in 0..count {
            let n = take_u8(&mut b)? as usize;
            if n == 0 || n > MAX_SERVICE_NAME_BYTES {
                return Err(PacketError::InvalidField("service name"));
            }
            services.push(decode_label(take(&mut b, n)?, MAX_SERVICE_NAME_BYTES, "service name")?);
        }

        if b.has_remaining() {
            return Err(PacketError::TrailingBytes(b.remaining()));
        }

        Ok(Self {
            device_id,
            port,
            noise_static,
            announce_seq,
            services,
        })
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

/// Scheduling class of a mux stream.
///
/// Ordering is scheduling order: a Control frame is never queued behind an
/// Rpc frame, and an Rpc frame is never queued behind a Bulk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Directory sync, liveness probes, small control messages.
    Control = 0x00,
    /// Request/response traffic.
    Rpc = 0x01,
    /// Anything large and latency-tolerant.
    Bulk = 0x02,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 3] = [Priority::Control, Priority::Rpc, Priority::Bulk];
}

impl TryFrom<u8> for Priority {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Priority::Control),
            0x01 => Ok(Priority::Rpc),
            0x02 => Ok(Priority::Bulk),
            other => Err(WireError::UnknownPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

// ── Mux frame header ──────────────────────────────────────────────────────────

/// Stream open request. Payload carries the stream label.
pub const FLAG_OPEN: u8 = 0x01;
/// Acknowledges an OPEN; the acking side's window rides along.
pub const FLAG_ACK: u8 = 0x02;
/// Payload is stream data.
pub const FLAG_DATA: u8 = 0x04;
/// Sender will write no more data (half-close).
pub const FLAG_FIN: u8 = 0x08;
/// Abort the stream; `code` carries the reason.
pub const FLAG_RESET: u8 = 0x10;
/// Window update: `ack` and `window` are meaningful.
pub const FLAG_WINDOW: u8 = 0x20;

const KNOWN_FLAGS: u8 = FLAG_OPEN | FLAG_ACK | FLAG_DATA | FLAG_FIN | FLAG_RESET | FLAG_WINDOW;

/// Current mux frame version.
pub const FRAME_VERSION: u8 = 0x01;

/// Largest payload a single mux frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Longest stream label accepted in an OPEN frame.
pub const MAX_STREAM_LABEL: usize = 32;

/// Header preceding every mux frame inside an encrypted session record.
///
/// Every field is byte-aligned, so the struct has no padding and can be read
/// straight out of an untrusted buffer.
///
/// Wire size: 26 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Frame format version. Currently 0x01.
    pub version: u8,
    /// Combination of the FLAG_* bits.
    pub flags: u8,
    /// Priority class of the stream (see `Priority`).
    pub priority: u8,
    /// Reset reason when FLAG_RESET is set, zero otherwise.
    pub code: u8,
    /// Stream identifier. Odd ids are opened by the session initiator,
    /// even ids by the responder.
    pub stream_id: U32<BigEndian>,
    /// Per-stream DATA frame counter, starts at 0.
    pub seq: U32<BigEndian>,
    /// Cumulative bytes of this stream the sender has consumed from its peer.
    pub ack: U64<BigEndian>,
    /// Bytes beyond `ack` the sender is willing to receive.
    pub window: U32<BigEndian>,
    /// Payload length following the header.
    pub length: U16<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 26]);

/// Size of `FrameHeader` on the wire.
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new(stream_id: u32, flags: u8, priority: Priority) -> Self {
        Self {
            version: FRAME_VERSION,
            flags,
            priority: priority.into(),
            code: 0,
            stream_id: U32::new(stream_id),
            seq: U32::new(0),
            ack: U64::new(0),
            window: U32::new(0),
            length: U16::new(0),
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = U32::new(seq);
        self
    }

    /// Attach the sender's receive state: bytes consumed and window beyond.
    pub fn with_credit(mut self, ack: u64, window: u32) -> Self {
        self.ack = U64::new(ack);
        self.window = U32::new(window);
        self
    }

    pub fn with_code(mut self, code: ResetCode) -> Self {
        self.code = code as u8;
        self
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn stream(&self) -> u32 {
        self.stream_id.get()
    }

    pub fn seq_no(&self) -> u32 {
        self.seq.get()
    }

    pub fn acked(&self) -> u64 {
        self.ack.get()
    }

    pub fn window_size(&self) -> u32 {
        self.window.get()
    }
}

/// A decoded mux frame: header plus the payload bytes it announced.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize header and payload into one buffer.
    pub fn encode(mut header: FrameHeader, payload: &[u8]) -> Result<Bytes, WireError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        header.length = U16::new(payload.len() as u16);
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.put_slice(header.as_bytes());
        out.put_slice(payload);
        Ok(out.freeze())
    }

    /// Parse one frame. The buffer must hold exactly one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated)?;
        if header.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.flags & !KNOWN_FLAGS != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags));
        }
        if header.flags == 0 {
            return Err(WireError::Malformed("frame without flags"));
        }
        Priority::try_from(header.priority)?;

        let len = header.length.get() as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(len));
        }
        let body = &bytes[FRAME_HEADER_LEN..];
        if body.len() != len {
            return Err(WireError::LengthMismatch {
                declared: len,
                actual: body.len(),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

/// Reason carried in the `code` byte of a RESET frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetCode {
    /// The application aborted the stream.
    Cancelled = 0x00,
    /// Sender overran the advertised window or stream buffer.
    Window = 0x01,
    /// Stream cap reached; the OPEN was refused.
    TooManyStreams = 0x02,
    /// Frame violated the stream protocol.
    Protocol = 0x03,
    /// Open was not acknowledged in time.
    Timeout = 0x04,
}

impl TryFrom<u8> for ResetCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ResetCode::Cancelled),
            0x01 => Ok(ResetCode::Window),
            0x02 => Ok(ResetCode::TooManyStreams),
            0x03 => Ok(ResetCode::Protocol),
            0x04 => Ok(ResetCode::Timeout),
            other => Err(WireError::UnknownResetCode(other)),
        }
    }
}

// ── Session records ───────────────────────────────────────────────────────────

/// First plaintext byte of every encrypted record after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Sender finished its identity check and accepts the session.
    Accept = 0x01,
    /// Remainder is one mux frame.
    Mux = 0x02,
    /// Liveness only, no content.
    Keepalive = 0x03,
    /// Sender is tearing the session down.
    Close = 0x04,
}

impl TryFrom<u8> for RecordKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(RecordKind::Accept),
            0x02 => Ok(RecordKind::Mux),
            0x03 => Ok(RecordKind::Keepalive),
            0x04 => Ok(RecordKind::Close),
            other => Err(WireError::UnknownRecord(other)),
        }
    }
}

// ── RPC envelope ──────────────────────────────────────────────────────────────

pub const MAX_RPC_NAME_BYTES: usize = 64;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Request = 0x01,
    Response = 0x02,
    /// Payload is `[fault code u8][UTF-8 message]`.
    Fault = 0x03,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EnvelopeKind::Request),
            0x02 => Ok(EnvelopeKind::Response),
            0x03 => Ok(EnvelopeKind::Fault),
            other => Err(WireError::UnknownEnvelope(other)),
        }
    }
}

/// Reason carried by a `Fault` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultCode {
    /// No service or method by that name on the callee.
    NotFound = 0x01,
    /// The service ran and returned an error.
    Application = 0x02,
    /// The callee's remote call policy refused the request.
    Denied = 0x03,
}

impl TryFrom<u8> for FaultCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FaultCode::NotFound),
            0x02 => Ok(FaultCode::Application),
            0x03 => Ok(FaultCode::Denied),
            other => Err(WireError::UnknownFault(other)),
        }
    }
}

/// `{call_id, service, method, payload}` as carried on an Rpc stream.
///
/// Layout: `kind u8 | call_id u64 BE | svc_len u8 | service | method_len u8 |
/// method | payload_len u32 BE | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEnvelope {
    pub kind: EnvelopeKind,
    pub call_id: u64,
    pub service: String,
    pub method: String,
    pub payload: Bytes,
}

impl RpcEnvelope {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        for name in [&self.service, &self.method] {
            if name.len() > MAX_RPC_NAME_BYTES {
                return Err(WireError::FieldTooLong("rpc name"));
            }
        }
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| WireError::PayloadTooLarge(self.payload.len()))?;

        let mut out = BytesMut::with_capacity(
            1 + 8 + 2 + self.service.len() + self.method.len() + 4 + self.payload.len(),
        );
        out.put_u8(self.kind as u8);
        out.put_u64(self.call_id);
        out.put_u8(self.service.len() as u8);
        out.put_slice(self.service.as_bytes());
        out.put_u8(self.method.len() as u8);
        out.put_slice(self.method.as_bytes());
        out.put_u32(payload_len);
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut b = bytes;
        if b.remaining() < 1 + 8 + 1 {
            return Err(WireError::Truncated);
        }
        let kind = EnvelopeKind::try_from(b.get_u8())?;
        let call_id = b.get_u64();
        let service = read_name(&mut b)?;
        let method = read_name(&mut b)?;
        if b.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let len = b.get_u32() as usize;
        if b.remaining() != len {
            return Err(WireError::LengthMismatch {
                declared: len,
                actual: b.remaining(),
            });
        }
        Ok(Self {
            kind,
            call_id,
            service,
            method,
            payload: Bytes::copy_from_slice(b),
        })
    }
}

fn read_name(b: &mut &[u8]) -> Result<String, WireError> {
    if b.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    let n = b.get_u8() as usize;
    if n > MAX_RPC_NAME_BYTES {
        return Err(WireError::FieldTooLong("rpc name"));
    }
    if b.remaining() < n {
        return Err(WireError::Truncated);
    }
    let (raw, rest) = b.split_at(n);
    *b = rest;
    let s = std::str::from_utf8(raw).map_err(|_| WireError::Malformed("rpc name not utf-8"))?;
    if s.chars().any(char::is_control) {
        return Err(WireError::Malformed("rpc name has control characters"));
    }
    Ok(s.to_owned())
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default UDP port for announce datagrams.
pub const DISCOVERY_PORT: u16 = 37020;

/// Default TCP port for session connections.
pub const SESSION_PORT: u16 = 37021;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting mux, record or envelope bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer truncated")]
    Truncated,

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown priority byte: 0x{0:02x}")]
    UnknownPriority(u8),

    #[error("unknown record kind: 0x{0:02x}")]
    UnknownRecord(u8),

    #[error("unknown envelope kind: 0x{0:02x}")]
    UnknownEnvelope(u8),

    #[error("unknown fault code: 0x{0:02x}")]
    UnknownFault(u8),

    #[error("unknown reset code: 0x{0:02x}")]
    UnknownResetCode(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("payload length {0} exceeds maximum")]
    PayloadTooLarge(usize),

    #[error("declared length {declared} but {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} too long")]
    FieldTooLong(&'static str),

    #[error("malformed: {0}")]
    Malformed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
