//! Length-prefixed framing over byte streams.
//!
//! Two users: session records on a connection (u16 prefix) and whole
//! messages on a mux stream (u32 prefix, used by busdir and rpcmux).
//! A declared length above the configured maximum is an error as soon as the
//! prefix is visible, so a hostile peer cannot make the reader buffer more
//! than one maximal frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    U16,
    U32,
}

impl Prefix {
    fn len(self) -> usize {
        match self {
            Prefix::U16 => 2,
            Prefix::U32 => 4,
        }
    }

    fn limit(self) -> usize {
        match self {
            Prefix::U16 => u16::MAX as usize,
            Prefix::U32 => u32::MAX as usize,
        }
    }
}

/// Append `body` to `out` behind its length prefix.
pub fn put_frame(out: &mut BytesMut, prefix: Prefix, body: &[u8]) -> Result<(), WireError> {
    if body.len() > prefix.limit() {
        return Err(WireError::PayloadTooLarge(body.len()));
    }
    out.reserve(prefix.len() + body.len());
    match prefix {
        Prefix::U16 => out.put_u16(body.len() as u16),
        Prefix::U32 => out.put_u32(body.len() as u32),
    }
    out.put_slice(body);
    Ok(())
}

/// Encode `body` as a standalone frame.
pub fn encode_frame(prefix: Prefix, body: &[u8]) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(prefix.len() + body.len());
    put_frame(&mut out, prefix, body)?;
    Ok(out.freeze())
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    prefix: Prefix,
    max: usize,
}

impl FrameReader {
    pub fn new(prefix: Prefix, max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            prefix,
            max: max.min(prefix.limit()),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        let hdr = self.prefix.len();
        if self.buf.len() < hdr {
            return Ok(None);
        }
        let declared = match self.prefix {
            Prefix::U16 => u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize,
            Prefix::U32 => {
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize
            }
        };
        if declared > self.max {
            return Err(WireError::PayloadTooLarge(declared));
        }
        if self.buf.len() < hdr + declared {
            return Ok(None);
        }
        self.buf.advance(hdr);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }
}
