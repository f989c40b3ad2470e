//! Cryptographic primitives for DSoftBus.
//!
//! Provides three things:
//!   1. BLAKE3 hashing for fingerprints and deterministic jitter
//!   2. Noise_XK session establishment with identity binding
//!   3. `SessionCipher`, the post-handshake record encryptor
//!
//! Keypairs are managed via x25519-dalek for explicit key control.
//! snow drives the Noise_XK state machine using those keys.
//!
//! All key material derives ZeroizeOnDrop and is wiped when dropped. No
//! `Debug` impl in this module prints key bytes.

use std::fmt;

use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Short, printable identity of a Noise static public key.
///
/// The first 16 bytes of BLAKE3(static_pub). Directory entries and logs
/// refer to peers by fingerprint, never by raw key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn of(static_pub: &[u8; 32]) -> Self {
        let digest = hash(static_pub);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..4]))
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// The Noise protocol pattern DSoftBus uses.
///
/// Noise_XK: the initiator already knows the responder's static key (from a
/// discovery announce); the initiator's static key is sent encrypted in
/// message 3.
const NOISE_PATTERN: &str = "Noise_XK_25519_ChaChaPoly_BLAKE2s";

/// Mixed into the handshake hash so peers speaking a different protocol
/// revision fail the handshake instead of misparsing records.
pub const PROLOGUE: &[u8] = b"nexus-dsoftbus/xk/1";

/// Upper bound on any handshake message, payload included.
const MAX_HANDSHAKE_MSG: usize = 512;

/// A device's long-term static X25519 keypair.
///
/// The public key appears in every announce. The private key never leaves
/// this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_private(secret.to_bytes())
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Derive a keypair from a seed. Test fabrics use this to get stable keys.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self::from_private(hash(seed))
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.public)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .field("private", &"<redacted>")
            .finish()
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

fn builder(keypair: &Keypair) -> Result<Builder<'_>, CryptoError> {
    let params = NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?;
    Ok(Builder::new(params)
        .local_private_key(&*keypair.private)
        .prologue(PROLOGUE))
}

fn write_handshake(state: &mut HandshakeState, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut msg = vec![0u8; MAX_HANDSHAKE_MSG];
    let len = state.write_message(payload, &mut msg)?;
    msg.truncate(len);
    Ok(msg)
}

fn read_handshake(state: &mut HandshakeState, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if msg.len() > MAX_HANDSHAKE_MSG {
        return Err(CryptoError::TooLong);
    }
    let mut payload = vec![0u8; msg.len()];
    let len = state.read_message(msg, &mut payload)?;
    payload.truncate(len);
    Ok(payload)
}

fn complete(state: HandshakeState) -> Result<CompletedHandshake, CryptoError> {
    let remote: [u8; 32] = state
        .get_remote_static()
        .and_then(|k| k.try_into().ok())
        .ok_or(CryptoError::MissingRemoteStatic)?;
    let session_id = hash(state.get_handshake_hash());
    let transport = state.into_stateless_transport_mode()?;
    Ok(CompletedHandshake {
        remote_static: remote,
        cipher: SessionCipher {
            session_id,
            transport,
            send_nonce: 0,
            recv_window: ReplayWindow::new(),
        },
    })
}

/// Result of a finished handshake, before any identity policy is applied.
pub struct CompletedHandshake {
    /// Static key the peer proved possession of.
    pub remote_static: [u8; 32],
    pub cipher: SessionCipher,
}

/// Initiator side of the Noise_XK handshake.
///
/// The initiator learned the responder's static key from an announce. It
/// sends message 1, reads message 2 and then writes message 3.
pub struct NoiseInitiator {
    state: HandshakeState,
}

impl NoiseInitiator {
    /// Begin a handshake toward `remote_static`. Returns message 1.
    pub fn new(keypair: &Keypair, remote_static: &[u8; 32]) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = builder(keypair)?
            .remote_public_key(remote_static)
            .build_initiator()?;
        let msg1 = write_handshake(&mut state, &[])?;
        Ok((Self { state }, msg1))
    }

    /// Read message 2. Returns the responder's payload (its device id).
    pub fn read_response(mut self, msg2: &[u8]) -> Result<(InitiatorPending, Vec<u8>), CryptoError> {
        let payload = read_handshake(&mut self.state, msg2)?;
        Ok((InitiatorPending { state: self.state }, payload))
    }
}

/// Initiator that has read message 2 and owes message 3.
pub struct InitiatorPending {
    state: HandshakeState,
}

impl InitiatorPending {
    /// Write message 3 carrying `payload` and complete the handshake.
    pub fn finish(mut self, payload: &[u8]) -> Result<(CompletedHandshake, Vec<u8>), CryptoError> {
        let msg3 = write_handshake(&mut self.state, payload)?;
        Ok((complete(self.state)?, msg3))
    }
}

/// Responder side of the Noise_XK handshake.
pub struct NoiseResponder {
    state: HandshakeState,
}

impl NoiseResponder {
    pub fn new(keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = builder(keypair)?.build_responder()?;
        Ok(Self { state })
    }

    /// Read message 1 and write message 2 carrying `payload`.
    pub fn respond(mut self, msg1: &[u8], payload: &[u8]) -> Result<(ResponderPending, Vec<u8>), CryptoError> {
        read_handshake(&mut self.state, msg1)?;
        let msg2 = write_handshake(&mut self.state, payload)?;
        Ok((ResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3 from the initiator.
pub struct ResponderPending {
    state: HandshakeState,
}

impl ResponderPending {
    /// Read message 3. Returns the completed handshake and the initiator's
    /// payload (its device id).
    pub fn finish(mut self, msg3: &[u8]) -> Result<(CompletedHandshake, Vec<u8>), CryptoError> {
        let payload = read_handshake(&mut self.state, msg3)?;
        Ok((complete(self.state)?, payload))
    }
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Number of nonces tracked behind the highest one seen.
const WINDOW_SIZE: u64 = 2048;
const WINDOW_WORDS: usize = (WINDOW_SIZE / 64) as usize;

/// Sliding-window replay protection (RFC 6479 style).
///
/// Bit `d` of the bitmap records whether nonce `highest - d` was seen.
pub struct ReplayWindow {
    highest: u64,
    seen_any: bool,
    bitmap: [u64; WINDOW_WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            seen_any: false,
            bitmap: [0; WINDOW_WORDS],
        }
    }

    /// True if the nonce has not been seen and is not behind the window.
    pub fn check(&self, nonce: u64) -> bool {
        if !self.seen_any || nonce > self.highest {
            return true;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return false;
        }
        self.bitmap[(diff / 64) as usize] & (1u64 << (diff % 64)) == 0
    }

    /// Record a nonce. Call only after the record authenticated.
    pub fn mark(&mut self, nonce: u64) {
        if !self.seen_any {
            self.seen_any = true;
            self.highest = nonce;
        } else if nonce > self.highest {
            self.advance(nonce - self.highest);
            self.highest = nonce;
        }
        let diff = self.highest - nonce;
        if diff < WINDOW_SIZE {
            self.bitmap[(diff / 64) as usize] |= 1u64 << (diff % 64);
        }
    }

    fn advance(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap = [0; WINDOW_WORDS];
            return;
        }
        let words = (shift / 64) as usize;
        let bits = (shift % 64) as u32;
        let old = self.bitmap;
        for i in 0..WINDOW_WORDS {
            let src = i.checked_sub(words);
            let hi = src.map_or(0, |s| old[s] << bits);
            let carry = match (bits, src.and_then(|s| s.checked_sub(1))) {
                (0, _) | (_, None) => 0,
                (b, Some(s)) => old[s] >> (64 - b),
            };
            self.bitmap[i] = hi | carry;
        }
    }
}

// ── SessionCipher ─────────────────────────────────────────────────────────────

/// Post-handshake record encryption for one session.
///
/// Each record carries an 8-byte LE nonce prefix:
///   [u64 nonce LE] [ChaChaPoly ciphertext (plaintext + 16-byte tag)]
///
/// Send nonces are strictly increasing; the cipher refuses to encrypt once
/// they are exhausted rather than reuse one.
pub struct SessionCipher {
    /// Derived from the Noise handshake hash. Identical on both sides.
    pub session_id: [u8; 32],
    transport: StatelessTransportState,
    send_nonce: u64,
    recv_window: ReplayWindow,
}

/// Bytes a record adds on top of its plaintext.
pub const RECORD_OVERHEAD: usize = 8 + 16;

impl SessionCipher {
    /// Encrypt plaintext into `out`, replacing its contents.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.send_nonce;
        self.send_nonce = nonce.checked_add(1).ok_or(CryptoError::NonceExhausted)?;

        out.clear();
        out.extend_from_slice(&nonce.to_le_bytes());
        out.resize(RECORD_OVERHEAD + plaintext.len(), 0);
        let written = self.transport.write_message(nonce, plaintext, &mut out[8..])?;
        out.truncate(8 + written);
        Ok(())
    }

    /// Decrypt a record into `out`. Rejects replays and forged records.
    pub fn decrypt(&mut self, record: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if record.len() < RECORD_OVERHEAD {
            return Err(CryptoError::TooShort);
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&record[..8]);
        let nonce = u64::from_le_bytes(prefix);

        if !self.recv_window.check(nonce) {
            return Err(CryptoError::Replay);
        }

        out.clear();
        out.resize(record.len() - 8, 0);
        let written = self.transport.read_message(nonce, &record[8..], out)?;
        out.truncate(written);

        self.recv_window.mark(nonce);
        Ok(())
    }

    pub fn session_id_hex(&self) -> String {
        hex::encode(&self.session_id[..8])
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("session", &self.session_id_hex())
            .field("send_nonce", &self.send_nonce)
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("record too short (need at least 24 bytes: 8 nonce + 16 tag)")]
    TooShort,

    #[error("handshake message too long")]
    TooLong,

    #[error("replayed or too-old nonce")]
    Replay,

    #[error("send nonces exhausted")]
    NonceExhausted,

    #[error("handshake finished without a remote static key")]
    MissingRemoteStatic,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
