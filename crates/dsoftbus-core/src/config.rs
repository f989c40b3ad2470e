//! Configuration system for DSoftBus.
//!
//! Resolution order: environment variables → config file → defaults, then
//! `validate()`.
//!
//! Config file location:
//!   1. $DSOFTBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dsoftbus/config.toml
//!   3. ~/.config/dsoftbus/config.toml
//!
//! Only the daemon calls `load()`. Library layers receive their section by
//! value and never touch files or the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{validate_label, DISCOVERY_PORT, MAX_FRAME_PAYLOAD, MAX_RPC_NAME_BYTES, SESSION_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftbusConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub mux: MuxConfig,
    pub rpc: RpcConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Device id announced to peers. Empty = derived from the hostname.
    pub device_id: String,
    /// Path to the X25519 static private key. Generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind the discovery and session sockets to.
    pub bind_addr: String,
    /// Destination of announce datagrams (normally the broadcast address).
    pub announce_addr: String,
    /// UDP port for announces.
    pub discovery_port: u16,
    /// TCP port for session connections.
    pub session_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base period between announces.
    pub announce_interval_ms: u64,
    /// Number of fixed offset slots an announce may fall into.
    pub jitter_buckets: u64,
    /// Width of each offset slot.
    pub jitter_bucket_ms: u64,
    /// Capacity of the peer table.
    pub peer_capacity: u64,
    /// Records not refreshed within this period are expired.
    pub peer_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub idle_timeout_ms: u64,
    /// Encrypted bytes a session may queue toward its connection.
    pub max_outbound_bytes: u64,
    /// Concurrent sessions, authenticated or in handshake.
    pub max_sessions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Concurrently open streams per session.
    pub max_streams: u64,
    /// Receive window advertised on every stream.
    pub initial_window: u64,
    /// Bytes buffered per stream before the stream is reset with EWINDOW.
    pub max_stream_buffer: u64,
    /// Largest DATA payload per frame.
    pub max_frame_payload: u64,
    pub open_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub call_timeout_ms: u64,
    /// Calls awaiting a response per session.
    pub max_pending_calls: u64,
    /// Largest single envelope, request or response.
    pub max_message_bytes: u64,
    /// Encoded bytes queued for the rpc stream before calls are refused.
    pub max_outbox_bytes: u64,
    /// Largest request payload a peer may send to a local service.
    pub max_request_bytes: u64,
    /// Services peers may call. Anything not listed is refused.
    pub allowed_services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub max_entries: u64,
    /// Remote entries any single peer may hold.
    pub max_entries_per_peer: u64,
    pub max_metadata_entries: u64,
    /// Sum of key and value lengths across one entry's metadata.
    pub max_metadata_bytes: u64,
    /// Interval at which local publications are re-sent to linked peers.
    pub refresh_interval_ms: u64,
    /// Events a watcher may fall behind before it is told it lagged.
    pub watch_queue: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            announce_addr: "255.255.255.255".into(),
            discovery_port: DISCOVERY_PORT,
            session_port: SESSION_PORT,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval_ms: 1_000,
            jitter_buckets: 8,
            jitter_bucket_ms: 50,
            peer_capacity: 16,
            peer_ttl_ms: 15_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            keepalive_interval_ms: 2_000,
            idle_timeout_ms: 10_000,
            max_outbound_bytes: 256 * 1024,
            max_sessions: 64,
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 64,
            initial_window: 64 * 1024,
            max_stream_buffer: 256 * 1024,
            max_frame_payload: MAX_FRAME_PAYLOAD as u64,
            open_timeout_ms: 5_000,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 3_000,
            max_pending_calls: 256,
            max_message_bytes: 1024 * 1024,
            max_outbox_bytes: 256 * 1024,
            max_request_bytes: 64 * 1024,
            allowed_services: Vec::new(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_entries_per_peer: 128,
            max_metadata_entries: 16,
            max_metadata_bytes: 1024,
            refresh_interval_ms: 10_000,
            watch_queue: 64,
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl MuxConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl DirectoryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("dsoftbus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

fn bounded(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SoftbusConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            SoftbusConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DSOFTBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SoftbusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values outside the ranges every layer is built for.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.device_id.len() > crate::wire::MAX_DEVICE_ID_BYTES {
            return Err(ConfigError::Invalid {
                field: "identity.device_id",
                reason: "longer than 64 bytes",
            });
        }
        if self.identity.device_id.chars().any(char::is_control) {
            return Err(ConfigError::Invalid {
                field: "identity.device_id",
                reason: "contains control characters",
            });
        }

        let d = &self.discovery;
        bounded("discovery.announce_interval_ms", d.announce_interval_ms, 100, 60_000)?;
        bounded("discovery.jitter_buckets", d.jitter_buckets, 1, 64)?;
        bounded("discovery.jitter_bucket_ms", d.jitter_bucket_ms, 0, 1_000)?;
        bounded("discovery.peer_capacity", d.peer_capacity, 1, 1_024)?;
        bounded("discovery.peer_ttl_ms", d.peer_ttl_ms, 1_000, 600_000)?;

        let s = &self.session;
        bounded("session.handshake_timeout_ms", s.handshake_timeout_ms, 100, 60_000)?;
        bounded("session.keepalive_interval_ms", s.keepalive_interval_ms, 100, 60_000)?;
        bounded(
            "session.idle_timeout_ms",
            s.idle_timeout_ms,
            s.keepalive_interval_ms.saturating_add(1),
            600_000,
        )?;
        bounded("session.max_outbound_bytes", s.max_outbound_bytes, 4_096, 64 << 20)?;
        bounded("session.max_sessions", s.max_sessions, 1, 1_024)?;

        let m = &self.mux;
        bounded("mux.max_streams", m.max_streams, 1, 4_096)?;
        bounded("mux.initial_window", m.initial_window, 1_024, 16 << 20)?;
        bounded("mux.max_stream_buffer", m.max_stream_buffer, m.initial_window, 64 << 20)?;
        bounded("mux.max_frame_payload", m.max_frame_payload, 256, MAX_FRAME_PAYLOAD as u64)?;
        bounded("mux.open_timeout_ms", m.open_timeout_ms, 100, 60_000)?;

        let r = &self.rpc;
        bounded("rpc.call_timeout_ms", r.call_timeout_ms, 10, 600_000)?;
        bounded("rpc.max_pending_calls", r.max_pending_calls, 1, 65_536)?;
        bounded("rpc.max_message_bytes", r.max_message_bytes, 1_024, 16 << 20)?;
        bounded("rpc.max_outbox_bytes", r.max_outbox_bytes, 1_024, 64 << 20)?;
        bounded("rpc.max_request_bytes", r.max_request_bytes, 0, r.max_message_bytes)?;
        let valid = |s: &String| validate_label(s, MAX_RPC_NAME_BYTES, "service").is_ok();
        if !r.allowed_services.iter().all(valid) {
            return Err(ConfigError::Invalid {
                field: "rpc.allowed_services",
                reason: "entries must be 1..=64 bytes without control characters",
            });
        }

        let dir = &self.directory;
        bounded("directory.max_entries", dir.max_entries, 1, 65_536)?;
        bounded("directory.max_entries_per_peer", dir.max_entries_per_peer, 1, dir.max_entries)?;
        bounded("directory.max_metadata_entries", dir.max_metadata_entries, 0, 256)?;
        bounded("directory.max_metadata_bytes", dir.max_metadata_bytes, 0, 64 * 1024)?;
        bounded("directory.refresh_interval_ms", dir.refresh_interval_ms, 100, 600_000)?;
        bounded("directory.watch_queue", dir.watch_queue, 1, 65_536)?;

        Ok(())
    }

    /// Apply DSOFTBUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn num(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut u64) {
            if let Some(v) = lookup(key).and_then(|v| v.parse().ok()) {
                *slot = v;
            }
        }

        if let Some(v) = lookup("DSOFTBUS_IDENTITY__DEVICE_ID") {
            self.identity.device_id = v;
        }
        if let Some(v) = lookup("DSOFTBUS_IDENTITY__KEYPAIR_PATH") {
            self.identity.keypair_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DSOFTBUS_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Some(v) = lookup("DSOFTBUS_NETWORK__ANNOUNCE_ADDR") {
            self.network.announce_addr = v;
        }
        if let Some(p) = lookup("DSOFTBUS_NETWORK__DISCOVERY_PORT").and_then(|v| v.parse().ok()) {
            self.network.discovery_port = p;
        }
        if let Some(p) = lookup("DSOFTBUS_NETWORK__SESSION_PORT").and_then(|v| v.parse().ok()) {
            self.network.session_port = p;
        }

        num(&lookup, "DSOFTBUS_DISCOVERY__ANNOUNCE_INTERVAL_MS", &mut self.discovery.announce_interval_ms);
        num(&lookup, "DSOFTBUS_DISCOVERY__PEER_CAPACITY", &mut self.discovery.peer_capacity);
        num(&lookup, "DSOFTBUS_DISCOVERY__PEER_TTL_MS", &mut self.discovery.peer_ttl_ms);
        num(&lookup, "DSOFTBUS_SESSION__HANDSHAKE_TIMEOUT_MS", &mut self.session.handshake_timeout_ms);
        num(&lookup, "DSOFTBUS_SESSION__IDLE_TIMEOUT_MS", &mut self.session.idle_timeout_ms);
        num(&lookup, "DSOFTBUS_MUX__MAX_STREAMS", &mut self.mux.max_streams);
        num(&lookup, "DSOFTBUS_MUX__INITIAL_WINDOW", &mut self.mux.initial_window);
        num(&lookup, "DSOFTBUS_MUX__MAX_STREAM_BUFFER", &mut self.mux.max_stream_buffer);
        num(&lookup, "DSOFTBUS_RPC__CALL_TIMEOUT_MS", &mut self.rpc.call_timeout_ms);
        num(&lookup, "DSOFTBUS_RPC__MAX_PENDING_CALLS", &mut self.rpc.max_pending_calls);
        num(&lookup, "DSOFTBUS_RPC__MAX_REQUEST_BYTES", &mut self.rpc.max_request_bytes);
        if let Some(v) = lookup("DSOFTBUS_RPC__ALLOWED_SERVICES") {
            self.rpc.allowed_services = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        num(&lookup, "DSOFTBUS_DIRECTORY__MAX_ENTRIES", &mut self.directory.max_entries);
        num(&lookup, "DSOFTBUS_DIRECTORY__WATCH_QUEUE", &mut self.directory.watch_queue);
    }
}
