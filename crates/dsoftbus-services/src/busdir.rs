//! busdir: the service directory.
//!
//! Entries are keyed by `(peer fingerprint, service name, version)`. Local
//! publications use this device's fingerprint; remote ones arrive over a
//! `DirectoryLink` and are keyed by the fingerprint the session proved.
//! Every entry carries a deadline and disappears on the first `tick` strictly
//! after it.
//!
//! Watches see `Added`, `Updated` and `Removed` in the order the directory
//! applied them. Each watch queue is bounded; on overflow the queued events
//! are replaced by a single `Lagged` and the watcher should `list` again.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use dsoftbus_core::config::DirectoryConfig;
use dsoftbus_core::crypto::Fingerprint;
use dsoftbus_core::framing::{put_frame, FrameReader, Prefix};
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{validate_label, MAX_SERVICE_NAME_BYTES};

use crate::mux::{Mux, MuxError, StreamId};

/// Largest busdir message accepted from a peer.
const MAX_DIR_MESSAGE: usize = 64 * 1024;

type EntryKey = (Fingerprint, String, u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub peer: Fingerprint,
    pub service_name: String,
    pub version: u32,
    pub metadata: BTreeMap<String, String>,
    pub ttl_deadline: MonotonicTime,
}

impl DirectoryEntry {
    fn key(&self) -> EntryKey {
        (self.peer, self.service_name.clone(), self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(DirectoryEntry),
    Updated(DirectoryEntry),
    Removed(DirectoryEntry),
    /// This many events were dropped because the queue was full.
    Lagged { dropped: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("no such publication")]
    NotFound,
    #[error("directory full")]
    TooManyEntries,
    #[error("peer holds its maximum number of entries")]
    PeerQuota,
    #[error("invalid service name")]
    InvalidName,
    #[error("metadata exceeds configured bounds")]
    MetadataTooLarge,
    #[error("unknown watch")]
    UnknownWatch,
}

impl DirectoryError {
    pub fn code(&self) -> &'static str {
        match self {
            DirectoryError::NotFound => "ENOTFOUND",
            DirectoryError::TooManyEntries => "EFULL",
            DirectoryError::PeerQuota => "EQUOTA",
            DirectoryError::InvalidName => "EINVAL",
            DirectoryError::MetadataTooLarge => "EMSGSIZE",
            DirectoryError::UnknownWatch => "EBADWATCH",
        }
    }
}

struct Watch {
    service: String,
    queue: VecDeque<WatchEvent>,
}

impl Watch {
    fn push(&mut self, event: WatchEvent, cap: usize) {
        if self.queue.len() < cap {
            self.queue.push_back(event);
            return;
        }
        let mut dropped = 1;
        for old in self.queue.drain(..) {
            dropped += match old {
                WatchEvent::Lagged { dropped } => dropped,
                _ => 1,
            };
        }
        self.queue.push_back(WatchEvent::Lagged { dropped });
    }
}

pub struct Directory {
    local: Fingerprint,
    config: DirectoryConfig,
    entries: BTreeMap<EntryKey, DirectoryEntry>,
    watches: BTreeMap<WatchId, Watch>,
    next_watch: u64,
}

impl Directory {
    pub fn new(local: Fingerprint, config: DirectoryConfig) -> Self {
        Self {
            local,
            config,
            entries: BTreeMap::new(),
            watches: BTreeMap::new(),
            next_watch: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish (or refresh) a local service. Re-publishing moves the
    /// deadline and reports `Updated` only when the metadata changed.
    pub fn publish(
        &mut self,
        service_name: &str,
        version: u32,
        metadata: BTreeMap<String, String>,
        ttl: Duration,
        now: MonotonicTime,
    ) -> Result<(), DirectoryError> {
        let entry = DirectoryEntry {
            peer: self.local,
            service_name: service_name.to_string(),
            version,
            metadata,
            ttl_deadline: now.saturating_add(ttl),
        };
        self.upsert(entry)?;
        tracing::info!(service = service_name, version, ttl_ms = ttl.as_millis() as u64, "service published");
        Ok(())
    }

    pub fn unpublish(&mut self, service_name: &str, version: u32) -> Result<(), DirectoryError> {
        let key = (self.local, service_name.to_string(), version);
        let entry = self.entries.remove(&key).ok_or(DirectoryError::NotFound)?;
        tracing::info!(service = service_name, version, "service unpublished");
        self.notify(WatchEvent::Removed(entry));
        Ok(())
    }

    /// Every entry for `service_name`, local and remote, in key order.
    pub fn list(&self, service_name: &str) -> Vec<DirectoryEntry> {
        self.entries
            .values()
            .filter(|e| e.service_name == service_name)
            .cloned()
            .collect()
    }

    /// Local publications in key order.
    pub fn local_entries(&self) -> impl Iterator<Item = &DirectoryEntry> + '_ {
        let local = self.local;
        self.entries.values().filter(move |e| e.peer == local)
    }

    /// Names of the local publications, deduplicated.
    pub fn local_service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local_entries().map(|e| e.service_name.clone()).collect();
        names.dedup();
        names
    }

    /// Subscribe to changes for `service_name`. The current entries are
    /// queued first as `Added`.
    pub fn watch(&mut self, service_name: &str) -> WatchId {
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        let cap = self.watch_cap();
        let mut watch = Watch {
            service: service_name.to_string(),
            queue: VecDeque::new(),
        };
        for entry in self.entries.values().filter(|e| e.service_name == service_name) {
            watch.push(WatchEvent::Added(entry.clone()), cap);
        }
        self.watches.insert(id, watch);
        id
    }

    pub fn poll_watch(&mut self, id: WatchId) -> Result<Option<WatchEvent>, DirectoryError> {
        let watch = self.watches.get_mut(&id).ok_or(DirectoryError::UnknownWatch)?;
        Ok(watch.queue.pop_front())
    }

    pub fn unwatch(&mut self, id: WatchId) -> Result<(), DirectoryError> {
        self.watches.remove(&id).map(|_| ()).ok_or(DirectoryError::UnknownWatch)
    }

    /// Remove every entry whose deadline lies strictly before `now`.
    pub fn tick(&mut self, now: MonotonicTime) {
        let expired: Vec<EntryKey> = self
            .entries
            .values()
            .filter(|e| now.is_past(e.ttl_deadline))
            .map(DirectoryEntry::key)
            .collect();
        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                tracing::debug!(service = %entry.service_name, version = entry.version, peer = %entry.peer, "directory entry expired");
                self.notify(WatchEvent::Removed(entry));
            }
        }
    }

    /// Apply a message received from `peer` over its directory link.
    pub fn apply_remote(&mut self, peer: Fingerprint, msg: DirMessage, now: MonotonicTime) -> Result<(), DirectoryError> {
        if peer == self.local {
            return Err(DirectoryError::InvalidName);
        }
        match msg {
            DirMessage::Publish {
                service,
                version,
                metadata,
                ttl_ms,
            } => self.upsert(DirectoryEntry {
                peer,
                service_name: service,
                version,
                metadata,
                ttl_deadline: now.saturating_add(Duration::from_millis(ttl_ms)),
            }),
            DirMessage::Unpublish { service, version } => {
                let entry = self
                    .entries
                    .remove(&(peer, service, version))
                    .ok_or(DirectoryError::NotFound)?;
                self.notify(WatchEvent::Removed(entry));
                Ok(())
            }
        }
    }

    fn peer_entry_count(&self, peer: Fingerprint) -> usize {
        self.entries
            .range((peer, String::new(), 0)..)
            .take_while(|(k, _)| k.0 == peer)
            .count()
    }

    /// Drop everything `peer` published. Used when its session ends.
    pub fn remove_peer(&mut self, peer: Fingerprint) -> usize {
        let keys: Vec<EntryKey> = self
            .entries
            .range((peer, String::new(), 0)..)
            .take_while(|(k, _)| k.0 == peer)
            .map(|(k, _)| k.clone())
            .collect();
        let n = keys.len();
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.notify(WatchEvent::Removed(entry));
            }
        }
        if n > 0 {
            tracing::debug!(%peer, removed = n, "dropped peer's directory entries");
        }
        n
    }

    fn upsert(&mut self, entry: DirectoryEntry) -> Result<(), DirectoryError> {
        self.check(&entry)?;
        let key = entry.key();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                let changed = existing.metadata != entry.metadata;
                *existing = entry.clone();
                if changed {
                    self.notify(WatchEvent::Updated(entry));
                }
            }
            None => {
                if self.entries.len() as u64 >= self.config.max_entries {
                    return Err(DirectoryError::TooManyEntries);
                }
                let remote = entry.peer != self.local;
                if remote && self.peer_entry_count(entry.peer) as u64 >= self.config.max_entries_per_peer {
                    return Err(DirectoryError::PeerQuota);
                }
                self.entries.insert(key, entry.clone());
                self.notify(WatchEvent::Added(entry));
            }
        }
        Ok(())
    }

    fn check(&self, entry: &DirectoryEntry) -> Result<(), DirectoryError> {
        validate_label(&entry.service_name, MAX_SERVICE_NAME_BYTES, "service")
            .map_err(|_| DirectoryError::InvalidName)?;
        let bytes: usize = entry.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        if entry.metadata.len() as u64 > self.config.max_metadata_entries
            || bytes as u64 > self.config.max_metadata_bytes
        {
            return Err(DirectoryError::MetadataTooLarge);
        }
        Ok(())
    }

    fn watch_cap(&self) -> usize {
        self.config.watch_queue.max(1) as usize
    }

    fn notify(&mut self, event: WatchEvent) {
        let cap = self.watch_cap();
        let service = match &event {
            WatchEvent::Added(e) | WatchEvent::Updated(e) | WatchEvent::Removed(e) => e.service_name.clone(),
            WatchEvent::Lagged { .. } => return,
        };
        for watch in self.watches.values_mut().filter(|w| w.service == service) {
            watch.push(event.clone(), cap);
        }
    }
}

// ── Directory link ────────────────────────────────────────────────────────────

/// What travels on a busdir stream, one JSON object per u32-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DirMessage {
    Publish {
        service: String,
        version: u32,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
        ttl_ms: u64,
    },
    Unpublish {
        service: String,
        version: u32,
    },
}

/// Keeps one peer's view of our publications in sync and applies theirs.
pub struct DirectoryLink {
    stream: StreamId,
    peer: Fingerprint,
    reader: FrameReader,
    out: BytesMut,
    /// Publications as last sent: metadata and deadline.
    sent: BTreeMap<(String, u32), (BTreeMap<String, String>, MonotonicTime)>,
    next_refresh: MonotonicTime,
}

impl DirectoryLink {
    pub fn new(stream: StreamId, peer: Fingerprint) -> Self {
        Self {
            stream,
            peer,
            reader: FrameReader::new(Prefix::U32, MAX_DIR_MESSAGE),
            out: BytesMut::new(),
            sent: BTreeMap::new(),
            next_refresh: MonotonicTime::ZERO,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn peer(&self) -> Fingerprint {
        self.peer
    }

    /// Read the peer's messages, queue our changes and write what the
    /// stream window allows. An error means the stream is gone.
    pub fn pump(&mut self, mux: &mut Mux, dir: &mut Directory, refresh: Duration, now: MonotonicTime) -> Result<(), MuxError> {
        self.read(mux, dir, now)?;
        if self.out.is_empty() {
            if now >= self.next_refresh {
                self.sent.clear();
                self.next_refresh = now.saturating_add(refresh);
            }
            self.queue_changes(dir, now);
        }
        self.write(mux)
    }

    fn read(&mut self, mux: &mut Mux, dir: &mut Directory, now: MonotonicTime) -> Result<(), MuxError> {
        let mut buf = [0u8; 4096];
        loop {
            match mux.read(self.stream, &mut buf) {
                Ok(0) => return Err(MuxError::Closed),
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(MuxError::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        loop {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "busdir framing violated");
                    return Err(MuxError::Protocol("busdir framing"));
                }
            };
            match serde_json::from_slice::<DirMessage>(&frame) {
                Ok(msg) => {
                    if let Err(e) = dir.apply_remote(self.peer, msg, now) {
                        tracing::debug!(peer = %self.peer, error = %e, "busdir message refused");
                    }
                }
                Err(e) => tracing::debug!(peer = %self.peer, error = %e, "undecodable busdir message"),
            }
        }
    }

    fn queue_changes(&mut self, dir: &Directory, now: MonotonicTime) {
        let mut current = BTreeMap::new();
        for entry in dir.local_entries() {
            let key = (entry.service_name.clone(), entry.version);
            let unchanged = self
                .sent
                .get(&key)
                .is_some_and(|(meta, deadline)| *meta == entry.metadata && *deadline == entry.ttl_deadline);
            if !unchanged {
                let ttl_ms = entry.ttl_deadline.as_millis().saturating_sub(now.as_millis());
                self.push(&DirMessage::Publish {
                    service: entry.service_name.clone(),
                    version: entry.version,
                    metadata: entry.metadata.clone(),
                    ttl_ms,
                });
            }
            current.insert(key, (entry.metadata.clone(), entry.ttl_deadline));
        }
        let gone: Vec<(String, u32)> = self.sent.keys().filter(|k| !current.contains_key(*k)).cloned().collect();
        for (service, version) in gone {
            self.push(&DirMessage::Unpublish { service, version });
        }
        self.sent = current;
    }

    fn push(&mut self, msg: &DirMessage) {
        match serde_json::to_vec(msg) {
            Ok(json) => {
                if let Err(e) = put_frame(&mut self.out, Prefix::U32, &json) {
                    tracing::debug!(error = %e, "busdir message not framed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "busdir message not serialized"),
        }
    }

    fn write(&mut self, mux: &mut Mux) -> Result<(), MuxError> {
        while !self.out.is_empty() {
            match mux.write(self.stream, &self.out) {
                Ok(n) => self.out.advance(n),
                Err(MuxError::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
