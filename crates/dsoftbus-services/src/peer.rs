//! Peer table: the bounded set of devices discovery currently knows about.
//!
//! Only the discovery engine mutates the table. Other layers get `&PeerTable`
//! and can look records up but never change them.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use dsoftbus_core::crypto::Fingerprint;
use dsoftbus_core::time::MonotonicTime;

/// A discovered peer, as claimed by its latest accepted announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub device_id: String,
    /// Noise static key the announce claims. Not yet proven.
    pub claimed_static_pub: [u8; 32],
    /// Where the peer accepts session connections.
    pub addr: SocketAddr,
    pub port: u16,
    pub announce_seq: u64,
    pub last_seen: MonotonicTime,
    pub services: Vec<String>,
}

impl PeerRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.claimed_static_pub)
    }
}

/// Outcome of a successful insert/update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted { evicted: Option<PeerRecord> },
    Updated { key_changed: bool },
}

/// Fixed-capacity table keyed by device id.
///
/// When full, inserting a new device evicts the record with the oldest
/// `last_seen`, ties broken by the lowest `announce_seq`, then by device id.
#[derive(Debug, Clone)]
pub struct PeerTable {
    capacity: usize,
    records: BTreeMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, device_id: &str) -> Option<&PeerRecord> {
        self.records.get(device_id)
    }

    /// Records in device id order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// True if `seq` would be rejected as a replay for `device_id`.
    pub fn is_replay(&self, device_id: &str, seq: u64) -> bool {
        self.records
            .get(device_id)
            .is_some_and(|r| seq <= r.announce_seq)
    }

    /// Insert or refresh a record. The caller has already rejected replays.
    pub(crate) fn upsert(&mut self, record: PeerRecord) -> Upsert {
        if let Some(existing) = self.records.get_mut(&record.device_id) {
            let key_changed = existing.claimed_static_pub != record.claimed_static_pub;
            *existing = record;
            return Upsert::Updated { key_changed };
        }

        let evicted = if self.records.len() >= self.capacity {
            self.lru_victim()
                .and_then(|victim| self.records.remove(&victim))
        } else {
            None
        };
        self.records.insert(record.device_id.clone(), record);
        Upsert::Inserted { evicted }
    }

    /// Remove records whose `last_seen + ttl` lies strictly before `now`.
    pub(crate) fn expire(&mut self, now: MonotonicTime, ttl: std::time::Duration) -> Vec<PeerRecord> {
        let stale: Vec<String> = self
            .records
            .values()
            .filter(|r| now.is_past(r.last_seen.saturating_add(ttl)))
            .map(|r| r.device_id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .collect()
    }

    fn lru_victim(&self) -> Option<String> {
        self.records
            .values()
            .min_by(|a, b| {
                (a.last_seen, a.announce_seq, &a.device_id).cmp(&(b.last_seen, b.announce_seq, &b.device_id))
            })
            .map(|r| r.device_id.clone())
    }
}
