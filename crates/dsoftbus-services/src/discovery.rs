//! Discovery engine: produces announces and turns received ones into peer
//! table changes.
//!
//! The engine never touches the network itself. `announce_tick` hands back
//! the datagram to send and `on_datagram` is fed whatever the transport
//! received, so the whole engine runs under an injected clock.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use dsoftbus_core::config::DiscoveryConfig;
use dsoftbus_core::crypto::hash;
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_core::wire::{AnnounceV1, PacketError};

use crate::peer::{PeerRecord, PeerTable, Upsert};

/// Why an announce was dropped. Never fatal and never evicts a good record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryRejection {
    #[error("malformed announce")]
    Malformed,
    #[error("oversized announce")]
    Oversized,
    #[error("replayed announce")]
    Replay,
    #[error("unsupported announce version")]
    VersionMismatch,
}

impl From<&PacketError> for DiscoveryRejection {
    fn from(e: &PacketError) -> Self {
        match e {
            PacketError::Oversized(_) => DiscoveryRejection::Oversized,
            PacketError::UnsupportedVersion(_) => DiscoveryRejection::VersionMismatch,
            _ => DiscoveryRejection::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Found(PeerRecord),
    Updated(PeerRecord),
    Rejected {
        src: SocketAddr,
        reason: DiscoveryRejection,
    },
    Expired(PeerRecord),
}

/// What this node announces about itself.
#[derive(Debug, Clone)]
pub struct LocalAnnounce {
    pub device_id: String,
    pub static_pub: [u8; 32],
    /// Session port peers should dial.
    pub port: u16,
    pub services: Vec<String>,
    /// Sequence number of the first announce. Must exceed anything a
    /// previous incarnation of this device sent.
    pub initial_seq: u64,
}

pub struct DiscoveryEngine {
    local: LocalAnnounce,
    config: DiscoveryConfig,
    peers: PeerTable,
    next_seq: u64,
    offset: Duration,
    next_announce: Option<MonotonicTime>,
}

impl DiscoveryEngine {
    pub fn new(local: LocalAnnounce, config: DiscoveryConfig) -> Self {
        let offset = schedule_offset(&local.device_id, &config);
        let peers = PeerTable::new(config.peer_capacity as usize);
        Self {
            next_seq: local.initial_seq,
            local,
            config,
            peers,
            offset,
            next_announce: None,
        }
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn local(&self) -> &LocalAnnounce {
        &self.local
    }

    /// Fixed offset of this device's announces within each interval.
    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// Replace the advertised service list. Takes effect on the next announce.
    pub fn set_services(&mut self, services: Vec<String>) -> Result<(), PacketError> {
        let previous = std::mem::replace(&mut self.local.services, services);
        if let Err(e) = self.build_announce(self.next_seq) {
            self.local.services = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Return the announce datagram if one is due at `now`.
    ///
    /// Announces land on `k * interval + offset` for integer `k`; a loop that
    /// falls behind skips missed slots instead of bursting.
    pub fn announce_tick(&mut self, now: MonotonicTime) -> Option<Bytes> {
        let due = match self.next_announce {
            Some(due) => due,
            None => {
                let due = self.slot_at_or_after(now);
                self.next_announce = Some(due);
                due
            }
        };
        if now < due {
            return None;
        }
        self.next_announce = Some(self.slot_at_or_after(MonotonicTime::from_millis(now.as_millis() + 1)));

        let seq = self.next_seq;
        match self.build_announce(seq) {
            Ok(bytes) => {
                self.next_seq += 1;
                tracing::trace!(seq, len = bytes.len(), "announce due");
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!(error = %e, "local announce does not encode");
                None
            }
        }
    }

    /// Process one received datagram.
    ///
    /// Own announces (same device id or same static key) are ignored and
    /// produce no event.
    pub fn on_datagram(&mut self, src: SocketAddr, bytes: &[u8], now: MonotonicTime) -> Option<PeerEvent> {
        let announce = match AnnounceV1::decode(bytes) {
            Ok(a) => a,
            Err(e) => {
                let reason = DiscoveryRejection::from(&e);
                tracing::debug!(%src, len = bytes.len(), error = %e, ?reason, "announce rejected");
                return Some(PeerEvent::Rejected { src, reason });
            }
        };

        if announce.device_id == self.local.device_id || announce.noise_static == self.local.static_pub {
            tracing::trace!(%src, "ignoring own announce");
            return None;
        }

        if self.peers.is_replay(&announce.device_id, announce.announce_seq) {
            tracing::debug!(
                %src,
                device_id = %announce.device_id,
                seq = announce.announce_seq,
                "announce replay rejected"
            );
            return Some(PeerEvent::Rejected {
                src,
                reason: DiscoveryRejection::Replay,
            });
        }

        let record = PeerRecord {
            device_id: announce.device_id,
            claimed_static_pub: announce.noise_static,
            addr: SocketAddr::new(src.ip(), announce.port),
            port: announce.port,
            announce_seq: announce.announce_seq,
            last_seen: now,
            services: announce.services,
        };

        match self.peers.upsert(record.clone()) {
            Upsert::Inserted { evicted } => {
                if let Some(old) = evicted {
                    tracing::debug!(device_id = %old.device_id, "peer evicted from full table");
                }
                tracing::info!(
                    device_id = %record.device_id,
                    addr = %record.addr,
                    fingerprint = %record.fingerprint(),
                    "peer discovered"
                );
                Some(PeerEvent::Found(record))
            }
            Upsert::Updated { key_changed } => {
                if key_changed {
                    tracing::warn!(
                        device_id = %record.device_id,
                        fingerprint = %record.fingerprint(),
                        "peer announced a different static key"
                    );
                }
                tracing::trace!(device_id = %record.device_id, seq = record.announce_seq, "peer refreshed");
                Some(PeerEvent::Updated(record))
            }
        }
    }

    /// Drop records not refreshed within the peer TTL.
    pub fn expire(&mut self, now: MonotonicTime) -> Vec<PeerEvent> {
        self.peers
            .expire(now, self.config.peer_ttl())
            .into_iter()
            .map(|r| {
                tracing::info!(device_id = %r.device_id, "peer expired");
                PeerEvent::Expired(r)
            })
            .collect()
    }

    fn build_announce(&self, seq: u64) -> Result<Bytes, PacketError> {
        AnnounceV1 {
            device_id: self.local.device_id.clone(),
            port: self.local.port,
            noise_static: self.local.static_pub,
            announce_seq: seq,
            services: self.local.services.clone(),
        }
        .encode()
    }

    fn slot_at_or_after(&self, t: MonotonicTime) -> MonotonicTime {
        let interval = self.config.announce_interval_ms.max(1);
        let offset = self.offset.as_millis() as u64 % interval;
        let t = t.as_millis();
        let base = t - t % interval + offset;
        let slot = if base >= t { base } else { base + interval };
        MonotonicTime::from_millis(slot)
    }
}

/// `hash(device_id) mod buckets * bucket_width`: spreads devices over the
/// interval without any randomness.
fn schedule_offset(device_id: &str, config: &DiscoveryConfig) -> Duration {
    let digest = hash(device_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let bucket = u64::from_le_bytes(head) % config.jitter_buckets.max(1);
    Duration::from_millis(bucket * config.jitter_bucket_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsoftbus_core::wire::MAX_ANNOUNCE;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn t(ms: u64) -> MonotonicTime {
        MonotonicTime::from_millis(ms)
    }

    fn src() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 37020))
    }

    fn engine(id: &str) -> DiscoveryEngine {
        DiscoveryEngine::new(
            LocalAnnounce {
                device_id: id.into(),
                static_pub: [0xAA; 32],
                port: 37021,
                services: vec!["samgrd".into()],
                initial_seq: 1,
            },
            DiscoveryConfig::default(),
        )
    }

    fn announce(id: &str, seq: u64) -> Bytes {
        AnnounceV1 {
            device_id: id.into(),
            port: 4000,
            noise_static: [0x42; 32],
            announce_seq: seq,
            services: vec!["rpc".into()],
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn first_announce_yields_found_then_updated() {
        let mut e = engine("node-b");
        match e.on_datagram(src(), &announce("node-a", 1), t(10)) {
            Some(PeerEvent::Found(r)) => {
                assert_eq!(r.device_id, "node-a");
                assert_eq!(r.addr, SocketAddr::from(([10, 0, 0, 2], 4000)));
                assert_eq!(r.services, vec!["rpc".to_string()]);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert!(matches!(
            e.on_datagram(src(), &announce("node-a", 2), t(20)),
            Some(PeerEvent::Updated(_))
        ));
        assert_eq!(e.peers().get("node-a").unwrap().last_seen, t(20));
    }

    #[test]
    fn replay_leaves_record_unchanged() {
        let mut e = engine("node-b");
        e.on_datagram(src(), &announce("node-a", 5), t(10));
        let before = e.peers().get("node-a").cloned();
        for seq in [5, 4, 0] {
            assert_eq!(
                e.on_datagram(src(), &announce("node-a", seq), t(99)),
                Some(PeerEvent::Rejected {
                    src: src(),
                    reason: DiscoveryRejection::Replay
                })
            );
        }
        assert_eq!(e.peers().get("node-a").cloned(), before);
    }

    #[test]
    fn oversized_is_rejected_without_mutation() {
        let mut e = engine("node-b");
        let big = vec![0u8; MAX_ANNOUNCE + 1];
        assert_eq!(
            e.on_datagram(src(), &big, t(1)),
            Some(PeerEvent::Rejected {
                src: src(),
                reason: DiscoveryRejection::Oversized
            })
        );
        assert!(e.peers().is_empty());
    }

    #[test]
    fn version_mismatch_is_named() {
        let mut e = engine("node-b");
        let mut bytes = announce("node-a", 1).to_vec();
        bytes[4] = 2;
        assert!(matches!(
            e.on_datagram(src(), &bytes, t(1)),
            Some(PeerEvent::Rejected {
                reason: DiscoveryRejection::VersionMismatch,
                ..
            })
        ));
    }

    #[test]
    fn bad_packet_does_not_evict_good_record() {
        let mut e = engine("node-b");
        e.on_datagram(src(), &announce("node-a", 1), t(1));
        e.on_datagram(src(), b"garbage", t(2));
        assert!(e.peers().get("node-a").is_some());
    }

    #[test]
    fn own_announce_is_ignored() {
        let mut e = engine("node-a");
        let own = (0..2_000)
            .step_by(10)
            .find_map(|ms| e.announce_tick(t(ms)))
            .unwrap();
        assert_eq!(e.on_datagram(src(), &own, t(10_001)), None);

        let mut same_key = AnnounceV1::decode(&own).unwrap();
        same_key.device_id = "alias".into();
        same_key.announce_seq = 99;
        assert_eq!(e.on_datagram(src(), &same_key.encode().unwrap(), t(10_002)), None);
        assert!(e.peers().is_empty());
    }

    #[test]
    fn announces_follow_fixed_schedule() {
        let mut e = engine("node-a");
        let offset = e.offset().as_millis() as u64;
        assert!(offset < 8 * 50);

        let mut fired = Vec::new();
        for ms in (0..3_500).step_by(10) {
            if let Some(bytes) = e.announce_tick(t(ms)) {
                fired.push((ms, AnnounceV1::decode(&bytes).unwrap().announce_seq));
            }
        }
        let expected_times: Vec<u64> = (0..4)
            .map(|k| k * 1_000 + offset)
            .filter(|ms| *ms < 3_500)
            .map(|ms| ms.div_ceil(10) * 10)
            .collect();
        let times: Vec<u64> = fired.iter().map(|(ms, _)| *ms).collect();
        assert_eq!(times, expected_times);
        let seqs: Vec<u64> = fired.iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn schedule_offset_is_deterministic_per_device() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(schedule_offset("node-a", &cfg), schedule_offset("node-a", &cfg));
    }

    #[test]
    fn expire_emits_expired_events() {
        let mut e = engine("node-b");
        e.on_datagram(src(), &announce("node-a", 1), t(0));
        assert!(e.expire(t(15_000)).is_empty());
        let events = e.expire(t(15_001));
        assert!(matches!(&events[..], [PeerEvent::Expired(r)] if r.device_id == "node-a"));
    }

    #[test]
    fn set_services_rejects_invalid_list() {
        let mut e = engine("node-a");
        assert!(e.set_services(vec!["ok".into(), "".into()]).is_err());
        assert_eq!(e.local().services, vec!["samgrd".to_string()]);
    }

    #[test]
    fn random_packets_never_insert_records() {
        let mut rng = StdRng::seed_from_u64(0xD150);
        let mut e = engine("node-b");
        for i in 0..1000u64 {
            let len = rng.gen_range(0..4096);
            let mut pkt = vec![0u8; len];
            rng.fill(&mut pkt[..]);
            let ev = e.on_datagram(src(), &pkt, t(i));
            assert!(matches!(ev, Some(PeerEvent::Rejected { .. })), "packet {i} produced {ev:?}");
        }
        assert!(e.peers().is_empty());
    }

    proptest! {
        #[test]
        fn stale_seq_after_newer_is_always_replay(s1 in 0u64..1_000, gap in 1u64..1_000, back in 0u64..2_000) {
            let s2 = s1 + gap;
            let mut e = engine("node-b");
            e.on_datagram(src(), &announce("node-a", s1), t(1));
            e.on_datagram(src(), &announce("node-a", s2), t(2));
            let stale = s2.saturating_sub(back);
            let before = e.peers().get("node-a").cloned();
            let ev = e.on_datagram(src(), &announce("node-a", stale), t(3));
            prop_assert_eq!(ev, Some(PeerEvent::Rejected { src: src(), reason: DiscoveryRejection::Replay }));
            prop_assert_eq!(e.peers().get("node-a").cloned(), before);
        }
    }
}
