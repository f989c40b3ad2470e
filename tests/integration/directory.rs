use crate::*;

use std::collections::BTreeMap;
use std::time::Duration;

use dsoftbus_services::{WatchEvent, WatchId};

fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Step until the watch yields an event.
fn next_event(c: &mut Cluster, name: &str, watch: WatchId, limit_ms: u64) -> Result<WatchEvent> {
    let mut found = None;
    c.run_until(limit_ms, |c| {
        found = c.node(name).directory_mut().poll_watch(watch).unwrap();
        found.is_some()
    })?;
    found.context("no watch event")
}

#[test]
fn test_publish_update_unpublish_across_nodes() {
    let mut c = Cluster::new(30, &["camera", "display"]);
    let camera_fp = c.node("camera").fingerprint();
    let watch = c.node("display").directory_mut().watch("video");
    c.link_all(5_000).unwrap();

    let result = (|| -> Result<()> {
        let now = c.now();
        c.node("camera")
            .publish("video", 1, meta(&[("codec", "h264")]), Duration::from_secs(60), now)?;
        match next_event(&mut c, "display", watch, 1_000)? {
            WatchEvent::Added(e) => {
                assert_eq!(e.peer, camera_fp);
                assert_eq!(e.version, 1);
                assert_eq!(e.metadata["codec"], "h264");
            }
            other => bail!("expected Added, got {other:?}"),
        }

        let now = c.now();
        c.node("camera")
            .publish("video", 1, meta(&[("codec", "av1")]), Duration::from_secs(60), now)?;
        match next_event(&mut c, "display", watch, 1_000)? {
            WatchEvent::Updated(e) => assert_eq!(e.metadata["codec"], "av1"),
            other => bail!("expected Updated, got {other:?}"),
        }

        c.node("camera").unpublish("video", 1)?;
        match next_event(&mut c, "display", watch, 1_000)? {
            WatchEvent::Removed(e) => assert_eq!(e.peer, camera_fp),
            other => bail!("expected Removed, got {other:?}"),
        }
        assert!(c.node("display").directory().list("video").is_empty());
        Ok(())
    })();
    result.unwrap();
}

/// Publications made before the link exist show up in the initial sync.
#[test]
fn test_initial_sync_and_watch_snapshot() {
    let mut c = Cluster::new(31, &["speaker", "phone"]);
    let now = c.now();
    c.node("speaker")
        .publish("audio.sink", 3, meta(&[("channels", "2")]), Duration::from_secs(60), now)
        .unwrap();
    c.link_all(5_000).unwrap();

    let entries = c.node("phone").directory().list("audio.sink");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version, 3);

    // A watch opened later starts from a snapshot of what is known.
    let watch = c.node("phone").directory_mut().watch("audio.sink");
    assert!(matches!(
        c.node("phone").directory_mut().poll_watch(watch).unwrap(),
        Some(WatchEvent::Added(_))
    ));
}

/// Entries that are not refreshed disappear everywhere when their ttl runs out.
#[test]
fn test_ttl_expiry_propagates() {
    let mut c = Cluster::new(32, &["sensor", "hub"]);
    c.link_all(5_000).unwrap();
    let watch = c.node("hub").directory_mut().watch("temperature");

    let now = c.now();
    c.node("sensor")
        .publish("temperature", 1, BTreeMap::new(), Duration::from_secs(2), now)
        .unwrap();
    assert!(matches!(next_event(&mut c, "hub", watch, 500).unwrap(), WatchEvent::Added(_)));

    c.run_for(1_500);
    assert_eq!(c.node("hub").directory().list("temperature").len(), 1);

    assert!(matches!(next_event(&mut c, "hub", watch, 1_500).unwrap(), WatchEvent::Removed(_)));
    assert!(c.node("sensor").directory().list("temperature").is_empty());
}

/// When a session ends the peer's entries are withdrawn and watchers told.
#[test]
fn test_peer_death_withdraws_entries() {
    let mut c = Cluster::new(33, &["printer", "laptop"]);
    let now = c.now();
    c.node("printer")
        .publish("ipp", 1, BTreeMap::new(), Duration::from_secs(300), now)
        .unwrap();
    c.link_all(5_000).unwrap();

    let watch = c.node("laptop").directory_mut().watch("ipp");
    assert!(matches!(
        c.node("laptop").directory_mut().poll_watch(watch).unwrap(),
        Some(WatchEvent::Added(_))
    ));

    c.kill("printer");
    assert!(matches!(next_event(&mut c, "laptop", watch, 1_000).unwrap(), WatchEvent::Removed(_)));
    assert!(c.node("laptop").directory().list("ipp").is_empty());
}

/// Three nodes publishing the same service are all listed, one entry each.
#[test]
fn test_entries_keyed_by_authenticated_peer() {
    let mut c = Cluster::new(34, &["a", "b", "c"]);
    for name in ["a", "b", "c"] {
        let now = c.now();
        c.node(name)
            .publish("chat", 1, meta(&[("owner", name)]), Duration::from_secs(60), now)
            .unwrap();
    }
    c.link_all(10_000).unwrap();

    for name in ["a", "b", "c"] {
        let entries = c.node(name).directory().list("chat");
        assert_eq!(entries.len(), 3, "{name}: {entries:?}");
        for e in entries {
            let owner = &e.metadata["owner"];
            let fp = c.nodes[c.index(owner)].fingerprint();
            assert_eq!(e.peer, fp);
        }
    }
}
