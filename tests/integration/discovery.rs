use crate::*;

use std::collections::BTreeMap;
use std::time::Duration;

use dsoftbus_services::discovery::{DiscoveryRejection, PeerEvent};

fn peer_events(c: &Cluster, name: &str) -> Vec<PeerEvent> {
    c.events[c.index(name)]
        .iter()
        .filter_map(|e| match e {
            NodeEvent::Peer(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_three_nodes_find_each_other() {
    let mut c = Cluster::new(10, &["a", "b", "c"]);
    c.run_until(2_500, |c| c.nodes.iter().all(|n| n.peers().len() == 2))
        .unwrap();

    for (i, node) in c.nodes.iter().enumerate() {
        let mut ids: Vec<&str> = node.peers().iter().map(|r| r.device_id.as_str()).collect();
        ids.sort();
        let mut expected: Vec<&str> = c.names.iter().map(String::as_str).filter(|n| *n != c.names[i]).collect();
        expected.sort();
        assert_eq!(ids, expected);
        // Own announces are heard on the broadcast but never recorded.
        assert!(node.peers().get(node.device_id()).is_none());
    }

    let b = c.nodes[0].peers().get("b").unwrap();
    assert_eq!(b.addr, SocketAddr::from((ip(1), SESSION_PORT)));
}

#[test]
fn test_dead_peer_expires_after_ttl() {
    let mut c = Cluster::with_config(11, &["a", "b", "c"], |cfg| {
        cfg.discovery.peer_ttl_ms = 3_000;
    });
    c.run_until(2_500, |c| c.nodes.iter().all(|n| n.peers().len() == 2))
        .unwrap();

    c.kill("c");
    c.run_for(2_000);
    assert_eq!(c.node("a").peers().len(), 2, "expired before the ttl");

    c.run_until(2_000, |c| c.nodes[0].peers().len() == 1 && c.nodes[1].peers().len() == 1)
        .unwrap();
    assert!(peer_events(&c, "a")
        .iter()
        .any(|e| matches!(e, PeerEvent::Expired(r) if r.device_id == "c")));
}

#[test]
fn test_published_services_ride_in_announces() {
    let mut c = Cluster::new(12, &["printer", "laptop"]);
    let now = c.now();
    c.node("printer")
        .publish("ipp", 2, BTreeMap::new(), Duration::from_secs(60), now)
        .unwrap();

    c.run_until(2_500, |c| {
        c.nodes[1]
            .peers()
            .get("printer")
            .is_some_and(|r| r.services == vec!["ipp".to_string()])
    })
    .unwrap();
}

#[test]
fn test_garbage_and_replays_are_rejected() {
    let mut c = Cluster::new(13, &["a"]);
    let mut noise = Impostor::attach(&c.net, 50);

    noise.send_raw(ip(0), b"").unwrap();
    noise.send_raw(ip(0), b"NXSB\x01").unwrap();
    noise.send_raw(ip(0), &[0xAB; 2_000]).unwrap();
    noise.announce(ip(0), "ghost", [7; 32], 10).unwrap();
    noise.announce(ip(0), "ghost", [7; 32], 10).unwrap();
    noise.announce(ip(0), "ghost", [7; 32], 9).unwrap();
    c.step();

    let events = peer_events(&c, "a");
    let rejected: Vec<DiscoveryRejection> = events
        .iter()
        .filter_map(|e| match e {
            PeerEvent::Rejected { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect();
    assert_eq!(rejected.len(), 5, "{events:?}");
    assert_eq!(rejected.iter().filter(|r| **r == DiscoveryRejection::Replay).count(), 2);
    assert!(rejected.contains(&DiscoveryRejection::Oversized));

    let ghost = c.node("a").peers().get("ghost").unwrap();
    assert_eq!(ghost.announce_seq, 10);
    assert_eq!(ghost.addr.ip(), noise.ip());
}
