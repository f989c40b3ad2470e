use crate::*;

use dsoftbus_core::config::{MuxConfig, SessionConfig};
use dsoftbus_core::wire::Priority;
use dsoftbus_services::peer::PeerTable;
use dsoftbus_services::session::{SessionLayer, SessionRejection};

fn incoming_stream(cluster: &Cluster, name: &str, label: &str) -> Option<(SessionId, StreamId)> {
    cluster.events[cluster.index(name)].iter().find_map(|e| match e {
        NodeEvent::IncomingStream { session, stream, .. } if stream.label == label => Some((*session, stream.id)),
        _ => None,
    })
}

/// Discovery, XK handshake, confirmation, then PING/PONG on a Control stream.
#[test]
fn test_ping_pong_over_control_stream() {
    let mut c = Cluster::new(1, &["phone", "watch"]);

    let result = (|| -> Result<()> {
        c.link_all(5_000)?;

        let now = c.now();
        let (session, stream) = c.node("phone").open_stream("watch", Priority::Control, "ping", now)?;
        c.write_all("phone", session, stream, b"PING")?;

        c.run_until(1_000, |c| incoming_stream(c, "watch", "ping").is_some())?;
        let (w_session, w_stream) = incoming_stream(&c, "watch", "ping").context("no stream")?;
        assert_eq!(c.read_exact("watch", w_session, w_stream, 4)?, b"PING");

        c.write_all("watch", w_session, w_stream, b"PONG")?;
        assert_eq!(c.read_exact("phone", session, stream, 4)?, b"PONG");
        Ok(())
    })();
    result.unwrap();

    // Every session that authenticated walked the full state machine.
    for name in ["phone", "watch"] {
        let states: Vec<SessionState> = c
            .session_events(name)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Transition { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert!(states.contains(&SessionState::HandshakeCompleted), "{name}: {states:?}");
        assert!(states.contains(&SessionState::IdentityVerifying), "{name}: {states:?}");
        assert_eq!(states.last(), Some(&SessionState::Authenticated), "{name}: {states:?}");
    }
}

/// Large transfers respect the window and arrive intact.
#[test]
fn test_bulk_stream_crosses_many_windows() {
    let mut c = Cluster::new(2, &["nas", "laptop"]);
    c.link_all(5_000).unwrap();

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let now = c.now();
    let (session, stream) = c.node("nas").open_stream("laptop", Priority::Bulk, "backup", now).unwrap();

    let mut sent = 0;
    let mut received = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut peer: Option<(SessionId, StreamId)> = None;
    for _ in 0..5_000 {
        if sent < payload.len() {
            match c.node("nas").mux_mut(session).unwrap().write(stream, &payload[sent..]) {
                Ok(n) => sent += n,
                Err(e) => assert_eq!(e.code(), "EWOULDBLOCK"),
            }
        }
        if peer.is_none() {
            peer = incoming_stream(&c, "laptop", "backup");
        }
        if let Some((ps, pid)) = peer {
            let mux = c.node("laptop").mux_mut(ps).unwrap();
            let n = mux.read(pid, &mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
            assert!(mux.readable(pid) as u64 <= MuxConfig::default().initial_window);
        }
        if received.len() == payload.len() {
            break;
        }
        c.step();
    }
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "payload corrupted in transit");
}

/// An announce binds a device id to a key the answering host does not own.
#[test]
fn test_identity_mismatch_rejects_session() {
    let mut c = Cluster::new(3, &["tv"]);
    let tv_static = *c.node("tv").sessions().local_static();

    // Mallory owns a key that sorts above the TV's, so the TV dials her.
    let mallory_keys = keypair_above(&tv_static, "mallory");
    let mallory_pub = mallory_keys.public;
    let mut mallory = Impostor::attach(&c.net, 66);
    let mut layer: SessionLayer<_> =
        SessionLayer::new(mallory_keys, "mallory", SessionConfig::default(), MuxConfig::default());
    let mallory_peers = PeerTable::new(8);

    // Claim to be "speaker" while presenting Mallory's own key.
    mallory.announce(ip(0), "speaker", mallory_pub, 1_000).unwrap();

    let result = c.run_until(3_000, |c| {
        let now = c.now();
        layer.accept_pending(&mut mallory.endpoint, now);
        layer.poll(&mallory_peers, now);
        layer.flush(now);
        while layer.poll_event().is_some() {}
        !c.ended_states("tv").is_empty()
    });
    result.unwrap();

    assert_eq!(
        c.ended_states("tv"),
        vec![SessionState::Rejected(SessionRejection::IdentityMismatch)]
    );
    assert!(c.node("tv").session_with("speaker").is_none());
    assert!(c.node("tv").session_with("mallory").is_none());
}

/// A host that accepts the connection but never answers.
#[test]
fn test_handshake_timeout() {
    let mut c = Cluster::new(4, &["tv"]);
    let mut silent = Impostor::attach(&c.net, 77);
    silent.announce(ip(0), "silent", [0xff; 32], 1).unwrap();

    c.run_for(4_900);
    assert!(c.ended_states("tv").is_empty(), "rejected before the handshake timeout");

    c.run_until(1_000, |c| !c.ended_states("tv").is_empty()).unwrap();
    assert_eq!(c.ended_states("tv")[0], SessionState::Rejected(SessionRejection::Timeout));
}

/// Local close reaches the peer as a remote close; the directory forgets it.
#[test]
fn test_disconnect_is_seen_by_peer() {
    let mut c = Cluster::new(5, &["car", "phone"]);
    c.link_all(5_000).unwrap();

    let now = c.now();
    c.node("car").disconnect("phone", now).unwrap();
    c.run_until(500, |c| !c.ended_states("phone").is_empty()).unwrap();

    use dsoftbus_services::session::CloseReason;
    assert_eq!(c.ended_states("car"), vec![SessionState::Closed(CloseReason::Local)]);
    assert_eq!(c.ended_states("phone"), vec![SessionState::Closed(CloseReason::Remote)]);
}

/// Peer death is noticed from the broken transport, and the pair relinks
/// when the host comes back.
#[test]
fn test_peer_death_and_return() {
    let mut c = Cluster::new(6, &["hub", "bulb"]);
    c.link_all(5_000).unwrap();

    c.kill("bulb");
    c.run_until(500, |c| c.node("hub").session_with("bulb").is_none()).unwrap();
    assert!(c
        .ended_states("hub")
        .iter()
        .any(|s| matches!(s, SessionState::Closed(_) | SessionState::Rejected(_))));

    // Rebuild the bulb on the same address, as after a reboot.
    let i = c.index("bulb");
    let mut config = SoftbusConfig::default();
    config.identity.device_id = "bulb".into();
    let now_seq = c.now().as_millis() + 1;
    c.nodes[i] = Node::new(c.net.endpoint(ip(i)), Keypair::from_seed(b"bulb"), config, now_seq).unwrap();
    c.thaw("bulb");

    c.link_all(20_000).unwrap();
}
