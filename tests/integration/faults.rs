use crate::*;

use dsoftbus_services::memnet::DatagramFaults;

/// Lossy, duplicating, jittery announces still converge to a full mesh.
#[test]
fn test_mesh_forms_despite_loss_and_duplication() {
    let mut c = Cluster::new(20, &["a", "b", "c", "d"]);
    c.net.set_faults(DatagramFaults {
        loss: 0.3,
        duplicate: 0.3,
        jitter_ms: 80,
    });

    c.link_all(20_000).unwrap();

    let stats = c.net.stats();
    assert!(stats.datagrams_dropped > 0, "{stats:?}");
    assert!(stats.datagrams_duplicated > 0, "{stats:?}");

    // Duplicates arrive as replays and are refused without disturbing links.
    for i in 0..c.nodes.len() {
        assert_eq!(c.nodes[i].sessions().len(), 3, "{}", c.names[i]);
    }
}

/// Total announce loss keeps nodes apart; healing the network joins them.
#[test]
fn test_partition_heals() {
    let mut c = Cluster::new(21, &["a", "b"]);
    c.net.set_faults(DatagramFaults {
        loss: 1.0,
        ..DatagramFaults::default()
    });
    c.run_for(5_000);
    assert!(c.nodes.iter().all(|n| n.peers().is_empty()));

    c.net.set_faults(DatagramFaults::default());
    c.link_all(5_000).unwrap();
}

/// A seeded flood of random datagrams never disturbs an established link.
#[test]
fn test_random_datagram_flood() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut c = Cluster::new(22, &["a", "b"]);
    c.link_all(5_000).unwrap();
    let mut flood = Impostor::attach(&c.net, 99);
    let mut rng = StdRng::seed_from_u64(0xD50F7);

    for i in 0u64..1_000 {
        let len = rng.gen_range(0..4_096);
        let mut bytes = vec![0u8; len];
        rng.fill(&mut bytes[..]);
        if i % 3 == 0 && len >= 4 {
            bytes[..4].copy_from_slice(b"NXSB");
        }
        flood.send_raw(ip((i % 2) as usize), &bytes).unwrap();
        if i % 50 == 0 {
            c.step();
        }
    }
    c.run_for(1_000);

    assert!(c.linked("a", "b"));
    assert_eq!(c.nodes[0].peers().len(), 1);
    assert_eq!(c.nodes[1].peers().len(), 1);
}
