//! dsoftbusd: DSoftBus node daemon.
//!
//! Binds the OS sockets, builds a `Node` and drives it from one
//! single-threaded loop until Ctrl-C.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;

use dsoftbus_core::config::SoftbusConfig;
use dsoftbus_core::time::MonotonicTime;
use dsoftbus_services::discovery::PeerEvent;
use dsoftbus_services::session::SessionEvent;
use dsoftbus_services::{Node, NodeEvent};

mod identity;
mod info;
mod net;

/// Event loop period. Every timer in the stack is a multiple of this.
const TICK: Duration = Duration::from_millis(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
/// Lifetime of this node's own directory entries; refreshed at half-life.
const PUBLISH_TTL: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SoftbusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = SoftbusConfig::load().context("failed to load config")?;

    let keypair = identity::load_or_generate(&config.identity.keypair_path)?;
    if config.identity.device_id.is_empty() {
        config.identity.device_id = identity::default_device_id(&keypair);
    }
    let device_id = config.identity.device_id.clone();
    let fingerprint = keypair.fingerprint();
    tracing::info!(%device_id, %fingerprint, "dsoftbusd starting");

    let bind_ip: IpAddr = config
        .network
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.network.bind_addr))?;
    let net = net::OsNet::bind(bind_ip, config.network.discovery_port, config.network.session_port)?;

    // Announce sequence numbers must keep rising across restarts.
    let initial_seq = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1);

    let mut node = Node::new(net, keypair, config, initial_seq).context("failed to start node")?;
    node.register_service(Box::new(info::NodeInfoService::new(device_id, fingerprint.to_string())));
    node.allow_remote(info::SERVICE_NAME);

    let start = Instant::now();
    let clock = || MonotonicTime::from_millis(start.elapsed().as_millis() as u64);

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let mut republish = tokio::time::interval(PUBLISH_TTL / 2);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = tick.tick() => {
                node.tick(clock());
                while let Some(event) = node.poll_event() {
                    if let NodeEvent::IncomingStream { session, stream, .. } = &event {
                        if let Some(mux) = node.mux_mut(*session) {
                            let _ = mux.reset(stream.id);
                        }
                    }
                    log_event(&event);
                }
            }
            _ = republish.tick() => {
                if let Err(e) = node.publish(info::SERVICE_NAME, info::SERVICE_VERSION, BTreeMap::new(), PUBLISH_TTL, clock()) {
                    tracing::warn!(error = %e, "failed to publish node service");
                }
            }
            _ = status.tick() => {
                tracing::info!(
                    peers = node.peers().len(),
                    sessions = node.sessions().len(),
                    entries = node.directory().len(),
                    "status snapshot"
                );
            }
        }
    }

    // Tell connected peers we are leaving instead of letting them time out.
    let now = clock();
    let connected: Vec<String> = node
        .peers()
        .iter()
        .map(|r| r.device_id.clone())
        .filter(|id| node.session_with(id).is_some())
        .collect();
    for device_id in connected {
        if let Err(e) = node.disconnect(&device_id, now) {
            tracing::debug!(%device_id, error = %e, "disconnect failed");
        }
    }
    node.tick(now);
    tracing::info!("shutting down");
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::Peer(PeerEvent::Found(r)) => {
            tracing::info!(device_id = %r.device_id, peer = %r.addr, fingerprint = %r.fingerprint(), "peer found")
        }
        NodeEvent::Peer(PeerEvent::Expired(r)) => tracing::info!(device_id = %r.device_id, "peer expired"),
        NodeEvent::Peer(PeerEvent::Rejected { src, reason }) => {
            tracing::debug!(peer = %src, ?reason, "announce rejected")
        }
        NodeEvent::Peer(PeerEvent::Updated(_)) => {}
        NodeEvent::Session(SessionEvent::Ended { id, device_id, state }) => {
            tracing::info!(session = %id, device_id = device_id.as_deref().unwrap_or("-"), ?state, "session ended")
        }
        NodeEvent::Session(_) => {}
        NodeEvent::IncomingStream { device_id, stream, .. } => {
            tracing::info!(%device_id, label = %stream.label, "unrouted stream, resetting");
        }
    }
}
