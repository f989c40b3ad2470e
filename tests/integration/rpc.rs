use crate::*;

use std::collections::BTreeMap;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use dsoftbus_services::{CallHandle, RpcError, RpcService, ServiceError};

/// Adds two big-endian u32s; also reports who answered.
struct Calc {
    owner: String,
}

impl RpcService for Calc {
    fn name(&self) -> &str {
        "calc"
    }

    fn handle(&mut self, method: &str, payload: &[u8]) -> Result<Bytes, ServiceError> {
        match method {
            "add" => {
                let [a0, a1, a2, a3, b0, b1, b2, b3] = <[u8; 8]>::try_from(payload)
                    .map_err(|_| ServiceError::Failed("want 8 bytes".into()))?;
                let sum = u32::from_be_bytes([a0, a1, a2, a3]).wrapping_add(u32::from_be_bytes([b0, b1, b2, b3]));
                Ok(Bytes::copy_from_slice(&sum.to_be_bytes()))
            }
            "whoami" => Ok(Bytes::from(self.owner.clone())),
            "fail" => Err(ServiceError::Failed("deliberate".into())),
            other => Err(ServiceError::UnknownMethod(other.into())),
        }
    }
}

fn add_args(a: u32, b: u32) -> Vec<u8> {
    let mut v = a.to_be_bytes().to_vec();
    v.extend_from_slice(&b.to_be_bytes());
    v
}

fn serve_calc(c: &mut Cluster, name: &str, version: u32) {
    let now = c.now();
    let node = c.node(name);
    node.register_service(Box::new(Calc { owner: name.to_string() }));
    node.allow_remote("calc");
    node.publish("calc", version, BTreeMap::new(), Duration::from_secs(300), now)
        .unwrap();
}

/// Link everything and wait until `caller` can see every provider of calc.
fn ready(c: &mut Cluster, caller: &str, providers: usize) {
    c.link_all(10_000).unwrap();
    c.run_until(2_000, |c| c.node(caller).directory().list("calc").len() == providers)
        .unwrap();
}

fn wait_call(c: &mut Cluster, name: &str, handle: CallHandle, limit_ms: u64) -> Result<Result<Bytes, RpcError>> {
    let mut out = None;
    c.run_until(limit_ms, |c| match c.node(name).poll_call(handle) {
        Poll::Ready(r) => {
            out = Some(r);
            true
        }
        Poll::Pending => false,
    })?;
    out.context("call never finished")
}

#[test]
fn test_call_resolves_through_directory() {
    let mut c = Cluster::new(40, &["client", "server"]);
    serve_calc(&mut c, "server", 1);
    ready(&mut c, "client", 1);

    let now = c.now();
    let h = c.node("client").call("calc", "add", &add_args(2, 40), now).unwrap();
    let reply = wait_call(&mut c, "client", h, 1_000).unwrap().unwrap();
    assert_eq!(&reply[..], &42u32.to_be_bytes());

    // Collected exactly once.
    assert_eq!(c.node("client").poll_call(h), Poll::Ready(Err(RpcError::Closed)));
}

#[test]
fn test_many_concurrent_calls() {
    let mut c = Cluster::new(41, &["client", "server"]);
    serve_calc(&mut c, "server", 1);
    ready(&mut c, "client", 1);

    let now = c.now();
    let handles: Vec<(u32, CallHandle)> = (0..64u32)
        .map(|i| (i, c.node("client").call("calc", "add", &add_args(i, 1_000), now).unwrap()))
        .collect();

    let mut results = BTreeMap::new();
    c.run_until(2_000, |c| {
        for (i, h) in &handles {
            if results.contains_key(i) {
                continue;
            }
            if let Poll::Ready(r) = c.node("client").poll_call(*h) {
                results.insert(*i, r);
            }
        }
        results.len() == handles.len()
    })
    .unwrap();

    for (i, r) in results {
        let bytes = r.unwrap();
        assert_eq!(u32::from_be_bytes(bytes[..].try_into().unwrap()), i + 1_000);
    }
}

#[test]
fn test_highest_version_wins() {
    let mut c = Cluster::new(42, &["client", "old", "new"]);
    serve_calc(&mut c, "old", 1);
    serve_calc(&mut c, "new", 2);
    ready(&mut c, "client", 2);

    let now = c.now();
    let h = c.node("client").call("calc", "whoami", b"", now).unwrap();
    assert_eq!(&wait_call(&mut c, "client", h, 1_000).unwrap().unwrap()[..], b"new");
}

#[test]
fn test_fault_codes() {
    let mut c = Cluster::new(43, &["client", "server"]);
    serve_calc(&mut c, "server", 1);
    c.node("server").allow_remote("weather");
    ready(&mut c, "client", 1);

    let now = c.now();
    let deadline = now.saturating_add(Duration::from_secs(1));
    let failed = c.node("client").call("calc", "fail", b"", now).unwrap();
    let no_method = c.node("client").call("calc", "divide", b"", now).unwrap();
    let no_service = c
        .node("client")
        .call_peer("server", "weather", "today", b"", deadline)
        .unwrap();

    let failed = wait_call(&mut c, "client", failed, 1_000).unwrap().unwrap_err();
    assert_eq!(failed.code(), "EPEER");
    assert_eq!(failed, RpcError::Peer("deliberate".into()));
    assert_eq!(wait_call(&mut c, "client", no_method, 1_000).unwrap().unwrap_err().code(), "ENOTFOUND");
    assert_eq!(wait_call(&mut c, "client", no_service, 1_000).unwrap().unwrap_err().code(), "ENOTFOUND");

    // Nobody publishes "weather", so it cannot be resolved by name.
    assert_eq!(c.node("client").call("weather", "today", b"", now).unwrap_err(), RpcError::NotFound);
}

/// A registered service stays private until the node exposes it.
#[test]
fn test_unexposed_service_is_denied() {
    let mut c = Cluster::new(46, &["client", "server"]);
    let now = c.now();
    let server = c.node("server");
    server.register_service(Box::new(Calc { owner: "server".into() }));
    server
        .publish("calc", 1, BTreeMap::new(), Duration::from_secs(300), now)
        .unwrap();
    ready(&mut c, "client", 1);

    let now = c.now();
    let h = c.node("client").call("calc", "add", &add_args(1, 2), now).unwrap();
    let err = wait_call(&mut c, "client", h, 1_000).unwrap().unwrap_err();
    assert_eq!(err.code(), "EDENIED");
    assert!(c.linked("client", "server"));

    c.node("server").allow_remote("calc");
    let now = c.now();
    let h = c.node("client").call("calc", "add", &add_args(1, 2), now).unwrap();
    assert_eq!(&wait_call(&mut c, "client", h, 1_000).unwrap().unwrap()[..], &3u32.to_be_bytes());
}

/// A hung peer times the call out; the session survives and late replies
/// are dropped.
#[test]
fn test_deadline_on_hung_peer() {
    let mut c = Cluster::new(44, &["client", "server"]);
    serve_calc(&mut c, "server", 1);
    ready(&mut c, "client", 1);

    c.freeze("server");
    let now = c.now();
    let deadline = now.saturating_add(Duration::from_millis(300));
    let h = c
        .node("client")
        .call_with_deadline("calc", "add", &add_args(1, 1), deadline)
        .unwrap();

    c.run_for(290);
    assert_eq!(c.node("client").poll_call(h), Poll::Pending);
    assert_eq!(wait_call(&mut c, "client", h, 100).unwrap(), Err(RpcError::Timeout));

    c.thaw("server");
    c.run_for(100);
    assert!(c.linked("client", "server"));

    let now = c.now();
    let h = c.node("client").call("calc", "add", &add_args(5, 5), now).unwrap();
    assert_eq!(&wait_call(&mut c, "client", h, 1_000).unwrap().unwrap()[..], &10u32.to_be_bytes());
}

/// Calls in flight when the peer dies resolve with ECLOSED, not a timeout.
#[test]
fn test_peer_death_closes_calls() {
    let mut c = Cluster::new(45, &["client", "server"]);
    serve_calc(&mut c, "server", 1);
    ready(&mut c, "client", 1);

    c.freeze("server");
    let now = c.now();
    let handles: Vec<CallHandle> = (0..4)
        .map(|i| c.node("client").call("calc", "add", &add_args(i, i), now).unwrap())
        .collect();
    c.run_for(50);

    c.kill("server");
    for h in handles {
        assert_eq!(wait_call(&mut c, "client", h, 500).unwrap(), Err(RpcError::Closed));
    }
    let now = c.now();
    assert_eq!(
        c.node("client").call("calc", "add", &add_args(1, 2), now).unwrap_err(),
        RpcError::NotFound
    );
}
