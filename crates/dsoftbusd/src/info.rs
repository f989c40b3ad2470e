//! `dsoftbus.node`: the one service every daemon publishes, so peers can
//! probe liveness and identity over rpcmux.

use bytes::Bytes;
use serde::Serialize;

use dsoftbus_services::rpcmux::{RpcService, ServiceError};

pub const SERVICE_NAME: &str = "dsoftbus.node";
pub const SERVICE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
struct Description<'a> {
    device_id: &'a str,
    fingerprint: &'a str,
    version: &'static str,
}

pub struct NodeInfoService {
    device_id: String,
    fingerprint: String,
}

impl NodeInfoService {
    pub fn new(device_id: String, fingerprint: String) -> Self {
        Self { device_id, fingerprint }
    }
}

impl RpcService for NodeInfoService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn handle(&mut self, method: &str, payload: &[u8]) -> Result<Bytes, ServiceError> {
        match method {
            "ping" => Ok(Bytes::copy_from_slice(payload)),
            "describe" => {
                let body = serde_json::to_vec(&Description {
                    device_id: &self.device_id,
                    fingerprint: &self.fingerprint,
                    version: env!("CARGO_PKG_VERSION"),
                })
                .map_err(|e| ServiceError::Failed(e.to_string()))?;
                Ok(Bytes::from(body))
            }
            other => Err(ServiceError::UnknownMethod(other.to_string())),
        }
    }
}
