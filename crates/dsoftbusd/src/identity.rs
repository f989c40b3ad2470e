//! Device identity: the persistent static keypair and the device id.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use dsoftbus_core::crypto::Keypair;
use dsoftbus_core::wire::MAX_DEVICE_ID_BYTES;

/// Load the static keypair from `path`, generating and saving one on first run.
/// The file holds the private key as 64 hex characters.
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read keypair {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("keypair file is not hex")?;
        let private: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("keypair file must hold 32 bytes"))?;
        return Ok(Keypair::from_private(private));
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create keypair {}", path.display()))?;
    file.write_all(hex::encode(keypair.private_bytes().as_slice()).as_bytes())
        .context("failed to write keypair")?;
    tracing::info!(path = %path.display(), "generated new static keypair");
    Ok(keypair)
}

/// Hostname-derived device id, or one derived from the key if there is none.
pub fn default_device_id(keypair: &Keypair) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty() && !h.chars().any(char::is_control));
    match host {
        Some(h) => truncate(h),
        None => format!("dsoftbus-{}", &keypair.fingerprint().to_string()[..8]),
    }
}

fn truncate(mut s: String) -> String {
    while s.len() > MAX_DEVICE_ID_BYTES {
        s.pop();
    }
    s
}
