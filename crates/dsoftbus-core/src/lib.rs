//! dsoftbus-core: wire formats, Noise-XK primitives, time and configuration.
//! All other DSoftBus crates depend on this one.

pub mod config;
pub mod crypto;
pub mod framing;
pub mod time;
pub mod wire;

pub use config::SoftbusConfig;
pub use crypto::{Fingerprint, Keypair};
pub use time::MonotonicTime;
pub use wire::Priority;
