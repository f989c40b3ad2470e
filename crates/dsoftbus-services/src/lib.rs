//! dsoftbus-services: discovery, secure sessions, stream multiplexing and
//! the bus services that ride on them. Everything is poll-driven and takes
//! the current time as an argument; nothing here spawns threads or sleeps.

pub mod busdir;
pub mod discovery;
pub mod memnet;
pub mod mux;
pub mod node;
pub mod peer;
pub mod rpcmux;
pub mod session;
pub mod transport;

pub use busdir::{Directory, DirectoryEntry, DirectoryError, WatchEvent, WatchId};
pub use discovery::{DiscoveryEngine, PeerEvent};
pub use mux::{Mux, MuxError, StreamId};
pub use node::{CallHandle, Node, NodeError, NodeEvent};
pub use peer::{PeerRecord, PeerTable};
pub use rpcmux::{Denial, RemotePolicy, RpcError, RpcService, ServiceError};
pub use session::{SessionEvent, SessionId, SessionState};
pub use transport::{Connection, NetStack, TransportError};
