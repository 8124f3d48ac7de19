//! Data-node side of twinfs.
//!
//! Every namespace is served by a pair of metadata servers (a primary and a
//! hot standby) and the data node reports to both without knowing which one
//! is primary; the coordination service publishes that out of band. The
//! heart of this crate is the namespace service manager:
//!
//! - [`endpoint::Endpoint`] — one metadata server's address pair and proxies
//! - [`session::Session`] — one long-lived data-node <-> metadata-server session
//! - [`service_pair::ServicePair`] — the two sessions of one namespace plus
//!   their supervisor
//! - [`namespace_manager::NamespaceManager`] — all pairs, with dynamic
//!   add/remove/refresh
//! - [`node::DataNode`] — bootstrap glue and the shutdown protocol

use std::path::PathBuf;
use std::time::Duration;

use twinfs_coordinator::CoordError;
use twinfs_net::NetError;
use twinfs_types::NamespaceId;

pub mod endpoint;
pub mod namespace_manager;
pub mod node;
pub mod offer;
pub mod service_pair;
pub mod session;
pub mod settings;
pub mod storage;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testutil;

pub use node::{DataNode, NodeContext, ShutdownHandle};

/// On-disk layout version this build reads and writes. Both metadata servers
/// of every namespace must report the same value at handshake.
pub const LOCAL_LAYOUT_VERSION: i32 = -41;

/// Build version exchanged at handshake. A mismatch is only a warning.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Block transfer protocol version sent along with the register RPC.
pub const DATA_TRANSFER_VERSION: u32 = 19;

/// Floor between DNS re-resolution attempts per endpoint.
pub const RESOLVE_MIN_INTERVAL: Duration = Duration::from_secs(120);

/// Supervisor sleep between register/serve iterations. Cancellable: a stop
/// wakes the supervisor immediately.
pub const OFFER_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Sleep between handshake retries when the peer times out.
pub const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Bound within which every worker must exit once shutdown is requested.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by the data-node core.
#[derive(Debug, thiserror::Error)]
pub enum DataNodeError {
    /// The peer's on-disk layout version differs from ours, or the two peers
    /// of one namespace disagree with each other.
    #[error("layout version mismatch: local {local}, remote {remote}")]
    LayoutMismatch { local: i32, remote: i32 },

    /// A register RPC returned a storage id that contradicts the one we
    /// already persisted.
    #[error("inconsistent storage ids: metadata server returned {returned}, expecting {expected}")]
    InconsistentStorage { returned: String, expected: String },

    /// A block event was routed to a namespace no pair serves.
    #[error("no service pair for namespace {0}")]
    UnknownNamespace(NamespaceId),

    /// A data directory failed validation.
    #[error("invalid data directory {path}: {reason}")]
    Disk { path: PathBuf, reason: String },

    /// Bad or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A condition that requires the whole data node to go down.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Coordinator(#[from] CoordError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

pub type Result<T> = std::result::Result<T, DataNodeError>;
