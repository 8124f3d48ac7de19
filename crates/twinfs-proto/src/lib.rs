//! Wire-level records exchanged between a data node and its metadata servers.
//!
//! Data-protocol methods that consume these types:
//!   version_request()                    -> NamespaceInfo
//!   register(DatanodeRegistration, u32)  -> DatanodeRegistration
//!   error_report(registration, severity, message)
//!
//! The admin protocol is opaque to this crate; its proxies are created by
//! twinfs-net and handed to the offer layer as-is.

use serde::{Deserialize, Serialize};
use twinfs_types::{BlockId, GenerationStamp, NamespaceId};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Result of the version-exchange handshake with a metadata server.
///
/// The layout version describes the on-disk format and must match between
/// the data node and both metadata servers of a namespace. The namespace id
/// is assigned by the metadata server and identifies the namespace for the
/// rest of the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub namespace_id: NamespaceId,
    pub layout_version: i32,
    pub build_version: String,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Storage identity of the data node as seen by one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    pub layout_version: i32,
    pub namespace_id: NamespaceId,
    pub creation_time: i64,
}

/// The registration record exchanged in the register RPC.
///
/// Sent with the node's current storage id (empty when the node has never
/// been formatted); the metadata server returns the record with the storage
/// id filled in. Once a storage id has been written to disk it is stable and
/// every later register must return the same id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatanodeRegistration {
    /// `host:port` the data node serves block transfers on.
    pub name: String,
    pub storage_id: String,
    pub storage_info: StorageInfo,
    pub info_port: u16,
    pub ipc_port: u16,
}

impl DatanodeRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_storage_id(&self) -> bool {
        !self.storage_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// An opaque fixed-identity block as tracked by the metadata servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub num_bytes: u64,
    pub generation: GenerationStamp,
}

impl Block {
    pub fn new(id: u64, num_bytes: u64, generation: u64) -> Self {
        Self {
            id: BlockId(id),
            num_bytes,
            generation: GenerationStamp(generation),
        }
    }
}

/// A block that completed recovery through the primary metadata server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedBlock {
    pub block: Block,
    pub locations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error report
// ---------------------------------------------------------------------------

/// Severity tag carried by the error_report RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Informational; the peer logs it and carries on.
    Notify,
    /// The data node hit a recoverable error.
    Error,
    /// The data node is about to go down.
    Fatal,
}

// ---------------------------------------------------------------------------
// Remote errors
// ---------------------------------------------------------------------------

/// Classes of errors a metadata server can reply with.
///
/// The first three are terminal for the whole data node: the exclude and
/// version policies are expected to agree between the primary and the
/// standby, so an answer of this class from either peer means the node must
/// shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    UnregisteredDatanode,
    DisallowedDatanode,
    IncorrectVersion,
    Other,
}

/// A tagged error returned by a metadata server inside an RPC response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("remote error {kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error class requires a data-node-wide shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::UnregisteredDatanode
                | RemoteErrorKind::DisallowedDatanode
                | RemoteErrorKind::IncorrectVersion
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_info_default() {
        let info = NamespaceInfo::default();
        assert!(!info.namespace_id.is_set());
        assert_eq!(info.layout_version, 0);
    }

    #[test]
    fn test_registration_storage_id() {
        let mut reg = DatanodeRegistration::new("dn1:50010");
        assert!(!reg.has_storage_id());
        reg.storage_id = "DS-314159-dn1".into();
        assert!(reg.has_storage_id());
    }

    #[test]
    fn test_registration_serde_roundtrip() {
        let reg = DatanodeRegistration {
            name: "dn1:50010".into(),
            storage_id: "DS-1".into(),
            storage_info: StorageInfo {
                layout_version: -41,
                namespace_id: NamespaceId(42),
                creation_time: 1700000000,
            },
            info_port: 50075,
            ipc_port: 50020,
        };
        let json = serde_json::to_string(&reg).unwrap();
        let parsed: DatanodeRegistration = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reg);
    }

    #[test]
    fn test_block() {
        let b = Block::new(1, 64 * 1024 * 1024, 1001);
        assert_eq!(*b.id, 1);
        assert_eq!(*b.generation, 1001);
    }

    #[test]
    fn test_remote_error_fatal_classes() {
        for kind in [
            RemoteErrorKind::UnregisteredDatanode,
            RemoteErrorKind::DisallowedDatanode,
            RemoteErrorKind::IncorrectVersion,
        ] {
            assert!(RemoteError::new(kind, "x").is_fatal());
        }
        assert!(!RemoteError::new(RemoteErrorKind::Other, "x").is_fatal());
    }

    #[test]
    fn test_remote_error_display() {
        let e = RemoteError::new(RemoteErrorKind::DisallowedDatanode, "not in include list");
        assert!(e.to_string().contains("DisallowedDatanode"));
        assert!(e.to_string().contains("not in include list"));
    }
}
