//! On-the-wire request/response frames for both protocol surfaces.
//!
//! Frames are newline-delimited JSON; every call opens its own connection,
//! writes one request line, and reads one response line. A server-side
//! failure travels back as [`WireResponse::Error`] carrying the remote error
//! class.

use serde::{Deserialize, Serialize};
use twinfs_proto::{Block, DatanodeRegistration, ErrorSeverity, NamespaceInfo, RemoteError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireRequest {
    VersionRequest,
    Register {
        registration: DatanodeRegistration,
        transfer_protocol_version: u32,
    },
    ErrorReport {
        registration: DatanodeRegistration,
        severity: ErrorSeverity,
        message: String,
    },
    PrimaryStatus {
        registration: DatanodeRegistration,
    },
    SyncBlock {
        block: Block,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireResponse {
    NamespaceInfo(NamespaceInfo),
    Registration(DatanodeRegistration),
    PrimaryStatus(bool),
    Locations(Vec<String>),
    Ack,
    Error(RemoteError),
}
