//! Client-side protocol traits for the two RPC surfaces a metadata server
//! exposes to data nodes.
//!
//! The concrete transport (framing, timeouts, connection reuse) lives behind
//! [`ProtocolConnector`]; the namespace service manager only ever sees the
//! trait objects.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use twinfs_proto::{Block, DatanodeRegistration, ErrorSeverity, NamespaceInfo};

use crate::error::NetResult;

/// The data-path protocol: handshake, registration, and error reporting.
#[async_trait]
pub trait DataProtocol: Send + Sync + std::fmt::Debug {
    /// Version-exchange handshake. Also yields the namespace id and layout
    /// version of the peer.
    async fn version_request(&self) -> NetResult<NamespaceInfo>;

    /// Enroll this data node as a member of the namespace. The returned
    /// registration carries the (possibly newly assigned) storage id.
    async fn register(
        &self,
        registration: DatanodeRegistration,
        transfer_protocol_version: u32,
    ) -> NetResult<DatanodeRegistration>;

    /// Report a local error condition to the peer.
    async fn error_report(
        &self,
        registration: &DatanodeRegistration,
        severity: ErrorSeverity,
        message: &str,
    ) -> NetResult<()>;
}

/// The admin-path protocol used by the offer-service loop.
///
/// The namespace service manager keeps these proxies alive and hands them to
/// the offer layer; the only operation the core itself relies on is the
/// primary probe the offer loop uses to observe failover.
#[async_trait]
pub trait AdminProtocol: Send + Sync + std::fmt::Debug {
    /// Ask the peer whether it currently considers itself primary for the
    /// registered data node.
    async fn primary_status(&self, registration: &DatanodeRegistration) -> NetResult<bool>;

    /// Recovery-synchronise a block through this peer. Only meaningful when
    /// the peer is primary.
    async fn sync_block(&self, block: Block) -> NetResult<Vec<String>>;
}

/// Dials the two protocol surfaces of one metadata server.
///
/// Implementations own socket setup and transport timeouts; connect-class
/// failures must be classified into the matching [`crate::NetError`]
/// variants so callers can decide whether to re-resolve.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect_data(&self, addr: SocketAddr) -> NetResult<Arc<dyn DataProtocol>>;

    async fn connect_admin(&self, addr: SocketAddr) -> NetResult<Arc<dyn AdminProtocol>>;
}
