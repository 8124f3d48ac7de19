use std::net::SocketAddr;

use async_trait::async_trait;
use twinfs_types::HostPort;

use crate::error::{NetError, NetResult};

/// Name resolution seam.
///
/// The data node re-resolves metadata-server names after unreachable-class
/// errors; tests substitute a table-driven resolver to simulate DNS changes.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, addr: &HostPort) -> NetResult<SocketAddr>;
}

/// System resolver backed by the runtime's host lookup.
#[derive(Debug, Default)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, addr: &HostPort) -> NetResult<SocketAddr> {
        // Literal IPs skip the lookup so an unreachable DNS server cannot
        // stall endpoints that were configured numerically.
        if let Some(sa) = addr.as_socket_addr() {
            return Ok(sa);
        }
        let mut candidates = tokio::net::lookup_host((addr.host(), addr.port()))
            .await
            .map_err(|e| {
                tracing::debug!(addr = %addr, error = %e, "host lookup failed");
                NetError::UnknownHost(addr.host().to_string())
            })?;
        candidates
            .next()
            .ok_or_else(|| NetError::UnknownHost(addr.host().to_string()))
    }
}
