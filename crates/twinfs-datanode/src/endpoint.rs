//! One metadata server's address pair and RPC proxies.
//!
//! An endpoint owns the data-path and admin-path addresses of a single
//! metadata server, their resolved socket addresses, and the two protocol
//! proxies. The per-endpoint mutex guards proxy lifecycle only; dialing and
//! resolving happen outside it. Endpoints of the same pair deliberately do
//! not share a lock: the two sessions restart independently.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use twinfs_net::{
    AddressResolver, AdminProtocol, DataProtocol, NetError, NetResult, ProtocolConnector,
};
use twinfs_types::HostPort;

use crate::RESOLVE_MIN_INTERVAL;

/// The two live proxies of one endpoint.
#[derive(Clone)]
pub struct Proxies {
    pub data: Arc<dyn DataProtocol>,
    pub admin: Arc<dyn AdminProtocol>,
}

impl std::fmt::Debug for Proxies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxies").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct EndpointState {
    data_sock: Option<SocketAddr>,
    admin_sock: Option<SocketAddr>,
    proxies: Option<Proxies>,
    needs_resolve: bool,
    last_resolved_at: Option<Instant>,
}

pub struct Endpoint {
    data_addr: HostPort,
    admin_addr: HostPort,
    resolver: Arc<dyn AddressResolver>,
    connector: Arc<dyn ProtocolConnector>,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub fn new(
        data_addr: HostPort,
        admin_addr: HostPort,
        resolver: Arc<dyn AddressResolver>,
        connector: Arc<dyn ProtocolConnector>,
    ) -> Self {
        Self {
            data_addr,
            admin_addr,
            resolver,
            connector,
            state: Mutex::new(EndpointState::default()),
        }
    }

    pub fn data_addr(&self) -> &HostPort {
        &self.data_addr
    }

    pub fn admin_addr(&self) -> &HostPort {
        &self.admin_addr
    }

    /// The current proxies, if both are live.
    pub fn proxies(&self) -> Option<Proxies> {
        self.state.lock().proxies.clone()
    }

    pub fn needs_resolve(&self) -> bool {
        self.state.lock().needs_resolve
    }

    /// Whether a re-resolution is both needed and past the rate-limit floor.
    pub fn resolve_due(&self) -> bool {
        let state = self.state.lock();
        state.needs_resolve
            && state
                .last_resolved_at
                .map_or(true, |t| t.elapsed() >= RESOLVE_MIN_INTERVAL)
    }

    /// Flag the endpoint for re-resolution after an unreachable-class RPC
    /// failure observed elsewhere (handshake, register).
    pub fn mark_needs_resolve(&self) {
        self.state.lock().needs_resolve = true;
    }

    /// Dial both protocols if no proxies are live.
    ///
    /// Either both proxies come up or neither does. Unreachable-class dial
    /// failures flag the endpoint for re-resolution.
    pub async fn ensure_proxies(&self) -> NetResult<Proxies> {
        if let Some(proxies) = self.proxies() {
            return Ok(proxies);
        }

        let (data_sock, admin_sock) = match self.resolved_socks() {
            Some(socks) => socks,
            None => {
                // A name that failed to resolve is only retried past the
                // floor; inside it the previous failure is re-reported.
                if self.needs_resolve() && !self.resolve_due() {
                    return Err(NetError::UnknownHost(self.data_addr.host().to_string()));
                }
                self.resolve_both().await?
            }
        };

        let dial = async {
            let data = self.connector.connect_data(data_sock).await?;
            let admin = self.connector.connect_admin(admin_sock).await?;
            Ok::<Proxies, NetError>(Proxies { data, admin })
        };
        match dial.await {
            Ok(proxies) => {
                let mut state = self.state.lock();
                // A competing bring-up may have installed proxies already;
                // keep the first pair.
                match &state.proxies {
                    Some(existing) => Ok(existing.clone()),
                    None => {
                        state.proxies = Some(proxies.clone());
                        state.needs_resolve = false;
                        Ok(proxies)
                    }
                }
            }
            Err(e) => {
                if e.needs_resolve() {
                    self.state.lock().needs_resolve = true;
                }
                debug!(peer = %self.data_addr, error = %e, "dial failed");
                Err(e)
            }
        }
    }

    /// Re-resolve both addresses if flagged and past the rate-limit floor.
    ///
    /// Returns whether either resolved address actually changed. Callers
    /// must have stopped any session using this endpoint first. A failed
    /// attempt keeps the flag set and still arms the rate limit.
    pub async fn maybe_reresolve(&self) -> bool {
        if !self.resolve_due() {
            return false;
        }

        let resolved = async {
            let data = self.resolver.resolve(&self.data_addr).await?;
            let admin = self.resolver.resolve(&self.admin_addr).await?;
            NetResult::Ok((data, admin))
        };
        match resolved.await {
            Ok((data_sock, admin_sock)) => {
                let mut state = self.state.lock();
                let changed =
                    state.data_sock != Some(data_sock) || state.admin_sock != Some(admin_sock);
                if changed {
                    info!(
                        peer = %self.data_addr,
                        data = %data_sock,
                        admin = %admin_sock,
                        "endpoint re-resolved to new addresses"
                    );
                }
                state.data_sock = Some(data_sock);
                state.admin_sock = Some(admin_sock);
                state.needs_resolve = false;
                state.last_resolved_at = Some(Instant::now());
                changed
            }
            Err(e) => {
                info!(peer = %self.data_addr, error = %e, "re-resolution failed");
                self.state.lock().last_resolved_at = Some(Instant::now());
                false
            }
        }
    }

    /// Tear down both proxies. Idempotent; the resolved addresses survive.
    pub fn close_proxies(&self) {
        let mut state = self.state.lock();
        if state.proxies.take().is_some() {
            debug!(peer = %self.data_addr, "proxies closed");
        }
    }

    fn resolved_socks(&self) -> Option<(SocketAddr, SocketAddr)> {
        let state = self.state.lock();
        Some((state.data_sock?, state.admin_sock?))
    }

    async fn resolve_both(&self) -> NetResult<(SocketAddr, SocketAddr)> {
        let resolved = async {
            let data = self.resolver.resolve(&self.data_addr).await?;
            let admin = self.resolver.resolve(&self.admin_addr).await?;
            NetResult::Ok((data, admin))
        };
        match resolved.await {
            Ok((data_sock, admin_sock)) => {
                let mut state = self.state.lock();
                state.data_sock = Some(data_sock);
                state.admin_sock = Some(admin_sock);
                state.last_resolved_at = Some(Instant::now());
                Ok((data_sock, admin_sock))
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.needs_resolve = true;
                state.last_resolved_at = Some(Instant::now());
                Err(e)
            }
        }
    }
}
