//! Coordination-service client.
//!
//! An external consensus-backed registry publishes which of the two metadata
//! servers of a namespace is currently primary. The data node consults it
//! only at startup and during session restart; everything else it learns
//! from the offer-service loops themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use twinfs_types::HostPort;

/// Errors from the coordination service.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// The coordination service could not be reached.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    /// The client was shut down.
    #[error("coordinator client shut down")]
    ShutDown,
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Trait for querying the primary registry.
///
/// `Ok(None)` is a legal answer and means "no primary currently published",
/// which happens while a failover is in flight.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Return the address of the current primary for the namespace
    /// registered under `default_addr`.
    async fn get_primary(&self, default_addr: &HostPort) -> CoordResult<Option<HostPort>>;

    /// Release any resources held by the client. Idempotent.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    primaries: HashMap<HostPort, HostPort>,
    unavailable: bool,
}

/// A table-backed coordinator used by tests and single-host clusters.
///
/// Real deployments plug their coordination-service client in behind the
/// [`Coordinator`] trait; this implementation exists so the rest of the
/// stack can be exercised without one. Clones share the registry but each
/// clone is its own client with its own shutdown state.
#[derive(Default)]
pub struct InMemoryCoordinator {
    registry: Arc<Mutex<Registry>>,
    shut_down: std::sync::atomic::AtomicBool,
}

impl Clone for InMemoryCoordinator {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            shut_down: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `primary` as the current primary for `default_addr`.
    pub fn publish_primary(&self, default_addr: HostPort, primary: HostPort) {
        self.registry.lock().primaries.insert(default_addr, primary);
    }

    /// Withdraw the published primary (failover in progress).
    pub fn clear_primary(&self, default_addr: &HostPort) {
        self.registry.lock().primaries.remove(default_addr);
    }

    /// Make every lookup fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.registry.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn get_primary(&self, default_addr: &HostPort) -> CoordResult<Option<HostPort>> {
        use std::sync::atomic::Ordering;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CoordError::ShutDown);
        }
        let registry = self.registry.lock();
        if registry.unavailable {
            return Err(CoordError::Unavailable("registry offline".into()));
        }
        Ok(registry.primaries.get(default_addr).cloned())
    }

    async fn shutdown(&self) {
        use std::sync::atomic::Ordering;
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("coordinator client shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> HostPort {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_lookup_published_primary() {
        let coord = InMemoryCoordinator::new();
        coord.publish_primary(addr("ns1:8020"), addr("10.0.0.1:8020"));

        let primary = coord.get_primary(&addr("ns1:8020")).await.unwrap();
        assert_eq!(primary, Some(addr("10.0.0.1:8020")));
    }

    #[tokio::test]
    async fn test_no_primary_published() {
        let coord = InMemoryCoordinator::new();
        let primary = coord.get_primary(&addr("ns1:8020")).await.unwrap();
        assert_eq!(primary, None);
    }

    #[tokio::test]
    async fn test_clear_primary() {
        let coord = InMemoryCoordinator::new();
        coord.publish_primary(addr("ns1:8020"), addr("10.0.0.1:8020"));
        coord.clear_primary(&addr("ns1:8020"));
        assert_eq!(coord.get_primary(&addr("ns1:8020")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let coord = InMemoryCoordinator::new();
        coord.set_unavailable(true);
        assert!(matches!(
            coord.get_primary(&addr("ns1:8020")).await,
            Err(CoordError::Unavailable(_))
        ));

        coord.set_unavailable(false);
        assert!(coord.get_primary(&addr("ns1:8020")).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let coord = InMemoryCoordinator::new();
        coord.shutdown().await;
        coord.shutdown().await;
        assert!(matches!(
            coord.get_primary(&addr("ns1:8020")).await,
            Err(CoordError::ShutDown)
        ));
    }
}
