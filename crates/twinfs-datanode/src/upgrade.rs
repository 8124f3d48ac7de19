//! Per-namespace distributed-upgrade bookkeeping.
//!
//! The metadata server drives distributed upgrades through offer-service
//! commands; the supervisor only has to kick a pending upgrade once a
//! session has registered, and wind it down on clean-up.

use parking_lot::Mutex;
use tracing::info;
use twinfs_types::NamespaceId;

#[derive(Debug, Default)]
struct UpgradeState {
    pending_version: Option<i32>,
    running_version: Option<i32>,
}

/// Singleton per namespace, created lazily by the owning service pair.
pub struct UpgradeManager {
    namespace_id: NamespaceId,
    state: Mutex<UpgradeState>,
}

impl UpgradeManager {
    pub fn new(namespace_id: NamespaceId) -> Self {
        Self {
            namespace_id,
            state: Mutex::new(UpgradeState::default()),
        }
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }

    /// Record an upgrade requested by the peer. Picked up by the supervisor
    /// on its next iteration.
    pub fn request_upgrade(&self, version: i32) {
        self.state.lock().pending_version = Some(version);
    }

    /// Start a pending upgrade, if any. Returns whether one was started.
    pub fn start_if_needed(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending_version.take() {
            Some(version) => {
                state.running_version = Some(version);
                info!(
                    namespace_id = *self.namespace_id,
                    version, "starting distributed upgrade"
                );
                true
            }
            None => false,
        }
    }

    pub fn is_upgrading(&self) -> bool {
        self.state.lock().running_version.is_some()
    }

    /// Abort any running upgrade. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(version) = state.running_version.take() {
            info!(
                namespace_id = *self.namespace_id,
                version, "shutting down distributed upgrade"
            );
        }
        state.pending_version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_without_pending() {
        let um = UpgradeManager::new(NamespaceId(1));
        assert!(!um.start_if_needed());
        assert!(!um.is_upgrading());
    }

    #[test]
    fn test_request_then_start_once() {
        let um = UpgradeManager::new(NamespaceId(1));
        um.request_upgrade(12);
        assert!(um.start_if_needed());
        assert!(um.is_upgrading());
        // The pending request is consumed.
        assert!(!um.start_if_needed());
    }

    #[test]
    fn test_shutdown_idempotent() {
        let um = UpgradeManager::new(NamespaceId(1));
        um.request_upgrade(12);
        um.start_if_needed();
        um.shutdown();
        assert!(!um.is_upgrading());
        um.shutdown();
    }
}
