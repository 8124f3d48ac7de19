//! All service pairs of the data node, keyed by session 0's data address.
//!
//! The manager supports dynamic reconfiguration: `refresh` diffs the running
//! set against a new configuration, stops and joins removed pairs, and
//! starts added ones. Block-event notifications may race with a refresh; a
//! notification that finds its namespace gone fails with `UnknownNamespace`,
//! which callers treat as benign.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use twinfs_proto::Block;
use twinfs_types::{HostPort, NamespaceId};

use crate::node::NodeContext;
use crate::service_pair::ServicePair;
use crate::settings::NamespaceConfig;
use crate::{DataNodeError, Result};

pub struct NamespaceManager {
    ctx: Arc<NodeContext>,
    pairs: Mutex<HashMap<HostPort, Arc<ServicePair>>>,
    /// Serialises refresh calls against each other; notifications do not
    /// take it.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl NamespaceManager {
    pub fn new(ctx: Arc<NodeContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            pairs: Mutex::new(HashMap::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build a manager holding one (unstarted) pair per configured
    /// namespace.
    pub fn from_settings(ctx: Arc<NodeContext>) -> Result<Arc<Self>> {
        let manager = Self::new(ctx.clone());
        for conf in &ctx.settings.namespaces {
            manager.add(conf)?;
        }
        Ok(manager)
    }

    /// Construct and insert a pair for `conf`. The pair is not started.
    pub fn add(self: &Arc<Self>, conf: &NamespaceConfig) -> Result<Arc<ServicePair>> {
        let pair = ServicePair::new(self.ctx.clone(), conf);
        let mut pairs = self.pairs.lock();
        if pairs.contains_key(pair.key()) {
            return Err(DataNodeError::Config(format!(
                "namespace with session-0 address {} is already managed",
                pair.key()
            )));
        }
        pair.attach_manager(self);
        pairs.insert(pair.key().clone(), pair.clone());
        Ok(pair)
    }

    /// Idempotent removal by pair identity.
    pub fn remove(&self, pair: &Arc<ServicePair>) {
        self.remove_by_key(pair.key());
    }

    /// Idempotent removal by namespace id.
    pub fn remove_namespace(&self, ns: NamespaceId) {
        let mut pairs = self.pairs.lock();
        pairs.retain(|_, pair| pair.namespace_id() != ns);
    }

    pub(crate) fn remove_by_key(&self, key: &HostPort) {
        self.pairs.lock().remove(key);
    }

    /// Look a pair up by its assigned namespace id. An O(n) scan; the pair
    /// count is small.
    pub fn get(&self, ns: NamespaceId) -> Option<Arc<ServicePair>> {
        self.pairs
            .lock()
            .values()
            .find(|pair| pair.namespace_id() == ns)
            .cloned()
    }

    pub fn get_by_addr(&self, addr: &HostPort) -> Option<Arc<ServicePair>> {
        self.pairs.lock().get(addr).cloned()
    }

    pub fn pairs(&self) -> Vec<Arc<ServicePair>> {
        self.pairs.lock().values().cloned().collect()
    }

    pub fn keys(&self) -> HashSet<HostPort> {
        self.pairs.lock().keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Block event routing
    // -----------------------------------------------------------------------

    pub fn notify_received(
        &self,
        ns: NamespaceId,
        block: Block,
        hint: Option<String>,
    ) -> Result<()> {
        let pair = self.get(ns).ok_or(DataNodeError::UnknownNamespace(ns))?;
        pair.notify_received(block, hint);
        Ok(())
    }

    pub fn notify_deleted(&self, ns: NamespaceId, block: Block) -> Result<()> {
        let pair = self.get(ns).ok_or(DataNodeError::UnknownNamespace(ns))?;
        pair.notify_deleted(block);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start every pair. Idempotent: pairs that are already alive are left
    /// alone.
    pub fn start_all(&self) {
        for pair in self.pairs() {
            pair.start();
        }
    }

    /// Stop every pair. Does not wait for workers; see [`Self::join_all`].
    pub async fn stop_all(&self) {
        for pair in self.pairs() {
            pair.stop().await;
        }
    }

    pub async fn join_all(&self) {
        for pair in self.pairs() {
            pair.join().await;
        }
    }

    // -----------------------------------------------------------------------
    // Dynamic reconfiguration
    // -----------------------------------------------------------------------

    /// Reconcile the running set with `new_config`.
    ///
    /// Pairs whose session-0 address is absent from the new set are stopped,
    /// then joined (two passes, so their shutdowns overlap); pairs in both
    /// sets keep running untouched; new addresses get fresh pairs, started
    /// by the trailing `start_all`.
    pub async fn refresh(self: &Arc<Self>, new_config: &[NamespaceConfig]) -> Result<()> {
        let _refresh = self.refresh_lock.lock().await;

        let to_stop = {
            let mut pairs = self.pairs.lock();
            let new_keys: HashSet<&HostPort> =
                new_config.iter().map(|conf| &conf.data_addr[0]).collect();

            let stop_keys: Vec<HostPort> = pairs
                .keys()
                .filter(|key| !new_keys.contains(key))
                .cloned()
                .collect();
            let mut to_stop = Vec::with_capacity(stop_keys.len());
            for key in &stop_keys {
                if let Some(pair) = pairs.remove(key) {
                    to_stop.push(pair);
                }
            }

            for conf in new_config {
                if !pairs.contains_key(&conf.data_addr[0]) {
                    let pair = ServicePair::new(self.ctx.clone(), conf);
                    pair.attach_manager(self);
                    pairs.insert(pair.key().clone(), pair);
                }
            }
            to_stop
        };

        if !to_stop.is_empty() {
            info!(count = to_stop.len(), "stopping removed namespaces");
        }
        for pair in &to_stop {
            pair.stop().await;
        }
        for pair in &to_stop {
            pair.join().await;
        }

        self.start_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRole;
    use crate::testutil::*;

    const A0: &str = "10.0.0.1:8020";
    const A1: &str = "10.0.0.2:8020";
    const B0: &str = "10.0.1.1:8020";
    const B1: &str = "10.0.1.2:8020";

    fn manager_with_namespace_a(ns_id: u32) -> (TestCluster, Arc<NamespaceManager>) {
        let cluster = TestCluster::new(test_settings());
        cluster.add_peer(A0, A0, ns_info(ns_id));
        cluster.add_peer(A1, A1, ns_info(ns_id));
        let manager = NamespaceManager::new(cluster.ctx.clone());
        manager.add(&ns_conf(Some("a"), A0, A1)).unwrap();
        (cluster, manager)
    }

    async fn wait_initialized(manager: &Arc<NamespaceManager>, ns: NamespaceId) {
        wait_until("namespace initialized", || {
            manager.get(ns).is_some_and(|pair| pair.initialized())
        })
        .await;
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_key() {
        let cluster = TestCluster::new(test_settings());
        let manager = NamespaceManager::new(cluster.ctx.clone());
        manager.add(&ns_conf(Some("a"), A0, A1)).unwrap();
        let err = manager.add(&ns_conf(Some("a2"), A0, B1)).unwrap_err();
        assert!(matches!(err, DataNodeError::Config(_)));
        assert_eq!(manager.pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_idempotent() {
        let cluster = TestCluster::new(test_settings());
        let manager = NamespaceManager::new(cluster.ctx.clone());
        let pair = manager.add(&ns_conf(Some("a"), A0, A1)).unwrap();

        manager.remove(&pair);
        manager.remove(&pair);
        assert!(manager.pairs().is_empty());

        // Removal by (unassigned) namespace id is also a no-op here.
        manager.remove_namespace(NamespaceId(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_routes_by_namespace_id() {
        let (cluster, manager) = manager_with_namespace_a(42);
        manager.start_all();
        wait_initialized(&manager, NamespaceId(42)).await;

        manager
            .notify_received(NamespaceId(42), twinfs_proto::Block::new(1, 64, 1), None)
            .unwrap();
        manager
            .notify_deleted(NamespaceId(42), twinfs_proto::Block::new(2, 64, 1))
            .unwrap();

        let offer = cluster.offers.latest_for(SessionRole::First).unwrap();
        wait_until("events delivered", || offer.pending().len() == 2).await;

        manager.stop_all().await;
        manager.join_all().await;
    }

    #[tokio::test]
    async fn test_notify_unknown_namespace() {
        let cluster = TestCluster::new(test_settings());
        let manager = NamespaceManager::new(cluster.ctx.clone());
        let err = manager
            .notify_received(NamespaceId(9), twinfs_proto::Block::new(1, 64, 1), None)
            .unwrap_err();
        assert!(matches!(err, DataNodeError::UnknownNamespace(ns) if ns == NamespaceId(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_removes_a_adds_b() {
        let (cluster, manager) = manager_with_namespace_a(42);
        cluster.add_peer(B0, B0, ns_info(43));
        cluster.add_peer(B1, B1, ns_info(43));
        manager.start_all();
        wait_initialized(&manager, NamespaceId(42)).await;
        let pair_a = manager.get_by_addr(&hp(A0)).unwrap();

        manager.refresh(&[ns_conf(Some("b"), B0, B1)]).await.unwrap();

        // A is gone, stopped, and joined; B is live.
        assert_eq!(manager.keys(), [hp(B0)].into_iter().collect());
        assert!(!pair_a.is_alive());
        wait_initialized(&manager, NamespaceId(43)).await;

        assert_eq!(
            cluster
                .block_store
                .removed
                .lock()
                .iter()
                .filter(|ns| **ns == NamespaceId(42))
                .count(),
            1
        );
        assert_eq!(
            cluster
                .block_store
                .added
                .lock()
                .iter()
                .filter(|ns| **ns == NamespaceId(43))
                .count(),
            1
        );

        manager.stop_all().await;
        manager.join_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_surviving_pairs_untouched() {
        let (cluster, manager) = manager_with_namespace_a(42);
        cluster.add_peer(B0, B0, ns_info(43));
        cluster.add_peer(B1, B1, ns_info(43));
        manager.start_all();
        wait_initialized(&manager, NamespaceId(42)).await;
        let before = manager.get_by_addr(&hp(A0)).unwrap();

        manager
            .refresh(&[ns_conf(Some("a"), A0, A1), ns_conf(Some("b"), B0, B1)])
            .await
            .unwrap();

        // The surviving pair is the same object, never restarted.
        let after = manager.get_by_addr(&hp(A0)).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(after.is_alive());
        assert_eq!(manager.keys().len(), 2);

        manager.stop_all().await;
        manager.join_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_join_all() {
        let (_cluster, manager) = manager_with_namespace_a(42);
        manager.start_all();
        wait_initialized(&manager, NamespaceId(42)).await;
        let pairs = manager.pairs();

        manager.stop_all().await;
        manager.join_all().await;
        for pair in pairs {
            assert!(!pair.is_alive());
            assert!(!pair.session(SessionRole::First).is_serving());
            assert!(!pair.session(SessionRole::Second).is_serving());
        }
    }
}
