//! Data-node glue: shared collaborator context, the shutdown protocol, and
//! the daemon body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};
use twinfs_coordinator::Coordinator;
use twinfs_net::{AddressResolver, ProtocolConnector};
use twinfs_proto::Block;
use twinfs_types::NamespaceId;

use crate::namespace_manager::NamespaceManager;
use crate::offer::OfferServiceFactory;
use crate::settings::Settings;
use crate::storage::{BlockStore, Scanner, Storage};
use crate::{DataNodeError, Result, SHUTDOWN_TIMEOUT};

/// Creates one coordinator client per service pair; each pair shuts its own
/// client down when stopped.
pub trait CoordinatorFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Coordinator>;
}

impl<F> CoordinatorFactory for F
where
    F: Fn() -> Arc<dyn Coordinator> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Coordinator> {
        self()
    }
}

// ---------------------------------------------------------------------------
// Shutdown protocol
// ---------------------------------------------------------------------------

/// Process-wide run flag plus the wake-up channel behind it.
///
/// `request` asks for a graceful exit; `request_fatal` additionally records
/// the reason, which makes the daemon exit non-zero. Both are idempotent and
/// wake every subscribed worker promptly.
#[derive(Clone)]
pub struct ShutdownHandle {
    should_run: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            should_run: Arc::new(AtomicBool::new(true)),
            tx: Arc::new(tx),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    pub fn request(&self) {
        if self.should_run.swap(false, Ordering::AcqRel) {
            info!("data node shutdown requested");
        }
        self.tx.send_replace(true);
    }

    pub fn request_fatal(&self, reason: &str) {
        self.fatal
            .lock()
            .get_or_insert_with(|| reason.to_string());
        self.request();
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything the namespace service manager shares across pairs.
pub struct NodeContext {
    pub settings: Settings,
    pub storage: Arc<dyn Storage>,
    pub block_store: Arc<dyn BlockStore>,
    pub scanner: Option<Arc<dyn Scanner>>,
    pub connector: Arc<dyn ProtocolConnector>,
    pub resolver: Arc<dyn AddressResolver>,
    pub offer_factory: Arc<dyn OfferServiceFactory>,
    pub coordinators: Arc<dyn CoordinatorFactory>,
    pub shutdown: ShutdownHandle,
    /// Serialises `recover_transition_read` across pairs.
    pub(crate) storage_setup_lock: tokio::sync::Mutex<()>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        storage: Arc<dyn Storage>,
        block_store: Arc<dyn BlockStore>,
        scanner: Option<Arc<dyn Scanner>>,
        connector: Arc<dyn ProtocolConnector>,
        resolver: Arc<dyn AddressResolver>,
        offer_factory: Arc<dyn OfferServiceFactory>,
        coordinators: Arc<dyn CoordinatorFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            storage,
            block_store,
            scanner,
            connector,
            resolver,
            offer_factory,
            coordinators,
            shutdown: ShutdownHandle::new(),
            storage_setup_lock: tokio::sync::Mutex::new(()),
        })
    }
}

// ---------------------------------------------------------------------------
// DataNode
// ---------------------------------------------------------------------------

pub struct DataNode {
    ctx: Arc<NodeContext>,
    manager: Arc<NamespaceManager>,
}

impl DataNode {
    pub fn new(ctx: Arc<NodeContext>) -> Result<Arc<Self>> {
        let manager = NamespaceManager::from_settings(ctx.clone())?;
        Ok(Arc::new(Self { ctx, manager }))
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn namespace_manager(&self) -> &Arc<NamespaceManager> {
        &self.manager
    }

    /// Route a received-block event to the owning pair, which fans it out to
    /// both metadata servers.
    pub fn notify_received(
        &self,
        ns: NamespaceId,
        block: Block,
        hint: Option<String>,
    ) -> Result<()> {
        self.manager.notify_received(ns, block, hint)
    }

    pub fn notify_deleted(&self, ns: NamespaceId, block: Block) -> Result<()> {
        self.manager.notify_deleted(ns, block)
    }

    /// Re-derive the namespace set from fresh settings.
    pub async fn refresh_namespaces(&self, settings: &Settings) -> Result<()> {
        info!(
            namespaces = settings.namespaces.len(),
            "refreshing namespace set"
        );
        self.manager.refresh(&settings.namespaces).await
    }

    /// Start the shutdown cascade: clear the run flag and stop every pair.
    pub async fn shutdown_dn(&self) {
        self.ctx.shutdown.request();
        self.manager.stop_all().await;
    }

    /// Daemon body: start everything, wait for a shutdown request, then
    /// stop, join, and clean up every pair. Returns an error when the
    /// shutdown was caused by a fatal condition.
    pub async fn run(&self) -> Result<()> {
        self.manager.start_all();

        let mut rx = self.ctx.shutdown.subscribe();
        while self.ctx.shutdown.is_running() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        info!("data node stopping all namespaces");
        let pairs = self.manager.pairs();
        self.manager.stop_all().await;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.manager.join_all())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "workers did not exit within the shutdown timeout"
            );
        }
        for pair in pairs {
            pair.clean_up();
        }

        match self.ctx.shutdown.fatal_reason() {
            Some(reason) => Err(DataNodeError::Fatal(reason)),
            None => Ok(()),
        }
    }
}
