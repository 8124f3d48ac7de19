//! The two sessions of one namespace and their supervisor.
//!
//! A service pair discovers the primary through the coordinator (startup
//! only), obtains a single namespace info, sets up namespace storage exactly
//! once, then keeps both sessions registered and serving until stopped.
//! Block events fan out to both sessions; only `sync_block` is routed to the
//! current primary.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use twinfs_coordinator::Coordinator;
use twinfs_proto::{
    Block, DatanodeRegistration, ErrorSeverity, NamespaceInfo, StorageInfo, SyncedBlock,
};
use twinfs_types::{HostPort, NamespaceId};

use crate::endpoint::{Endpoint, Proxies};
use crate::namespace_manager::NamespaceManager;
use crate::node::NodeContext;
use crate::session::{Session, SessionRole};
use crate::settings::NamespaceConfig;
use crate::upgrade::UpgradeManager;
use crate::{
    DataNodeError, Result, BUILD_VERSION, HANDSHAKE_RETRY_INTERVAL, LOCAL_LAYOUT_VERSION,
    OFFER_RETRY_INTERVAL,
};

// ---------------------------------------------------------------------------
// Primary tracking
// ---------------------------------------------------------------------------

const NO_PRIMARY: usize = usize::MAX;

/// The pair's primary slot as a single atomic value.
///
/// Holding "no primary" as its own state (rather than two booleans) leaves
/// no window in which both or neither session could read as primary. Only
/// the offer layer writes it, on an authoritative signal from a peer; the
/// supervisor never infers primaryship from session state.
#[derive(Clone)]
pub struct PrimaryHandle {
    slot: Arc<AtomicUsize>,
}

impl PrimaryHandle {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(AtomicUsize::new(NO_PRIMARY)),
        }
    }

    pub fn set(&self, role: Option<SessionRole>) {
        let new = role.map_or(NO_PRIMARY, SessionRole::index);
        let old = self.slot.swap(new, Ordering::AcqRel);
        if old == new {
            return;
        }
        match role {
            Some(role) => info!(%role, "primary metadata server declared"),
            None => info!(
                "failover in progress, commands from either peer are ignored \
                 until a new primary is declared"
            ),
        }
    }

    pub fn get(&self) -> Option<SessionRole> {
        SessionRole::from_index(self.slot.load(Ordering::Acquire))
    }

    pub fn is(&self, role: SessionRole) -> bool {
        self.get() == Some(role)
    }
}

impl Default for PrimaryHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared pair state
// ---------------------------------------------------------------------------

/// State shared between the supervisor, the two sessions, and the offer
/// layer.
pub(crate) struct PairState {
    pub(crate) nameservice_id: Option<String>,
    pub(crate) default_addr: HostPort,
    pub(crate) node: Arc<NodeContext>,
    namespace_id: AtomicU32,
    namespace_info: Mutex<Option<NamespaceInfo>>,
    registration: Mutex<DatanodeRegistration>,
    registration_adopted: AtomicBool,
    primary: PrimaryHandle,
    should_run: AtomicBool,
    initialized: AtomicBool,
    storage_ready: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl PairState {
    fn new(node: Arc<NodeContext>, conf: &NamespaceConfig) -> Arc<Self> {
        let mut registration = DatanodeRegistration::new(node.settings.node_name.clone());
        registration.info_port = node.settings.info_port;
        registration.ipc_port = node.settings.ipc_port;
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            nameservice_id: conf.nameservice_id.clone(),
            default_addr: conf.default_addr.clone(),
            node,
            namespace_id: AtomicU32::new(*NamespaceId::UNSET),
            namespace_info: Mutex::new(None),
            registration: Mutex::new(registration),
            registration_adopted: AtomicBool::new(false),
            primary: PrimaryHandle::new(),
            should_run: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            storage_ready: AtomicBool::new(false),
            stop_tx,
        })
    }

    pub(crate) fn should_run(&self) -> bool {
        self.should_run.load(Ordering::Acquire) && self.node.shutdown.is_running()
    }

    pub(crate) fn request_stop(&self) {
        self.should_run.store(false, Ordering::Release);
        self.stop_tx.send_replace(true);
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn namespace_id(&self) -> NamespaceId {
        NamespaceId(self.namespace_id.load(Ordering::Acquire))
    }

    pub(crate) fn namespace_info(&self) -> Option<NamespaceInfo> {
        self.namespace_info.lock().clone()
    }

    pub(crate) fn set_namespace_info(&self, info: NamespaceInfo) {
        self.namespace_id
            .store(*info.namespace_id, Ordering::Release);
        *self.namespace_info.lock() = Some(info);
    }

    pub(crate) fn registration(&self) -> DatanodeRegistration {
        self.registration.lock().clone()
    }

    pub(crate) fn update_registration(&self, f: impl FnOnce(&mut DatanodeRegistration)) {
        f(&mut self.registration.lock());
    }

    /// First successful register in either session fixes the pair's record.
    pub(crate) fn adopt_registration(&self, returned: DatanodeRegistration) {
        if !self.registration_adopted.swap(true, Ordering::AcqRel) {
            *self.registration.lock() = returned;
        }
    }

    pub(crate) fn primary_handle(&self) -> PrimaryHandle {
        self.primary.clone()
    }

    pub(crate) fn storage_ready(&self) -> bool {
        self.storage_ready.load(Ordering::Acquire)
    }

    /// Check a handshake result against this build. A layout mismatch sends
    /// a best-effort error report and takes the whole data node down.
    pub(crate) async fn verify_namespace_info(
        &self,
        proxies: Option<&Proxies>,
        info: &NamespaceInfo,
    ) -> Result<()> {
        if info.build_version != BUILD_VERSION {
            warn!(
                peer_build = %info.build_version,
                local_build = BUILD_VERSION,
                "build versions differ"
            );
        }
        if info.layout_version != LOCAL_LAYOUT_VERSION {
            let message = format!(
                "data-node and metadata-server layout versions must match: \
                 local {}, remote {}",
                LOCAL_LAYOUT_VERSION, info.layout_version
            );
            return Err(self
                .fail_layout(proxies, LOCAL_LAYOUT_VERSION, info.layout_version, message)
                .await);
        }
        Ok(())
    }

    pub(crate) async fn fail_layout(
        &self,
        proxies: Option<&Proxies>,
        local: i32,
        remote: i32,
        message: String,
    ) -> DataNodeError {
        error!("{message}");
        if let Some(proxies) = proxies {
            if let Err(e) = proxies
                .data
                .error_report(&self.registration(), ErrorSeverity::Notify, &message)
                .await
            {
                info!(error = %e, "could not deliver layout error report");
            }
        }
        self.node.shutdown.request_fatal(&message);
        DataNodeError::LayoutMismatch { local, remote }
    }
}

// ---------------------------------------------------------------------------
// ServicePair
// ---------------------------------------------------------------------------

pub struct ServicePair {
    shared: Arc<PairState>,
    sessions: [Arc<Session>; 2],
    key: HostPort,
    coordinator: Arc<dyn Coordinator>,
    upgrade: Mutex<Option<Arc<UpgradeManager>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    cleaned: AtomicBool,
    manager: Mutex<Weak<NamespaceManager>>,
}

impl std::fmt::Debug for ServicePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePair")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl ServicePair {
    pub fn new(node: Arc<NodeContext>, conf: &NamespaceConfig) -> Arc<Self> {
        let shared = PairState::new(node.clone(), conf);
        let endpoint = |i: usize| {
            Endpoint::new(
                conf.data_addr[i].clone(),
                conf.admin_addr[i].clone(),
                node.resolver.clone(),
                node.connector.clone(),
            )
        };
        let sessions = [
            Session::new(SessionRole::First, endpoint(0), shared.clone()),
            Session::new(SessionRole::Second, endpoint(1), shared.clone()),
        ];
        Arc::new(Self {
            shared,
            sessions,
            key: conf.data_addr[0].clone(),
            coordinator: node.coordinators.create(),
            upgrade: Mutex::new(None),
            supervisor: Mutex::new(None),
            cleaned: AtomicBool::new(false),
            manager: Mutex::new(Weak::new()),
        })
    }

    /// The data-path address of session 0; the pair's identity in the
    /// namespace manager.
    pub fn key(&self) -> &HostPort {
        &self.key
    }

    pub fn nameservice_id(&self) -> Option<&str> {
        self.shared.nameservice_id.as_deref()
    }

    /// Assigned by the metadata server at handshake; `UNSET` until then.
    pub fn namespace_id(&self) -> NamespaceId {
        self.shared.namespace_id()
    }

    pub fn registration(&self) -> DatanodeRegistration {
        self.shared.registration()
    }

    pub fn initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn session(&self, role: SessionRole) -> &Arc<Session> {
        &self.sessions[role.index()]
    }

    pub fn is_primary(&self, role: SessionRole) -> bool {
        self.shared.primary.is(role)
    }

    pub fn primary_session(&self) -> Option<SessionRole> {
        self.shared.primary.get()
    }

    /// Written by the offer layer on an authoritative signal; `None` means a
    /// failover is in flight.
    pub fn set_primary(&self, role: Option<SessionRole>) {
        self.shared.primary.set(role);
    }

    pub fn primary_handle(&self) -> PrimaryHandle {
        self.shared.primary_handle()
    }

    /// The lazily created per-namespace upgrade manager.
    pub fn upgrade_manager(&self) -> Arc<UpgradeManager> {
        self.upgrade
            .lock()
            .get_or_insert_with(|| Arc::new(UpgradeManager::new(self.shared.namespace_id())))
            .clone()
    }

    pub(crate) fn attach_manager(&self, manager: &Arc<NamespaceManager>) {
        *self.manager.lock() = Arc::downgrade(manager);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the supervisor. Idempotent while the supervisor is alive.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock();
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *guard = Some(tokio::spawn(self.clone().supervise()));
    }

    /// Stop the pair: clear the run flag, stop both sessions, shut down the
    /// coordinator client. Does not wait for workers; see [`Self::join`].
    pub async fn stop(&self) {
        self.shared.request_stop();
        self.stop_services().await;
    }

    /// Wait for both session workers and the supervisor to exit. Idempotent.
    pub async fn join(&self) {
        for session in &self.sessions {
            session.join().await;
        }
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "supervisor ended abnormally");
            }
        }
    }

    pub async fn shutdown(&self) {
        self.stop().await;
        self.join().await;
    }

    pub fn is_alive(&self) -> bool {
        self.shared.should_run.load(Ordering::Acquire)
            && self
                .supervisor
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Release everything the pair holds in the shared node: upgrade
    /// manager, manager registration, scanner, block store, and namespace
    /// storage. Idempotent; failures are logged and swallowed.
    pub fn clean_up(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.should_run.store(false, Ordering::Release);

        if let Some(upgrade) = self.upgrade.lock().clone() {
            upgrade.shutdown();
        }
        if let Some(manager) = self.manager.lock().upgrade() {
            manager.remove_by_key(&self.key);
        }

        let ns = self.shared.namespace_id();
        if !ns.is_set() {
            return;
        }
        let node = &self.shared.node;
        if let Some(scanner) = &node.scanner {
            scanner.remove_namespace(ns);
        }
        node.block_store.remove_namespace(ns);
        if let Err(e) = node.storage.remove_namespace_storage(ns) {
            warn!(namespace_id = *ns, error = %e, "failed to remove namespace storage");
        }
    }

    async fn stop_services(&self) {
        for session in &self.sessions {
            session.stop();
        }
        self.coordinator.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Supervisor
    // -----------------------------------------------------------------------

    async fn supervise(self: Arc<Self>) {
        info!(
            nameservice_id = self.nameservice_id().unwrap_or("<default>"),
            peer0 = %self.sessions[0].endpoint().data_addr(),
            peer1 = %self.sessions[1].endpoint().data_addr(),
            "namespace supervisor starting"
        );
        match self.setup_namespace().await {
            Ok(true) => self.serve_loop().await,
            Ok(false) => {}
            Err(e) => {
                error!(
                    nameservice_id = self.nameservice_id().unwrap_or("<default>"),
                    error = %e,
                    "namespace initialization failed"
                );
            }
        }
        self.stop_services().await;
        for session in &self.sessions {
            session.join().await;
        }
        self.clean_up();
        info!(
            namespace_id = *self.namespace_id(),
            "namespace supervisor finished"
        );
    }

    /// Steps 1-3 of startup: primary discovery, initial handshake, one-time
    /// namespace storage setup. `Ok(false)` means the pair was stopped.
    async fn setup_namespace(&self) -> Result<bool> {
        let info = match self.initial_handshake().await? {
            Some(info) => info,
            None => return Ok(false),
        };
        if !self.shared.should_run() {
            return Ok(false);
        }
        self.setup_storage(&info).await?;
        Ok(true)
    }

    /// Obtain the single namespace info the pair needs before storage setup.
    ///
    /// With a published primary only that session handshakes (a standby may
    /// lag during startup and is not worth waiting on). With no primary
    /// published both peers are tried and their layouts must agree.
    async fn initial_handshake(&self) -> Result<Option<NamespaceInfo>> {
        let mut stop_rx = self.shared.subscribe_stop();
        while self.shared.should_run() {
            let mut first_is_primary = false;
            let mut no_primary = false;
            match self.coordinator.get_primary(&self.shared.default_addr).await {
                Ok(Some(primary)) => {
                    first_is_primary = primary == *self.sessions[0].endpoint().data_addr();
                }
                Ok(None) => no_primary = true,
                Err(e) => {
                    error!(error = %e, "could not get the primary address from the coordinator");
                }
            }

            if no_primary {
                let info0 = self.sessions[0].handshake().await;
                let info1 = self.sessions[1].handshake().await;
                if let (Some(a), Some(b)) = (&info0, &info1) {
                    if a.layout_version != b.layout_version {
                        let message = format!(
                            "layout versions don't match on peers zero, one: {}, {}",
                            a.layout_version, b.layout_version
                        );
                        let proxies = self
                            .sessions
                            .iter()
                            .find_map(|s| s.endpoint().proxies());
                        return Err(self
                            .shared
                            .fail_layout(
                                proxies.as_ref(),
                                a.layout_version,
                                b.layout_version,
                                message,
                            )
                            .await);
                    }
                }
                // Either handshake is good; prefer the later one.
                let (adopted, via) = match (info1, info0) {
                    (Some(info), _) => (info, SessionRole::Second),
                    (None, Some(info)) => (info, SessionRole::First),
                    (None, None) => {
                        self.handshake_pause(&mut stop_rx).await;
                        continue;
                    }
                };
                let proxies = self.sessions[via.index()].endpoint().proxies();
                self.shared
                    .verify_namespace_info(proxies.as_ref(), &adopted)
                    .await?;
                self.shared.set_namespace_info(adopted.clone());
                return Ok(Some(adopted));
            }

            let chosen = if first_is_primary {
                SessionRole::First
            } else {
                SessionRole::Second
            };
            self.sessions[chosen.index()].try_bring_up(true).await?;
            if let Some(info) = self.shared.namespace_info() {
                return Ok(Some(info));
            }
            self.handshake_pause(&mut stop_rx).await;
        }
        Ok(None)
    }

    async fn handshake_pause(&self, stop_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(HANDSHAKE_RETRY_INTERVAL) => {}
            _ = stop_rx.changed() => {}
        }
    }

    /// Exactly-once namespace storage setup, serialised node-wide.
    async fn setup_storage(&self, info: &NamespaceInfo) -> Result<()> {
        if self.shared.storage_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let node = &self.shared.node;
        let _guard = node.storage_setup_lock.lock().await;
        let ns = info.namespace_id;
        let startup = node.settings.startup;
        let nameservice_id = self.shared.nameservice_id.as_deref();

        if node.settings.simulated_storage {
            // Skip disk recovery; the storage identity comes straight from
            // the handshake result.
            node.storage.recover_namespace(info, startup, nameservice_id)?;
            let storage_id = node.storage.storage_id();
            self.shared.update_registration(|reg| {
                reg.storage_id = storage_id;
                reg.storage_info = StorageInfo {
                    layout_version: info.layout_version,
                    namespace_id: ns,
                    creation_time: 0,
                };
            });
        } else {
            node.storage.recover_transition_read(info, startup)?;
            node.storage.recover_namespace(info, startup, nameservice_id)?;
            let storage_info = node.storage.namespace_storage_info(ns)?;
            let storage_id = node.storage.storage_id();
            info!(
                namespace_id = *ns,
                layout_version = storage_info.layout_version,
                "namespace storage set up"
            );
            self.shared.update_registration(|reg| {
                reg.storage_id = storage_id;
                reg.storage_info = storage_info;
            });
        }

        node.block_store
            .add_namespace(ns, &node.storage.namespace_data_dir(ns));
        if let Some(scanner) = &node.scanner {
            scanner.add_namespace(ns);
        }
        self.shared.storage_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Step 4: keep both sessions registered and serving.
    async fn serve_loop(&self) {
        let mut stop_rx = self.shared.subscribe_stop();
        let mut node_rx = self.shared.node.shutdown.subscribe();
        while self.shared.should_run() {
            // Re-acquire live proxies on endpoints flagged for resolution.
            // Each session compares against its own resolution timestamp.
            for session in &self.sessions {
                if session.endpoint().resolve_due() {
                    session.restart().await;
                    session.endpoint().maybe_reresolve().await;
                }
            }

            // Session 1 must be attempted even when session 0 failed.
            let outcomes = [
                self.sessions[0].try_bring_up(false).await,
                self.sessions[1].try_bring_up(false).await,
            ];
            for (session, outcome) in self.sessions.iter().zip(outcomes) {
                if let Err(e) = outcome {
                    error!(role = %session.role(), error = %e, "session bring-up failed");
                }
            }

            if self.shared.storage_ready()
                && self.sessions.iter().any(|s| s.is_registered())
            {
                if !self.shared.initialized.swap(true, Ordering::AcqRel) {
                    info!(namespace_id = *self.namespace_id(), "namespace initialized");
                }
                self.upgrade_manager().start_if_needed();
            }

            if !self.shared.should_run() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(OFFER_RETRY_INTERVAL) => {}
                _ = stop_rx.changed() => {}
                _ = node_rx.changed() => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Block event fan-out
    // -----------------------------------------------------------------------

    /// Both peers learn about received blocks; a newly elected primary may
    /// need either copy of the report.
    pub fn notify_received(&self, block: Block, hint: Option<String>) {
        for session in &self.sessions {
            session.enqueue_received(block, hint.clone());
        }
    }

    pub fn notify_deleted(&self, block: Block) {
        for session in &self.sessions {
            session.enqueue_deleted(block);
        }
    }

    pub fn remove_received_blocks(&self, blocks: &[Block]) {
        for session in &self.sessions {
            session.remove_received_blocks(blocks);
        }
    }

    pub fn report_bad_blocks(&self, blocks: &[Block]) {
        for session in &self.sessions {
            session.report_bad_blocks(blocks);
        }
    }

    pub fn schedule_block_report(&self, delay: std::time::Duration) {
        for session in &self.sessions {
            session.schedule_block_report(delay);
        }
    }

    /// Routed ONLY through the current primary; `None` when no primary is
    /// declared.
    pub async fn sync_block(&self, block: Block) -> Result<Option<SyncedBlock>> {
        let Some(role) = self.shared.primary.get() else {
            return Ok(None);
        };
        match self.sessions[role.index()].sync_block(block).await {
            Some(result) => Ok(Some(result?)),
            None => Ok(None),
        }
    }
}
