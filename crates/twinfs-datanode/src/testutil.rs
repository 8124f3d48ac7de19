//! Shared test doubles for the namespace service manager.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use twinfs_coordinator::{Coordinator, InMemoryCoordinator};
use twinfs_net::{
    AddressResolver, AdminProtocol, DataProtocol, NetError, NetResult, ProtocolConnector,
};
use twinfs_proto::{
    Block, DatanodeRegistration, ErrorSeverity, NamespaceInfo, RemoteError,
};
use twinfs_types::{HostPort, NamespaceId};

use crate::node::NodeContext;
use crate::offer::{BufferedOfferService, OfferContext, OfferService, OfferServiceFactory};
use crate::session::SessionRole;
use crate::settings::{NamespaceConfig, Settings, StartupOption};
use crate::storage::{BlockStore, Scanner, SimulatedStorage};
use crate::LOCAL_LAYOUT_VERSION;

pub(crate) fn hp(s: &str) -> HostPort {
    s.parse().unwrap()
}

pub(crate) fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub(crate) fn ns_info(id: u32) -> NamespaceInfo {
    NamespaceInfo {
        namespace_id: NamespaceId(id),
        layout_version: LOCAL_LAYOUT_VERSION,
        build_version: crate::BUILD_VERSION.to_string(),
    }
}

/// Poll `f` under virtual time until it holds.
pub(crate) async fn wait_until(what: &str, f: impl Fn() -> bool) {
    for _ in 0..3000 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached: {what}");
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Table-driven resolver; unknown names fail like NXDOMAIN.
#[derive(Default)]
pub(crate) struct TableResolver {
    table: Mutex<HashMap<HostPort, SocketAddr>>,
}

impl TableResolver {
    pub fn set(&self, addr: &str, resolved: SocketAddr) {
        self.table.lock().insert(hp(addr), resolved);
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

#[async_trait]
impl AddressResolver for TableResolver {
    async fn resolve(&self, addr: &HostPort) -> NetResult<SocketAddr> {
        self.table
            .lock()
            .get(addr)
            .copied()
            .ok_or_else(|| NetError::UnknownHost(addr.host().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Protocol mocks
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum RegisterBehavior {
    /// Echo the request with this storage id filled in.
    Success { storage_id: String },
    Timeout,
    Remote(RemoteError),
}

#[derive(Debug)]
pub(crate) struct MockDataProtocol {
    version: Mutex<Option<NamespaceInfo>>,
    version_errors: Mutex<VecDeque<NetError>>,
    register: Mutex<RegisterBehavior>,
    pub register_calls: AtomicUsize,
    pub error_reports: Mutex<Vec<(ErrorSeverity, String)>>,
}

impl Default for MockDataProtocol {
    fn default() -> Self {
        Self {
            version: Mutex::new(None),
            version_errors: Mutex::new(VecDeque::new()),
            register: Mutex::new(RegisterBehavior::Success {
                storage_id: "DS-1".into(),
            }),
            register_calls: AtomicUsize::new(0),
            error_reports: Mutex::new(Vec::new()),
        }
    }
}

impl MockDataProtocol {
    pub fn with_namespace(info: NamespaceInfo) -> Arc<Self> {
        let mock = Self::default();
        *mock.version.lock() = Some(info);
        Arc::new(mock)
    }

    /// Queue an error to be returned by the next version_request calls.
    pub fn push_version_error(&self, err: NetError) {
        self.version_errors.lock().push_back(err);
    }

    pub fn set_register(&self, behavior: RegisterBehavior) {
        *self.register.lock() = behavior;
    }

    pub fn error_report_count(&self) -> usize {
        self.error_reports.lock().len()
    }
}

#[async_trait]
impl DataProtocol for MockDataProtocol {
    async fn version_request(&self) -> NetResult<NamespaceInfo> {
        if let Some(err) = self.version_errors.lock().pop_front() {
            return Err(err);
        }
        match self.version.lock().clone() {
            Some(info) => Ok(info),
            None => Err(NetError::ConnectionClosed),
        }
    }

    async fn register(
        &self,
        registration: DatanodeRegistration,
        _transfer_protocol_version: u32,
    ) -> NetResult<DatanodeRegistration> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        match &*self.register.lock() {
            RegisterBehavior::Success { storage_id } => {
                let mut returned = registration;
                returned.storage_id = storage_id.clone();
                Ok(returned)
            }
            RegisterBehavior::Timeout => Err(NetError::Timeout),
            RegisterBehavior::Remote(remote) => Err(NetError::Remote(remote.clone())),
        }
    }

    async fn error_report(
        &self,
        _registration: &DatanodeRegistration,
        severity: ErrorSeverity,
        message: &str,
    ) -> NetResult<()> {
        self.error_reports
            .lock()
            .push((severity, message.to_string()));
        Ok(())
    }
}

#[derive(Default, Debug)]
pub(crate) struct MockAdminProtocol {
    primary: Mutex<bool>,
    sync_locations: Mutex<Vec<String>>,
    pub sync_calls: AtomicUsize,
}

impl MockAdminProtocol {
    pub fn set_primary_answer(&self, primary: bool) {
        *self.primary.lock() = primary;
    }

    pub fn set_sync_locations(&self, locations: Vec<String>) {
        *self.sync_locations.lock() = locations;
    }
}

#[async_trait]
impl AdminProtocol for MockAdminProtocol {
    async fn primary_status(&self, _registration: &DatanodeRegistration) -> NetResult<bool> {
        Ok(*self.primary.lock())
    }

    async fn sync_block(&self, _block: Block) -> NetResult<Vec<String>> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sync_locations.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

type FailureFn = Box<dyn Fn() -> NetError + Send + Sync>;

/// Routes dials to registered mocks; dials can be made to fail per address.
#[derive(Default)]
pub(crate) struct MockConnector {
    data: Mutex<HashMap<SocketAddr, Arc<MockDataProtocol>>>,
    admin: Mutex<HashMap<SocketAddr, Arc<MockAdminProtocol>>>,
    data_failures: Mutex<HashMap<SocketAddr, FailureFn>>,
    admin_failures: Mutex<HashMap<SocketAddr, FailureFn>>,
}

impl MockConnector {
    pub fn serve_data(&self, addr: SocketAddr, mock: Arc<MockDataProtocol>) {
        self.data.lock().insert(addr, mock);
    }

    pub fn serve_admin(&self, addr: SocketAddr, mock: Arc<MockAdminProtocol>) {
        self.admin.lock().insert(addr, mock);
    }

    pub fn fail_data(
        &self,
        addr: SocketAddr,
        failure: impl Fn() -> NetError + Send + Sync + 'static,
    ) {
        self.data_failures.lock().insert(addr, Box::new(failure));
    }

    pub fn fail_admin(
        &self,
        addr: SocketAddr,
        failure: impl Fn() -> NetError + Send + Sync + 'static,
    ) {
        self.admin_failures.lock().insert(addr, Box::new(failure));
    }

    pub fn clear_data_failure(&self, addr: SocketAddr) {
        self.data_failures.lock().remove(&addr);
    }
}

#[async_trait]
impl ProtocolConnector for MockConnector {
    async fn connect_data(&self, addr: SocketAddr) -> NetResult<Arc<dyn DataProtocol>> {
        if let Some(failure) = self.data_failures.lock().get(&addr) {
            return Err(failure());
        }
        let mock = self
            .data
            .lock()
            .entry(addr)
            .or_insert_with(|| Arc::new(MockDataProtocol::default()))
            .clone();
        Ok(mock)
    }

    async fn connect_admin(&self, addr: SocketAddr) -> NetResult<Arc<dyn AdminProtocol>> {
        if let Some(failure) = self.admin_failures.lock().get(&addr) {
            return Err(failure());
        }
        let mock = self
            .admin
            .lock()
            .entry(addr)
            .or_insert_with(|| Arc::new(MockAdminProtocol::default()))
            .clone();
        Ok(mock)
    }
}

// ---------------------------------------------------------------------------
// Storage fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingBlockStore {
    pub added: Mutex<Vec<NamespaceId>>,
    pub removed: Mutex<Vec<NamespaceId>>,
}

impl BlockStore for RecordingBlockStore {
    fn add_namespace(&self, ns: NamespaceId, _dir: &Path) {
        self.added.lock().push(ns);
    }

    fn remove_namespace(&self, ns: NamespaceId) {
        self.removed.lock().push(ns);
    }
}

#[derive(Default)]
pub(crate) struct RecordingScanner {
    pub added: Mutex<Vec<NamespaceId>>,
    pub removed: Mutex<Vec<NamespaceId>>,
}

impl Scanner for RecordingScanner {
    fn add_namespace(&self, ns: NamespaceId) {
        self.added.lock().push(ns);
    }

    fn remove_namespace(&self, ns: NamespaceId) {
        self.removed.lock().push(ns);
    }
}

// ---------------------------------------------------------------------------
// Offer factory
// ---------------------------------------------------------------------------

/// Builds real buffered offer services and keeps handles for inspection.
#[derive(Default)]
pub(crate) struct CapturingOfferFactory {
    pub created: Mutex<Vec<(SessionRole, Arc<BufferedOfferService>)>>,
}

impl CapturingOfferFactory {
    pub fn offers_for(&self, role: SessionRole) -> Vec<Arc<BufferedOfferService>> {
        self.created
            .lock()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, offer)| offer.clone())
            .collect()
    }

    pub fn latest_for(&self, role: SessionRole) -> Option<Arc<BufferedOfferService>> {
        self.offers_for(role).pop()
    }
}

impl OfferServiceFactory for CapturingOfferFactory {
    fn create(&self, ctx: OfferContext) -> Arc<dyn OfferService> {
        let role = ctx.role;
        let offer = BufferedOfferService::new(ctx);
        self.created.lock().push((role, offer.clone()));
        offer
    }
}

// ---------------------------------------------------------------------------
// Cluster harness
// ---------------------------------------------------------------------------

pub(crate) fn test_settings() -> Settings {
    Settings {
        node_name: "dn1:50010".into(),
        info_port: 50075,
        ipc_port: 50020,
        namespaces: Vec::new(),
        data_dirs: vec![PathBuf::from("/unused")],
        simulated_storage: true,
        startup: StartupOption::Regular,
        coordinator_seed: Vec::new(),
    }
}

pub(crate) fn ns_conf(nameservice_id: Option<&str>, d0: &str, d1: &str) -> NamespaceConfig {
    let data0 = hp(d0);
    let data1 = hp(d1);
    NamespaceConfig {
        nameservice_id: nameservice_id.map(str::to_string),
        admin_addr: [
            data0.with_port(data0.port() + 1),
            data1.with_port(data1.port() + 1),
        ],
        data_addr: [data0.clone(), data1],
        default_addr: data0,
    }
}

/// One mocked metadata server: its data and admin proxies.
pub(crate) struct MockPeer {
    pub data: Arc<MockDataProtocol>,
    pub admin: Arc<MockAdminProtocol>,
}

/// A full mocked deployment around one [`NodeContext`].
pub(crate) struct TestCluster {
    pub connector: Arc<MockConnector>,
    pub resolver: Arc<TableResolver>,
    pub coordinator: InMemoryCoordinator,
    pub storage: Arc<SimulatedStorage>,
    pub block_store: Arc<RecordingBlockStore>,
    pub scanner: Arc<RecordingScanner>,
    pub offers: Arc<CapturingOfferFactory>,
    pub ctx: Arc<NodeContext>,
}

impl TestCluster {
    pub fn new(settings: Settings) -> Self {
        let connector = Arc::new(MockConnector::default());
        let resolver = Arc::new(TableResolver::default());
        let coordinator = InMemoryCoordinator::new();
        let storage = Arc::new(SimulatedStorage::new());
        let block_store = Arc::new(RecordingBlockStore::default());
        let scanner = Arc::new(RecordingScanner::default());
        let offers = Arc::new(CapturingOfferFactory::default());

        let coordinator_proto = coordinator.clone();
        let ctx = NodeContext::new(
            settings,
            storage.clone(),
            block_store.clone(),
            Some(scanner.clone()),
            connector.clone(),
            resolver.clone(),
            offers.clone(),
            Arc::new(move || Arc::new(coordinator_proto.clone()) as Arc<dyn Coordinator>),
        );
        Self {
            connector,
            resolver,
            coordinator,
            storage,
            block_store,
            scanner,
            offers,
            ctx,
        }
    }

    /// Stand up a mocked metadata server at `addr`, resolving to `resolved`.
    pub fn add_peer(&self, addr: &str, resolved: &str, info: NamespaceInfo) -> MockPeer {
        let data_addr = hp(addr);
        let admin_addr = data_addr.with_port(data_addr.port() + 1);
        let data_sock = sock(resolved);
        let admin_sock = SocketAddr::new(data_sock.ip(), data_addr.port() + 1);

        self.resolver.set(addr, data_sock);
        self.resolver
            .set(&admin_addr.to_string(), admin_sock);

        let data = MockDataProtocol::with_namespace(info);
        let admin = Arc::new(MockAdminProtocol::default());
        self.connector.serve_data(data_sock, data.clone());
        self.connector.serve_admin(admin_sock, admin.clone());
        MockPeer { data, admin }
    }
}
