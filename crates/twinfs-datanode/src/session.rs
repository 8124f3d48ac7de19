//! One long-lived data-node <-> metadata-server session.
//!
//! A session walks IDLE -> CONNECTED -> (HANDSHAKEN) -> REGISTERED ->
//! SERVING and back to IDLE on stop or error. The two sessions of a pair
//! are fully independent workers; nothing here blocks on the sibling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twinfs_net::{NetError, NetResult};
use twinfs_proto::{Block, NamespaceInfo, RemoteError, SyncedBlock};

use crate::endpoint::{Endpoint, Proxies};
use crate::offer::{OfferContext, OfferService};
use crate::service_pair::PairState;
use crate::{DataNodeError, Result, DATA_TRANSFER_VERSION, HANDSHAKE_RETRY_INTERVAL};

/// Which of the pair's two metadata servers this session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    First,
    Second,
}

impl SessionRole {
    pub fn index(self) -> usize {
        match self {
            SessionRole::First => 0,
            SessionRole::Second => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SessionRole::First),
            1 => Some(SessionRole::Second),
            _ => None,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.index())
    }
}

/// Externally observable session state, derived from the live flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Registered,
    Serving,
}

pub struct Session {
    role: SessionRole,
    endpoint: Arc<Endpoint>,
    pair: Arc<PairState>,
    registered: AtomicBool,
    offer: Mutex<Option<Arc<dyn OfferService>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(role: SessionRole, endpoint: Endpoint, pair: Arc<PairState>) -> Arc<Self> {
        Arc::new(Self {
            role,
            endpoint: Arc::new(endpoint),
            pair,
            registered: AtomicBool::new(false),
            offer: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// SERVING: registered with a live offer worker.
    pub fn is_serving(&self) -> bool {
        self.is_registered()
            && self
                .offer
                .lock()
                .as_ref()
                .is_some_and(|offer| offer.is_running())
    }

    pub fn state(&self) -> SessionState {
        if self.is_serving() {
            SessionState::Serving
        } else if self.is_registered() {
            SessionState::Registered
        } else if self.endpoint.proxies().is_some() {
            SessionState::Connected
        } else {
            SessionState::Idle
        }
    }

    // -----------------------------------------------------------------------
    // Bring-up
    // -----------------------------------------------------------------------

    /// Walk toward SERVING. Idempotent: returns `Ok(true)` immediately when
    /// already serving.
    ///
    /// Retryable failures (unreachable peers, timeouts) come back as
    /// `Ok(false)` after flagging the endpoint where called for; only
    /// conditions that end the pair or the node surface as errors. With
    /// `startup` set, the session also runs the handshake when the pair has
    /// no namespace info yet. Registration waits until the pair's namespace
    /// storage is ready.
    pub(crate) async fn try_bring_up(&self, startup: bool) -> Result<bool> {
        if !self.pair.should_run() {
            return Ok(false);
        }
        if self.is_serving() {
            return Ok(true);
        }

        let proxies = match self.endpoint.ensure_proxies().await {
            Ok(proxies) => proxies,
            Err(e) => {
                info!(role = %self.role, peer = %self.endpoint.data_addr(), error = %e,
                      "metadata server not reachable yet");
                return Ok(false);
            }
        };

        if startup && self.pair.namespace_info().is_none() {
            match self.handshake_with(&proxies).await {
                Some(info) => {
                    self.pair
                        .verify_namespace_info(Some(&proxies), &info)
                        .await?;
                    self.pair.set_namespace_info(info);
                }
                None => return Ok(false),
            }
        }

        if !self.pair.storage_ready() {
            return Ok(false);
        }
        self.register_if_needed(&proxies).await
    }

    /// Run the version-exchange handshake against this session's peer.
    ///
    /// `None` means a retryable failure, already classified (the endpoint is
    /// flagged for re-resolution where warranted) and logged. Verification
    /// of the result against the local build is the pair's job.
    pub(crate) async fn handshake(&self) -> Option<NamespaceInfo> {
        let proxies = match self.endpoint.ensure_proxies().await {
            Ok(proxies) => proxies,
            Err(e) => {
                info!(role = %self.role, peer = %self.endpoint.data_addr(), error = %e,
                      "metadata server not reachable yet");
                return None;
            }
        };
        self.handshake_with(&proxies).await
    }

    async fn handshake_with(&self, proxies: &Proxies) -> Option<NamespaceInfo> {
        let mut stop_rx = self.pair.subscribe_stop();
        loop {
            if !self.pair.should_run() {
                return None;
            }
            match proxies.data.version_request().await {
                Ok(info) => return Some(info),
                Err(e) if e.is_timeout() => {
                    info!(role = %self.role, peer = %self.endpoint.data_addr(),
                          "handshake timed out, peer busy");
                    tokio::select! {
                        _ = tokio::time::sleep(HANDSHAKE_RETRY_INTERVAL) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
                Err(e) => {
                    if e.needs_resolve() {
                        self.endpoint.mark_needs_resolve();
                    }
                    info!(role = %self.role, peer = %self.endpoint.data_addr(), error = %e,
                          "handshake failed");
                    return None;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    async fn register_if_needed(&self, proxies: &Proxies) -> Result<bool> {
        if self.is_registered() {
            if !self.is_serving() {
                // The offer worker died underneath a live registration.
                self.spawn_offer(proxies.clone()).await;
            }
            return Ok(true);
        }

        let request = self.pair.registration();
        let returned = match proxies.data.register(request, DATA_TRANSFER_VERSION).await {
            Ok(returned) => returned,
            Err(e) if e.is_timeout() => {
                info!(role = %self.role, peer = %self.endpoint.data_addr(),
                      "register timed out, peer busy");
                return Ok(false);
            }
            Err(NetError::Remote(remote)) => {
                return self.handle_remote_error(remote).map(|()| false);
            }
            Err(e) => {
                if e.needs_resolve() {
                    self.endpoint.mark_needs_resolve();
                }
                info!(role = %self.role, peer = %self.endpoint.data_addr(), error = %e,
                      "register failed");
                return Ok(false);
            }
        };

        self.adopt_registration(returned)?;
        self.spawn_offer(proxies.clone()).await;
        info!(role = %self.role, peer = %self.endpoint.data_addr(), "session serving");
        Ok(true)
    }

    /// First successful register in either session fixes the pair's
    /// registration; later ones must agree on the storage id.
    fn adopt_registration(&self, returned: twinfs_proto::DatanodeRegistration) -> Result<()> {
        let storage = &self.pair.node.storage;
        let local_id = storage.storage_id();
        if local_id.is_empty() {
            storage.set_storage_id(&returned.storage_id);
            storage.write_all()?;
            info!(
                storage_id = %returned.storage_id,
                node = %returned.name,
                "new storage id assigned to data node"
            );
        } else if local_id != returned.storage_id {
            let err = DataNodeError::InconsistentStorage {
                returned: returned.storage_id.clone(),
                expected: local_id,
            };
            error!(role = %self.role, "{err}");
            self.pair.request_stop();
            return Err(err);
        }
        self.pair.adopt_registration(returned);
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    /// Remote errors of the unregistered/disallowed/incorrect-version
    /// classes take the whole data node down; anything else is retried.
    fn handle_remote_error(&self, remote: RemoteError) -> Result<()> {
        if remote.is_fatal() {
            warn!(role = %self.role, error = %remote, "data node is shutting down");
            self.pair.node.shutdown.request_fatal(&remote.to_string());
            Err(NetError::Remote(remote).into())
        } else {
            warn!(role = %self.role, error = %remote, "metadata server rejected call");
            Ok(())
        }
    }

    async fn spawn_offer(&self, proxies: Proxies) {
        let offer = self.pair.node.offer_factory.create(OfferContext {
            role: self.role,
            data: proxies.data,
            admin: proxies.admin,
            registration: self.pair.registration(),
            primary: self.pair.primary_handle(),
        });
        *self.offer.lock() = Some(offer.clone());
        let handle = tokio::spawn(offer.run());
        *self.worker.lock().await = Some(handle);
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Leave SERVING: signal the offer worker, drop the proxies, clear the
    /// registered flag. Non-blocking and idempotent.
    pub fn stop(&self) {
        self.registered.store(false, Ordering::Release);
        if let Some(offer) = self.offer.lock().take() {
            offer.stop();
        }
        self.endpoint.close_proxies();
        debug!(role = %self.role, peer = %self.endpoint.data_addr(), "session stopped");
    }

    /// Wait for the offer worker to exit. Idempotent.
    pub async fn join(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(role = %self.role, error = %e, "offer worker ended abnormally");
            }
        }
    }

    /// Stop, wait for the worker, and become eligible for bring-up on the
    /// supervisor's next tick.
    pub async fn restart(&self) {
        self.stop();
        self.join().await;
    }

    // -----------------------------------------------------------------------
    // Event delivery
    // -----------------------------------------------------------------------

    fn offer(&self) -> Option<Arc<dyn OfferService>> {
        self.offer.lock().clone()
    }

    /// Deliver to the offer worker if running; silently drop if not. The
    /// offer subsystem replays pending state on re-registration.
    pub fn enqueue_received(&self, block: Block, hint: Option<String>) {
        if let Some(offer) = self.offer() {
            offer.enqueue_received(block, hint);
        }
    }

    pub fn enqueue_deleted(&self, block: Block) {
        if let Some(offer) = self.offer() {
            offer.enqueue_deleted(block);
        }
    }

    pub fn remove_received_blocks(&self, blocks: &[Block]) {
        if let Some(offer) = self.offer() {
            offer.remove_received_blocks(blocks);
        }
    }

    pub fn report_bad_blocks(&self, blocks: &[Block]) {
        if let Some(offer) = self.offer() {
            offer.report_bad_blocks(blocks);
        }
    }

    pub fn schedule_block_report(&self, delay: std::time::Duration) {
        if let Some(offer) = self.offer() {
            offer.schedule_block_report(delay);
        }
    }

    /// `None` when this session has no running offer worker.
    pub async fn sync_block(&self, block: Block) -> Option<NetResult<SyncedBlock>> {
        let offer = self.offer()?;
        if !offer.is_running() {
            return None;
        }
        Some(offer.sync_block(block).await)
    }
}
