//! Contract between the namespace service manager and the offer-service
//! loop.
//!
//! The offer service is the long-lived exchange of heartbeats, block
//! reports, and commands with one metadata server. The manager does not care
//! how that loop works; it only needs the operations below: event delivery,
//! block sync through the primary, and stop. Sessions obtain instances
//! through an [`OfferServiceFactory`] once their register RPC has succeeded,
//! so no event can reach an offer service before registration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};
use twinfs_net::{AdminProtocol, DataProtocol, NetResult};
use twinfs_proto::{Block, DatanodeRegistration, SyncedBlock};

use crate::service_pair::PrimaryHandle;
use crate::session::SessionRole;

/// How often the worker probes the peer for its primary status.
pub const PRIMARY_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Everything a freshly registered session hands to its offer service.
pub struct OfferContext {
    pub role: SessionRole,
    pub data: Arc<dyn DataProtocol>,
    pub admin: Arc<dyn AdminProtocol>,
    pub registration: DatanodeRegistration,
    /// The pair's primary slot; the offer loop writes it when it observes an
    /// authoritative primary signal from its peer.
    pub primary: PrimaryHandle,
}

/// One session's offer-service loop, as seen by the namespace service
/// manager.
///
/// Enqueue operations on a worker that is not running are silently dropped;
/// the offer subsystem replays pending state to the peer when the session
/// re-registers.
#[async_trait]
pub trait OfferService: Send + Sync {
    /// Worker body. Returns once [`OfferService::stop`] has been called.
    async fn run(self: Arc<Self>);

    fn is_running(&self) -> bool;

    fn enqueue_received(&self, block: Block, hint: Option<String>);

    fn enqueue_deleted(&self, block: Block);

    /// Purge locally deleted blocks from the pending received/retry queues.
    fn remove_received_blocks(&self, blocks: &[Block]);

    fn report_bad_blocks(&self, blocks: &[Block]);

    fn schedule_block_report(&self, delay: Duration);

    /// Recovery-sync a block through this session's peer. Callers must only
    /// invoke this on the primary session.
    async fn sync_block(&self, block: Block) -> NetResult<SyncedBlock>;

    /// Signal the worker to exit. Non-blocking, idempotent.
    fn stop(&self);
}

/// Creates one offer service per successful registration.
pub trait OfferServiceFactory: Send + Sync {
    fn create(&self, ctx: OfferContext) -> Arc<dyn OfferService>;
}

impl<F> OfferServiceFactory for F
where
    F: Fn(OfferContext) -> Arc<dyn OfferService> + Send + Sync,
{
    fn create(&self, ctx: OfferContext) -> Arc<dyn OfferService> {
        self(ctx)
    }
}

// ---------------------------------------------------------------------------
// Buffered implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingEvent {
    Received { block: Block, hint: Option<String> },
    Deleted { block: Block },
    BadBlocks { blocks: Vec<Block> },
}

/// Minimal conforming offer service.
///
/// Buffers block events for the heartbeat exchange and keeps the pair's
/// primary slot in sync by probing the peer's admin protocol. The actual
/// heartbeat/command traffic lives outside the namespace service manager.
pub struct BufferedOfferService {
    role: SessionRole,
    admin: Arc<dyn AdminProtocol>,
    registration: DatanodeRegistration,
    primary: PrimaryHandle,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    pending: Mutex<VecDeque<PendingEvent>>,
    report_delay: Mutex<Option<Duration>>,
}

impl BufferedOfferService {
    pub fn new(ctx: OfferContext) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            role: ctx.role,
            admin: ctx.admin,
            registration: ctx.registration,
            primary: ctx.primary,
            running: AtomicBool::new(false),
            stop_tx,
            pending: Mutex::new(VecDeque::new()),
            report_delay: Mutex::new(None),
        })
    }

    /// Pending events, oldest first. Test hook.
    pub fn pending(&self) -> Vec<PendingEvent> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn scheduled_report_delay(&self) -> Option<Duration> {
        *self.report_delay.lock()
    }

    async fn poll_primary(&self) {
        match self.admin.primary_status(&self.registration).await {
            Ok(true) => self.primary.set(Some(self.role)),
            Ok(false) => {
                // Our peer stopped being primary; leave the slot empty until
                // some peer claims it again.
                if self.primary.is(self.role) {
                    self.primary.set(None);
                }
            }
            Err(e) => trace!(role = %self.role, error = %e, "primary probe failed"),
        }
    }

    fn push(&self, event: PendingEvent) {
        if !self.is_running() {
            trace!(role = %self.role, "offer worker not running, dropping event");
            return;
        }
        self.pending.lock().push_back(event);
    }
}

#[async_trait]
impl OfferService for BufferedOfferService {
    async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::Release);
        debug!(role = %self.role, "offer worker started");
        let mut stop_rx = self.stop_tx.subscribe();
        while !*stop_rx.borrow_and_update() {
            self.poll_primary().await;
            tokio::select! {
                _ = tokio::time::sleep(PRIMARY_POLL_INTERVAL) => {}
                _ = stop_rx.changed() => {}
            }
        }
        self.running.store(false, Ordering::Release);
        debug!(role = %self.role, "offer worker stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn enqueue_received(&self, block: Block, hint: Option<String>) {
        self.push(PendingEvent::Received { block, hint });
    }

    fn enqueue_deleted(&self, block: Block) {
        self.push(PendingEvent::Deleted { block });
    }

    fn remove_received_blocks(&self, blocks: &[Block]) {
        self.pending.lock().retain(|event| match event {
            PendingEvent::Received { block, .. } => !blocks.contains(block),
            _ => true,
        });
    }

    fn report_bad_blocks(&self, blocks: &[Block]) {
        self.push(PendingEvent::BadBlocks {
            blocks: blocks.to_vec(),
        });
    }

    fn schedule_block_report(&self, delay: Duration) {
        *self.report_delay.lock() = Some(delay);
    }

    async fn sync_block(&self, block: Block) -> NetResult<SyncedBlock> {
        let locations = self.admin.sync_block(block).await?;
        Ok(SyncedBlock { block, locations })
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.running.store(false, Ordering::Release);
    }
}

/// Factory for [`BufferedOfferService`].
#[derive(Default)]
pub struct BufferedOfferFactory;

impl OfferServiceFactory for BufferedOfferFactory {
    fn create(&self, ctx: OfferContext) -> Arc<dyn OfferService> {
        BufferedOfferService::new(ctx)
    }
}
