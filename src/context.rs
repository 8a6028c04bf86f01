//! `Context` — the per-node singleton every public API call and every
//! inbound message is dispatched through. Owns the page tables, the
//! directory, the node table, and the lock/barrier/failover state.
//!
//! Lock order, enforced by convention rather than the type system:
//! `context_lock -> table_lock -> entry_lock` (§5). `context_lock`
//! guards `tables`/`nodes`/allocation bookkeeping; `table_lock` and
//! `entry_lock` are internal to [`crate::page::PageTable`] and
//! [`crate::page::PageEntry`] respectively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::directory::Directory;
use crate::error::Result;
use crate::page::PageTable;
use crate::stats::Stats;
use crate::transport::{Handler, NodeInfo, Transport};
use crate::wire::{Message, NodeId, PageId};

use crate::barrier::BarrierManager;
use crate::failover::Failover;
use crate::lock_manager::LockManager;

pub struct Context {
    pub config: Config,
    pub self_id: NodeId,
    pub transport: Arc<Transport>,
    pub directory: Directory,
    pub stats: Arc<Stats>,
    pub nodes: Mutex<HashMap<NodeId, NodeInfo>>,

    pub(crate) tables: RwLock<Vec<Arc<PageTable>>>,
    pub(crate) context_lock: Mutex<()>,
    pub(crate) allocation_lock: Mutex<()>,
    pub(crate) next_slot: AtomicU32,
    #[allow(clippy::type_complexity)]
    pub(crate) pending_allocs: Mutex<HashMap<(PageId, PageId), Arc<Mutex<std::collections::HashSet<NodeId>>>>>,

    pub lock_manager: LockManager,
    pub barrier: BarrierManager,
    pub failover: Failover,
    pub(crate) promotion_lock: Mutex<()>,
    pub(crate) effective_manager: AtomicU32,

    running: AtomicBool,
}

impl Context {
    pub fn new(config: Config, stats: Arc<Stats>) -> Arc<Self> {
        let self_id = config.node_id;
        let transport = Transport::new(self_id, Arc::clone(&stats));
        Arc::new(Context {
            self_id,
            transport,
            directory: Directory::new(),
            stats,
            nodes: Mutex::new(HashMap::new()),
            tables: RwLock::new(Vec::new()),
            context_lock: Mutex::new(()),
            allocation_lock: Mutex::new(()),
            next_slot: AtomicU32::new(0),
            pending_allocs: Mutex::new(HashMap::new()),
            lock_manager: LockManager::new(),
            barrier: BarrierManager::new(),
            failover: Failover::new(),
            promotion_lock: Mutex::new(()),
            effective_manager: AtomicU32::new(0),
            running: AtomicBool::new(true),
            config,
        })
    }

    /// Brings up networking and the fault handler. Workers block here
    /// until their connection to the manager is accepted. Node 1 (the
    /// backup) additionally pre-binds the manager's port so it can
    /// start servicing it on promotion with no bind race (spec.md:181).
    pub fn init(self: &Arc<Self>) -> Result<()> {
        self.transport.set_handler(Arc::clone(self) as Arc<dyn Handler>);
        if self.config.is_manager {
            self.transport.listen(&self.config.bind_host, self.config.port)?;
        } else {
            if self.config.is_backup() {
                self.transport.prebind(&self.config.bind_host, self.config.manager_port)?;
            }
            self.transport.connect_to_manager(&self.config.manager_host, self.config.manager_port, "worker")?;
        }
        self.transport.spawn_dispatcher()?;
        let hb_ctx = Arc::clone(self);
        self.transport.spawn_heartbeat(std::time::Duration::from_millis(self.config.heartbeat_interval_ms), move || {
            hb_ctx.heartbeat_tick()
        })?;
        crate::fault::install(self)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.transport.shutdown();
    }

    pub fn effective_manager(&self) -> NodeId {
        self.effective_manager.load(Ordering::Acquire)
    }

    /// Looks up the live (not yet `free`d) page table covering `addr`.
    /// Exposed beyond `pub(crate)` so the multi-node integration tests
    /// under `tests/` — which bring up several `Context`s in one process
    /// via `test_support::bring_up` and so can't rely on the real,
    /// process-wide SIGSEGV handler (`fault.rs`'s `GLOBAL_CONTEXT` only
    /// ever holds one `Context`) — can drive `fetch_for_read`/
    /// `fetch_for_write` directly instead of touching memory and
    /// crashing the test process.
    pub fn table_for_addr(&self, addr: usize) -> Option<Arc<PageTable>> {
        self.tables.read().unwrap().iter().find(|t| t.contains_addr(addr) && !t.is_unlinked()).cloned()
    }

    pub(crate) fn table_and_index_for_page(&self, page_id: PageId) -> Option<(Arc<PageTable>, usize)> {
        let tables = self.tables.read().unwrap();
        for t in tables.iter() {
            if t.contains_page_id(page_id) {
                return Some((Arc::clone(t), (page_id - t.start_page_id) as usize));
            }
        }
        None
    }

    /// Runs on the heartbeat thread: ages every known peer, marks any
    /// that crossed `heartbeat_timeout_missed` as failed, and lets the
    /// backup notice a dead manager.
    pub(crate) fn heartbeat_tick(&self) {
        let mut newly_failed = Vec::new();
        {
            let mut nodes = self.nodes.lock().unwrap();
            for (id, info) in nodes.iter_mut() {
                if info.is_failed {
                    continue;
                }
                info.missed_heartbeats += 1;
                if info.missed_heartbeats >= self.config.heartbeat_timeout_missed {
                    info.is_failed = true;
                    info.connected = false;
                    newly_failed.push(*id);
                }
            }
        }
        for failed in newly_failed {
            tracing::warn!(node_id = failed, "node presumed failed (missed heartbeats)");
            self.directory.handle_node_failure(failed);
            if self.self_id == self.effective_manager() {
                self.transport.broadcast(&Message::NodeFailed { failed_node: failed }, None);
            }
            if failed == 0 {
                if self.config.is_backup() {
                    self.maybe_promote();
                } else {
                    // A worker has no standing connection to the backup to
                    // learn of its promotion over (star topology), so it
                    // redials the known backup address itself rather than
                    // waiting on a broadcast that can never reach it.
                    self.redial_new_manager(self.backup_node());
                }
            }
        }
    }

    fn register_node(&self, id: NodeId, hostname: String, port: u16) {
        let mut nodes = self.nodes.lock().unwrap();
        let info = nodes.entry(id).or_insert_with(|| NodeInfo::new(id, hostname.clone(), port));
        info.hostname = hostname;
        info.port = port;
        info.connected = true;
        info.missed_heartbeats = 0;
        info.is_failed = false;
    }

    fn note_heartbeat(&self, id: NodeId) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(info) = nodes.get_mut(&id) {
            info.last_heartbeat = Some(std::time::Instant::now());
            info.missed_heartbeats = 0;
            info.connected = true;
        }
    }
}

impl Handler for Context {
    fn on_message(&self, sender: NodeId, msg: Message) {
        match msg {
            Message::PageRequest { page_id, access, requester } => self.handle_page_request(page_id, access, requester),
            Message::PageReply { page_id, version, access, data } => self.handle_page_reply(page_id, version, access, data),
            Message::Invalidate { page_id, new_owner, version } => self.handle_invalidate(sender, page_id, new_owner, version),
            Message::InvalidateAck { page_id, acker } => self.handle_invalidate_ack(page_id, acker),
            Message::LockRequest { lock_id, node } => self.handle_lock_request(lock_id, node),
            Message::LockGrant { lock_id, node } => self.handle_lock_grant(lock_id, node),
            Message::LockRelease { lock_id, node } => self.handle_lock_release(lock_id, node),
            Message::BarrierArrive { barrier_id, arriver, num_participants } => {
                self.handle_barrier_arrive(barrier_id, arriver, num_participants)
            }
            Message::BarrierRelease { barrier_id, num_arrived } => self.handle_barrier_release(barrier_id, num_arrived),
            Message::AllocNotify { start_page_id, end_page_id, owner, num_pages, base_addr, total_size } => {
                self.handle_alloc_notify(start_page_id, end_page_id, owner, num_pages, base_addr, total_size)
            }
            Message::AllocAck { start, end, acker } => self.handle_alloc_ack(start, end, acker),
            Message::NodeJoin { node_id, hostname, port } => self.register_node(node_id, hostname, port),
            Message::NodeLeave { node_id } => {
                let mut nodes = self.nodes.lock().unwrap();
                if let Some(info) = nodes.get_mut(&node_id) {
                    info.connected = false;
                }
            }
            Message::Heartbeat => {
                self.note_heartbeat(sender);
                let _ = self.transport.send_to(
                    sender,
                    &Message::HeartbeatAck {
                        acker: self.self_id,
                        timestamp: std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0),
                    },
                );
            }
            Message::HeartbeatAck { acker, .. } => self.note_heartbeat(acker),
            Message::DirQuery { page_id, requester } => {
                let owner = self.directory.lookup_owner(page_id);
                let _ = self.transport.send_to(requester, &Message::DirReply { page_id, owner });
            }
            Message::DirReply { page_id, owner } => self.handle_dir_reply(page_id, owner),
            Message::OwnerUpdate { page_id, new_owner } => {
                if let Some((table, idx)) = self.table_and_index_for_page(page_id) {
                    table.entries[idx].set_owner(new_owner);
                }
            }
            Message::NodeFailed { failed_node } => self.handle_node_failed(failed_node),
            Message::SharerQuery { page_id, requester } => {
                let sharers = self.directory.get_sharers(page_id);
                let _ = self.transport.send_to(requester, &Message::SharerReply { page_id, sharers });
            }
            Message::SharerReply { .. } => {}
            Message::StateSyncDir { sync_seq, page_id, owner, sharers } => {
                self.handle_state_sync_dir(sync_seq, page_id, owner, sharers)
            }
            Message::StateSyncLock { sync_seq, lock_id, holder, queue } => {
                self.handle_state_sync_lock(sync_seq, lock_id, holder, queue)
            }
            Message::StateSyncBarrier { sync_seq, barrier_id, expected, arrived, generation } => {
                self.handle_state_sync_barrier(sync_seq, barrier_id, expected, arrived, generation)
            }
            Message::StateSyncNode { sync_seq, node_id, is_failed } => {
                self.handle_state_sync_node(sync_seq, node_id, is_failed)
            }
            Message::ManagerPromotion { new_manager, old_manager, promotion_time } => {
                self.handle_manager_promotion(new_manager, old_manager, promotion_time)
            }
            Message::ReconnectRequest { requester_id, last_seq_seen } => {
                tracing::info!(requester_id, last_seq_seen, "reconnect request noted, no replay log kept");
            }
            Message::Error { error_code, page_id, message } => self.handle_error(page_id, error_code, message),
        }
    }

    fn on_peer_closed(&self, peer: Option<NodeId>) {
        if let Some(id) = peer {
            tracing::warn!(node_id = id, "peer connection closed");
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(info) = nodes.get_mut(&id) {
                info.connected = false;
            }
        }
    }
}

/// Multi-node test harness. Exposed publicly behind the `test-support`
/// feature (rather than `#[cfg(test)]` alone) so the black-box tests
/// under `tests/` — a separate crate that links the non-test build of
/// this library — can bring up several `Context`s in one process; see
/// `Cargo.toml`'s `[dev-dependencies]` self-reference that enables it.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::Context;
    use crate::config::Config;
    use crate::stats::Stats;
    use crate::transport::Handler;
    use std::sync::Arc;
    use std::time::Duration;

    /// Brings up a `Context`'s networking without installing the
    /// process-wide SIGSEGV handler, so several instances can coexist
    /// in one test binary (one per simulated cluster node). Mirrors
    /// `Context::init`'s connection setup exactly (including the
    /// backup's pre-bind of the manager's port) so promotion behaves
    /// the same way under test as it does for a real node.
    pub fn bring_up(config: Config) -> Arc<Context> {
        let is_manager = config.is_manager;
        let is_backup = config.is_backup();
        let bind_host = config.bind_host.clone();
        let port = config.port;
        let manager_host = config.manager_host.clone();
        let manager_port = config.manager_port;
        let ctx = Context::new(config, Arc::new(Stats::new()));
        ctx.transport.set_handler(Arc::clone(&ctx) as Arc<dyn Handler>);
        if is_manager {
            ctx.transport.listen(&bind_host, port).unwrap();
            std::thread::sleep(Duration::from_millis(30));
        } else {
            if is_backup {
                ctx.transport.prebind(&bind_host, manager_port).unwrap();
            }
            ctx.transport.connect_to_manager(&manager_host, manager_port, "worker").unwrap();
        }
        ctx.transport.spawn_dispatcher().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        ctx
    }
}
