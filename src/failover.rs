//! Manager/backup failover (§4.L): node 0 is the manager, node 1 is a
//! warm shadow replica of its directory, lock queues, and barrier
//! state. On manager failure, node 1 promotes itself and announces the
//! new authority with `ManagerPromotion`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::context::Context;
use crate::wire::{BarrierId, LockId, Message, NodeId, PageId};

struct ShadowDirEntry {
    owner: Option<NodeId>,
    sharers: Vec<NodeId>,
}

struct ShadowLockEntry {
    holder: Option<NodeId>,
    queue: Vec<NodeId>,
}

struct ShadowBarrierEntry {
    expected: u32,
    arrived: u32,
    generation: u64,
}

pub struct Failover {
    sync_seq: AtomicU64,
    shadow_dir: Mutex<HashMap<PageId, ShadowDirEntry>>,
    shadow_locks: Mutex<HashMap<LockId, ShadowLockEntry>>,
    shadow_barriers: Mutex<HashMap<BarrierId, ShadowBarrierEntry>>,
    promoted: AtomicBool,
}

impl Default for Failover {
    fn default() -> Self {
        Self::new()
    }
}

impl Failover {
    pub fn new() -> Self {
        Failover {
            sync_seq: AtomicU64::new(0),
            shadow_dir: Mutex::new(HashMap::new()),
            shadow_locks: Mutex::new(HashMap::new()),
            shadow_barriers: Mutex::new(HashMap::new()),
            promoted: AtomicBool::new(false),
        }
    }
}

impl Context {
    pub(crate) fn backup_node(&self) -> NodeId {
        1
    }

    /// Best-effort: a dropped `StateSync*` send just means the backup's
    /// shadow state is one update stale, tolerated per Open Question
    /// §9.5 ("tolerate retry" is the accepted behaviour for replication
    /// gaps, same as for in-flight lock requests during promotion).
    pub(crate) fn replicate_dir(&self, page_id: PageId, owner: Option<NodeId>, sharers: Vec<NodeId>) {
        if self.self_id != self.effective_manager() || self.self_id == self.backup_node() {
            return;
        }
        let seq = self.failover.sync_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.transport.send_to(self.backup_node(), &Message::StateSyncDir { sync_seq: seq, page_id, owner, sharers });
    }

    pub(crate) fn replicate_lock(&self, lock_id: LockId, holder: Option<NodeId>, queue: Vec<NodeId>) {
        if self.self_id != self.effective_manager() || self.self_id == self.backup_node() {
            return;
        }
        let seq = self.failover.sync_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.transport.send_to(self.backup_node(), &Message::StateSyncLock { sync_seq: seq, lock_id, holder, queue });
    }

    pub(crate) fn replicate_barrier(&self, barrier_id: BarrierId, expected: u32, arrived: u32, generation: u64) {
        if self.self_id != self.effective_manager() || self.self_id == self.backup_node() {
            return;
        }
        let seq = self.failover.sync_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.transport.send_to(
            self.backup_node(),
            &Message::StateSyncBarrier { sync_seq: seq, barrier_id, expected, arrived, generation },
        );
    }

    pub(crate) fn handle_state_sync_dir(&self, _sync_seq: u64, page_id: PageId, owner: Option<NodeId>, sharers: Vec<NodeId>) {
        self.failover.shadow_dir.lock().unwrap().insert(page_id, ShadowDirEntry { owner, sharers });
    }

    pub(crate) fn handle_state_sync_lock(&self, _sync_seq: u64, lock_id: LockId, holder: Option<NodeId>, queue: Vec<NodeId>) {
        self.failover.shadow_locks.lock().unwrap().insert(lock_id, ShadowLockEntry { holder, queue });
    }

    pub(crate) fn handle_state_sync_barrier(&self, _sync_seq: u64, barrier_id: BarrierId, expected: u32, arrived: u32, generation: u64) {
        self.failover.shadow_barriers.lock().unwrap().insert(barrier_id, ShadowBarrierEntry { expected, arrived, generation });
    }

    pub(crate) fn handle_state_sync_node(&self, _sync_seq: u64, node_id: NodeId, is_failed: bool) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(info) = nodes.get_mut(&node_id) {
            info.is_failed = is_failed;
        }
    }

    pub(crate) fn handle_node_failed(&self, failed_node: NodeId) {
        self.directory.handle_node_failure(failed_node);
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(info) = nodes.get_mut(&failed_node) {
            info.is_failed = true;
            info.connected = false;
        }
        drop(nodes);
        if failed_node == self.effective_manager() {
            self.maybe_promote();
        }
    }

    /// Guarded by `promotion_lock` so a flurry of missed heartbeats
    /// can't double-promote (split brain).
    pub(crate) fn maybe_promote(&self) {
        if !self.config.is_backup() {
            return;
        }
        let _guard = self.promotion_lock.lock().unwrap();
        if self.failover.promoted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!("manager presumed dead, promoting self to manager");
        for (page_id, shadow) in self.failover.shadow_dir.lock().unwrap().iter() {
            if let Some(owner) = shadow.owner {
                self.directory.set_owner(*page_id, owner);
            }
            for sharer in &shadow.sharers {
                let _ = self.directory.add_reader(*page_id, *sharer);
            }
        }
        for (lock_id, shadow) in self.failover.shadow_locks.lock().unwrap().iter() {
            self.lock_manager.rehydrate_queue(*lock_id, shadow.queue.iter().copied().collect());
        }
        for (barrier_id, shadow) in self.failover.shadow_barriers.lock().unwrap().iter() {
            self.barrier.rehydrate(*barrier_id, shadow.expected, shadow.arrived, shadow.generation);
        }
        self.effective_manager.store(self.self_id, Ordering::Release);
        if let Err(e) = self.transport.begin_listening() {
            tracing::error!(error = %e, "promoted backup failed to begin listening on the manager port");
        }
        let promotion_time =
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        // Reaches whoever happens to already hold a connection to us (none,
        // in the common star topology — workers only ever dial node 0).
        // The real recovery path is `redial_new_manager`, below, which a
        // worker drives itself off its own heartbeat-timeout detection.
        self.transport.broadcast(
            &Message::ManagerPromotion { new_manager: self.self_id, old_manager: 0, promotion_time },
            None,
        );
    }

    /// A non-backup node's reaction to the manager's failure: dial the
    /// known backup address directly instead of waiting for a
    /// `ManagerPromotion` broadcast it has no connection to receive
    /// (spec.md:181's star topology leaves workers connected only to
    /// node 0). Safe to call repeatedly; a no-op once already connected.
    pub(crate) fn redial_new_manager(&self, new_manager: NodeId) {
        if self.transport.is_connected(new_manager) {
            self.effective_manager.store(new_manager, Ordering::Release);
            return;
        }
        let host = if new_manager == self.backup_node() { &self.config.backup_host } else { &self.config.manager_host };
        match self.transport.connect_to_peer(host, self.config.manager_port, new_manager, "worker") {
            Ok(()) => {
                tracing::warn!(new_manager, "redialed newly promoted manager");
                self.effective_manager.store(new_manager, Ordering::Release);
            }
            Err(e) => {
                tracing::warn!(new_manager, error = %e, "failed to redial newly promoted manager, will retry next heartbeat tick")
            }
        }
    }

    pub(crate) fn handle_manager_promotion(&self, new_manager: NodeId, old_manager: NodeId, _promotion_time: u64) {
        tracing::warn!(new_manager, old_manager, "manager promotion observed");
        self.effective_manager.store(new_manager, Ordering::Release);
        if new_manager != self.self_id {
            self.redial_new_manager(new_manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::context::test_support::bring_up;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn backup_promotes_itself_when_manager_is_marked_failed() {
        let port = 19831;
        let manager = bring_up(Config {
            node_id: 0,
            port,
            bind_host: "127.0.0.1".into(),
            manager_port: port,
            num_nodes: 2,
            is_manager: true,
            ..Config::default()
        });
        let backup = bring_up(Config {
            node_id: 1,
            port: 0,
            bind_host: "127.0.0.2".into(),
            manager_port: port,
            num_nodes: 2,
            is_manager: false,
            ..Config::default()
        });
        thread::sleep(Duration::from_millis(150));

        backup.handle_node_failed(0);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(backup.effective_manager(), 1);
        assert!(backup.failover.promoted.load(std::sync::atomic::Ordering::Acquire));

        manager.shutdown();
        backup.shutdown();
    }

    #[test]
    fn backup_keeps_a_live_shadow_of_lock_state_and_grants_after_promotion() {
        let port = 19861;
        let manager = bring_up(Config {
            node_id: 0,
            port,
            bind_host: "127.0.0.1".into(),
            manager_port: port,
            num_nodes: 2,
            is_manager: true,
            ..Config::default()
        });
        let backup = bring_up(Config {
            node_id: 1,
            port: 0,
            bind_host: "127.0.0.2".into(),
            manager_port: port,
            num_nodes: 2,
            is_manager: false,
            ..Config::default()
        });
        thread::sleep(Duration::from_millis(150));

        // The manager queues node 2 behind node 0's grant and replicates
        // both the grant and the queued waiter to the backup, same as it
        // would for a real remote requester.
        manager.handle_lock_request(42, 0);
        manager.handle_lock_request(42, 2);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(backup.failover.shadow_locks.lock().unwrap().get(&42).unwrap().holder, Some(0));
        assert_eq!(backup.failover.shadow_locks.lock().unwrap().get(&42).unwrap().queue, vec![0, 2]);

        // The manager dies before releasing; the backup promotes and
        // must now be able to service lock traffic on its own account
        // using only what it learned via StateSyncLock.
        backup.handle_node_failed(0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(backup.effective_manager(), 1);

        backup.handle_lock_release(42, 0);
        assert_eq!(
            backup.lock_manager.queue_front(42),
            Some(2),
            "node 2 is next in line on the promoted manager's own queue"
        );

        manager.shutdown();
        backup.shutdown();
    }
}
