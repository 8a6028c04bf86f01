//! Centralized FIFO distributed lock manager, authoritative at
//! [`Context::effective_manager`] (§4.J).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{DsmError, Result};
use crate::wire::{LockId, Message, NodeId};

pub struct LockManager {
    /// Manager-side only: queue of waiting nodes per lock, front holds it.
    queues: Mutex<HashMap<LockId, VecDeque<NodeId>>>,
    /// Requester-side: which locks this node has been granted.
    granted: Mutex<HashMap<LockId, bool>>,
    /// Ids registered via `lock_create`, so a duplicate create is
    /// rejected instead of silently reusing someone else's lock.
    created: Mutex<HashSet<LockId>>,
    cv: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            queues: Mutex::new(HashMap::new()),
            granted: Mutex::new(HashMap::new()),
            created: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }
    }

    /// Registers `id` as a live lock, returning `false` if it was
    /// already registered (spec.md:221's `lock_create(id) -> null`).
    pub(crate) fn try_create(&self, id: LockId) -> bool {
        self.created.lock().unwrap().insert(id)
    }

    /// Restores a manager-side queue from a backup's shadow copy at
    /// promotion time (§4.L), so a newly promoted manager's view of
    /// who's waiting matches what the dead manager last replicated.
    pub(crate) fn rehydrate_queue(&self, lock_id: LockId, queue: VecDeque<NodeId>) {
        self.queues.lock().unwrap().insert(lock_id, queue);
    }

    /// Whoever's at the front of `lock_id`'s manager-side queue, if any.
    pub(crate) fn queue_front(&self, lock_id: LockId) -> Option<NodeId> {
        self.queues.lock().unwrap().get(&lock_id).and_then(|q| q.front().copied())
    }
}

impl Context {
    /// Registers `id` as a lock handle (spec.md:221). Fails if `id` was
    /// already created by this node — there is no cluster-wide create
    /// broadcast, so two nodes agreeing on a lock still need to pick the
    /// id out of band (a well-known constant, or one side telling the
    /// other).
    pub fn lock_create(&self, id: LockId) -> Result<LockId> {
        if self.lock_manager.try_create(id) {
            Ok(id)
        } else {
            Err(DsmError::Invalid(format!("lock {id} already created")))
        }
    }

    pub fn lock_acquire(&self, lock_id: LockId, timeout: Duration) -> Result<()> {
        {
            let mut granted = self.lock_manager.granted.lock().unwrap();
            granted.insert(lock_id, false);
        }
        let manager = self.effective_manager();
        if manager == self.self_id {
            self.handle_lock_request(lock_id, self.self_id);
        } else {
            self.transport.send_to(manager, &Message::LockRequest { lock_id, node: self.self_id })?;
        }

        let mut granted = self.lock_manager.granted.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while !*granted.get(&lock_id).unwrap_or(&false) {
            let now = Instant::now();
            if now >= deadline {
                return Err(DsmError::timeout("lock acquire", timeout.as_millis() as u64));
            }
            let (guard, result) = self.lock_manager.cv.wait_timeout(granted, deadline - now).unwrap();
            granted = guard;
            if result.timed_out() && !*granted.get(&lock_id).unwrap_or(&false) {
                return Err(DsmError::timeout("lock acquire", timeout.as_millis() as u64));
            }
        }
        self.stats.lock_acquisitions(1);
        Ok(())
    }

    pub fn lock_release(&self, lock_id: LockId) -> Result<()> {
        self.lock_manager.granted.lock().unwrap().remove(&lock_id);
        let manager = self.effective_manager();
        if manager == self.self_id {
            self.handle_lock_release(lock_id, self.self_id);
            Ok(())
        } else {
            self.transport.send_to(manager, &Message::LockRelease { lock_id, node: self.self_id })
        }
    }

    pub(crate) fn handle_lock_request(&self, lock_id: LockId, node: NodeId) {
        let mut queues = self.lock_manager.queues.lock().unwrap();
        let q = queues.entry(lock_id).or_default();
        let was_empty = q.is_empty();
        q.push_back(node);
        let snapshot: Vec<NodeId> = q.iter().copied().collect();
        drop(queues);
        self.replicate_lock(lock_id, snapshot.first().copied(), snapshot);
        if was_empty {
            self.grant(lock_id, node);
        }
    }

    pub(crate) fn handle_lock_release(&self, lock_id: LockId, node: NodeId) {
        let mut queues = self.lock_manager.queues.lock().unwrap();
        let next = if let Some(q) = queues.get_mut(&lock_id) {
            if q.front() == Some(&node) {
                q.pop_front();
            } else {
                q.retain(|n| *n != node);
            }
            q.front().copied()
        } else {
            None
        };
        let snapshot: Vec<NodeId> = queues.get(&lock_id).map(|q| q.iter().copied().collect()).unwrap_or_default();
        drop(queues);
        self.replicate_lock(lock_id, next, snapshot);
        if let Some(next) = next {
            self.grant(lock_id, next);
        }
    }

    pub(crate) fn handle_lock_grant(&self, lock_id: LockId, node: NodeId) {
        if node != self.self_id {
            return;
        }
        let mut granted = self.lock_manager.granted.lock().unwrap();
        granted.insert(lock_id, true);
        drop(granted);
        self.lock_manager.cv.notify_all();
    }

    fn grant(&self, lock_id: LockId, node: NodeId) {
        if node == self.self_id {
            self.handle_lock_grant(lock_id, node);
        } else {
            let _ = self.transport.send_to(node, &Message::LockGrant { lock_id, node });
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::context::test_support::bring_up;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn worker_queues_behind_the_manager_and_is_granted_in_order() {
        let port = 19811;
        let manager = bring_up(Config { node_id: 0, port, manager_port: port, num_nodes: 2, is_manager: true, ..Config::default() });
        let worker = bring_up(Config { node_id: 1, port: 0, manager_port: port, num_nodes: 2, is_manager: false, ..Config::default() });
        thread::sleep(Duration::from_millis(150));

        manager.lock_acquire(1, Duration::from_secs(2)).unwrap();

        let worker_clone = Arc::clone(&worker);
        let waiter = thread::spawn(move || worker_clone.lock_acquire(1, Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished(), "worker must block while the manager holds the lock");

        manager.lock_release(1).unwrap();
        waiter.join().unwrap().expect("worker is granted once the manager releases");
        worker.lock_release(1).unwrap();

        manager.shutdown();
        worker.shutdown();
    }
}
