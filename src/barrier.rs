//! Sense-reversing centralized barrier, authoritative at
//! [`Context::effective_manager`] (§4.K).
//!
//! Ordering rule: the manager bumps `generation` *before* resetting
//! `arrived` back to zero and broadcasting `BarrierRelease`, so a
//! waiter that wakes from the generation change never observes a
//! half-reset counter for the next round.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{DsmError, Result};
use crate::wire::{BarrierId, Message};

struct ManagerBarrierState {
    arrived: u32,
    expected: u32,
}

pub struct BarrierManager {
    manager_state: Mutex<HashMap<BarrierId, ManagerBarrierState>>,
    generation: Mutex<HashMap<BarrierId, u64>>,
    cv: Condvar,
}

impl Default for BarrierManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierManager {
    pub fn new() -> Self {
        BarrierManager { manager_state: Mutex::new(HashMap::new()), generation: Mutex::new(HashMap::new()), cv: Condvar::new() }
    }

    /// Restores manager-side arrival counts and generation from a
    /// backup's shadow copy at promotion time (§4.L).
    pub(crate) fn rehydrate(&self, barrier_id: BarrierId, expected: u32, arrived: u32, generation: u64) {
        self.manager_state.lock().unwrap().insert(barrier_id, ManagerBarrierState { arrived, expected });
        self.generation.lock().unwrap().insert(barrier_id, generation);
    }
}

impl Context {
    pub fn barrier_wait(&self, barrier_id: BarrierId, num_participants: u32, timeout: Duration) -> Result<()> {
        let start_gen = {
            let g = self.barrier.generation.lock().unwrap();
            *g.get(&barrier_id).unwrap_or(&0)
        };

        let manager = self.effective_manager();
        if manager == self.self_id {
            self.handle_barrier_arrive(barrier_id, self.self_id, num_participants);
        } else {
            self.transport.send_to(
                manager,
                &Message::BarrierArrive { barrier_id, arriver: self.self_id, num_participants },
            )?;
        }

        let mut g = self.barrier.generation.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while *g.get(&barrier_id).unwrap_or(&0) == start_gen {
            let now = Instant::now();
            if now >= deadline {
                return Err(DsmError::timeout("barrier wait", timeout.as_millis() as u64));
            }
            let (guard, result) = self.barrier.cv.wait_timeout(g, deadline - now).unwrap();
            g = guard;
            if result.timed_out() && *g.get(&barrier_id).unwrap_or(&0) == start_gen {
                return Err(DsmError::timeout("barrier wait", timeout.as_millis() as u64));
            }
        }
        self.stats.barrier_waits(1);
        Ok(())
    }

    pub(crate) fn handle_barrier_arrive(&self, barrier_id: BarrierId, _arriver: u32, num_participants: u32) {
        let (released, arrived_snapshot) = {
            let mut ms = self.barrier.manager_state.lock().unwrap();
            let st = ms.entry(barrier_id).or_insert(ManagerBarrierState { arrived: 0, expected: num_participants });
            st.expected = num_participants;
            st.arrived += 1;
            if st.arrived >= st.expected {
                st.arrived = 0;
                (true, 0)
            } else {
                (false, st.arrived)
            }
        };
        let generation = {
            let mut g = self.barrier.generation.lock().unwrap();
            if released {
                *g.entry(barrier_id).or_insert(0) += 1;
            }
            *g.get(&barrier_id).unwrap_or(&0)
        };
        self.replicate_barrier(barrier_id, num_participants, arrived_snapshot, generation);
        if released {
            self.transport.broadcast(&Message::BarrierRelease { barrier_id, num_arrived: num_participants }, None);
            self.barrier.cv.notify_all();
        }
    }

    pub(crate) fn handle_barrier_release(&self, barrier_id: BarrierId, _num_arrived: u32) {
        let mut g = self.barrier.generation.lock().unwrap();
        *g.entry(barrier_id).or_insert(0) += 1;
        drop(g);
        self.barrier.cv.notify_all();
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
    fn three_nodes_release_together() {
        let port = 19821;
        let manager = bring_up(Config { node_id: 0, port, manager_port: port, num_nodes: 3, is_manager: true, ..Config::default() });
        let w1 = bring_up(Config { node_id: 1, port: 0, manager_port: port, num_nodes: 3, is_manager: false, ..Config::default() });
        let w2 = bring_up(Config { node_id: 2, port: 0, manager_port: port, num_nodes: 3, is_manager: false, ..Config::default() });
        thread::sleep(Duration::from_millis(200));

        let handles: Vec<_> = [Arc::clone(&manager), Arc::clone(&w1), Arc::clone(&w2)]
            .into_iter()
            .map(|ctx| thread::spawn(move || ctx.barrier_wait(1, 3, Duration::from_secs(2))))
            .collect();

        for h in handles {
            h.join().unwrap().expect("every participant is released once all three arrive");
        }

        manager.shutdown();
        w1.shutdown();
        w2.shutdown();
    }

    #[test]
    fn four_nodes_release_together_and_can_run_a_second_round() {
        let port = 19851;
        let manager = bring_up(Config { node_id: 0, port, manager_port: port, num_nodes: 4, is_manager: true, ..Config::default() });
        let w1 = bring_up(Config { node_id: 1, port: 0, manager_port: port, num_nodes: 4, is_manager: false, ..Config::default() });
        let w2 = bring_up(Config { node_id: 2, port: 0, manager_port: port, num_nodes: 4, is_manager: false, ..Config::default() });
        let w3 = bring_up(Config { node_id: 3, port: 0, manager_port: port, num_nodes: 4, is_manager: false, ..Config::default() });
        thread::sleep(Duration::from_millis(200));

        let nodes = [Arc::clone(&manager), Arc::clone(&w1), Arc::clone(&w2), Arc::clone(&w3)];
        for round in 0..2 {
            let handles: Vec<_> = nodes
                .iter()
                .cloned()
                .map(|ctx| thread::spawn(move || ctx.barrier_wait(7, 4, Duration::from_secs(2))))
                .collect();
            for h in handles {
                h.join().unwrap().unwrap_or_else(|e| panic!("round {round} failed: {e}"));
            }
        }

        manager.shutdown();
        w1.shutdown();
        w2.shutdown();
        w3.shutdown();
    }
}
