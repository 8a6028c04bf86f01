//! SVAS allocation (§4.F): a node reserves address space locally,
//! broadcasts it to every connected peer, and waits (bounded by
//! `alloc_ack_timeout_ms`) for every peer to mirror the reservation
//! before handing the address back to the caller.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{DsmError, Result};
use crate::page::{PageState, PageTable, MAX_ALLOCATIONS, PAGE_ID_NODE_STRIDE};
use crate::permission::{self, Protection};
use crate::wire::{Message, NodeId};
use crate::PAGE_SIZE;

impl Context {
    /// Reserves `size` bytes of SVAS, owned initially by this node.
    pub fn malloc(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(DsmError::Invalid("malloc(0) is not meaningful".into()));
        }
        let _g = self.allocation_lock.lock().unwrap();
        let slot = self.next_slot.fetch_add(1, Ordering::AcqRel);
        if slot as usize >= MAX_ALLOCATIONS {
            self.next_slot.fetch_sub(1, Ordering::AcqRel);
            return Err(DsmError::Memory(format!(
                "node {} has exhausted its {MAX_ALLOCATIONS} allocation slots",
                self.self_id
            )));
        }
        let num_pages = size.div_ceil(PAGE_SIZE);
        let total_size = num_pages * PAGE_SIZE;
        let start_page_id =
            self.self_id as u64 * PAGE_ID_NODE_STRIDE + slot as u64 * crate::page::PAGE_ID_SLOT_STRIDE;

        let base_addr = permission::reserve(total_size)?;
        let table = match PageTable::new(base_addr, total_size, start_page_id, self.self_id) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                let _ = permission::unreserve(base_addr, total_size);
                return Err(e);
            }
        };
        for entry in &table.entries {
            self.directory.set_owner(entry.id, self.self_id);
        }

        let peers = self.transport.connected_peers();
        if !peers.is_empty() {
            let tracker = Arc::new(std::sync::Mutex::new(HashSet::<NodeId>::new()));
            let key = (start_page_id, table.end_page_id());
            self.pending_allocs.lock().unwrap().insert(key, Arc::clone(&tracker));

            self.transport.broadcast(
                &Message::AllocNotify {
                    start_page_id,
                    end_page_id: table.end_page_id(),
                    owner: self.self_id,
                    num_pages: num_pages as u32,
                    base_addr: base_addr as u64,
                    total_size: total_size as u64,
                },
                None,
            );

            let deadline = Instant::now() + Duration::from_millis(self.config.alloc_ack_timeout_ms);
            loop {
                if tracker.lock().unwrap().len() >= peers.len() {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(
                        start_page_id,
                        acked = tracker.lock().unwrap().len(),
                        expected = peers.len(),
                        "alloc ack timeout, proceeding with unacked peers"
                    );
                    self.stats.timeouts(1);
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            self.pending_allocs.lock().unwrap().remove(&key);
        }

        permission::set_protection(Some(&table), base_addr, Protection::ReadWrite)?;
        for e in &table.entries {
            e.set_state(PageState::ReadWrite);
        }
        self.stats.alloc_count(1);
        self.tables.write().unwrap().push(table);
        Ok(base_addr)
    }

    /// Unmaps and forgets an allocation this node owns a table for.
    /// `dsm_free` is local-only: there is no cluster-wide free
    /// broadcast in the wire protocol, so peers keep their mirrored
    /// `PROT_NONE` mapping until their own table entries fault or the
    /// process exits (§4.F step 2, §1 Non-goals: no garbage collector).
    pub fn free(&self, addr: usize) -> Result<()> {
        let table =
            self.table_for_addr(addr).ok_or_else(|| DsmError::NotFound(format!("no allocation owns address {addr:#x}")))?;
        table.mark_unlinked();
        self.directory.remove_range(table.start_page_id, table.end_page_id());
        permission::unreserve(table.base_addr, table.total_size)?;
        self.tables.write().unwrap().retain(|t| !Arc::ptr_eq(t, &table));
        self.stats.free_count(1);
        Ok(())
    }

    /// Returns the `base_addr` of the `slot`-th page table this node
    /// knows about (local or mirrored via `AllocNotify`), in the order
    /// allocations were made — the hook other nodes' apps use to find
    /// node A's `k`-th allocation after the broadcast round-trips
    /// (§4.F, §8 scenario "every node returns the same base_addr from
    /// get_allocation(k)").
    pub fn get_allocation(&self, slot: usize) -> Option<usize> {
        self.tables.read().unwrap().get(slot).map(|t| t.base_addr)
    }

    pub(crate) fn handle_alloc_notify(
        &self,
        start_page_id: u64,
        end_page_id: u64,
        owner: NodeId,
        _num_pages: u32,
        base_addr: u64,
        total_size: u64,
    ) {
        match permission::reserve_at(base_addr as usize, total_size as usize) {
            Ok(_) => match PageTable::new(base_addr as usize, total_size as usize, start_page_id, owner) {
                Ok(table) => {
                    for e in &table.entries {
                        self.directory.set_owner(e.id, owner);
                    }
                    self.tables.write().unwrap().push(Arc::new(table));
                }
                Err(e) => tracing::error!(error = %e, "rejecting malformed AllocNotify"),
            },
            Err(e) => tracing::error!(error = %e, base_addr, total_size, "failed to mirror remote allocation"),
        }
        let _ = self.transport.send_to(owner, &Message::AllocAck { start: start_page_id, end: end_page_id, acker: self.self_id });
    }

    pub(crate) fn handle_alloc_ack(&self, start: u64, end: u64, acker: NodeId) {
        if let Some(tracker) = self.pending_allocs.lock().unwrap().get(&(start, end)) {
            tracker.lock().unwrap().insert(acker);
        }
    }
}
