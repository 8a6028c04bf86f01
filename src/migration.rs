//! The SWMR page-coherence engine (§4.H): fault-driven `fetch_for_read`
//! / `fetch_for_write`, and the peer-side handlers that service another
//! node's fetch.
//!
//! Ownership is tracked two ways: each [`crate::page::PageEntry`] keeps
//! a locally cached `owner` hint (updated on every `PageReply` and
//! `OwnerUpdate`), and the directory (authoritative at
//! [`Context::effective_manager`]) is the fallback consulted via
//! `DirQuery` when the cached hint turns out stale. A stale-owner reply
//! comes back as `Error(Invalid)`, which is retried once after
//! resolving through the directory.

use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::error::{DsmError, ErrorKind, Result};
use crate::page::{PageEntry, PageState, PageTable};
use crate::permission::{self, Protection};
use crate::wire::{Access, Message, NodeId, PageId};
use crate::PAGE_SIZE;

impl Context {
    /// Installs read access for `entry`, fetching the page from its
    /// owner if it isn't already mapped.
    pub fn fetch_for_read(&self, table: &Arc<PageTable>, entry: &PageEntry) -> Result<()> {
        self.fetch(table, entry, Access::Read, self.config.read_fetch_timeout_ms)
    }

    /// Installs write access for `entry`: fetches (if needed) and, if
    /// this node already owns the page, invalidates any sharers first.
    pub fn fetch_for_write(&self, table: &Arc<PageTable>, entry: &PageEntry) -> Result<()> {
        self.fetch(table, entry, Access::Write, self.config.write_fetch_timeout_ms)
    }

    /// At most 3 rounds: a transient failure (stale cached owner,
    /// dropped send) re-resolves the owner through the directory and
    /// retries once more before giving up.
    fn fetch(&self, table: &Arc<PageTable>, entry: &PageEntry, access: Access, timeout_ms: u64) -> Result<()> {
        for attempt in 0..3 {
            if entry.try_begin_fetch() {
                let owner = entry.owner();
                if owner == self.self_id {
                    let outcome = self.satisfy_fetch_locally(table, entry, access);
                    entry.complete_fetch(outcome.as_ref().map(|_| ()).map_err(|e| e.kind()));
                    match outcome {
                        Ok(()) => return Ok(()),
                        Err(e) if e.kind().is_transient() && attempt < 2 => {
                            self.stats.retries(1);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if let Err(e) = self.transport.send_to(owner, &Message::PageRequest { page_id: entry.id, access, requester: self.self_id }) {
                    entry.complete_fetch(Err(ErrorKind::Network));
                    if attempt < 2 {
                        self.stats.retries(1);
                        self.resolve_owner_via_directory(entry.id);
                        continue;
                    }
                    return Err(e);
                }
                // The send succeeded; completion now happens
                // asynchronously when the dispatcher thread decodes the
                // PageReply/Error and calls `entry.complete_fetch`. Join
                // the wait below like any other thread would.
            }
            match entry.wait_for_fetch(Duration::from_millis(timeout_ms)) {
                Some(Ok(())) => return Ok(()),
                Some(Err(kind)) if kind.is_transient() && attempt < 2 => {
                    self.stats.retries(1);
                    self.resolve_owner_via_directory(entry.id);
                    continue;
                }
                Some(Err(kind)) => return Err(kind.into()),
                None => {
                    if self.owner_presumed_failed(entry.owner()) {
                        return self.reclaim_after_owner_failure(table, entry, access);
                    }
                    self.stats.timeouts(1);
                    return Err(DsmError::timeout("page fetch", timeout_ms));
                }
            }
        }
        Err(DsmError::timeout("page fetch", timeout_ms))
    }

    fn owner_presumed_failed(&self, owner: NodeId) -> bool {
        self.nodes.lock().unwrap().get(&owner).map(|info| info.is_failed).unwrap_or(false)
    }

    /// A fetch that timed out against an owner the heartbeat thread has
    /// already marked failed (§4.H step 5/7): the page is gone with it,
    /// so this node reclaims ownership locally, zeroes the page, and
    /// maps it at the access level the caller originally asked for
    /// instead of surfacing a timeout the caller can't do anything
    /// about.
    fn reclaim_after_owner_failure(&self, table: &Arc<PageTable>, entry: &PageEntry, access: Access) -> Result<()> {
        self.directory.reclaim_ownership(entry.id, self.self_id);
        permission::set_protection(Some(table), entry.local_addr, Protection::ReadWrite)?;
        unsafe {
            std::ptr::write_bytes(entry.local_addr as *mut u8, 0, PAGE_SIZE);
        }
        let (prot, state) =
            if access == Access::Write { (Protection::ReadWrite, PageState::ReadWrite) } else { (Protection::Read, PageState::ReadOnly) };
        if prot != Protection::ReadWrite {
            permission::set_protection(Some(table), entry.local_addr, prot)?;
        }
        entry.set_state_owner_version(state, self.self_id, entry.version() + 1);
        entry.complete_fetch(Ok(()));
        Ok(())
    }

    fn satisfy_fetch_locally(&self, table: &Arc<PageTable>, entry: &PageEntry, access: Access) -> Result<()> {
        if access == Access::Write {
            let sharers = self.directory.get_sharers(entry.id);
            self.invalidate_sharers(entry.id, &sharers);
            permission::set_protection(Some(table), entry.local_addr, Protection::ReadWrite)?;
            entry.set_state(PageState::ReadWrite);
        } else {
            permission::set_protection(Some(table), entry.local_addr, Protection::Read)?;
            entry.set_state(PageState::ReadOnly);
        }
        Ok(())
    }

    fn resolve_owner_via_directory(&self, page_id: PageId) {
        let manager = self.effective_manager();
        if manager == self.self_id {
            if let Some((table, idx)) = self.table_and_index_for_page(page_id) {
                table.entries[idx].set_owner(self.directory.lookup_owner(page_id).unwrap_or(self.self_id));
            }
        } else {
            let _ = self.transport.send_to(manager, &Message::DirQuery { page_id, requester: self.self_id });
        }
    }

    pub(crate) fn handle_dir_reply(&self, page_id: PageId, owner: Option<NodeId>) {
        if let (Some(owner), Some((table, idx))) = (owner, self.table_and_index_for_page(page_id)) {
            table.entries[idx].set_owner(owner);
        }
    }

    fn invalidate_sharers(&self, page_id: PageId, sharers: &[NodeId]) {
        let others: Vec<NodeId> = sharers.iter().copied().filter(|n| *n != self.self_id).collect();
        if others.is_empty() {
            return;
        }
        if let Some((table, idx)) = self.table_and_index_for_page(page_id) {
            let entry = &table.entries[idx];
            let version = entry.version() + 1;
            entry.begin_invalidation(others.len() as i32);
            for node in &others {
                self.stats.invalidations_sent(1);
                if self
                    .transport
                    .send_to(*node, &Message::Invalidate { page_id, new_owner: self.self_id, version })
                    .is_err()
                {
                    entry.ack_invalidation();
                }
            }
            entry.wait_for_invalidation_acks(Duration::from_millis(self.config.write_fetch_timeout_ms));
            self.directory.clear_sharers(page_id);
        }
    }

    /// Services a `PageRequest` received as the current owner (per the
    /// locally-cached view of ownership; a stale cache produces an
    /// `Error(Invalid)` reply that sends the requester back to the
    /// directory).
    pub(crate) fn handle_page_request(&self, page_id: PageId, access: Access, requester: NodeId) {
        let Some((table, idx)) = self.table_and_index_for_page(page_id) else {
            let _ = self.transport.send_to(
                requester,
                &Message::Error { error_code: ErrorKind::NotFound.code(), page_id, message: format!("no local table for page {page_id}") },
            );
            return;
        };
        let entry = &table.entries[idx];
        if entry.owner() != self.self_id {
            let _ = self.transport.send_to(
                requester,
                &Message::Error { error_code: ErrorKind::Invalid.code(), page_id, message: "stale owner".into() },
            );
            return;
        }

        let data = unsafe { std::slice::from_raw_parts(entry.local_addr as *const u8, PAGE_SIZE) }.to_vec();
        match access {
            Access::Read => {
                let version = entry.version();
                // Grants are always served RW at the protocol layer
                // (§4.H deadlock-avoidance rule): the owner's own
                // mapping stays untouched here, it simply gains a
                // sharer. The requester installs its side read-only.
                if self.transport.send_to(requester, &Message::PageReply { page_id, version, access: Access::Read, data }).is_ok()
                {
                    if self.directory.add_reader(page_id, requester).is_ok() {
                        self.stats.pages_fetched(1);
                        self.replicate_dir(page_id, self.directory.lookup_owner(page_id), self.directory.get_sharers(page_id));
                    }
                }
            }
            Access::Write => {
                let invalidate_list = self.directory.set_writer(page_id, requester);
                let version = entry.version() + 1;
                if self.transport.send_to(requester, &Message::PageReply { page_id, version, access: Access::Write, data }).is_err()
                {
                    return;
                }
                self.stats.pages_fetched(1);
                self.replicate_dir(page_id, Some(requester), Vec::new());
                let _ = permission::set_protection(Some(&table), entry.local_addr, Protection::None);
                entry.set_state_owner_version(PageState::Invalid, requester, version);
                for node in invalidate_list.iter().filter(|n| **n != requester) {
                    self.stats.invalidations_sent(1);
                    let _ = self.transport.send_to(*node, &Message::Invalidate { page_id, new_owner: requester, version });
                }
            }
        }
    }

    pub(crate) fn handle_page_reply(&self, page_id: PageId, version: u64, access: Access, data: Vec<u8>) {
        let Some((table, idx)) = self.table_and_index_for_page(page_id) else { return };
        let entry = &table.entries[idx];
        if data.len() != PAGE_SIZE {
            entry.complete_fetch(Err(ErrorKind::Invalid));
            return;
        }
        if permission::set_protection(Some(&table), entry.local_addr, Protection::ReadWrite).is_err() {
            entry.complete_fetch(Err(ErrorKind::Permission));
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), entry.local_addr as *mut u8, PAGE_SIZE);
        }
        let (prot, state) =
            if access == Access::Write { (Protection::ReadWrite, PageState::ReadWrite) } else { (Protection::Read, PageState::ReadOnly) };
        let _ = permission::set_protection(Some(&table), entry.local_addr, prot);
        entry.set_state_owner_version(state, self.self_id, version);
        entry.complete_fetch(Ok(()));
    }

    pub(crate) fn handle_invalidate(&self, from: NodeId, page_id: PageId, new_owner: NodeId, version: u64) {
        if let Some((table, idx)) = self.table_and_index_for_page(page_id) {
            let entry = &table.entries[idx];
            let _ = permission::set_protection(Some(&table), entry.local_addr, Protection::None);
            entry.set_state_owner_version(PageState::Invalid, new_owner, version);
            self.stats.invalidations_received(1);
        }
        let _ = self.transport.send_to(from, &Message::InvalidateAck { page_id, acker: self.self_id });
    }

    pub(crate) fn handle_invalidate_ack(&self, page_id: PageId, _acker: NodeId) {
        if let Some((table, idx)) = self.table_and_index_for_page(page_id) {
            table.entries[idx].ack_invalidation();
        }
    }

    pub(crate) fn handle_error(&self, page_id: PageId, error_code: i32, message: String) {
        if let Some((table, idx)) = self.table_and_index_for_page(page_id) {
            let kind = match error_code {
                c if c == ErrorKind::NotFound.code() => ErrorKind::NotFound,
                c if c == ErrorKind::Invalid.code() => ErrorKind::Invalid,
                c if c == ErrorKind::Permission.code() => ErrorKind::Permission,
                _ => ErrorKind::Network,
            };
            tracing::warn!(page_id, error_code, %message, "peer reported error servicing page fetch");
            table.entries[idx].complete_fetch(Err(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::test_support::bring_up;
    use std::thread;

    #[test]
    fn write_then_read_migrates_and_invalidates() {
        let port = 19801;
        let manager = bring_up(Config { node_id: 0, port, manager_port: port, num_nodes: 2, is_manager: true, ..Config::default() });
        let worker = bring_up(Config { node_id: 1, port: 0, manager_port: port, num_nodes: 2, is_manager: false, ..Config::default() });
        thread::sleep(Duration::from_millis(150));

        let addr = manager.malloc(PAGE_SIZE).unwrap();
        thread::sleep(Duration::from_millis(150));

        let table = worker.table_for_addr(addr).expect("worker mirrored the allocation via AllocNotify");
        let entry = table.entry_for_addr(addr).expect("entry exists at the mirrored address");
        assert_eq!(entry.owner(), 0);

        worker.fetch_for_read(&table, entry).expect("read fetch from the manager succeeds");
        assert_eq!(entry.state(), PageState::ReadOnly);
        assert_eq!(unsafe { *(entry.local_addr as *const u8) }, 0);

        worker.fetch_for_write(&table, entry).expect("write fetch upgrades and invalidates the manager's copy");
        assert_eq!(entry.state(), PageState::ReadWrite);
        assert_eq!(entry.owner(), 1);
        unsafe { *(entry.local_addr as *mut u8) = 0x7 };

        thread::sleep(Duration::from_millis(150));
        let manager_table = manager.table_for_addr(addr).unwrap();
        let manager_entry = manager_table.entry_for_addr(addr).unwrap();
        assert_eq!(manager_entry.state(), PageState::Invalid);

        manager.shutdown();
        worker.shutdown();
    }

    #[test]
    fn two_readers_share_without_invalidating_each_other() {
        let port = 19841;
        let manager = bring_up(Config { node_id: 0, port, manager_port: port, num_nodes: 3, is_manager: true, ..Config::default() });
        let r1 = bring_up(Config { node_id: 1, port: 0, manager_port: port, num_nodes: 3, is_manager: false, ..Config::default() });
        let r2 = bring_up(Config { node_id: 2, port: 0, manager_port: port, num_nodes: 3, is_manager: false, ..Config::default() });
        thread::sleep(Duration::from_millis(150));

        let addr = manager.malloc(PAGE_SIZE).unwrap();
        thread::sleep(Duration::from_millis(150));

        let t1 = r1.table_for_addr(addr).unwrap();
        let e1 = t1.entry_for_addr(addr).unwrap();
        let t2 = r2.table_for_addr(addr).unwrap();
        let e2 = t2.entry_for_addr(addr).unwrap();

        r1.fetch_for_read(&t1, e1).unwrap();
        r2.fetch_for_read(&t2, e2).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(e1.state(), PageState::ReadOnly);
        assert_eq!(e2.state(), PageState::ReadOnly);
        let mut sharers = manager.directory.get_sharers(e1.id);
        sharers.sort();
        assert_eq!(sharers, vec![1, 2], "both readers are tracked as sharers of the manager-owned page");
        assert_eq!(manager.directory.lookup_owner(e1.id), Some(0), "the manager keeps ownership while only serving reads");

        manager.shutdown();
        r1.shutdown();
        r2.shutdown();
    }
}
