//! The directory: `page_id -> {owner, sharers}`, authoritative at node
//! 0 and shadow-replicated to node 1 (§3, §4.G).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{DsmError, Result};
use crate::wire::{NodeId, PageId};

/// ~100 000 buckets, per §3.
const NUM_BUCKETS: usize = 100_003;
/// Open Question §9.4 resolved: cap sharers at 32 per page. This value
/// leaks into `Invalidate` fan-out (`fetch_for_write` invalidates at
/// most this many sharers).
pub const SHARER_CAP: usize = 32;

struct DirState {
    owner: Option<NodeId>,
    sharers: Vec<NodeId>,
}

pub struct DirectoryEntry {
    pub page_id: PageId,
    inner: Mutex<DirState>,
}

impl DirectoryEntry {
    fn new(page_id: PageId, owner: Option<NodeId>) -> Self {
        DirectoryEntry { page_id, inner: Mutex::new(DirState { owner, sharers: Vec::new() }) }
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.inner.lock().unwrap().owner
    }

    pub fn sharers(&self) -> Vec<NodeId> {
        self.inner.lock().unwrap().sharers.clone()
    }
}

pub struct Directory {
    buckets: Vec<Mutex<HashMap<PageId, Arc<DirectoryEntry>>>>,
    /// Serialises structural changes (insert/remove of an entry);
    /// content changes (owner/sharers) only need the entry's own lock.
    /// Lock order: `global_lock -> entry` (§5).
    global_lock: Mutex<()>,
}

impl Directory {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(Mutex::new(HashMap::new()));
        }
        Directory { buckets, global_lock: Mutex::new(()) }
    }

    fn bucket_idx(page_id: PageId) -> usize {
        (page_id % NUM_BUCKETS as u64) as usize
    }

    fn get(&self, page_id: PageId) -> Option<Arc<DirectoryEntry>> {
        let bucket = self.buckets[Self::bucket_idx(page_id)].lock().unwrap();
        bucket.get(&page_id).cloned()
    }

    /// Creates the entry lazily on first reference (§3 Lifecycle).
    fn get_or_create(&self, page_id: PageId, owner: Option<NodeId>) -> Arc<DirectoryEntry> {
        let idx = Self::bucket_idx(page_id);
        {
            let bucket = self.buckets[idx].lock().unwrap();
            if let Some(e) = bucket.get(&page_id) {
                return Arc::clone(e);
            }
        }
        let _g = self.global_lock.lock().unwrap();
        let mut bucket = self.buckets[idx].lock().unwrap();
        Arc::clone(bucket.entry(page_id).or_insert_with(|| Arc::new(DirectoryEntry::new(page_id, owner))))
    }

    pub fn lookup_owner(&self, page_id: PageId) -> Option<NodeId> {
        self.get(page_id).and_then(|e| e.owner())
    }

    pub fn set_owner(&self, page_id: PageId, owner: NodeId) {
        let entry = self.get_or_create(page_id, Some(owner));
        let mut s = entry.inner.lock().unwrap();
        s.owner = Some(owner);
    }

    pub fn add_reader(&self, page_id: PageId, reader: NodeId) -> Result<()> {
        let entry = self.get_or_create(page_id, None);
        let mut s = entry.inner.lock().unwrap();
        if !s.sharers.contains(&reader) {
            if s.sharers.len() >= SHARER_CAP {
                return Err(DsmError::Busy(format!("page {page_id} sharer list full ({SHARER_CAP})")));
            }
            s.sharers.push(reader);
        }
        Ok(())
    }

    pub fn remove_sharer(&self, page_id: PageId, node: NodeId) {
        if let Some(entry) = self.get(page_id) {
            let mut s = entry.inner.lock().unwrap();
            s.sharers.retain(|n| *n != node);
        }
    }

    pub fn get_sharers(&self, page_id: PageId) -> Vec<NodeId> {
        self.get(page_id).map(|e| e.sharers()).unwrap_or_default()
    }

    pub fn clear_sharers(&self, page_id: PageId) {
        if let Some(entry) = self.get(page_id) {
            let mut s = entry.inner.lock().unwrap();
            s.sharers.clear();
        }
    }

    /// Sets `new_writer` as owner and returns the invalidation list:
    /// `(old_sharers ∪ {old_owner}) \ {new_writer}` (§4.G). The caller
    /// — the migration engine — issues the invalidations; this call
    /// never touches the network.
    pub fn set_writer(&self, page_id: PageId, new_writer: NodeId) -> Vec<NodeId> {
        let entry = self.get_or_create(page_id, Some(new_writer));
        let mut s = entry.inner.lock().unwrap();
        let mut invalidate: Vec<NodeId> = s.sharers.drain(..).collect();
        if let Some(old_owner) = s.owner {
            if old_owner != new_writer && !invalidate.contains(&old_owner) {
                invalidate.push(old_owner);
            }
        }
        invalidate.retain(|n| *n != new_writer);
        s.owner = Some(new_writer);
        invalidate
    }

    pub fn remove_entry(&self, page_id: PageId) {
        let idx = Self::bucket_idx(page_id);
        let _g = self.global_lock.lock().unwrap();
        let mut bucket = self.buckets[idx].lock().unwrap();
        bucket.remove(&page_id);
    }

    /// Used after owner failure: makes `new_owner` authoritative with
    /// no surviving sharers (§4.H fetch timeout recovery path).
    pub fn reclaim_ownership(&self, page_id: PageId, new_owner: NodeId) {
        self.set_owner(page_id, new_owner);
        self.clear_sharers(page_id);
    }

    /// §4.G: `owner == failed` becomes `None`; `failed` is removed
    /// from every sharer list. Scans every bucket, so this should only
    /// run from the heartbeat thread's failure path, not per-fault.
    pub fn handle_node_failure(&self, failed: NodeId) {
        for bucket in &self.buckets {
            let bucket = bucket.lock().unwrap();
            for entry in bucket.values() {
                let mut s = entry.inner.lock().unwrap();
                if s.owner == Some(failed) {
                    s.owner = None;
                }
                s.sharers.retain(|n| *n != failed);
            }
        }
    }

    /// Removes every directory entry covering `[start, end)`, used by
    /// `dsm_free` (§4.F step 2).
    pub fn remove_range(&self, start: PageId, end: PageId) {
        for page_id in start..end {
            self.remove_entry(page_id);
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_writer_invalidates_old_owner_and_sharers() {
        let d = Directory::new();
        d.set_owner(1, 0);
        d.add_reader(1, 2).unwrap();
        d.add_reader(1, 3).unwrap();
        let mut invalidate = d.set_writer(1, 2);
        invalidate.sort();
        assert_eq!(invalidate, vec![0, 3]);
        assert_eq!(d.lookup_owner(1), Some(2));
        assert!(d.get_sharers(1).is_empty());
    }

    #[test]
    fn sharer_cap_is_enforced() {
        let d = Directory::new();
        for n in 0..SHARER_CAP as u32 {
            d.add_reader(1, n).unwrap();
        }
        assert!(d.add_reader(1, 9999).is_err());
    }

    #[test]
    fn node_failure_scrubs_ownership_and_sharers() {
        let d = Directory::new();
        d.set_owner(1, 2);
        d.add_reader(2, 2).unwrap();
        d.set_owner(2, 3);
        d.handle_node_failure(2);
        assert_eq!(d.lookup_owner(1), None);
        assert!(d.get_sharers(2).is_empty());
        assert_eq!(d.lookup_owner(2), Some(3));
    }

    #[test]
    fn remove_range_clears_entries() {
        let d = Directory::new();
        for id in 10..15 {
            d.set_owner(id, 0);
        }
        d.remove_range(10, 15);
        for id in 10..15 {
            assert_eq!(d.lookup_owner(id), None);
        }
    }
}
