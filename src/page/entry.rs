//! `PageEntry` — one per 4 KiB page, the unit the SWMR protocol
//! operates on (§3, §4.H).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::wire::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Invalid,
    ReadOnly,
    ReadWrite,
}

/// The mutable half of a `PageEntry`, behind `entry_lock`. Collapses
/// the source's condvar-plus-"fetch_result" idiom onto one mutex per
/// Design Note §9.3: waiters loop until `fetch_result` is `Some` or the
/// deadline passes, then take the result out under the same lock that
/// protects `request_pending`.
struct EntryState {
    owner: NodeId,
    state: PageState,
    version: u64,
    request_pending: bool,
    num_waiting_threads: u32,
    fetch_result: Option<Result<(), ErrorKind>>,
    pending_inv_acks: i32,
}

pub struct PageEntry {
    pub id: u64,
    pub local_addr: usize,
    inner: Mutex<EntryState>,
    ready_cv: Condvar,
    inv_ack_cv: Condvar,
}

impl PageEntry {
    pub fn new(id: u64, local_addr: usize, owner: NodeId) -> Self {
        PageEntry {
            id,
            local_addr,
            inner: Mutex::new(EntryState {
                owner,
                state: PageState::Invalid,
                version: 0,
                request_pending: false,
                num_waiting_threads: 0,
                fetch_result: None,
                pending_inv_acks: 0,
            }),
            ready_cv: Condvar::new(),
            inv_ack_cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> PageState {
        self.inner.lock().unwrap().state
    }

    pub fn owner(&self) -> NodeId {
        self.inner.lock().unwrap().owner
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    pub fn set_state(&self, state: PageState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn set_owner(&self, owner: NodeId) {
        self.inner.lock().unwrap().owner = owner;
    }

    pub fn set_state_owner_version(&self, state: PageState, owner: NodeId, version: u64) {
        let mut s = self.inner.lock().unwrap();
        s.state = state;
        s.owner = owner;
        s.version = version;
    }

    /// Claims the entry for an in-flight fetch if none is pending.
    /// Returns `true` if the caller now owns the fetch and must send
    /// the request; `false` means a fetch was already pending and the
    /// caller should have been queued as a waiter instead (see
    /// [`Self::wait_for_fetch`]).
    pub fn try_begin_fetch(&self) -> bool {
        let mut s = self.inner.lock().unwrap();
        if s.request_pending {
            false
        } else {
            s.request_pending = true;
            s.fetch_result = None;
            true
        }
    }

    /// Anti-thundering-herd wait: blocks until the in-flight fetch
    /// completes (or the deadline passes), returning the published
    /// result. At most one `PageRequest` is ever in flight per entry.
    pub fn wait_for_fetch(&self, timeout: Duration) -> Option<Result<(), ErrorKind>> {
        let mut s = self.inner.lock().unwrap();
        s.num_waiting_threads += 1;
        let deadline = Instant::now() + timeout;
        while s.fetch_result.is_none() {
            let now = Instant::now();
            if now >= deadline {
                s.num_waiting_threads -= 1;
                return None;
            }
            let (guard, result) = self.ready_cv.wait_timeout(s, deadline - now).unwrap();
            s = guard;
            if result.timed_out() && s.fetch_result.is_none() {
                s.num_waiting_threads -= 1;
                return None;
            }
        }
        s.num_waiting_threads -= 1;
        s.fetch_result
    }

    /// Publishes the result of a completed fetch, clears
    /// `request_pending`, and wakes every waiter. Always called under
    /// no other lock held (network sends never happen under this
    /// lock, per §5's lock-ordering rule, and this is the inverse:
    /// nothing but this lock is held while publishing).
    pub fn complete_fetch(&self, result: Result<(), ErrorKind>) {
        let mut s = self.inner.lock().unwrap();
        s.request_pending = false;
        s.fetch_result = Some(result);
        drop(s);
        self.ready_cv.notify_all();
    }

    pub fn is_fetch_pending(&self) -> bool {
        self.inner.lock().unwrap().request_pending
    }

    /// Initialises the invalidation-ack counter before fanning out
    /// `Invalidate` to `count` sharers (§4.H fetch_for_write step 5).
    pub fn begin_invalidation(&self, count: i32) {
        let mut s = self.inner.lock().unwrap();
        s.pending_inv_acks = count;
    }

    pub fn ack_invalidation(&self) {
        let mut s = self.inner.lock().unwrap();
        if s.pending_inv_acks > 0 {
            s.pending_inv_acks -= 1;
        }
        if s.pending_inv_acks <= 0 {
            drop(s);
            self.inv_ack_cv.notify_all();
        }
    }

    /// Waits up to `timeout` for `pending_inv_acks` to reach zero.
    /// Regardless of outcome the caller proceeds (§4.H step 6: "clear
    /// sharers" happens whether or not every ack arrived).
    pub fn wait_for_invalidation_acks(&self, timeout: Duration) -> bool {
        let mut s = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while s.pending_inv_acks > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.inv_ack_cv.wait_timeout(s, deadline - now).unwrap();
            s = guard;
            if result.timed_out() && s.pending_inv_acks > 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_fetcher_claims_the_slot() {
        let e = PageEntry::new(1, 0, 0);
        assert!(e.try_begin_fetch());
        assert!(!e.try_begin_fetch(), "a second concurrent fetch must be refused");
    }

    #[test]
    fn waiters_wake_on_completion() {
        let e = Arc::new(PageEntry::new(1, 0, 0));
        assert!(e.try_begin_fetch());
        let e2 = Arc::clone(&e);
        let handle = thread::spawn(move || e2.wait_for_fetch(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(50));
        e.complete_fetch(Ok(()));
        assert_eq!(handle.join().unwrap(), Some(Ok(())));
        assert!(!e.is_fetch_pending());
    }

    #[test]
    fn wait_for_fetch_times_out() {
        let e = PageEntry::new(1, 0, 0);
        assert!(e.try_begin_fetch());
        assert_eq!(e.wait_for_fetch(Duration::from_millis(20)), None);
    }

    #[test]
    fn invalidation_acks_release_at_zero() {
        let e = PageEntry::new(1, 0, 0);
        e.begin_invalidation(2);
        e.ack_invalidation();
        assert!(!e.wait_for_invalidation_acks(Duration::from_millis(10)));
        e.ack_invalidation();
        assert!(e.wait_for_invalidation_acks(Duration::from_millis(10)));
    }
}
