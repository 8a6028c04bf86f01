//! Runtime counters exposed through `get_stats`/`reset_stats`/`print_stats`.
//! Guarded by one `stats_lock`, per §5's shared-resource policy.

use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct StatsSnapshot {
    pub page_faults: u64,
    pub read_faults: u64,
    pub write_faults: u64,
    pub pages_fetched: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
    pub lock_acquisitions: u64,
    pub barrier_waits: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub timeouts: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<StatsSnapshot>,
}

macro_rules! counter_bump {
    ($name:ident) => {
        pub fn $name(&self, by: u64) {
            let mut s = self.inner.lock().unwrap();
            s.$name += by;
        }
    };
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    counter_bump!(page_faults);
    counter_bump!(read_faults);
    counter_bump!(write_faults);
    counter_bump!(pages_fetched);
    counter_bump!(invalidations_sent);
    counter_bump!(invalidations_received);
    counter_bump!(lock_acquisitions);
    counter_bump!(barrier_waits);
    counter_bump!(bytes_sent);
    counter_bump!(bytes_received);
    counter_bump!(alloc_count);
    counter_bump!(free_count);
    counter_bump!(timeouts);
    counter_bump!(retries);

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock().unwrap()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = StatsSnapshot::default();
    }

    /// Renders the current snapshot as a JSON object, for tooling that
    /// wants to scrape stats without parsing the `tracing` log line.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn print(&self) {
        let s = self.snapshot();
        tracing::info!(
            page_faults = s.page_faults,
            read_faults = s.read_faults,
            write_faults = s.write_faults,
            pages_fetched = s.pages_fetched,
            invalidations_sent = s.invalidations_sent,
            invalidations_received = s.invalidations_received,
            lock_acquisitions = s.lock_acquisitions,
            barrier_waits = s.barrier_waits,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            alloc_count = s.alloc_count,
            free_count = s.free_count,
            timeouts = s.timeouts,
            retries = s.retries,
            "dsm stats"
        );
    }
}
