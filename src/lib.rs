//! A user-level, page-based distributed shared memory runtime: a
//! single virtual address space spread across a small cluster of
//! processes, kept coherent by a single-writer/multiple-reader
//! protocol driven off SIGSEGV, plus a distributed lock manager and
//! barrier built on the same transport (see `SPEC_FULL.md`).

pub mod allocator;
pub mod barrier;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod failover;
pub mod fault;
pub mod lock_manager;
pub mod logging;
pub mod migration;
pub mod page;
pub mod permission;
pub mod stats;
pub mod transport;
pub mod wire;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub use config::Config;
pub use context::Context;
pub use error::{DsmError, ErrorKind, Result};
pub use stats::StatsSnapshot;

/// Page granularity the whole protocol operates on (§3).
pub const PAGE_SIZE: usize = 4096;

static RUNTIME: OnceLock<Arc<Context>> = OnceLock::new();
static NEXT_BARRIER_ID: AtomicU64 = AtomicU64::new(1);

fn runtime() -> Result<&'static Arc<Context>> {
    RUNTIME.get().ok_or_else(|| DsmError::Init("dsm_init has not been called".into()))
}

/// Brings up logging, networking, and the fault handler for this
/// process. Must be called exactly once, before any other API call.
pub fn init(config: Config) -> Result<()> {
    config.validate()?;
    logging::install(config.log_level);
    let stats = Arc::new(stats::Stats::new());
    let ctx = Context::new(config, stats);
    ctx.init()?;
    RUNTIME.set(ctx).map_err(|_| DsmError::Init("dsm_init called more than once".into()))?;
    Ok(())
}

pub fn finalize() {
    if let Some(ctx) = RUNTIME.get() {
        ctx.shutdown();
    }
}

pub fn malloc(size: usize) -> Result<usize> {
    runtime()?.malloc(size)
}

pub fn free(addr: usize) -> Result<()> {
    runtime()?.free(addr)
}

pub fn get_allocation(slot: usize) -> Result<usize> {
    runtime()?.get_allocation(slot).ok_or_else(|| DsmError::NotFound(format!("no allocation at slot {slot}")))
}

/// Registers `id` as a lock handle, failing if this node already
/// created it (spec.md:221's `lock_create(id) -> handle | null`). Two
/// nodes that want "the same" logical lock must agree on `id` out of
/// band (e.g. a well-known constant).
pub fn lock_create(id: u64) -> Result<u64> {
    runtime()?.lock_create(id)
}

pub fn lock_acquire(lock_id: u64, timeout_ms: u64) -> Result<()> {
    let ctx = runtime()?;
    let timeout = if timeout_ms == 0 { Duration::from_millis(ctx.config.lock_timeout_ms) } else { Duration::from_millis(timeout_ms) };
    ctx.lock_acquire(lock_id, timeout)
}

pub fn lock_release(lock_id: u64) -> Result<()> {
    runtime()?.lock_release(lock_id)
}

/// No cluster-wide lock registry exists to destroy (§1 Non-goals): this
/// just drops the local grant bookkeeping for `lock_id`.
pub fn lock_destroy(lock_id: u64) -> Result<()> {
    runtime()?.lock_release(lock_id)
}

pub fn barrier_create() -> u64 {
    NEXT_BARRIER_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn barrier(barrier_id: u64, num_participants: u32, timeout_ms: u64) -> Result<()> {
    let ctx = runtime()?;
    let timeout = if timeout_ms == 0 { Duration::from_millis(ctx.config.barrier_timeout_ms) } else { Duration::from_millis(timeout_ms) };
    ctx.barrier_wait(barrier_id, num_participants, timeout)
}

pub fn get_stats() -> Result<StatsSnapshot> {
    Ok(runtime()?.stats.snapshot())
}

pub fn reset_stats() -> Result<()> {
    runtime()?.stats.reset();
    Ok(())
}

pub fn print_stats() -> Result<()> {
    runtime()?.stats.print();
    Ok(())
}

/// Same counters as [`get_stats`], serialized to a JSON string.
pub fn get_stats_json() -> Result<String> {
    runtime()?.stats.to_json().map_err(|e| DsmError::Invalid(format!("failed to serialize stats: {e}")))
}

pub fn set_log_level(level: u8) {
    logging::set_log_level(level);
}
