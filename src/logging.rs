//! One process-wide `tracing` subscriber, installed idempotently by
//! `init`, with a live-reloadable filter so `set_log_level` actually
//! changes verbosity at runtime instead of being a no-op.

use std::sync::OnceLock;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::reload;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static RELOAD_HANDLE: OnceLock<ReloadHandle> = OnceLock::new();

fn level_to_filter(level: u8) -> EnvFilter {
    let lvl = match level {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    EnvFilter::new(lvl.to_string())
}

/// Installs the subscriber once per process. Safe to call from every
/// node's `init` even under `cargo test` running multiple contexts in
/// one process — later calls are no-ops.
pub fn install(initial_level: u8) {
    if RELOAD_HANDLE.get().is_some() {
        return;
    }
    let (filter, handle) = reload::Layer::new(level_to_filter(initial_level));
    let subscriber = tracing_subscriber::registry().with(filter).with(fmt::layer());
    // Only the first caller in the process wins; concurrent callers in
    // tests racing this are fine, tracing's global dispatcher already
    // serialises this.
    let _ = tracing::subscriber::set_global_default(subscriber);
    let _ = RELOAD_HANDLE.set(handle);
}

/// Live-updates the process-wide log level (§6's `set_log_level`).
pub fn set_log_level(level: u8) {
    if let Some(handle) = RELOAD_HANDLE.get() {
        let _ = handle.reload(level_to_filter(level));
    }
}
