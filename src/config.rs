//! Runtime configuration: the values every node needs before `init`
//! can install the fault handler and stand up the transport.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DsmError, Result};

fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_heartbeat_timeout_missed() -> u32 {
    3
}
fn default_alloc_ack_timeout_ms() -> u64 {
    2000
}
fn default_read_fetch_timeout_ms() -> u64 {
    5000
}
fn default_write_fetch_timeout_ms() -> u64 {
    10_000
}
fn default_barrier_timeout_ms() -> u64 {
    30_000
}
fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_backup_host() -> String {
    "127.0.0.1".into()
}
fn default_bind_host() -> String {
    "0.0.0.0".into()
}

/// The node cap this runtime documents (§1 Non-goals: "more than ~16 nodes").
pub const MAX_NODES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: u32,
    pub port: u16,
    /// Local address this node binds its listening socket(s) to. Every
    /// node is a separate host in a real deployment, so `0.0.0.0` (every
    /// interface) is always correct there; a test harness running several
    /// simulated nodes as threads in one process must give each node a
    /// distinct bind address (e.g. a loopback alias) since two sockets
    /// can't share one `0.0.0.0:port`.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub manager_host: String,
    pub manager_port: u16,
    /// Where node 1 (the backup) can be dialed once it has promoted
    /// itself — workers have no standing connection to the backup to
    /// receive its `ManagerPromotion` broadcast over (star topology,
    /// spec.md:181), so they redial this address themselves once their
    /// heartbeat thread notices the manager is gone.
    #[serde(default = "default_backup_host")]
    pub backup_host: String,
    pub num_nodes: usize,
    pub is_manager: bool,
    pub log_level: u8,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_missed")]
    pub heartbeat_timeout_missed: u32,
    #[serde(default = "default_alloc_ack_timeout_ms")]
    pub alloc_ack_timeout_ms: u64,
    #[serde(default = "default_read_fetch_timeout_ms")]
    pub read_fetch_timeout_ms: u64,
    #[serde(default = "default_write_fetch_timeout_ms")]
    pub write_fetch_timeout_ms: u64,
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 0,
            port: 9600,
            bind_host: default_bind_host(),
            manager_host: "127.0.0.1".into(),
            manager_port: 9600,
            backup_host: default_backup_host(),
            num_nodes: 1,
            is_manager: true,
            log_level: 2,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_missed: default_heartbeat_timeout_missed(),
            alloc_ack_timeout_ms: default_alloc_ack_timeout_ms(),
            read_fetch_timeout_ms: default_read_fetch_timeout_ms(),
            write_fetch_timeout_ms: default_write_fetch_timeout_ms(),
            barrier_timeout_ms: default_barrier_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Config {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DsmError::Init(format!("reading config {:?}: {e}", path.as_ref())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| DsmError::Init(format!("parsing config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `DSM_*` environment variable overrides on top of `self`.
    pub fn apply_env_overrides(mut self) -> Self {
        macro_rules! env_override {
            ($field:ident, $var:expr, $parse:expr) => {
                if let Ok(v) = std::env::var($var) {
                    if let Ok(parsed) = $parse(&v) {
                        self.$field = parsed;
                    }
                }
            };
        }
        env_override!(node_id, "DSM_NODE_ID", str::parse::<u32>);
        env_override!(port, "DSM_PORT", str::parse::<u16>);
        env_override!(manager_port, "DSM_MANAGER_PORT", str::parse::<u16>);
        env_override!(num_nodes, "DSM_NUM_NODES", str::parse::<usize>);
        env_override!(log_level, "DSM_LOG_LEVEL", str::parse::<u8>);
        if let Ok(v) = std::env::var("DSM_MANAGER_HOST") {
            self.manager_host = v;
        }
        if let Ok(v) = std::env::var("DSM_BACKUP_HOST") {
            self.backup_host = v;
        }
        if let Ok(v) = std::env::var("DSM_BIND_HOST") {
            self.bind_host = v;
        }
        if let Ok(v) = std::env::var("DSM_IS_MANAGER") {
            self.is_manager = matches!(v.as_str(), "1" | "true" | "yes");
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 || self.num_nodes > MAX_NODES {
            return Err(DsmError::Init(format!("num_nodes {} out of range 1..={MAX_NODES}", self.num_nodes)));
        }
        if self.node_id as usize >= self.num_nodes {
            return Err(DsmError::Init(format!("node_id {} >= num_nodes {}", self.node_id, self.num_nodes)));
        }
        if (self.node_id == 0) != self.is_manager {
            return Err(DsmError::Init("node 0 must be the manager and only node 0 may be".into()));
        }
        if self.port == 0 {
            return Err(DsmError::Init("port must be nonzero".into()));
        }
        Ok(())
    }

    pub fn is_backup(&self) -> bool {
        self.node_id == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_node_id_out_of_range() {
        let mut cfg = Config { num_nodes: 2, node_id: 5, is_manager: false, ..Config::default() };
        cfg.node_id = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_manager_mismatch() {
        let cfg = Config { node_id: 1, is_manager: true, num_nodes: 2, ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_are_valid_single_node() {
        assert!(Config::default().validate().is_ok());
    }
}
