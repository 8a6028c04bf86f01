//! `NodeInfo` — what the context tracks about every peer (§3).

use std::time::Instant;

use crate::wire::NodeId;

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub connected: bool,
    pub last_heartbeat: Option<Instant>,
    pub missed_heartbeats: u32,
    pub is_failed: bool,
}

impl NodeInfo {
    pub fn new(id: NodeId, hostname: impl Into<String>, port: u16) -> Self {
        NodeInfo {
            id,
            hostname: hostname.into(),
            port,
            connected: false,
            last_heartbeat: None,
            missed_heartbeats: 0,
            is_failed: false,
        }
    }
}
