//! Transport: length-framed TCP, one poll-driven dispatcher thread, an
//! accept thread, and a heartbeat thread (§2 component B, §5's
//! scheduling model).

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DsmError, Result};
use crate::stats::Stats;
use crate::transport::connection::Connection;
use crate::wire::{Header, Message, NodeId};

/// Implemented by the context to receive decoded messages off the
/// dispatcher thread, and notified when a peer connection drops.
pub trait Handler: Send + Sync {
    fn on_message(&self, sender: NodeId, msg: Message);
    fn on_peer_closed(&self, peer: Option<NodeId>);
}

pub struct Transport {
    self_id: NodeId,
    /// Identified connections, keyed by node id.
    connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    /// Accepted-but-not-yet-`NodeJoin`'d connections.
    pending: Mutex<Vec<Arc<Connection>>>,
    /// Bound but not yet accepting; see `prebind`/`begin_listening`.
    prebound: Mutex<Option<TcpListener>>,
    handler: OnceLock<Arc<dyn Handler>>,
    running: AtomicBool,
    stats: Arc<Stats>,
}

impl Transport {
    pub fn new(self_id: NodeId, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Transport {
            self_id,
            connections: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            prebound: Mutex::new(None),
            handler: OnceLock::new(),
            running: AtomicBool::new(true),
            stats,
        })
    }

    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        let _ = self.handler.set(handler);
    }

    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.connections.read().unwrap().contains_key(&peer)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.connections.read().unwrap().keys().copied().collect()
    }

    /// Dials `(host, port)`, announces ourselves, and registers the
    /// connection under `peer_id`. Used both for the initial dial to
    /// the manager (always node 0, via `connect_to_manager`) and for a
    /// worker's post-promotion redial straight to the backup once it
    /// takes over (`peer_id` is then the backup's node id, not 0).
    pub fn connect_to_peer(self: &Arc<Self>, host: &str, port: u16, peer_id: NodeId, hostname: &str) -> Result<()> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| DsmError::Network(format!("connecting to node {peer_id} at {host}:{port}: {e}")))?;
        let conn = Arc::new(Connection::new(Some(peer_id), stream));
        conn.send(
            &Message::NodeJoin { node_id: self.self_id, hostname: hostname.to_string(), port },
            self.self_id,
        )?;
        self.connections.write().unwrap().insert(peer_id, conn);
        Ok(())
    }

    /// Worker-side: connects to the manager and announces ourselves.
    pub fn connect_to_manager(self: &Arc<Self>, host: &str, port: u16, hostname: &str) -> Result<()> {
        self.connect_to_peer(host, port, 0, hostname)
    }

    /// Binds `host:port` without yet accepting connections. Used by the
    /// backup (node 1) during `init` so promotion can start servicing
    /// the manager's port with no bind race (spec.md:181).
    pub fn prebind(&self, host: &str, port: u16) -> Result<()> {
        let listener =
            TcpListener::bind((host, port)).map_err(|e| DsmError::Network(format!("prebind {host}:{port}: {e}")))?;
        *self.prebound.lock().unwrap() = Some(listener);
        Ok(())
    }

    /// Spawns the accept loop on a previously `prebind`-ed listener.
    /// Connections are parked as "pending" until their `NodeJoin`
    /// arrives on the dispatcher thread. Called by the manager at
    /// startup (via `listen`) and by the backup on promotion
    /// (spec.md:187).
    pub fn begin_listening(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .prebound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DsmError::Init("begin_listening called with no prebound socket".into()))?;
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("dsm-accept".into())
            .spawn(move || this.accept_loop(listener))
            .map_err(|e| DsmError::Init(format!("spawning accept thread: {e}")))?;
        Ok(())
    }

    /// Manager-side: binds and immediately spawns the accept loop.
    pub fn listen(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        self.prebind(host, port)?;
        self.begin_listening()
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    tracing::info!(?addr, "accepted connection");
                    let conn = Arc::new(Connection::new(None, stream));
                    self.pending.lock().unwrap().push(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Sends to a known, already-identified peer.
    pub fn send_to(&self, peer: NodeId, msg: &Message) -> Result<()> {
        let conn = {
            let map = self.connections.read().unwrap();
            map.get(&peer).cloned()
        };
        match conn {
            Some(c) => c.send(msg, self.self_id),
            None => Err(DsmError::Network(format!("no connection to node {peer}"))),
        }
    }

    pub fn broadcast(&self, msg: &Message, skip: Option<NodeId>) {
        let peers: Vec<Arc<Connection>> = {
            let map = self.connections.read().unwrap();
            map.iter().filter(|(id, _)| Some(**id) != skip).map(|(_, c)| Arc::clone(c)).collect()
        };
        for conn in peers {
            if let Err(e) = conn.send(msg, self.self_id) {
                tracing::warn!(peer = conn.peer_id(), error = %e, "broadcast send failed");
            }
        }
    }

    /// The single dispatcher thread (§5): polls every connected and
    /// pending socket, decodes whatever frames are complete, and
    /// invokes the registered handler inline. Handlers never block on
    /// the network themselves (they only send, which is a bounded
    /// write), so this thread stays responsive.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("dsm-dispatcher".into())
            .spawn(move || this.dispatch_loop())
            .map_err(|e| DsmError::Init(format!("spawning dispatcher thread: {e}")))?;
        Ok(())
    }

    fn dispatch_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let mut all: Vec<Arc<Connection>> = self.connections.read().unwrap().values().cloned().collect();
            all.extend(self.pending.lock().unwrap().iter().cloned());
            if all.is_empty() {
                thread::sleep(Duration::from_millis(20));
                continue;
            }

            let mut pollfds: Vec<libc::pollfd> =
                all.iter().map(|c| libc::pollfd { fd: c.raw_fd(), events: libc::POLLIN, revents: 0 }).collect();

            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 200) };
            if rc < 0 {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            for (conn, pfd) in all.iter().zip(pollfds.iter()) {
                if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                    continue;
                }
                match conn.poll_read() {
                    Ok(frames) => {
                        for (header, msg) in frames {
                            self.stats.bytes_received(1);
                            self.on_frame(conn, header, msg);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = ?conn.peer_id(), error = %e, "connection dropped");
                        self.drop_connection(conn);
                    }
                }
            }
        }
    }

    fn on_frame(&self, conn: &Arc<Connection>, header: Header, msg: Message) {
        if conn.peer_id().is_none() {
            if let Message::NodeJoin { node_id, .. } = &msg {
                conn.set_peer_id(*node_id);
                self.pending.lock().unwrap().retain(|c| !Arc::ptr_eq(c, conn));
                self.connections.write().unwrap().insert(*node_id, Arc::clone(conn));
                tracing::info!(node_id, "peer identified");
            } else {
                tracing::warn!("dropping frame from unidentified peer before NodeJoin");
                return;
            }
        }
        if let Some(handler) = self.handler.get() {
            handler.on_message(header.sender, msg);
        }
    }

    fn drop_connection(&self, conn: &Arc<Connection>) {
        let peer = conn.peer_id();
        self.pending.lock().unwrap().retain(|c| !Arc::ptr_eq(c, conn));
        if let Some(id) = peer {
            self.connections.write().unwrap().remove(&id);
        }
        if let Some(handler) = self.handler.get() {
            handler.on_peer_closed(peer);
        }
    }

    /// Heartbeat thread (§4.L): announces liveness on
    /// `heartbeat_interval_ms` and leaves failure *detection* to the
    /// caller, which inspects `NodeInfo.last_heartbeat` on the same
    /// cadence (kept in the context, not here, since only the context
    /// knows the full node table).
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration, on_tick: impl Fn() + Send + 'static) -> Result<()> {
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("dsm-heartbeat".into())
            .spawn(move || {
                while this.running.load(Ordering::Acquire) {
                    this.broadcast(&Message::Heartbeat, None);
                    on_tick();
                    thread::sleep(interval);
                }
            })
            .map_err(|e| DsmError::Init(format!("spawning heartbeat thread: {e}")))?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn last_activity(&self) -> Instant {
        Instant::now()
    }
}
