//! A single peer connection: a TCP stream, a send-side lock so two
//! threads can't interleave frames, and an accumulation buffer the
//! dispatcher drains complete frames out of (§5: "send queue ...
//! have their own locks").

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::wire::{self, Header, Message, NodeId, NO_NODE};

pub struct Connection {
    /// `NO_NODE` until the peer's `NodeJoin` is received (inbound
    /// connections on the manager are anonymous until then).
    peer_id: AtomicU32,
    stream: Mutex<TcpStream>,
    send_lock: Mutex<()>,
    read_buf: Mutex<Vec<u8>>,
    next_seq: AtomicU64,
}

impl Connection {
    pub fn new(peer_id: Option<NodeId>, stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Connection {
            peer_id: AtomicU32::new(peer_id.unwrap_or(NO_NODE)),
            stream: Mutex::new(stream),
            send_lock: Mutex::new(()),
            read_buf: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn peer_id(&self) -> Option<NodeId> {
        match self.peer_id.load(Ordering::Acquire) {
            NO_NODE => None,
            id => Some(id),
        }
    }

    pub fn set_peer_id(&self, id: NodeId) {
        self.peer_id.store(id, Ordering::Release);
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.lock().unwrap().as_raw_fd()
    }

    pub fn try_clone(&self) -> std::io::Result<TcpStream> {
        self.stream.lock().unwrap().try_clone()
    }

    /// Serialised so concurrent senders never interleave frame bytes.
    pub fn send(&self, msg: &Message, sender: NodeId) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = wire::encode(msg, sender, seq)?;
        let _g = self.send_lock.lock().unwrap();
        let mut s = self.stream.lock().unwrap();
        s.write_all(&(frame.len() as u32).to_be_bytes())?;
        s.write_all(&frame)?;
        s.flush()?;
        Ok(())
    }

    /// Pulls whatever bytes are currently available (the socket is
    /// blocking, but `poll` having reported readability means this
    /// will not block indefinitely) and appends them to the internal
    /// buffer, then extracts every complete frame found so far.
    pub fn poll_read(&self) -> Result<Vec<(Header, Message)>> {
        let mut chunk = [0u8; 8192];
        let n = {
            let mut s = self.stream.lock().unwrap();
            s.read(&mut chunk)?
        };
        if n == 0 {
            return Err(crate::error::DsmError::Network(format!(
                "peer {:?} closed the connection",
                self.peer_id()
            )));
        }
        let mut buf = self.read_buf.lock().unwrap();
        buf.extend_from_slice(&chunk[..n]);
        self.drain_frames(&mut buf)
    }

    fn drain_frames(&self, buf: &mut Vec<u8>) -> Result<Vec<(Header, Message)>> {
        let mut out = Vec::new();
        loop {
            if buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
            if len == 0 || len > wire::MAX_FRAME_LEN {
                return Err(crate::error::DsmError::Invalid(format!("implausible frame length {len}")));
            }
            if buf.len() < 4 + len {
                break;
            }
            let frame = &buf[4..4 + len];
            let (header, msg) = wire::decode(frame)?;
            out.push((header, msg));
            buf.drain(0..4 + len);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn send_and_poll_read_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let client_conn = Connection::new(Some(1), client);
        client_conn.send(&Message::Heartbeat, 0).unwrap();

        let server_conn = Connection::new(Some(0), server);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let frames = server_conn.poll_read().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, Message::Heartbeat);
    }
}
