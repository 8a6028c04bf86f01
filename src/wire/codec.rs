//! Length-framed encode/decode. Every frame on the wire is:
//! `[4-byte BE outer length][24-byte Header][type-specific payload]`.
//!
//! All multi-byte integers inside the header and payload are written
//! little-endian, by hand, field by field — there is no `#[derive]`
//! doing this for us and no host struct is ever memcpy'd onto the
//! socket (Design Note §9).

use std::io::{Read, Write};

use crate::error::{DsmError, ErrorKind, Result};
use crate::wire::message::*;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::with_capacity(64) }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }
    fn node(&mut self, v: Option<NodeId>) {
        self.u32(v.unwrap_or(NO_NODE));
    }
    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }
    fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }
    fn node_vec(&mut self, v: &[NodeId]) {
        self.u32(v.len() as u32);
        for n in v {
            self.u32(*n);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }
    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            return Err(DsmError::Invalid("truncated frame".into()));
        }
        Ok(())
    }
    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }
    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }
    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }
    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }
    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }
    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }
    fn node(&mut self) -> Result<Option<NodeId>> {
        let v = self.u32()?;
        Ok(if v == NO_NODE { None } else { Some(v) })
    }
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(DsmError::Invalid("payload field too large".into()));
        }
        self.need(len)?;
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }
    fn string(&mut self) -> Result<String> {
        let v = self.bytes()?;
        String::from_utf8(v).map_err(|e| DsmError::Invalid(format!("bad utf8: {e}")))
    }
    fn node_vec(&mut self) -> Result<Vec<NodeId>> {
        let count = self.u32()? as usize;
        if count > 4096 {
            return Err(DsmError::Invalid("sharer/queue list too large".into()));
        }
        let mut v = Vec::with_capacity(count);
        for _ in 0..count {
            v.push(self.u32()?);
        }
        Ok(v)
    }
}

fn encode_payload(msg: &Message) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    match msg {
        Message::PageRequest { page_id, access, requester } => {
            w.u64(*page_id);
            w.u8(access.to_u8());
            w.u32(*requester);
        }
        Message::PageReply { page_id, version, access, data } => {
            if !assert_page_sized(data) {
                return Err(DsmError::Invalid("PageReply payload must be exactly one page".into()));
            }
            w.u64(*page_id);
            w.u64(*version);
            w.u8(access.to_u8());
            w.bytes(data);
        }
        Message::Invalidate { page_id, new_owner, version } => {
            w.u64(*page_id);
            w.u32(*new_owner);
            w.u64(*version);
        }
        Message::InvalidateAck { page_id, acker } => {
            w.u64(*page_id);
            w.u32(*acker);
        }
        Message::LockRequest { lock_id, node } | Message::LockGrant { lock_id, node } | Message::LockRelease { lock_id, node } => {
            w.u64(*lock_id);
            w.u32(*node);
        }
        Message::BarrierArrive { barrier_id, arriver, num_participants } => {
            w.u64(*barrier_id);
            w.u32(*arriver);
            w.u32(*num_participants);
        }
        Message::BarrierRelease { barrier_id, num_arrived } => {
            w.u64(*barrier_id);
            w.u32(*num_arrived);
        }
        Message::AllocNotify { start_page_id, end_page_id, owner, num_pages, base_addr, total_size } => {
            w.u64(*start_page_id);
            w.u64(*end_page_id);
            w.u32(*owner);
            w.u32(*num_pages);
            w.u64(*base_addr);
            w.u64(*total_size);
        }
        Message::AllocAck { start, end, acker } => {
            w.u64(*start);
            w.u64(*end);
            w.u32(*acker);
        }
        Message::NodeJoin { node_id, hostname, port } => {
            w.u32(*node_id);
            w.string(hostname);
            w.u16(*port);
        }
        Message::NodeLeave { node_id } => {
            w.u32(*node_id);
        }
        Message::Heartbeat => {}
        Message::HeartbeatAck { acker, timestamp } => {
            w.u32(*acker);
            w.u64(*timestamp);
        }
        Message::DirQuery { page_id, requester } => {
            w.u64(*page_id);
            w.u32(*requester);
        }
        Message::DirReply { page_id, owner } => {
            w.u64(*page_id);
            w.node(*owner);
        }
        Message::OwnerUpdate { page_id, new_owner } => {
            w.u64(*page_id);
            w.u32(*new_owner);
        }
        Message::NodeFailed { failed_node } => {
            w.u32(*failed_node);
        }
        Message::SharerQuery { page_id, requester } => {
            w.u64(*page_id);
            w.u32(*requester);
        }
        Message::SharerReply { page_id, sharers } => {
            w.u64(*page_id);
            w.node_vec(sharers);
        }
        Message::StateSyncDir { sync_seq, page_id, owner, sharers } => {
            w.u64(*sync_seq);
            w.u64(*page_id);
            w.node(*owner);
            w.node_vec(sharers);
        }
        Message::StateSyncLock { sync_seq, lock_id, holder, queue } => {
            w.u64(*sync_seq);
            w.u64(*lock_id);
            w.node(*holder);
            w.node_vec(queue);
        }
        Message::StateSyncBarrier { sync_seq, barrier_id, expected, arrived, generation } => {
            w.u64(*sync_seq);
            w.u64(*barrier_id);
            w.u32(*expected);
            w.u32(*arrived);
            w.u64(*generation);
        }
        Message::StateSyncNode { sync_seq, node_id, is_failed } => {
            w.u64(*sync_seq);
            w.u32(*node_id);
            w.bool(*is_failed);
        }
        Message::ManagerPromotion { new_manager, old_manager, promotion_time } => {
            w.u32(*new_manager);
            w.u32(*old_manager);
            w.u64(*promotion_time);
        }
        Message::ReconnectRequest { requester_id, last_seq_seen } => {
            w.u32(*requester_id);
            w.u64(*last_seq_seen);
        }
        Message::Error { error_code, page_id, message } => {
            w.i32(*error_code);
            w.u64(*page_id);
            w.string(message);
        }
    }
    Ok(w.buf)
}

fn decode_payload(msg_type: u32, r: &mut Reader) -> Result<Message> {
    Ok(match msg_type {
        1 => Message::PageRequest {
            page_id: r.u64()?,
            access: Access::from_u8(r.u8()?).ok_or_else(|| DsmError::Invalid("bad access byte".into()))?,
            requester: r.u32()?,
        },
        2 => {
            let page_id = r.u64()?;
            let version = r.u64()?;
            let access = Access::from_u8(r.u8()?).ok_or_else(|| DsmError::Invalid("bad access byte".into()))?;
            let data = r.bytes()?;
            if !assert_page_sized(&data) {
                return Err(DsmError::Invalid("PageReply payload must be exactly one page".into()));
            }
            Message::PageReply { page_id, version, access, data }
        }
        3 => Message::Invalidate { page_id: r.u64()?, new_owner: r.u32()?, version: r.u64()? },
        4 => Message::InvalidateAck { page_id: r.u64()?, acker: r.u32()? },
        5 => Message::LockRequest { lock_id: r.u64()?, node: r.u32()? },
        6 => Message::LockGrant { lock_id: r.u64()?, node: r.u32()? },
        7 => Message::LockRelease { lock_id: r.u64()?, node: r.u32()? },
        8 => Message::BarrierArrive { barrier_id: r.u64()?, arriver: r.u32()?, num_participants: r.u32()? },
        9 => Message::BarrierRelease { barrier_id: r.u64()?, num_arrived: r.u32()? },
        10 => Message::AllocNotify {
            start_page_id: r.u64()?,
            end_page_id: r.u64()?,
            owner: r.u32()?,
            num_pages: r.u32()?,
            base_addr: r.u64()?,
            total_size: r.u64()?,
        },
        11 => Message::AllocAck { start: r.u64()?, end: r.u64()?, acker: r.u32()? },
        12 => Message::NodeJoin { node_id: r.u32()?, hostname: r.string()?, port: r.u16()? },
        13 => Message::NodeLeave { node_id: r.u32()? },
        14 => Message::Heartbeat,
        15 => Message::HeartbeatAck { acker: r.u32()?, timestamp: r.u64()? },
        16 => Message::DirQuery { page_id: r.u64()?, requester: r.u32()? },
        17 => Message::DirReply { page_id: r.u64()?, owner: r.node()? },
        18 => Message::OwnerUpdate { page_id: r.u64()?, new_owner: r.u32()? },
        19 => Message::NodeFailed { failed_node: r.u32()? },
        20 => Message::SharerQuery { page_id: r.u64()?, requester: r.u32()? },
        21 => Message::SharerReply { page_id: r.u64()?, sharers: r.node_vec()? },
        22 => Message::StateSyncDir { sync_seq: r.u64()?, page_id: r.u64()?, owner: r.node()?, sharers: r.node_vec()? },
        23 => Message::StateSyncLock { sync_seq: r.u64()?, lock_id: r.u64()?, holder: r.node()?, queue: r.node_vec()? },
        24 => Message::StateSyncBarrier {
            sync_seq: r.u64()?,
            barrier_id: r.u64()?,
            expected: r.u32()?,
            arrived: r.u32()?,
            generation: r.u64()?,
        },
        25 => Message::StateSyncNode { sync_seq: r.u64()?, node_id: r.u32()?, is_failed: r.bool()? },
        26 => Message::ManagerPromotion { new_manager: r.u32()?, old_manager: r.u32()?, promotion_time: r.u64()? },
        27 => Message::ReconnectRequest { requester_id: r.u32()?, last_seq_seen: r.u64()? },
        28 => Message::Error { error_code: r.i32()?, page_id: r.u64()?, message: r.string()? },
        other => return Err(DsmError::Invalid(format!("unknown message type {other}"))),
    })
}

/// Encodes `msg` into a full frame (header + payload), *not* including
/// the outer 4-byte length prefix used by [`write_frame`].
pub fn encode(msg: &Message, sender: NodeId, seq_num: u64) -> Result<Vec<u8>> {
    let payload = encode_payload(msg)?;
    let mut w = Writer::new();
    w.u32(MAGIC);
    w.u32(msg.type_tag());
    w.u32(payload.len() as u32);
    w.u32(sender);
    w.u64(seq_num);
    w.buf.extend_from_slice(&payload);
    if w.buf.len() > MAX_FRAME_LEN {
        return Err(DsmError::Invalid(format!("frame too large: {} bytes", w.buf.len())));
    }
    Ok(w.buf)
}

/// Decodes a full frame (header + payload) produced by [`encode`].
pub fn decode(frame: &[u8]) -> Result<(Header, Message)> {
    let mut r = Reader::new(frame);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(DsmError::Invalid(format!("bad magic 0x{magic:08x}")));
    }
    let msg_type = r.u32()?;
    let length = r.u32()?;
    let sender = r.u32()?;
    let seq_num = r.u64()?;
    if HEADER_LEN + length as usize != frame.len() {
        return Err(DsmError::Invalid("frame length mismatch".into()));
    }
    let msg = decode_payload(msg_type, &mut r)?;
    Ok((Header { magic, msg_type, length, sender, seq_num }, msg))
}

/// Writes `msg` to `w` as `[4-byte BE outer length][frame]`.
pub fn write_frame<W: Write>(w: &mut W, msg: &Message, sender: NodeId, seq_num: u64) -> Result<()> {
    let frame = encode(msg, sender, seq_num)?;
    w.write_all(&(frame.len() as u32).to_be_bytes())?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Reads one `[4-byte BE outer length][frame]` unit from `r`.
pub fn read_frame<R: Read>(r: &mut R) -> Result<(Header, Message)> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(DsmError::Invalid(format!("implausible frame length {len}")));
    }
    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame)?;
    decode(&frame)
}

/// Turns a received [`Message::Error`] into a `DsmError`, or `None` if
/// the message isn't an `Error` variant.
pub fn as_error(msg: &Message) -> Option<(ErrorKind, PageId, String)> {
    if let Message::Error { error_code, page_id, message } = msg {
        let kind = match *error_code {
            -1 => ErrorKind::Init,
            -2 => ErrorKind::Memory,
            -3 => ErrorKind::Network,
            -4 => ErrorKind::Timeout,
            -5 => ErrorKind::NotFound,
            -6 => ErrorKind::Invalid,
            -7 => ErrorKind::Busy,
            _ => ErrorKind::Invalid,
        };
        Some((kind, *page_id, message.clone()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = encode(&msg, 3, 42).expect("encode");
        let (header, decoded) = decode(&encoded).expect("decode");
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.sender, 3);
        assert_eq!(header.seq_num, 42);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_every_variant() {
        roundtrip(Message::PageRequest { page_id: 7, access: Access::Read, requester: 1 });
        roundtrip(Message::PageReply { page_id: 7, version: 2, access: Access::Write, data: vec![0xAB; crate::PAGE_SIZE] });
        roundtrip(Message::Invalidate { page_id: 7, new_owner: 2, version: 3 });
        roundtrip(Message::InvalidateAck { page_id: 7, acker: 2 });
        roundtrip(Message::LockRequest { lock_id: 5000, node: 1 });
        roundtrip(Message::BarrierArrive { barrier_id: 100, arriver: 1, num_participants: 4 });
        roundtrip(Message::BarrierRelease { barrier_id: 100, num_arrived: 4 });
        roundtrip(Message::AllocNotify {
            start_page_id: 1_000_000,
            end_page_id: 1_000_010,
            owner: 1,
            num_pages: 10,
            base_addr: 0x7f0000000000,
            total_size: 40960,
        });
        roundtrip(Message::NodeJoin { node_id: 2, hostname: "worker-2".into(), port: 9000 });
        roundtrip(Message::Heartbeat);
        roundtrip(Message::DirReply { page_id: 7, owner: None });
        roundtrip(Message::DirReply { page_id: 7, owner: Some(2) });
        roundtrip(Message::SharerReply { page_id: 7, sharers: vec![1, 2, 3] });
        roundtrip(Message::Error { error_code: ErrorKind::Invalid.code(), page_id: 7, message: "stale owner".into() });
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode(&Message::Heartbeat, 0, 0).unwrap();
        frame[0] ^= 0xff;
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn page_reply_must_be_one_page() {
        let msg = Message::PageReply { page_id: 1, version: 1, access: Access::Read, data: vec![0; 10] };
        assert!(encode(&msg, 0, 0).is_err());
    }

    #[test]
    fn frame_round_trips_over_a_pipe() {
        let (mut r, mut w) = (std::io::Cursor::new(Vec::new()), Vec::new());
        write_frame(&mut w, &Message::Heartbeat, 5, 9).unwrap();
        r.get_mut().extend_from_slice(&w);
        let (header, msg) = read_frame(&mut r).unwrap();
        assert_eq!(header.sender, 5);
        assert_eq!(msg, Message::Heartbeat);
    }
}
