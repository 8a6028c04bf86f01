//! The wire protocol: tagged message variants plus their hand-rolled
//! (de)serialisation (§6).

pub mod codec;
pub mod message;

pub use codec::{as_error, decode, encode, read_frame, write_frame};
pub use message::{Access, Header, Message, BarrierId, LockId, NodeId, PageId, HEADER_LEN, MAGIC, MAX_FRAME_LEN, NO_NODE};
