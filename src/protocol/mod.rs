//! Protocol module - wire format, codec, and framing.
//!
//! This module implements the 9P2000 wire protocol:
//! - 7-byte header encoding/decoding and message type codes
//! - Typed request/response messages with exact byte layouts
//! - Incremental framer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod message;
mod types;
mod wire_format;

pub use frame::{Frame, Trailing};
pub use frame_buffer::{Decoded, FrameBuffer};
pub use message::{decode_request, decode_response, encode_request, encode_response, Rmessage, Tmessage};
pub use types::{perm, OpenMode, Qid, QidType, Stat};
pub use wire_format::{
    Header, MessageType, DEFAULT_IOUNIT, DEFAULT_MSIZE, HEADER_SIZE, IOHDRSZ, MAXWELEM, NOFID,
    NOTAG, QID_SIZE, VERSION_9P2000,
};
