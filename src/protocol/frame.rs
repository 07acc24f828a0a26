//! Frame struct with typed accessors.
//!
//! Represents one complete response: its header, the decoded message, and
//! the raw bytes it was decoded from. Variable-length trailing payloads
//! (Rread data, Rerror text) are described by a [`Trailing`] span into the
//! raw bytes rather than copied.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use ninep_client::protocol::{encode_response, FrameBuffer, Rmessage};
//!
//! let raw = encode_response(4, &Rmessage::Read { data: Bytes::from_static(b"hello") }).unwrap();
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&raw).unwrap();
//!
//! assert_eq!(frames[0].tag(), 4);
//! assert_eq!(frames[0].payload(), b"hello");
//! ```

use bytes::Bytes;

use super::message::Rmessage;
use super::wire_format::{Header, MessageType};

/// Location of a variable-length trailing payload inside the raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailing {
    /// Offset from the first header byte.
    pub offset: usize,
    /// Payload length in bytes.
    pub len: usize,
}

/// A complete response frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Decoded message body.
    pub message: Rmessage,
    raw: Bytes,
    trailing: Option<Trailing>,
}

impl Frame {
    pub(crate) fn new(header: Header, message: Rmessage, raw: Bytes, trailing: Option<Trailing>) -> Self {
        Self {
            header,
            message,
            raw,
            trailing,
        }
    }

    /// Get the tag.
    #[inline]
    pub fn tag(&self) -> u16 {
        self.header.tag
    }

    /// Get the message type.
    #[inline]
    pub fn msg_type(&self) -> MessageType {
        self.message.msg_type()
    }

    /// Check if this is an Rerror.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    /// The whole message as received, header included.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Span of the trailing payload, if this kind carries one.
    #[inline]
    pub fn trailing(&self) -> Option<Trailing> {
        self.trailing
    }

    /// The trailing payload bytes (empty if there is none).
    pub fn payload(&self) -> &[u8] {
        match self.trailing {
            Some(t) => &self.raw[t.offset..t.offset + t.len],
            None => &[],
        }
    }

    /// Take the decoded message, dropping the frame.
    pub fn into_message(self) -> Rmessage {
        self.message
    }
}
