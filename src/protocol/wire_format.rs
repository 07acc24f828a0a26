//! Wire format encoding and decoding.
//!
//! Every 9P2000 message starts with a 7-byte header:
//! ```text
//! ┌──────────┬───────┬──────────┐
//! │ Size     │ Type  │ Tag      │
//! │ 4 bytes  │ 1 byte│ 2 bytes  │
//! │ uint32 LE│       │ uint16 LE│
//! └──────────┴───────┴──────────┘
//! ```
//!
//! `size` counts the whole message, header included.
//! All multi-byte integers are Little Endian.

use crate::error::{NineError, Result};

/// Header size in bytes (fixed, exactly 7).
pub const HEADER_SIZE: usize = 7;

/// Encoded size of a qid.
pub const QID_SIZE: usize = 13;

/// Message size proposed in Tversion unless configured otherwise.
pub const DEFAULT_MSIZE: u32 = 8192;

/// Room for the Tread/Twrite header inside one message.
///
/// size[4] type[1] tag[2] fid[4] offset[8] count[4], rounded up.
pub const IOHDRSZ: u32 = 24;

/// iounit used when the server reports 0.
pub const DEFAULT_IOUNIT: u32 = DEFAULT_MSIZE - IOHDRSZ;

/// Maximum number of path elements in a single Twalk.
pub const MAXWELEM: usize = 16;

/// The only protocol version this client speaks.
pub const VERSION_9P2000: &str = "9P2000";

/// Tag reserved for "no tag".
pub const NOTAG: u16 = 0xFFFF;

/// Fid value meaning "no fid" (used as afid when auth is skipped).
pub const NOFID: u32 = 0xFFFF_FFFF;

/// 9P2000 message type codes. Each R-message is its T-message + 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl MessageType {
    /// Map a raw type byte to a known message type.
    pub fn from_u8(value: u8) -> Option<Self> {
        use MessageType::*;
        let ty = match value {
            100 => Tversion,
            101 => Rversion,
            102 => Tauth,
            103 => Rauth,
            104 => Tattach,
            105 => Rattach,
            107 => Rerror,
            108 => Tflush,
            109 => Rflush,
            110 => Twalk,
            111 => Rwalk,
            112 => Topen,
            113 => Ropen,
            114 => Tcreate,
            115 => Rcreate,
            116 => Tread,
            117 => Rread,
            118 => Twrite,
            119 => Rwrite,
            120 => Tclunk,
            121 => Rclunk,
            122 => Tremove,
            123 => Rremove,
            124 => Tstat,
            125 => Rstat,
            126 => Twstat,
            127 => Rwstat,
            _ => return None,
        };
        Some(ty)
    }

    /// Raw type byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// T-messages have even codes.
    #[inline]
    pub fn is_request(self) -> bool {
        self.as_u8() % 2 == 0
    }

    /// Check if this is an R-message (including Rerror).
    #[inline]
    pub fn is_response(self) -> bool {
        !self.is_request()
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total message size in bytes, header included.
    pub size: u32,
    /// Raw type byte.
    pub msg_type: u8,
    /// Request/response correlation tag.
    pub tag: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(size: u32, msg_type: u8, tag: u16) -> Self {
        Self {
            size,
            msg_type,
            tag,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use ninep_client::protocol::{Header, MessageType};
    ///
    /// let header = Header::new(19, MessageType::Tversion.as_u8(), 0);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [19, 0, 0, 0, 100, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (7 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4] = self.msg_type;
        buf[5..7].copy_from_slice(&self.tag.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use ninep_client::protocol::Header;
    ///
    /// let bytes = [11, 0, 0, 0, 117, 3, 0];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.size, 11);
    /// assert_eq!(header.msg_type, 117);
    /// assert_eq!(header.tag, 3);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            msg_type: buf[4],
            tag: u16::from_le_bytes([buf[5], buf[6]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Size covers at least the header itself
    /// - Size doesn't exceed the negotiated msize
    /// - Type byte is a known message type
    pub fn validate(&self, msize: u32) -> Result<MessageType> {
        if (self.size as usize) < HEADER_SIZE {
            return Err(NineError::Decode(format!(
                "Message size {} smaller than header",
                self.size
            )));
        }

        if self.size > msize {
            return Err(NineError::Decode(format!(
                "Message size {} exceeds msize {}",
                self.size, msize
            )));
        }

        MessageType::from_u8(self.msg_type).ok_or(NineError::UnknownType(self.msg_type))
    }

    /// Body length (size minus header).
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    /// Check if this is an Rerror.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Rerror.as_u8()
    }
}
