//! Incremental framer for 9P responses.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented messages:
//! - `WaitingForHeader`: Need the 7-byte header before anything else
//! - `WaitingForPrefix`: Header parsed, need the embedded count field that
//!   fixes the body length (Rversion, Rerror, Rwalk, Rread, Rstat)
//! - `WaitingForBody`: Exact total length known, need the rest
//!
//! A message is only materialized once every byte of it is buffered; until
//! then [`FrameBuffer::next_frame`] reports exactly how many more bytes it
//! needs and consumes nothing. Parsed header and computed lengths are kept
//! in the state, so no byte is scanned twice.
//!
//! # Example
//!
//! ```
//! use ninep_client::protocol::{encode_response, Decoded, FrameBuffer, Rmessage};
//!
//! let raw = encode_response(1, &Rmessage::Write { count: 5 }).unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! buffer.extend(&raw[..3]);
//! assert!(matches!(buffer.next_frame().unwrap(), Decoded::Incomplete { needed: 4 }));
//!
//! buffer.extend(&raw[3..]);
//! match buffer.next_frame().unwrap() {
//!     Decoded::Frame(frame) => assert_eq!(frame.message, Rmessage::Write { count: 5 }),
//!     Decoded::Incomplete { .. } => unreachable!(),
//! }
//! ```

use bytes::BytesMut;

use super::frame::{Frame, Trailing};
use super::message::decode_response_body;
use super::wire_format::{Header, MessageType, DEFAULT_MSIZE, HEADER_SIZE, MAXWELEM, QID_SIZE};
use crate::error::{NineError, Result};

/// How the body length of a response kind is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLayout {
    /// Statically known body length.
    Fixed(usize),
    /// `prefix` bytes must be read first; the count field at `count_at`
    /// (`width` bytes wide) multiplied by `unit` gives the rest.
    Counted {
        prefix: usize,
        count_at: usize,
        width: usize,
        unit: usize,
        trailing: bool,
    },
}

impl BodyLayout {
    fn for_response(ty: MessageType) -> Result<Self> {
        use BodyLayout::*;
        let layout = match ty {
            MessageType::Rversion => Counted {
                prefix: 6,
                count_at: 4,
                width: 2,
                unit: 1,
                trailing: false,
            },
            MessageType::Rauth | MessageType::Rattach => Fixed(QID_SIZE),
            MessageType::Rerror => Counted {
                prefix: 2,
                count_at: 0,
                width: 2,
                unit: 1,
                trailing: true,
            },
            MessageType::Rflush
            | MessageType::Rclunk
            | MessageType::Rremove
            | MessageType::Rwstat => Fixed(0),
            MessageType::Rwalk => Counted {
                prefix: 2,
                count_at: 0,
                width: 2,
                unit: QID_SIZE,
                trailing: false,
            },
            MessageType::Ropen | MessageType::Rcreate => Fixed(QID_SIZE + 4),
            MessageType::Rread => Counted {
                prefix: 4,
                count_at: 0,
                width: 4,
                unit: 1,
                trailing: true,
            },
            MessageType::Rwrite => Fixed(4),
            MessageType::Rstat => Counted {
                prefix: 2,
                count_at: 0,
                width: 2,
                unit: 1,
                trailing: false,
            },
            other => {
                return Err(NineError::Decode(format!(
                    "received request type {:?} from server",
                    other
                )))
            }
        };
        Ok(layout)
    }
}

/// State machine for message parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 7 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for the count field.
    WaitingForPrefix {
        header: Header,
        ty: MessageType,
        layout: BodyLayout,
    },
    /// Total length known, waiting for the remaining bytes.
    WaitingForBody {
        header: Header,
        ty: MessageType,
        total: usize,
        trailing: Option<Trailing>,
    },
}

/// Result of one framing step.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes buffered; at least `needed` more are required.
    Incomplete { needed: usize },
    /// Exactly one complete message was consumed.
    Frame(Frame),
}

/// Buffer for accumulating incoming bytes and extracting complete responses.
///
/// All data is stored in a single `BytesMut` buffer; completed messages are
/// split off and frozen, so payloads share the receive allocation.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Largest message accepted; the negotiated msize.
    msize: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max message: 8192 bytes.
    pub fn new() -> Self {
        Self::with_msize(DEFAULT_MSIZE)
    }

    /// Create a new frame buffer accepting messages up to `msize` bytes.
    pub fn with_msize(msize: u32) -> Self {
        Self::with_capacity_and_msize(64 * 1024, msize)
    }

    /// Create a new frame buffer with custom capacity and msize.
    pub fn with_capacity_and_msize(capacity: usize, msize: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            msize,
        }
    }

    /// Change the size ceiling after version negotiation.
    pub fn set_msize(&mut self, msize: u32) {
        self.msize = msize;
    }

    /// Current size ceiling.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on any framing violation; the buffer is then unusable.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Decoded::Frame(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Decoded::Frame(frame))` if a complete message was consumed
    /// - `Ok(Decoded::Incomplete { needed })` with the exact shortfall
    /// - `Err(...)` on a protocol violation (unknown type, size mismatch,
    ///   message larger than msize). These are not recoverable.
    pub fn next_frame(&mut self) -> Result<Decoded> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(Decoded::Incomplete {
                            needed: HEADER_SIZE - self.buffer.len(),
                        });
                    }

                    let header = Header::decode(&self.buffer[..HEADER_SIZE])
                        .ok_or_else(|| NineError::Decode("short header".into()))?;
                    let ty = header.validate(self.msize)?;
                    let layout = BodyLayout::for_response(ty)?;

                    self.state = match layout {
                        BodyLayout::Fixed(len) => {
                            let total = HEADER_SIZE + len;
                            check_total(&header, ty, total)?;
                            State::WaitingForBody {
                                header,
                                ty,
                                total,
                                trailing: None,
                            }
                        }
                        BodyLayout::Counted { .. } => State::WaitingForPrefix { header, ty, layout },
                    };
                }

                State::WaitingForPrefix { header, ty, layout } => {
                    let BodyLayout::Counted {
                        prefix,
                        count_at,
                        width,
                        unit,
                        trailing,
                    } = layout
                    else {
                        unreachable!("fixed layouts skip the prefix state");
                    };

                    let needed = HEADER_SIZE + prefix;
                    if self.buffer.len() < needed {
                        return Ok(Decoded::Incomplete {
                            needed: needed - self.buffer.len(),
                        });
                    }

                    let at = HEADER_SIZE + count_at;
                    let count = match width {
                        2 => u16::from_le_bytes([self.buffer[at], self.buffer[at + 1]]) as usize,
                        _ => u32::from_le_bytes([
                            self.buffer[at],
                            self.buffer[at + 1],
                            self.buffer[at + 2],
                            self.buffer[at + 3],
                        ]) as usize,
                    };
                    if ty == MessageType::Rwalk && count > MAXWELEM {
                        return Err(NineError::Decode(format!("Rwalk with {} qids", count)));
                    }

                    let total = (HEADER_SIZE + prefix)
                        .checked_add(count.saturating_mul(unit))
                        .unwrap_or(usize::MAX);
                    check_total(&header, ty, total)?;

                    self.state = State::WaitingForBody {
                        header,
                        ty,
                        total,
                        trailing: trailing.then_some(Trailing {
                            offset: HEADER_SIZE + prefix,
                            len: count,
                        }),
                    };
                }

                State::WaitingForBody {
                    header,
                    ty,
                    total,
                    trailing,
                } => {
                    if self.buffer.len() < total {
                        return Ok(Decoded::Incomplete {
                            needed: total - self.buffer.len(),
                        });
                    }

                    // Consume exactly one message (zero-copy freeze)
                    let raw = self.buffer.split_to(total).freeze();
                    self.state = State::WaitingForHeader;

                    let message = decode_response_body(ty, &raw)?;
                    return Ok(Decoded::Frame(Frame::new(header, message, raw, trailing)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPrefix { .. } => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The size field must agree with the length implied by the body layout.
fn check_total(header: &Header, ty: MessageType, total: usize) -> Result<()> {
    if header.size as usize != total {
        return Err(NineError::Decode(format!(
            "{:?} header size {} but body layout requires {}",
            ty, header.size, total
        )));
    }
    Ok(())
}
