//! One 9P conversation over an async byte stream.
//!
//! [`Connection`] owns the stream and the framer. It writes one encoded
//! request, then reads until the framer yields the matching response.
//! Bytes that arrive ahead of time (a server answering early, several
//! responses in one segment) stay in the framer for the next exchange.
//!
//! # Architecture
//!
//! ```text
//! Session worker ─► Connection::transact ─► encode ─► write_all ─► Stream
//!                                       ◄─ FrameBuffer ◄─ read ◄──┘
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NineError, Result};
use crate::protocol::{encode_request, Decoded, Frame, FrameBuffer, Rmessage, Tmessage};

/// Default size of a single socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) struct Connection<S> {
    stream: S,
    frames: FrameBuffer,
    read_buf: Vec<u8>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, msize: u32, read_buffer_size: usize) -> Self {
        Self {
            stream,
            frames: FrameBuffer::with_msize(msize),
            read_buf: vec![0u8; read_buffer_size.max(1)],
        }
    }

    pub(crate) fn msize(&self) -> u32 {
        self.frames.msize()
    }

    pub(crate) fn set_msize(&mut self, msize: u32) {
        self.frames.set_msize(msize);
    }

    /// Encode and write one request.
    ///
    /// A request that would exceed msize is refused before any byte is
    /// written, so the stream stays in sync.
    pub(crate) async fn send(&mut self, tag: u16, msg: &Tmessage) -> Result<()> {
        let bytes = encode_request(tag, msg)?;
        if bytes.len() > self.msize() as usize {
            return Err(NineError::InvalidArgument(format!(
                "{:?} of {} bytes exceeds msize {}",
                msg.msg_type(),
                bytes.len(),
                self.msize()
            )));
        }

        tracing::debug!(
            "-> {:?} tag={} size={}",
            msg.msg_type(),
            tag,
            bytes.len()
        );
        self.write_all(&bytes).await
    }

    async fn write_all(&mut self, bytes: &Bytes) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read until one complete response is framed.
    pub(crate) async fn recv(&mut self) -> Result<Frame> {
        loop {
            match self.frames.next_frame()? {
                Decoded::Frame(frame) => {
                    tracing::debug!(
                        "<- {:?} tag={} size={}",
                        frame.msg_type(),
                        frame.tag(),
                        frame.header.size
                    );
                    return Ok(frame);
                }
                Decoded::Incomplete { needed } => {
                    let n = self.stream.read(&mut self.read_buf).await?;
                    if n == 0 {
                        return Err(NineError::Connect(format!(
                            "connection closed while {} more bytes were expected",
                            needed
                        )));
                    }
                    self.frames.extend(&self.read_buf[..n]);
                }
            }
        }
    }

    /// Send a request and wait for the response carrying the same tag.
    ///
    /// Rerror is turned into [`NineError::Protocol`] here, so callers only
    /// ever see success layouts. A response for any other tag cannot be
    /// correlated while exactly one request is in flight and is fatal.
    pub(crate) async fn transact(&mut self, tag: u16, msg: &Tmessage) -> Result<Rmessage> {
        self.send(tag, msg).await?;
        let frame = self.recv().await?;

        if frame.tag() != tag {
            return Err(NineError::Decode(format!(
                "response tag {} does not match in-flight tag {}",
                frame.tag(),
                tag
            )));
        }

        match frame.into_message() {
            Rmessage::Error { ename } => Err(NineError::Protocol(ename)),
            other => Ok(other),
        }
    }

    /// Flush and close the write side.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Build the error for a response of the wrong kind.
pub(crate) fn unexpected(expected: &str, got: &Rmessage) -> NineError {
    NineError::Decode(format!(
        "expected {}, got {:?}",
        expected,
        got.msg_type()
    ))
}
