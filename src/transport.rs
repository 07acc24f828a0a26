//! Transport collaborators: how a session gets its byte stream and whom it
//! tells about state changes.
//!
//! The session never opens sockets itself. A [`Connector`] produces one
//! ordered, bidirectional async byte stream; an [`EventSink`] injected at
//! construction receives ready/failed notifications.
//!
//! # Example
//!
//! ```ignore
//! use ninep_client::transport::StreamConnector;
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:564").await?;
//! let session = Session::builder().connect(StreamConnector::new(stream)).await?;
//! ```

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NineError;

/// Connection phases. Only `Ready` accepts new operations.
///
/// ```text
/// Disconnected → Connecting → VersionNegotiating → Attaching → Ready
///                                                              ├→ Failed
///                                                              └→ Disconnected
/// ```
///
/// Any phase before `Ready` may also move straight to `Failed`. A failed
/// session is never resumed; build a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    VersionNegotiating,
    Attaching,
    Ready,
    Failed,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, VersionNegotiating)
                | (VersionNegotiating, Attaching)
                | (Attaching, Ready)
                | (Ready, Disconnected)
                | (Connecting | VersionNegotiating | Attaching | Ready, Failed)
        )
    }

    /// Once a session has left `Disconnected`, these states end it for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Disconnected)
    }
}

/// Receiver of session lifecycle notifications.
///
/// Called from the session's worker task; implementations should return
/// quickly.
pub trait EventSink: Send + Sync {
    /// Every state transition, in order.
    fn state_changed(&self, _state: ConnectionState) {}

    /// The session finished attaching and accepts operations.
    fn ready(&self) {}

    /// The session failed; queued operations are being failed with it.
    fn failed(&self, _error: &NineError) {}
}

/// Event sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Capability to establish the byte stream for one session.
///
/// Consumed by the connect: a reconnect needs a fresh connector and a
/// fresh session.
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connector wrapping a stream that is already established.
#[derive(Debug)]
pub struct StreamConnector<S> {
    stream: S,
}

impl<S> StreamConnector<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S> Connector for StreamConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn connect(self) -> impl Future<Output = io::Result<S>> + Send {
        std::future::ready(Ok(self.stream))
    }
}
