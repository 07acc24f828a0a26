//! Error types for ninep-client.

use thiserror::Error;

use crate::transport::ConnectionState;

/// Main error type for all 9P client operations.
#[derive(Debug, Error)]
pub enum NineError {
    /// Malformed or truncated bytes on the wire.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Response carried a type byte this client does not understand.
    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    /// Server answered with Rerror. Only the originating request fails.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Walk resolved fewer path elements than requested.
    #[error("Walk incomplete: {walked} of {requested} elements resolved")]
    WalkIncomplete { requested: usize, walked: usize },

    /// Transport failure, reset, or a session that is no longer running.
    #[error("Connect error: {0}")]
    Connect(String),

    /// No free fid or tag left.
    #[error("Exhausted: no free {0}")]
    Exhausted(&'static str),

    /// Operation submitted while the session was not ready.
    #[error("Session not ready (state: {0:?})")]
    NotReady(ConnectionState),

    /// Caller supplied something that cannot be put on the wire.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl NineError {
    /// Whether this error terminates the whole session.
    ///
    /// Decode and transport failures leave the framing state unrecoverable,
    /// everything else resolves only the request that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NineError::Decode(_) | NineError::UnknownType(_) | NineError::Connect(_) | NineError::Io(_)
        )
    }
}

/// Result type alias using NineError.
pub type Result<T> = std::result::Result<T, NineError>;
