//! # Connection Errors
//!
//! Purpose: Classify every failure a connection can surface so callers can
//! tell a poisoned connection apart from a rejected command.
//!
//! ## Design Principles
//! 1. **Sticky vs. Local**: I/O, protocol and close errors poison the
//!    connection; encode, pipeline and server errors do not.
//! 2. **Cheap Clones**: The sticky copy is handed out on every later call, so
//!    `io::Error` is kept behind an `Arc`.
//! 3. **Fail Fast**: Errors are returned, never retried or swallowed.

use std::io;
use std::sync::Arc;

/// Result type for connection operations.
pub type ConnResult<T> = Result<T, ConnError>;

/// Errors surfaced by a connection and its helpers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnError {
    /// The connection could not be established.
    #[error("dial {network} {address}: {source}")]
    Dial {
        network: String,
        address: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Dial was asked for a network this crate does not speak.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// A request could not be put on the wire. The connection stays usable.
    #[error("encode error: {0}")]
    Encode(String),

    /// `max_pending` commands are already waiting for replies.
    #[error("pipeline full: {0} commands pending")]
    PipelineFull(usize),

    /// Socket read or write failure, including timeouts.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// The peer sent a frame that does not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed locally.
    #[error("use of closed connection")]
    Closed,

    /// The server rejected the command with an error reply.
    #[error("{0}")]
    Server(String),

    /// A reply helper was given a nil reply.
    #[error("nil reply")]
    Nil,

    /// A reply helper was given a reply of the wrong shape.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ConnError {
    /// Returns true when this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnError::Io(_) | ConnError::Protocol(_) | ConnError::Closed
        )
    }

    /// Returns true when a read or write deadline expired.
    ///
    /// Blocking sockets report an expired timeout as `WouldBlock` on Unix and
    /// `TimedOut` on Windows.
    pub fn is_timeout(&self) -> bool {
        match self {
            ConnError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ConnError::Protocol(msg.into())
    }
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        ConnError::Io(Arc::new(err))
    }
}
