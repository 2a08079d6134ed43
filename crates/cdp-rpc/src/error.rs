//! Error types for the RPC runtime
//!
//! One flat enum. Callers branch on variants, never on strings.

use thiserror::Error;

use crate::rpc::protocol::{ResponseError, SessionId};

/// Result type for RPC operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The connection is shutting down or already gone. Terminal.
    #[error("rpc: the connection is closing")]
    Closing,

    /// The stream was closed and every buffered message has been consumed.
    #[error("rpc: the stream is closing")]
    StreamClosing,

    /// `close` was called on a stream that was already closed by its owner.
    #[error("rpc: stream already closed")]
    StreamClosed,

    /// The remote answered the call with an error object.
    #[error(transparent)]
    Remote(#[from] ResponseError),

    /// The caller's cancellation signal fired first.
    #[error("rpc: operation cancelled")]
    Cancelled,

    #[error("rpc: request timeout")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid websocket address {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// Misuse of [`crate::stream::sync`].
    #[error("sync: {0}")]
    Sync(String),

    #[error("session: unknown session {0}")]
    UnknownSession(SessionId),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// True for terminal connection errors, including a drained stream.
    pub fn is_closing(&self) -> bool {
        matches!(self, Error::Closing | Error::StreamClosing)
    }

    /// True when the operation stopped because the caller gave up on it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }

    /// The remote error object, if the remote rejected the call.
    pub fn remote(&self) -> Option<&ResponseError> {
        match self {
            Error::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is itself.
    pub(crate) fn merge(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
