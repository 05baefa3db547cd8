//! Messaging client error types.

use chatwatch_protocol::JidError;
use thiserror::Error;

/// Result type for messaging client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by a [`MessagingClient`](super::MessagingClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// A JID given by a caller could not be parsed.
    #[error("invalid jid: {0}")]
    InvalidJid(#[from] JidError),

    /// The remote side rejected the request.
    #[error("{method} failed: {message}")]
    Rejected { method: &'static str, message: String },

    /// No answer within the configured request timeout.
    #[error("{method} timed out after {secs}s")]
    Timeout { method: &'static str, secs: u64 },

    /// The client process or its channel is gone.
    #[error("messaging client closed")]
    Closed,

    /// Response payload did not match the expected shape.
    #[error("decoding {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
