//! Error types for the streaming daemon

use std::io;

use pmoevent::EventError;

/// Result type alias for streaming client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Result type alias for daemon-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a streaming client is being dropped.
///
/// All of these are contained to one connection: the owner closes the
/// client and carries on with the others.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The peer closed its side of the connection
    #[error("connection closed by peer")]
    Disconnected,

    /// The client was already closed
    #[error("client is closed")]
    Closed,

    /// Request line or header line could not be parsed
    #[error("malformed request: {0:?}")]
    MalformedRequest(String),

    /// Only GET requests can be streamed
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The request did not fit in the input buffer
    #[error("request too large")]
    RequestTooLarge,

    /// Socket error other than "would block" / "interrupted"
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that stop the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The event channel is broken or misconfigured
    #[error("event channel error: {0}")]
    Event(#[from] EventError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
