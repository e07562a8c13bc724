//! Error types for the event channel

use crate::EventKind;

/// Result type alias for event channel operations
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised by the event channel.
///
/// Every variant describes a defect the daemon cannot recover from: a
/// broken wake channel, or a handler table that does not match the set of
/// emitted kinds. Callers are expected to stop the process on them.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A handler was already registered for this kind
    #[error("a handler is already registered for event {0}")]
    AlreadyRegistered(EventKind),

    /// The signal kind is handled by the caller of `consume`, never by a handler
    #[error("the signal event cannot have a handler")]
    Reserved,

    /// A pending event has no handler
    #[error("no handler registered for pending event {0}")]
    Unhandled(EventKind),

    /// Reading or writing the wake channel failed
    #[error("wake channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}
