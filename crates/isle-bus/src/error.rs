//! Error types for the event bus.

use isle_events::EnvelopeError;

/// Errors that can occur while talking to the message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport rejected or failed the operation.
    #[error("bus transport error: {0}")]
    Transport(String),

    /// An envelope could not be encoded for publishing.
    #[error("bus envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// The subscription or bus has been closed.
    #[error("bus closed")]
    Closed,

    /// A local store used by the bus (outbox, dead letters) failed.
    #[error("bus store error: {0}")]
    Store(String),
}
