//! Error types for envelope encoding and decoding.

use crate::subject::Subject;

/// Errors produced while encoding or decoding an [`Envelope`](crate::Envelope).
///
/// Every decode failure is permanent: redelivering the same bytes cannot
/// succeed, so listeners dead-letter these instead of retrying.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The bytes are not a JSON envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The envelope `type` is not in the catalog.
    #[error("unknown event subject: {0}")]
    UnknownSubject(String),

    /// The payload does not match the schema of its subject.
    #[error("invalid payload for {subject}: {source}")]
    InvalidPayload {
        /// The subject named by the envelope.
        subject: Subject,
        /// The schema violation.
        #[source]
        source: serde_json::Error,
    },

    /// The envelope arrived on a different subject than it names.
    #[error("envelope of type {found} delivered on subject {expected}")]
    SubjectMismatch {
        /// Subject the message was delivered on.
        expected: Subject,
        /// Subject named inside the envelope.
        found: Subject,
    },

    /// The envelope could not be serialised.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}
