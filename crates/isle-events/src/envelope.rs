//! The wire envelope wrapping every published event.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::payload::EventPayload;
use crate::subject::Subject;

/// An immutable, published event.
///
/// The `delivery_token` is minted once when the envelope is created and is
/// carried unchanged through every redelivery, so logs and dead letters can
/// correlate repeated deliveries of the same event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    delivery_token: String,
    payload: EventPayload,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    subject: String,
    delivery_token: String,
    payload: serde_json::Value,
}

impl Envelope {
    /// Wraps a payload with a fresh delivery token.
    pub fn new(payload: EventPayload) -> Self {
        Self::with_token(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Wraps a payload with a caller-supplied token.
    pub fn with_token(delivery_token: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            delivery_token: delivery_token.into(),
            payload,
        }
    }

    pub fn subject(&self) -> Subject {
        self.payload.subject()
    }

    pub fn delivery_token(&self) -> &str {
        &self.delivery_token
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    /// Serialises the envelope to its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = WireEnvelope {
            subject: self.subject().as_str().to_string(),
            delivery_token: self.delivery_token.clone(),
            payload: self.payload.to_value().map_err(EnvelopeError::Encode)?,
        };
        serde_json::to_vec(&wire).map_err(EnvelopeError::Encode)
    }

    /// Parses an envelope from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        let subject: Subject = wire.subject.parse()?;
        let payload = EventPayload::from_value(subject, wire.payload)
            .map_err(|source| EnvelopeError::InvalidPayload { subject, source })?;

        Ok(Self {
            delivery_token: wire.delivery_token,
            payload,
        })
    }

    /// Parses an envelope and checks it names the subject it arrived on.
    pub fn decode_for(expected: Subject, bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope = Self::decode(bytes)?;
        if envelope.subject() != expected {
            return Err(EnvelopeError::SubjectMismatch {
                expected,
                found: envelope.subject(),
            });
        }
        Ok(envelope)
    }
}
