//! NATS JetStream transport.
//!
//! Every subject of the catalog is published as `isle.<token>` onto one
//! file-backed stream. Each `(queue group, subject set)` pair maps to one
//! durable pull consumer with explicit acknowledgement, so a group keeps
//! accumulating messages while all of its members are offline and members
//! of the same group compete for messages. Consumers allow a single
//! unacknowledged message, which keeps delivery in stream order across
//! redeliveries and across every subject of the set.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream, AckKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use isle_events::{Envelope, Subject};
use tracing::{debug, info, warn};

use crate::error::BusError;
use crate::transport::{Acker, Delivery, MessageBus, Subscription};

/// Default stream holding every isle event.
pub const DEFAULT_STREAM_NAME: &str = "ISLE_EVENTS";

const SUBJECT_PREFIX: &str = "isle";

/// Retention of the event stream. Long enough for a service to be offline
/// for a maintenance window and catch up afterwards.
const STREAM_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// How long JetStream waits for an ack before redelivering.
const ACK_WAIT: Duration = Duration::from_secs(30);

/// Outstanding deliveries per consumer.
const MAX_ACK_PENDING: i64 = 1;

/// [`MessageBus`] backed by a NATS JetStream stream.
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
    stream: Stream,
}

impl NatsBus {
    /// Connects to `url` and ensures the event stream exists.
    pub async fn connect(url: &str, stream_name: &str) -> Result<Self, BusError> {
        info!(url, "connecting to NATS");

        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Transport(format!("failed to connect to NATS: {e}")))?;
        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![format!("{SUBJECT_PREFIX}.>")],
                max_age: STREAM_MAX_AGE,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Transport(format!("failed to create stream: {e}")))?;

        info!(stream = stream_name, "using stream with subjects {SUBJECT_PREFIX}.>");
        Ok(Self { jetstream, stream })
    }

    fn nats_subject(subject: Subject) -> String {
        format!("{SUBJECT_PREFIX}.{}", subject.token())
    }

    /// Inverse of [`NatsBus::nats_subject`].
    fn catalog_subject(nats_subject: &str) -> Option<Subject> {
        let token = nats_subject.strip_prefix(SUBJECT_PREFIX)?.strip_prefix('.')?;
        Subject::from_token(token).ok()
    }

    fn consumer_name(subjects: &[Subject], queue_group: &str) -> String {
        let tokens: Vec<String> = subjects
            .iter()
            .map(|subject| subject.token().replace('.', "-"))
            .collect();
        format!("{queue_group}-{}", tokens.join("_"))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let bytes = envelope.encode()?;
        let subject = Self::nats_subject(envelope.subject());

        // Wait for the stream's ack so a returned Ok means the event is
        // persisted, not merely written to the socket.
        self.jetstream
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|e| BusError::Transport(format!("failed to publish to {subject}: {e}")))?
            .await
            .map_err(|e| BusError::Transport(format!("publish to {subject} not acked: {e}")))?;

        debug!(
            subject = %subject,
            delivery_token = envelope.delivery_token(),
            "published event"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        subjects: &[Subject],
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut subjects = subjects.to_vec();
        subjects.sort();
        subjects.dedup();
        let Some(&fallback) = subjects.first() else {
            return Err(BusError::Transport(format!(
                "queue group {queue_group} subscribed to no subjects"
            )));
        };

        let name = Self::consumer_name(&subjects, queue_group);
        let mut filters: Vec<String> = subjects.iter().map(|s| Self::nats_subject(*s)).collect();
        let (filter_subject, filter_subjects) = if filters.len() == 1 {
            (filters.remove(0), Vec::new())
        } else {
            (String::new(), filters)
        };

        let consumer: PullConsumer = self
            .stream
            .get_or_create_consumer(
                &name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_ack_pending: MAX_ACK_PENDING,
                    filter_subject,
                    filter_subjects,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Transport(format!("failed to create consumer {name}: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Transport(format!("failed to open consumer {name}: {e}")))?;

        info!(consumer = %name, subjects = subjects.len(), "subscribed");
        Ok(Box::new(NatsSubscription { fallback, messages }))
    }
}

struct NatsSubscription {
    /// Used when a message arrives on a subject outside the catalog; the
    /// envelope check then dead-letters it as malformed.
    fallback: Subject,
    messages: jetstream::consumer::pull::Stream,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => {
                return Some(Err(BusError::Transport(format!(
                    "error receiving message: {e}"
                ))))
            }
        };

        let subject = match NatsBus::catalog_subject(message.subject.as_str()) {
            Some(subject) => subject,
            None => {
                warn!(nats_subject = %message.subject, "message on a subject outside the catalog");
                self.fallback
            }
        };
        let attempt = match message.info() {
            Ok(info) => info.delivered.max(1) as u64,
            Err(e) => {
                warn!(subject = %subject, "message without JetStream metadata: {e}");
                1
            }
        };
        let payload = message.payload.to_vec();

        Some(Ok(Delivery::new(
            subject,
            payload,
            attempt,
            Box::new(NatsAcker { message }),
        )))
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&mut self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Transport(format!("failed to ack: {e}")))
    }

    async fn nak(&mut self) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Transport(format!("failed to nak: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_prefixed_tokens() {
        assert_eq!(
            NatsBus::nats_subject(Subject::PrerequisiteCreated),
            "isle.prerequisite.created"
        );
    }

    #[test]
    fn catalog_subjects_round_trip() {
        for subject in Subject::ALL {
            assert_eq!(
                NatsBus::catalog_subject(&NatsBus::nats_subject(subject)),
                Some(subject)
            );
        }
        assert_eq!(NatsBus::catalog_subject("isle.unknown.thing"), None);
        assert_eq!(NatsBus::catalog_subject("other.island.updated"), None);
    }

    #[test]
    fn consumer_names_are_per_group_and_subject_set() {
        assert_eq!(
            NatsBus::consumer_name(&[Subject::AttemptCreated], "progress-service"),
            "progress-service-attempt-created"
        );
        assert_eq!(
            NatsBus::consumer_name(
                &[Subject::PrerequisitesDeleted, Subject::PrerequisiteCreated],
                "storefront-service"
            ),
            "storefront-service-prerequisites-deleted_prerequisite-created"
        );
    }
}
