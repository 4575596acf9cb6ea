//! Transport abstraction shared by the in-memory and NATS buses.

use async_trait::async_trait;
use isle_events::{Envelope, Subject};

use crate::error::BusError;

/// A publish/subscribe message bus with durable queue groups.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes one envelope on its subject.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Joins `queue_group` for the messages of `subjects`.
    ///
    /// A group is identified by its name and subject set. Members of the
    /// same group share one ordered queue: messages are handed out in
    /// publish order, one at a time, and the next message is withheld until
    /// the current one is acked. A nak'd message is delivered again before
    /// anything published after it. Every distinct group receives its own
    /// copy of every message.
    async fn subscribe(
        &self,
        subjects: &[Subject],
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

/// A live subscription handing out deliveries one at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. Returns `None` once the subscription is
    /// closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>>;
}

/// Acknowledgment channel back to the bus for a single delivery.
#[async_trait]
pub trait Acker: Send {
    /// Removes the message from the group's queue.
    async fn ack(&mut self) -> Result<(), BusError>;

    /// Returns the message for redelivery.
    async fn nak(&mut self) -> Result<(), BusError>;
}

/// One delivery of a message to one member of a queue group.
///
/// A delivery that is dropped without [`Delivery::ack`] or [`Delivery::nak`]
/// behaves like a consumer crash: the bus redelivers the message.
pub struct Delivery {
    subject: Subject,
    payload: Vec<u8>,
    attempt: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(subject: Subject, payload: Vec<u8>, attempt: u64, acker: Box<dyn Acker>) -> Self {
        Self {
            subject,
            payload,
            attempt,
            acker,
        }
    }

    /// The subject the message was delivered on.
    pub fn subject(&self) -> Subject {
        self.subject
    }

    /// Raw envelope bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 1 for the first delivery, incremented on every redelivery.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub async fn ack(mut self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn nak(mut self) -> Result<(), BusError> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("attempt", &self.attempt)
            .field("bytes", &self.payload.len())
            .finish()
    }
}
