//! Durable queue-grouped listeners and the per-message state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use isle_events::{Envelope, Subject};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::BusError;
use crate::transport::{Delivery, MessageBus};

/// Result of applying one event to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The event was applied (or was already reflected locally).
    Applied,
    /// A required reference is not present locally; the event was not
    /// applied and will not be retried.
    Skipped { entity: &'static str, id: String },
}

/// Failure while applying an event. The delivery is returned to the bus.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Applies a set of event types on behalf of one queue group.
///
/// The subjects share one ordered subscription, so events whose relative
/// order matters belong to the same handler. Implementations must be
/// idempotent: the same envelope may be handled any number of times.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn subjects(&self) -> &[Subject];

    fn queue_group(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> Result<HandleOutcome, HandlerError>;
}

/// Why a message was acknowledged without being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    MissingReference,
    MalformedPayload,
    DeliveryExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingReference => "MISSING_REFERENCE",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::DeliveryExhausted => "DELIVERY_EXHAUSTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MISSING_REFERENCE" => Some(Self::MissingReference),
            "MALFORMED_PAYLOAD" => Some(Self::MalformedPayload),
            "DELIVERY_EXHAUSTED" => Some(Self::DeliveryExhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that was acknowledged without being applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub subject: Subject,
    pub queue_group: String,
    /// Absent when the envelope could not be decoded.
    pub delivery_token: Option<String>,
    pub reason: DeadLetterReason,
    pub detail: String,
    /// The raw message, lossily decoded as UTF-8.
    pub payload: String,
    pub attempt: u64,
}

/// Durable record of dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), BusError>;
}

/// Keeps dead letters in memory. Used in tests and when no store is set up.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, letter: DeadLetter) -> Result<(), BusError> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(letter);
        Ok(())
    }
}

/// Listener tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Dead-letter a message once it has failed this many deliveries.
    /// `None` redelivers forever.
    pub max_deliveries: Option<u64>,
    /// Pause after a transport error before pulling again.
    pub error_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_deliveries: None,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Per-listener counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    dead_lettered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
    pub failed: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Applied and acknowledged.
    Applied,
    /// Skipped on a missing reference, dead-lettered and acknowledged.
    Skipped,
    /// Dead-lettered for another reason and acknowledged.
    DeadLettered(DeadLetterReason),
    /// Returned to the bus for redelivery.
    Retried,
}

/// Runs one delivery through the state machine and settles it.
///
/// ```text
/// Received ─► decode ─┬─ malformed ─► dead letter ─► ack
///                     └─► handle ─┬─ Applied ──────────────► ack
///                                 ├─ Skipped ─► dead letter ─► ack
///                                 └─ Failed ─┬─ exhausted ─► dead letter ─► ack
///                                            └─────────────► nak
/// ```
///
/// A dead letter that cannot be recorded is never acknowledged: the
/// delivery is nak'd instead so the message is not lost without a trace.
pub async fn process_delivery(
    handler: &dyn EventHandler,
    dead_letters: &dyn DeadLetterSink,
    config: &ListenerConfig,
    stats: &ListenerStats,
    delivery: Delivery,
) -> Disposition {
    ListenerStats::bump(&stats.received);
    let subject = delivery.subject();
    let queue_group = handler.queue_group();
    let attempt = delivery.attempt();

    let decoded = if handler.subjects().contains(&subject) {
        Envelope::decode_for(subject, delivery.payload()).map_err(|e| e.to_string())
    } else {
        Err(format!("subject {subject} is not handled by this listener"))
    };
    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(detail) => {
            let letter = DeadLetter {
                subject,
                queue_group: queue_group.to_string(),
                delivery_token: None,
                reason: DeadLetterReason::MalformedPayload,
                detail,
                payload: String::from_utf8_lossy(delivery.payload()).into_owned(),
                attempt,
            };
            return dead_letter(dead_letters, stats, delivery, letter).await;
        }
    };
    let token = envelope.delivery_token().to_string();

    match handler.handle(&envelope).await {
        Ok(HandleOutcome::Applied) => {
            tracing::debug!(
                subject = %subject,
                queue_group,
                delivery_token = %token,
                entity_id = envelope.payload().entity_id(),
                attempt,
                "applied event"
            );
            ListenerStats::bump(&stats.applied);
            settle_ack(delivery, subject, &token).await;
            Disposition::Applied
        }
        Ok(HandleOutcome::Skipped { entity, id }) => {
            let letter = DeadLetter {
                subject,
                queue_group: queue_group.to_string(),
                delivery_token: Some(token),
                reason: DeadLetterReason::MissingReference,
                detail: format!("missing {entity} {id}"),
                payload: String::from_utf8_lossy(delivery.payload()).into_owned(),
                attempt,
            };
            match dead_letter(dead_letters, stats, delivery, letter).await {
                Disposition::DeadLettered(_) => {
                    ListenerStats::bump(&stats.skipped);
                    Disposition::Skipped
                }
                other => other,
            }
        }
        Err(e) => {
            ListenerStats::bump(&stats.failed);
            let exhausted = config.max_deliveries.is_some_and(|max| attempt >= max);
            if exhausted {
                let letter = DeadLetter {
                    subject,
                    queue_group: queue_group.to_string(),
                    delivery_token: Some(token),
                    reason: DeadLetterReason::DeliveryExhausted,
                    detail: e.to_string(),
                    payload: String::from_utf8_lossy(delivery.payload()).into_owned(),
                    attempt,
                };
                return dead_letter(dead_letters, stats, delivery, letter).await;
            }

            tracing::warn!(
                subject = %subject,
                queue_group,
                delivery_token = %token,
                attempt,
                error = %e,
                "failed to apply event, requesting redelivery"
            );
            settle_nak(delivery, subject).await;
            Disposition::Retried
        }
    }
}

async fn dead_letter(
    sink: &dyn DeadLetterSink,
    stats: &ListenerStats,
    delivery: Delivery,
    letter: DeadLetter,
) -> Disposition {
    let subject = letter.subject;
    let reason = letter.reason;

    tracing::warn!(
        subject = %subject,
        queue_group = %letter.queue_group,
        delivery_token = letter.delivery_token.as_deref().unwrap_or("-"),
        reason = %reason,
        detail = %letter.detail,
        attempt = letter.attempt,
        "dead-lettering event"
    );

    let token = letter.delivery_token.clone().unwrap_or_default();
    match sink.record(letter).await {
        Ok(()) => {
            ListenerStats::bump(&stats.dead_lettered);
            settle_ack(delivery, subject, &token).await;
            Disposition::DeadLettered(reason)
        }
        Err(e) => {
            tracing::error!(
                subject = %subject,
                reason = %reason,
                error = %e,
                "failed to record dead letter, requesting redelivery"
            );
            settle_nak(delivery, subject).await;
            Disposition::Retried
        }
    }
}

async fn settle_ack(delivery: Delivery, subject: Subject, token: &str) {
    if let Err(e) = delivery.ack().await {
        tracing::warn!(subject = %subject, delivery_token = token, error = %e, "failed to ack");
    }
}

async fn settle_nak(delivery: Delivery, subject: Subject) {
    if let Err(e) = delivery.nak().await {
        tracing::warn!(subject = %subject, error = %e, "failed to nak");
    }
}

fn describe(subjects: &[Subject]) -> String {
    subjects
        .iter()
        .map(|subject| subject.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Subscribes `handler` to its subjects and processes deliveries one at a
/// time until `shutdown` flips to `true`.
///
/// A delivery already being processed when shutdown is signalled runs to
/// completion before the listener returns.
pub async fn run_listener(
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn EventHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ListenerConfig,
    stats: Arc<ListenerStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BusError> {
    let subjects = describe(handler.subjects());
    let queue_group = handler.queue_group().to_string();
    let mut subscription = bus.subscribe(handler.subjects(), &queue_group).await?;

    tracing::info!(subjects = %subjects, queue_group = %queue_group, "listener started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender dropped: nobody can signal shutdown any more.
                    break;
                }
                continue;
            }
            next = subscription.next_delivery() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                process_delivery(
                    handler.as_ref(),
                    dead_letters.as_ref(),
                    &config,
                    &stats,
                    delivery,
                )
                .await;
            }
            Some(Err(e)) => {
                tracing::error!(
                    subjects = %subjects,
                    queue_group = %queue_group,
                    error = %e,
                    "error receiving delivery"
                );
                tokio::time::sleep(config.error_backoff).await;
            }
            None => {
                tracing::warn!(subjects = %subjects, queue_group = %queue_group, "subscription closed");
                return Err(BusError::Closed);
            }
        }
    }

    tracing::info!(subjects = %subjects, queue_group = %queue_group, "listener stopped");
    Ok(())
}
