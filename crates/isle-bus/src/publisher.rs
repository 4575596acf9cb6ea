//! Post-commit event publication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use isle_events::{Envelope, EventPayload};
use serde::Serialize;

use crate::error::BusError;
use crate::transport::MessageBus;

/// Tracing target for events lost between commit and publish.
pub const LOST_EVENT_TARGET: &str = "isle::lost_event";

/// Process-wide delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    published: AtomicU64,
    lost: AtomicU64,
    relayed: AtomicU64,
    relay_failures: AtomicU64,
}

/// A point-in-time copy of [`DeliveryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySnapshot {
    pub published: u64,
    pub lost: u64,
    pub relayed: u64,
    pub relay_failures: u64,
}

impl DeliveryMetrics {
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            published: self.published.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_relayed(&self, count: u64) {
        self.relayed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_relay_failure(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of publishing a batch of committed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub lost: usize,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.lost == 0
    }
}

/// Publishes committed changes to the bus, one event at a time.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    metrics: Arc<DeliveryMetrics>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            metrics: Arc::new(DeliveryMetrics::default()),
        }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    /// Publishes one envelope without touching the lost-event accounting.
    ///
    /// Used by the outbox relay, whose rows survive a failed publish.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.bus.publish(envelope).await?;
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Publishes events whose state change has already been committed.
    ///
    /// Events go out in order. The first failure stops the batch: that event
    /// and every later one are reported lost, since publishing a later event
    /// without the earlier one (say `prerequisite:created` without the
    /// preceding `prerequisites:deleted`) would mislead subscribers.
    pub async fn publish_committed(&self, events: Vec<EventPayload>) -> PublishReport {
        let envelopes: Vec<Envelope> = events.into_iter().map(Envelope::new).collect();
        self.publish_envelopes(&envelopes).await
    }

    /// Same as [`Publisher::publish_committed`] for pre-built envelopes.
    pub async fn publish_envelopes(&self, envelopes: &[Envelope]) -> PublishReport {
        let mut report = PublishReport {
            published: 0,
            lost: 0,
        };

        for (index, envelope) in envelopes.iter().enumerate() {
            if let Err(e) = self.publish_envelope(envelope).await {
                let lost = &envelopes[index..];
                for missing in lost {
                    tracing::error!(
                        target: LOST_EVENT_TARGET,
                        subject = %missing.subject(),
                        entity_id = missing.payload().entity_id(),
                        delivery_token = missing.delivery_token(),
                        error = %e,
                        "committed event was not published"
                    );
                }
                self.metrics
                    .lost
                    .fetch_add(lost.len() as u64, Ordering::Relaxed);
                report.lost = lost.len();
                break;
            }
            report.published += 1;
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBus;
    use isle_events::{PrerequisitePayload, PrerequisitesDeletedPayload, Subject};

    fn replacement(island: &str, prereqs: &[&str]) -> Vec<EventPayload> {
        let mut events = vec![EventPayload::PrerequisitesDeleted(
            PrerequisitesDeletedPayload {
                island_id: island.to_string(),
            },
        )];
        events.extend(prereqs.iter().map(|p| {
            EventPayload::PrerequisiteCreated(PrerequisitePayload {
                island_id: island.to_string(),
                prerequisite_island_id: p.to_string(),
            })
        }));
        events
    }

    #[tokio::test]
    async fn publishes_in_order() {
        let bus = InMemoryBus::new();
        let publisher = Publisher::new(Arc::new(bus.clone()));

        let report = publisher
            .publish_committed(replacement("d", &["a", "b"]))
            .await;

        assert_eq!(report, PublishReport { published: 3, lost: 0 });
        let subjects: Vec<Subject> = bus.published().iter().map(Envelope::subject).collect();
        assert_eq!(
            subjects,
            vec![
                Subject::PrerequisitesDeleted,
                Subject::PrerequisiteCreated,
                Subject::PrerequisiteCreated
            ]
        );
        assert_eq!(publisher.metrics().snapshot().published, 3);
    }

    #[tokio::test]
    async fn failure_counts_remaining_events_as_lost() {
        let bus = InMemoryBus::new();
        bus.set_unavailable(true);
        let publisher = Publisher::new(Arc::new(bus.clone()));

        let report = publisher
            .publish_committed(replacement("d", &["a", "b"]))
            .await;

        assert!(!report.is_complete());
        assert_eq!(report, PublishReport { published: 0, lost: 3 });
        let snapshot = publisher.metrics().snapshot();
        assert_eq!(snapshot.lost, 3);
        assert_eq!(snapshot.published, 0);
    }
}
