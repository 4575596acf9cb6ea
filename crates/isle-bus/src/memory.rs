//! In-process bus with durable queue groups and at-least-once redelivery.
//!
//! Used by tests and by single-process deployments. Semantics follow the
//! durable consumers of the NATS transport:
//!
//! - a queue group, once created by its first `subscribe`, keeps receiving
//!   messages even while it has no connected members;
//! - each message is copied to every group whose subject set covers it and
//!   handed to one member of each group;
//! - a group has at most one message in flight, so its members see
//!   messages strictly in publish order;
//! - a nak'd or dropped delivery goes back to the front of its group's
//!   queue with its attempt counter incremented.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use isle_events::{Envelope, Subject};
use tokio::sync::Notify;

use crate::error::BusError;
use crate::transport::{Acker, Delivery, MessageBus, Subscription};

#[derive(Debug, Clone)]
struct Pending {
    subject: Subject,
    bytes: Arc<Vec<u8>>,
    attempt: u64,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Pending>,
    in_flight: bool,
}

#[derive(Default)]
struct GroupQueue {
    // std Mutex: every critical section is a VecDeque push/pop and never
    // spans an await point.
    state: Mutex<QueueState>,
    notify: Notify,
}

impl GroupQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_back(&self, pending: Pending) {
        self.lock().queue.push_back(pending);
        self.notify.notify_one();
    }

    /// Takes the head of the queue unless a delivery is still outstanding.
    fn take(&self) -> Option<Pending> {
        let mut state = self.lock();
        if state.in_flight {
            return None;
        }
        let pending = state.queue.pop_front()?;
        state.in_flight = true;
        Some(pending)
    }

    /// Settles the outstanding delivery, returning it to the front of the
    /// queue when `redeliver` is set.
    fn settle(&self, redeliver: Option<Pending>) {
        {
            let mut state = self.lock();
            if let Some(pending) = redeliver {
                state.queue.push_front(pending);
            }
            state.in_flight = false;
        }
        self.notify.notify_one();
    }

    fn count(&self, subject: Subject) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|pending| pending.subject == subject)
            .count()
    }
}

/// A queue group is its name plus the sorted subjects it covers.
type GroupKey = (String, Vec<Subject>);

#[derive(Default)]
struct Inner {
    groups: Mutex<HashMap<GroupKey, Arc<GroupQueue>>>,
    published: Mutex<Vec<Envelope>>,
    unavailable: AtomicBool,
}

/// An in-process [`MessageBus`].
///
/// Cloning shares the same underlying bus.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `publish` fail until reset, simulating a bus
    /// outage between commit and publish.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every envelope accepted by `publish`, in publish order.
    pub fn published(&self) -> Vec<Envelope> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of `subject` messages waiting (undelivered or returned) in the
    /// groups named `queue_group`. A delivery in flight is not counted.
    pub fn pending(&self, subject: Subject, queue_group: &str) -> usize {
        self.groups()
            .iter()
            .filter(|((name, subjects), _)| name == queue_group && subjects.contains(&subject))
            .map(|(_, group)| group.count(subject))
            .sum()
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<GroupKey, Arc<GroupQueue>>> {
        self.inner
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Transport("in-memory bus is unavailable".to_string()));
        }

        let bytes = Arc::new(envelope.encode()?);
        let subject = envelope.subject();

        let targets: Vec<Arc<GroupQueue>> = self
            .groups()
            .iter()
            .filter(|((_, subjects), _)| subjects.contains(&subject))
            .map(|(_, group)| group.clone())
            .collect();

        for group in targets {
            group.push_back(Pending {
                subject,
                bytes: bytes.clone(),
                attempt: 1,
            });
        }

        self.inner
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(envelope.clone());

        tracing::trace!(
            subject = %subject,
            delivery_token = envelope.delivery_token(),
            "published to in-memory bus"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        subjects: &[Subject],
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        if subjects.is_empty() {
            return Err(BusError::Transport(format!(
                "queue group {queue_group} subscribed to no subjects"
            )));
        }

        let mut key = subjects.to_vec();
        key.sort();
        key.dedup();

        let group = self
            .groups()
            .entry((queue_group.to_string(), key))
            .or_default()
            .clone();

        Ok(Box::new(MemorySubscription { group }))
    }
}

struct MemorySubscription {
    group: Arc<GroupQueue>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        loop {
            if let Some(pending) = self.group.take() {
                let bytes = pending.bytes.as_ref().clone();
                let subject = pending.subject;
                let attempt = pending.attempt;
                let acker = MemoryAcker {
                    group: self.group.clone(),
                    pending: Some(pending),
                };
                return Some(Ok(Delivery::new(subject, bytes, attempt, Box::new(acker))));
            }
            self.group.notify.notified().await;
        }
    }
}

struct MemoryAcker {
    group: Arc<GroupQueue>,
    pending: Option<Pending>,
}

impl MemoryAcker {
    fn redeliver(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.attempt += 1;
            self.group.settle(Some(pending));
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&mut self) -> Result<(), BusError> {
        if self.pending.take().is_some() {
            self.group.settle(None);
        }
        Ok(())
    }

    async fn nak(&mut self) -> Result<(), BusError> {
        self.redeliver();
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.redeliver();
    }
}
