//! Event bus plumbing for the isle services.
//!
//! Implements the replication fabric between independently owned services:
//! publishing committed changes, durable queue-grouped subscriptions, and
//! the per-message apply/acknowledge state machine.
//!
//! # Delivery contract
//!
//! - **Publishing is best-effort.** In [`DeliveryMode::Direct`] the owner
//!   publishes after its transaction commits, once per event. A failure in
//!   that window loses the event; it is counted in [`DeliveryMetrics`] and
//!   logged under the `isle::lost_event` target so operators can spot
//!   diverging replicas. [`DeliveryMode::Outbox`] closes the window by
//!   writing events into the `outbox` table inside the transaction and
//!   relaying them afterwards.
//! - **Consumption is at-least-once.** A delivery that is not acknowledged
//!   (handler failure, crash, dropped delivery) is redelivered to some
//!   member of the same queue group. Handlers must therefore be idempotent.
//! - **Ordering** is guaranteed per subscription. A queue group subscribes
//!   to a set of subjects and receives them in publish order, one message
//!   at a time, redeliveries included. Events of subjects in different
//!   subscriptions may arrive in any order relative to each other, so
//!   subjects whose relative order matters share one subscription.
//!
//! # Per-message state machine
//!
//! ```text
//! Received ─► decode ─┬─ malformed ───────────────► dead letter ─► ack
//!                     └─► handle ─┬─ Applied ─────────────────────► ack
//!                                 ├─ Skipped(missing ref) ─► dead letter ─► ack
//!                                 └─ Failed ───────────────────────► nak (redelivered)
//! ```
//!
//! [`DeliveryMode::Direct`]: isle_types::DeliveryMode::Direct
//! [`DeliveryMode::Outbox`]: isle_types::DeliveryMode::Outbox

pub mod error;
pub mod listener;
pub mod memory;
pub mod nats;
pub mod outbox;
pub mod publisher;
pub mod transport;

pub use error::BusError;
pub use listener::{
    process_delivery, run_listener, DeadLetter, DeadLetterReason, DeadLetterSink, Disposition,
    EventHandler, HandleOutcome, HandlerError, ListenerConfig, ListenerStats, ListenerStatsSnapshot,
    MemoryDeadLetters,
};
pub use memory::InMemoryBus;
pub use nats::NatsBus;
pub use outbox::{enqueue, start_outbox_relay, OutboxError, OutboxRelay, OutboxRow, RelayReport};
pub use publisher::{DeliveryMetrics, DeliverySnapshot, PublishReport, Publisher, LOST_EVENT_TARGET};
pub use transport::{Acker, Delivery, MessageBus, Subscription};
