//! Local shadow copies of entities owned by other services.
//!
//! A service subscribes to the subjects it does not own (see
//! [`replicated_subjects`]) and applies each event through [`apply_event`].
//! Application is idempotent: created and updated events upsert, edge
//! replacement arrives as `prerequisites:deleted` followed by one
//! `prerequisite:created` per edge on a single ordered subscription (see
//! [`subscription_sets`]), and an event whose references are not
//! yet present locally is skipped and written to the dead-letter table
//! instead of being retried.

pub mod apply;
pub mod dead_letters;
pub mod error;
pub mod handler;
pub mod store;

pub use apply::apply_event;
pub use dead_letters::{
    insert_dead_letter, list_dead_letters, DeadLetterFilter, SqliteDeadLetterStore,
    StoredDeadLetter,
};
pub use error::ReplicaError;
pub use handler::{replica_handlers, replicated_subjects, subscription_sets, ReplicaHandler};
pub use store::{Entity, ReplicaIsland, ReplicaLevel, ReplicaUser};
